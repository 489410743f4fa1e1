//! pynode-bridge server: exposes worker functions over HTTP.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pynode_bridge::transport::{ServerConfig, serve};
use pynode_bridge::{
    BridgeClient, BridgeConfig, DEFAULT_SCRIPTS_DIR, DEFAULT_WORKER_SCRIPT, RestartPolicy,
    WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "pynode-bridge")]
#[command(about = "Call functions in a supervised interpreter worker over HTTP")]
#[command(version)]
struct Args {
    /// Host to bind to
    #[arg(long, env = "PYNODE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind to
    #[arg(long, env = "PYNODE_PORT", default_value_t = 53631)]
    port: u16,

    /// Include error source chains in 5xx responses
    #[arg(long, env = "PYNODE_INCLUDE_ERROR_STACK", default_value_t = true, action = ArgAction::Set)]
    include_error_stack: bool,

    /// Interpreter executable (platform default when unset)
    #[arg(long, env = "PYNODE_INTERPRETER")]
    interpreter: Option<String>,

    /// Interpreter install directory, added to the worker's PATH with its Scripts subdirectory
    #[arg(long, env = "PYNODE_INTERPRETER_DIR")]
    interpreter_dir: Option<PathBuf>,

    /// Extra PATH entry for the worker (repeatable)
    #[arg(long = "search-path", value_name = "DIR")]
    search_paths: Vec<PathBuf>,

    /// Worker entry script
    #[arg(long, env = "PYNODE_WORKER_SCRIPT", default_value = DEFAULT_WORKER_SCRIPT)]
    worker_script: PathBuf,

    /// Directory containing callable modules
    #[arg(long, env = "PYNODE_SCRIPTS_DIR", default_value = DEFAULT_SCRIPTS_DIR)]
    scripts_dir: PathBuf,

    /// Per-call timeout in seconds (0 disables)
    #[arg(long, env = "PYNODE_CALL_TIMEOUT", default_value_t = 300)]
    call_timeout_secs: u64,

    /// Maximum concurrent calls before new calls are rejected
    #[arg(long, env = "PYNODE_MAX_IN_FLIGHT", default_value_t = 256)]
    max_in_flight: usize,

    /// Consecutive worker restarts before giving up
    #[arg(long, env = "PYNODE_MAX_RESTARTS", default_value_t = 5)]
    max_restarts: u32,
}

impl Args {
    fn bridge_config(&self) -> BridgeConfig {
        let mut worker = WorkerConfig::new(&self.worker_script)
            .with_restart_policy(RestartPolicy::default().with_max_restarts(self.max_restarts));
        if let Some(interpreter) = &self.interpreter {
            worker = worker.with_interpreter(interpreter);
        }
        if let Some(dir) = &self.interpreter_dir {
            worker = worker.with_interpreter_dir(dir);
        }
        for path in &self.search_paths {
            worker = worker.with_search_path(path);
        }

        let call_timeout = (self.call_timeout_secs > 0)
            .then(|| Duration::from_secs(self.call_timeout_secs));
        BridgeConfig::new(worker)
            .with_scripts_dir(&self.scripts_dir)
            .with_call_timeout(call_timeout)
            .with_max_in_flight(self.max_in_flight)
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            include_error_stack: self.include_error_stack,
        }
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PYNODE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!("pynode_bridge={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting pynode-bridge");

    let bridge = BridgeClient::new(args.bridge_config());
    bridge.initialize().await?;

    serve(args.server_config(), bridge).await
}
