//! Worker process supervision.
//!
//! Flow:
//! 1. Resolve interpreter and search path from [`WorkerConfig`]
//! 2. Spawn `<interpreter> <worker script>` with piped stdio
//! 3. Reader task feeds stdout into a [`FrameDecoder`] and publishes bus events
//! 4. Monitor task waits for exit; unrequested exits restart under [`RestartPolicy`]
//! 5. `destroy()` sends the exit signal, closes stdin and terminates the process

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::frame::FrameDecoder;
use crate::bridge::protocol::WorkerRequest;
use crate::bus::{BridgeEvent, CorrelationBus, WorkerExit};
use crate::error::SupervisorError;

/// Interpreter directory assumed on Windows when none is configured.
pub const DEFAULT_WINDOWS_INTERPRETER_DIR: &str = r"C:\Program Files\Python310";

/// Worker entry script, relative to the working directory.
pub const DEFAULT_WORKER_SCRIPT: &str = "src/python/services/Loader.py";

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How long to wait for the reader to drain stdout after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Interpreter executable for the current platform.
pub fn default_interpreter() -> &'static str {
    if cfg!(windows) {
        "python.exe"
    } else if cfg!(target_os = "linux") {
        "python3"
    } else {
        "python"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    Closing,
    Destroyed,
    /// Restart budget exhausted. Only `Destroyed` follows.
    Defunct,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Defunct)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Destroyed => "destroyed",
            Self::Defunct => "defunct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub pid: Option<u32>,
    /// Restarts since the last stable run.
    pub restarts: u32,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::NotStarted,
            pid: None,
            restarts: 0,
        }
    }
}

/// Restart budget for unrequested worker exits.
///
/// Backoff doubles per consecutive restart, capped at `max_backoff`. A worker
/// that stays up for `reset_after` earns a fresh budget.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            reset_after: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }

    /// Delay before restart number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable name or path; platform default when unset.
    pub interpreter: Option<String>,
    /// Interpreter install directory; must exist when set.
    pub interpreter_dir: Option<PathBuf>,
    /// Extra entries appended to the child's PATH.
    pub search_paths: Vec<PathBuf>,
    pub worker_script: PathBuf,
    pub restart: RestartPolicy,
    /// Time between SIGTERM and force-kill on destroy.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_SCRIPT)
    }
}

impl WorkerConfig {
    pub fn new(worker_script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: None,
            interpreter_dir: None,
            search_paths: Vec::new(),
            worker_script: worker_script.into(),
            restart: RestartPolicy::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_interpreter_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.interpreter_dir = Some(dir.into());
        self
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Resolved launch parameters for one worker process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub script: PathBuf,
    /// Full PATH value for the child.
    pub path: OsString,
}

impl LaunchSpec {
    pub fn resolve(config: &WorkerConfig) -> Result<Self, SupervisorError> {
        let program = config
            .interpreter
            .clone()
            .unwrap_or_else(|| default_interpreter().to_string());

        let mut extra = Vec::new();
        match &config.interpreter_dir {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(SupervisorError::Configuration(format!(
                        "interpreter directory {} does not exist",
                        dir.display()
                    )));
                }
                extra.push(dir.clone());
                extra.push(dir.join("Scripts"));
            }
            None if cfg!(windows) => {
                let dir = Path::new(DEFAULT_WINDOWS_INTERPRETER_DIR);
                if dir.is_dir() {
                    extra.push(dir.to_path_buf());
                    extra.push(dir.join("Scripts"));
                } else {
                    tracing::debug!(dir = %dir.display(), "Default interpreter directory not found");
                }
            }
            None => {}
        }
        extra.extend(config.search_paths.iter().cloned());

        let mut entries: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|path| std::env::split_paths(&path).collect())
            .unwrap_or_default();
        entries.extend(extra);
        let path = std::env::join_paths(entries).map_err(|e| {
            SupervisorError::Configuration(format!("invalid search path entry: {e}"))
        })?;

        Ok(Self {
            program,
            script: config.worker_script.clone(),
            path,
        })
    }

    /// `<program> <script>` with piped stdio and the resolved PATH.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg(&self.script)
            .env("PATH", &self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &LaunchSpec) -> Result<Child, SupervisorError>;
}

/// Spawns the interpreter directly from the resolved [`LaunchSpec`].
pub struct InterpreterSpawner;

impl WorkerSpawner for InterpreterSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Result<Child, SupervisorError> {
        let child = launch.command().spawn()?;
        Ok(child)
    }
}

type RequestWriter = FramedWrite<ChildStdin, JsonLineCodec<WorkerRequest>>;

struct RunningWorker {
    child: Child,
    pid: Option<u32>,
    reader: JoinHandle<()>,
    started_at: Instant,
}

/// Owns the worker process across restarts.
pub struct ProcessSupervisor {
    config: WorkerConfig,
    launch: LaunchSpec,
    spawner: Arc<dyn WorkerSpawner>,
    bus: Arc<CorrelationBus>,
    status: watch::Sender<WorkerStatus>,
    writer: Mutex<Option<RequestWriter>>,
    shutdown: CancellationToken,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Spawn the first worker and start supervising it.
    ///
    /// Configuration and spawn failures of the first launch are returned;
    /// failures on later restarts are published as ERROR events.
    pub async fn start(
        config: WorkerConfig,
        spawner: Arc<dyn WorkerSpawner>,
        bus: Arc<CorrelationBus>,
    ) -> Result<Arc<Self>, SupervisorError> {
        let launch = LaunchSpec::resolve(&config)?;
        let (status, _) = watch::channel(WorkerStatus::default());
        let supervisor = Arc::new(Self {
            config,
            launch,
            spawner,
            bus,
            status,
            writer: Mutex::new(None),
            shutdown: CancellationToken::new(),
            monitor: StdMutex::new(None),
        });

        let worker = supervisor.launch().await?;
        let monitor = tokio::spawn(Arc::clone(&supervisor).supervise(worker));
        *supervisor.monitor_slot() = Some(monitor);
        Ok(supervisor)
    }

    fn monitor_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update state unless already destroyed.
    fn transition(&self, state: WorkerState, pid: Option<u32>) {
        self.status.send_modify(|status| {
            if status.state != WorkerState::Destroyed {
                status.state = state;
                status.pid = pid;
            }
        });
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.status.borrow().pid
    }

    /// Wait until the worker is running or can no longer run.
    pub async fn ready_state(&self) -> WorkerState {
        let mut rx = self.status.subscribe();
        match rx
            .wait_for(|status| {
                matches!(
                    status.state,
                    WorkerState::Running | WorkerState::Destroyed | WorkerState::Defunct
                )
            })
            .await
        {
            Ok(status) => status.state,
            Err(_) => WorkerState::Destroyed,
        }
    }

    /// Write one request line to the worker's stdin.
    pub async fn send(&self, request: WorkerRequest) -> Result<(), SupervisorError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SupervisorError::NotRunning)?;
        writer.send(request).await.map_err(SupervisorError::Write)
    }

    async fn launch(&self) -> Result<RunningWorker, SupervisorError> {
        self.transition(WorkerState::Starting, None);

        let mut child = self.spawner.spawn(&self.launch)?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        let reader = tokio::spawn(read_output(stdout, Arc::clone(&self.bus)));
        *self.writer.lock().await = Some(FramedWrite::new(stdin, JsonLineCodec::new()));
        self.transition(WorkerState::Running, pid);

        tracing::info!(
            pid = ?pid,
            program = %self.launch.program,
            script = %self.launch.script.display(),
            "Worker process started"
        );
        Ok(RunningWorker {
            child,
            pid,
            reader,
            started_at: Instant::now(),
        })
    }

    async fn supervise(self: Arc<Self>, mut worker: RunningWorker) {
        let policy = self.config.restart.clone();
        let mut restarts: u32 = 0;

        loop {
            let exited = loop {
                let until_stable = policy
                    .reset_after
                    .saturating_sub(worker.started_at.elapsed());
                tokio::select! {
                    status = worker.child.wait() => break Some(status),
                    _ = self.shutdown.cancelled() => break None,
                    _ = tokio::time::sleep(until_stable), if restarts > 0 => {
                        self.reset_restart_budget(&mut restarts);
                    }
                }
            };

            let requested = exited.is_none() || self.status().state == WorkerState::Destroyed;
            if !requested {
                self.transition(WorkerState::Closing, None);
            }
            let code = match exited {
                Some(Ok(status)) => status.code(),
                Some(Err(e)) => {
                    tracing::warn!(pid = ?worker.pid, error = %e, "Failed to read worker exit status");
                    None
                }
                None => self.terminate(&mut worker).await,
            };

            self.writer.lock().await.take();
            // Frames written just before exit must reach their callers before CLOSE fails them.
            drain_reader(&mut worker.reader).await;
            self.bus.publish(&BridgeEvent::Close(WorkerExit {
                pid: worker.pid,
                code,
                requested,
            }));

            if requested {
                tracing::info!(pid = ?worker.pid, code = ?code, "Worker process stopped");
                break;
            }
            tracing::warn!(pid = ?worker.pid, code = ?code, "Worker process exited unexpectedly");

            if worker.started_at.elapsed() >= policy.reset_after {
                self.reset_restart_budget(&mut restarts);
            }
            match self.restart(&policy, &mut restarts).await {
                Some(next) => worker = next,
                None => break,
            }
        }
    }

    fn reset_restart_budget(&self, restarts: &mut u32) {
        if *restarts == 0 {
            return;
        }
        tracing::info!(restarts = *restarts, "Worker stable, restart budget reset");
        *restarts = 0;
        self.status.send_modify(|status| status.restarts = 0);
    }

    async fn restart(&self, policy: &RestartPolicy, restarts: &mut u32) -> Option<RunningWorker> {
        loop {
            if *restarts >= policy.max_restarts {
                tracing::error!(restarts = *restarts, "Worker restart limit reached");
                self.transition(WorkerState::Defunct, None);
                self.bus.publish(&BridgeEvent::Error(
                    "worker unavailable: restart limit reached".to_string(),
                ));
                return None;
            }

            let delay = policy.backoff(*restarts);
            *restarts += 1;
            let attempt = *restarts;
            self.status.send_modify(|status| status.restarts = attempt);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Restarting worker process"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return None,
            }

            match self.launch().await {
                Ok(worker) => return Some(worker),
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Failed to restart worker process");
                    self.bus
                        .publish(&BridgeEvent::Error(format!("failed to restart worker: {e}")));
                }
            }
        }
    }

    /// SIGTERM, wait out the grace period, then kill. Returns the exit code if known.
    async fn terminate(&self, worker: &mut RunningWorker) -> Option<i32> {
        if let Some(pid) = worker.pid {
            request_termination(pid);
        }

        match tokio::time::timeout(self.config.shutdown_grace, worker.child.wait()).await {
            Ok(Ok(status)) => return status.code(),
            Ok(Err(e)) => {
                tracing::warn!(pid = ?worker.pid, error = %e, "Failed to wait for worker exit");
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?worker.pid,
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "Worker did not exit within grace period, killing"
                );
            }
        }

        if let Err(e) = worker.child.kill().await {
            tracing::warn!(pid = ?worker.pid, error = %e, "Failed to kill worker process");
        }
        worker
            .child
            .try_wait()
            .ok()
            .flatten()
            .and_then(|status| status.code())
    }

    /// Stop the worker and end supervision. Idempotent.
    ///
    /// Returns whether a live worker process existed.
    pub async fn destroy(&self) -> bool {
        let mut already_destroyed = false;
        self.status.send_modify(|status| {
            already_destroyed = status.state == WorkerState::Destroyed;
            status.state = WorkerState::Destroyed;
        });
        if already_destroyed {
            return false;
        }

        let live = {
            let mut guard = self.writer.lock().await;
            match guard.take() {
                Some(mut writer) => {
                    match tokio::time::timeout(
                        self.config.shutdown_grace,
                        writer.send(WorkerRequest::exit()),
                    )
                    .await
                    {
                        Ok(Ok(())) => tracing::debug!("Sent exit signal to worker"),
                        Ok(Err(e)) => tracing::debug!(error = %e, "Failed to send exit signal"),
                        Err(_) => tracing::debug!("Timed out sending exit signal"),
                    }
                    // Dropping the writer closes the worker's stdin.
                    true
                }
                None => false,
            }
        };

        self.shutdown.cancel();
        let monitor = self.monitor_slot().take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                tracing::warn!(error = %e, "Worker monitor task failed");
            }
        }
        self.status.send_modify(|status| status.pid = None);

        tracing::info!(live, "Worker supervisor destroyed");
        live
    }

    /// Non-blocking teardown for drop paths: the monitor terminates the worker in the background.
    pub fn abort(&self) {
        self.status
            .send_modify(|status| status.state = WorkerState::Destroyed);
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("launch", &self.launch)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

fn missing_pipe(name: &str) -> SupervisorError {
    SupervisorError::Spawn(io::Error::other(format!("worker {name} not captured")))
}

#[cfg(unix)]
fn request_termination(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM to worker");
    }
}

/// No polite termination signal; the exit request and closed stdin have to do.
#[cfg(not(unix))]
fn request_termination(_pid: u32) {}

async fn drain_reader(reader: &mut JoinHandle<()>) {
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut *reader)
        .await
        .is_err()
    {
        tracing::debug!("Worker stdout still open after exit, abandoning reader");
        reader.abort();
    }
}

async fn read_output(mut stdout: ChildStdout, bus: Arc<CorrelationBus>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buf.reserve(READ_BUFFER_SIZE);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Worker stdout closed");
                if let Some(frame) = decoder.finish() {
                    bus.publish(&BridgeEvent::Response(frame.decode()));
                }
                bus.publish(&BridgeEvent::End);
                break;
            }
            Ok(n) => {
                tracing::trace!(bytes = n, "Read worker stdout");
                let chunk = buf.split().freeze();
                bus.publish(&BridgeEvent::Data(chunk.clone()));
                for frame in decoder.feed(&chunk) {
                    bus.publish(&BridgeEvent::Response(frame.decode()));
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read worker stdout");
                bus.publish(&BridgeEvent::Error(format!(
                    "failed to read worker stdout: {e}"
                )));
                break;
            }
        }
    }
}

async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(line)) => {
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "pynode_bridge::worker", pid = ?pid, "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}
