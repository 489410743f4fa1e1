//! End-to-end tests against real worker processes.
//!
//! Workers are small POSIX shell scripts speaking the line/sentinel protocol.

#![cfg(unix)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::process::Child;

use pynode_bridge::{
    BridgeClient, BridgeConfig, BridgeError, CallOptions, CancellationToken, Delivery, EventType,
    InterpreterSpawner, LaunchSpec, RestartPolicy, SupervisorError, WorkerConfig, WorkerSpawner,
    WorkerState,
};

const PRELUDE: &str = r#"
S='<------------------- START ------------------->'
E='<------------------- END ------------------->'
field() {
  printf '%s\n' "$1" | sed -n "s/.*\"$2\":\"\{0,1\}\([^\",}]*\).*/\1/p"
}
reply() {
  printf '%s{"request_id":"%s","hasSucceeded":true%s}%s' "$S" "$1" "$2" "$E"
}
"#;

const MATH_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"exit":true'*) exit 0 ;;
  esac
  id=$(field "$line" requestId)
  case "$(field "$line" functionName)" in
    add) reply "$id" ",\"result\":$(( $(field "$line" a) + $(field "$line" b) ))" ;;
    echo) reply "$id" ",\"x\":$(field "$line" x)" ;;
    noisy)
      printf 'warming up...%s{"request_id":"stale","hasSucceeded":true}%s' "$S" "$E"
      printf '%snot json at all%s' "$S" "$E"
      reply "$id" ',"result":"quiet"' ;;
    crash) exit 3 ;;
    *) printf '%s{"request_id":"%s","exception":"unknown function"}%s' "$S" "$id" "$E" ;;
  esac
done
"#;

/// Reads two requests, answers the second first.
const REVERSE_WORKER: &str = r#"
IFS= read -r first
IFS= read -r second
reply "$(field "$second" requestId)" ",\"x\":$(field "$second" x)"
reply "$(field "$first" requestId)" ",\"x\":$(field "$first" x)"
while IFS= read -r line; do
  case "$line" in *'"exit":true'*) exit 0 ;; esac
done
"#;

/// Never answers.
const SILENT_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in *'"exit":true'*) exit 0 ;; esac
done
"#;

const DYING_WORKER: &str = "exit 1";

const WAIT: Duration = Duration::from_secs(10);

fn worker(body: &str) -> (TempDir, BridgeConfig) {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("worker.sh");
    std::fs::write(&script, format!("{PRELUDE}\n{body}\n")).unwrap();

    let worker = WorkerConfig::new(&script)
        .with_interpreter("sh")
        .with_restart_policy(
            RestartPolicy::default()
                .with_max_restarts(3)
                .with_backoff(Duration::from_millis(10), Duration::from_millis(50)),
        )
        .with_shutdown_grace(Duration::from_millis(500));
    let config = BridgeConfig::new(worker)
        .with_scripts_dir(dir.path())
        .with_call_timeout(Some(WAIT));
    (dir, config)
}

#[derive(Default)]
struct CountingSpawner {
    spawned: AtomicUsize,
}

impl WorkerSpawner for CountingSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Result<Child, SupervisorError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        InterpreterSpawner.spawn(launch)
    }
}

/// First worker runs `first_script`, the next `failed_spawns` spawns fail,
/// every later spawn is a normal worker.
struct FlakySpawner {
    spawned: AtomicUsize,
    first_script: PathBuf,
    failed_spawns: usize,
}

impl FlakySpawner {
    fn new(dir: &TempDir, first_body: &str, failed_spawns: usize) -> Self {
        let first_script = dir.path().join("first.sh");
        std::fs::write(&first_script, first_body).unwrap();
        Self {
            spawned: AtomicUsize::new(0),
            first_script,
            failed_spawns,
        }
    }

    fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for FlakySpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Result<Child, SupervisorError> {
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            let first = LaunchSpec {
                script: self.first_script.clone(),
                ..launch.clone()
            };
            InterpreterSpawner.spawn(&first)
        } else if n <= self.failed_spawns {
            Err(SupervisorError::Spawn(io::Error::other(
                "transient spawn failure",
            )))
        } else {
            InterpreterSpawner.spawn(launch)
        }
    }
}

async fn wait_for_pending(client: &BridgeClient, n: usize) {
    tokio::time::timeout(WAIT, async {
        while client.pending_calls() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("calls never became pending");
}

#[tokio::test]
async fn call_returns_worker_result_without_request_id() {
    let (_dir, config) = worker(MATH_WORKER);
    let client = BridgeClient::new(config);

    let chunks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&chunks);
    client.events().subscribe(EventType::Data, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Delivery::Accepted
    });

    client.initialize().await.unwrap();
    let response = client
        .call("math.py", "add", json!({"a": 2, "b": 3}))
        .await
        .unwrap();

    assert!(response.has_succeeded());
    assert_eq!(
        response.into_value(),
        json!({"hasSucceeded": true, "result": 5})
    );
    assert!(chunks.load(Ordering::SeqCst) > 0);
    assert_eq!(client.pending_calls(), 0);
    assert!(client.destroy().await);
}

#[tokio::test]
async fn unsuccessful_response_is_not_an_error() {
    let (_dir, config) = worker(MATH_WORKER);
    let client = BridgeClient::new(config);
    client.initialize().await.unwrap();

    let response = client.call("math.py", "nope", json!({})).await.unwrap();

    assert!(!response.has_succeeded());
    assert_eq!(response.get("exception"), Some(&json!("unknown function")));
    client.destroy().await;
}

#[tokio::test]
async fn concurrent_calls_resolve_by_request_id() {
    let (_dir, config) = worker(REVERSE_WORKER);
    let client = BridgeClient::new(config);
    client.initialize().await.unwrap();

    let (one, two) = tokio::join!(
        client.call("m.py", "echo", json!({"x": 1})),
        client.call("m.py", "echo", json!({"x": 2})),
    );

    assert_eq!(one.unwrap().get("x"), Some(&json!(1)));
    assert_eq!(two.unwrap().get("x"), Some(&json!(2)));
    client.destroy().await;
}

#[tokio::test]
async fn noise_and_foreign_frames_do_not_disturb_calls() {
    let (_dir, config) = worker(MATH_WORKER);
    let client = BridgeClient::new(config);
    client.initialize().await.unwrap();

    let response = client.call("m.py", "noisy", json!({})).await.unwrap();

    assert_eq!(response.get("result"), Some(&json!("quiet")));
    let after = client
        .call("math.py", "add", json!({"a": 40, "b": 2}))
        .await
        .unwrap();
    assert_eq!(after.get("result"), Some(&json!(42)));
    client.destroy().await;
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let (_dir, config) = worker(MATH_WORKER);
    let spawner = Arc::new(CountingSpawner::default());
    let client = BridgeClient::with_spawner(config, spawner.clone());

    client.initialize().await.unwrap();
    let pid = client.process_id().await;
    client.initialize().await.unwrap();

    assert!(pid.is_some());
    assert_eq!(client.process_id().await, pid);
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
    client.destroy().await;
}

#[tokio::test]
async fn crash_fails_pending_call_and_worker_restarts() {
    let (_dir, config) = worker(MATH_WORKER);
    let spawner = Arc::new(CountingSpawner::default());
    let client = BridgeClient::with_spawner(config, spawner.clone());
    client.initialize().await.unwrap();
    let first_pid = client.process_id().await.unwrap();
    let mut status = client.subscribe_status().await.unwrap();

    let err = client.call("m.py", "crash", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::WorkerCrashed), "got {err:?}");

    tokio::time::timeout(
        WAIT,
        status.wait_for(|s| {
            s.state == WorkerState::Running && s.pid.is_some() && s.pid != Some(first_pid)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    let response = client
        .call("math.py", "add", json!({"a": 1, "b": 1}))
        .await
        .unwrap();
    assert_eq!(response.get("result"), Some(&json!(2)));
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    client.destroy().await;
}

#[tokio::test]
async fn call_during_restart_waits_for_next_worker() {
    let (dir, mut config) = worker(MATH_WORKER);
    config.worker.restart = RestartPolicy::default()
        .with_max_restarts(3)
        .with_backoff(Duration::from_millis(200), Duration::from_millis(400));
    let spawner = Arc::new(FlakySpawner::new(&dir, "sleep 0.2\nexit 1\n", 1));
    let client = BridgeClient::with_spawner(config, spawner.clone());

    let errors = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&errors);
    client.events().subscribe(EventType::Error, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Delivery::Accepted
    });

    client.initialize().await.unwrap();
    let mut status = client.subscribe_status().await.unwrap();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state != WorkerState::Running))
        .await
        .unwrap()
        .unwrap();

    // Issued while the old worker is gone; a failed spawn and its ERROR event
    // happen before the next worker comes up.
    let response = client
        .call("math.py", "add", json!({"a": 2, "b": 3}))
        .await
        .unwrap();

    assert_eq!(response.get("result"), Some(&json!(5)));
    assert_eq!(spawner.spawned(), 3);
    assert!(errors.load(Ordering::SeqCst) >= 1);
    assert_eq!(client.pending_calls(), 0);
    client.destroy().await;
}

#[tokio::test]
async fn restart_count_resets_once_worker_is_stable() {
    let (dir, mut config) = worker(MATH_WORKER);
    config.worker.restart = config
        .worker
        .restart
        .clone()
        .with_reset_after(Duration::from_millis(300));
    let spawner = Arc::new(FlakySpawner::new(&dir, "exit 1\n", 0));
    let client = BridgeClient::with_spawner(config, spawner.clone());
    client.initialize().await.unwrap();

    tokio::time::timeout(WAIT, async {
        while spawner.spawned() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("crashed worker was never restarted");

    let mut status = client.subscribe_status().await.unwrap();
    let stable = tokio::time::timeout(
        WAIT,
        status.wait_for(|s| s.state == WorkerState::Running && s.restarts == 0),
    )
    .await
    .expect("restart count never reset")
    .unwrap()
    .clone();
    assert!(stable.pid.is_some());

    let response = client
        .call("math.py", "add", json!({"a": 1, "b": 2}))
        .await
        .unwrap();
    assert_eq!(response.get("result"), Some(&json!(3)));
    assert_eq!(spawner.spawned(), 2);
    client.destroy().await;
}

#[tokio::test]
async fn exhausted_restart_budget_makes_worker_unavailable() {
    let (_dir, config) = worker(DYING_WORKER);
    let spawner = Arc::new(CountingSpawner::default());
    let client = BridgeClient::with_spawner(config, spawner.clone());

    let errors = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&errors);
    client.events().subscribe(EventType::Error, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Delivery::Accepted
    });

    client.initialize().await.unwrap();
    let mut status = client.subscribe_status().await.unwrap();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == WorkerState::Defunct))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 4);
    assert!(errors.load(Ordering::SeqCst) >= 1);

    let err = client.call("math.py", "add", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::WorkerUnavailable), "got {err:?}");

    // A defunct worker can be replaced by initializing again.
    client.initialize().await.unwrap();
    assert!(spawner.spawned.load(Ordering::SeqCst) >= 5);
    client.destroy().await;
}

#[tokio::test]
async fn destroy_rejects_pending_calls() {
    let (_dir, config) = worker(SILENT_WORKER);
    let client = BridgeClient::new(config);
    client.initialize().await.unwrap();

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.call("slow.py", "wait", json!({})).await });
    wait_for_pending(&client, 1).await;

    assert!(client.destroy().await);

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("pending call did not settle after destroy")
        .unwrap();
    assert!(matches!(result, Err(BridgeError::Destroyed)), "got {result:?}");
    assert_eq!(client.pending_calls(), 0);

    assert!(!client.destroy().await);
    let status = client.status().await.unwrap();
    assert_eq!(status.state, WorkerState::Destroyed);
    assert_eq!(status.pid, None);

    let err = client.call("slow.py", "wait", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::Destroyed), "got {err:?}");
}

#[tokio::test]
async fn reinitialize_after_destroy_starts_new_worker() {
    let (_dir, config) = worker(MATH_WORKER);
    let client = BridgeClient::new(config);
    client.initialize().await.unwrap();
    let first_pid = client.process_id().await;
    assert!(client.destroy().await);

    client.initialize().await.unwrap();

    assert_ne!(client.process_id().await, first_pid);
    let response = client
        .call("math.py", "add", json!({"a": 3, "b": 4}))
        .await
        .unwrap();
    assert_eq!(response.get("result"), Some(&json!(7)));
    client.destroy().await;
}

#[tokio::test]
async fn call_times_out_when_worker_never_answers() {
    let (_dir, config) = worker(SILENT_WORKER);
    let client = BridgeClient::new(config);
    client.initialize().await.unwrap();

    let limit = Duration::from_millis(100);
    let err = client
        .call_with(
            "slow.py",
            "wait",
            json!({}),
            CallOptions::default().with_timeout(limit),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::Timeout(d) if d == limit), "got {err:?}");
    assert_eq!(client.pending_calls(), 0);
    client.destroy().await;
}

#[tokio::test]
async fn cancelled_call_returns_cancelled() {
    let (_dir, config) = worker(SILENT_WORKER);
    let client = BridgeClient::new(config);
    client.initialize().await.unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = client
        .call_with(
            "slow.py",
            "wait",
            json!({}),
            CallOptions::default().with_cancel(token),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::Cancelled), "got {err:?}");
    assert_eq!(client.pending_calls(), 0);
    client.destroy().await;
}

#[tokio::test]
async fn calls_beyond_capacity_fail_fast() {
    let (_dir, config) = worker(SILENT_WORKER);
    let client = BridgeClient::new(config.with_max_in_flight(1));
    client.initialize().await.unwrap();

    let caller = client.clone();
    let first = tokio::spawn(async move { caller.call("slow.py", "wait", json!({})).await });
    wait_for_pending(&client, 1).await;

    let err = client.call("slow.py", "wait", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::AtCapacity(1)), "got {err:?}");

    client.destroy().await;
    let first = first.await.unwrap();
    assert!(matches!(first, Err(BridgeError::Destroyed)), "got {first:?}");
}

#[tokio::test]
async fn missing_interpreter_dir_fails_initialization() {
    let (_dir, mut config) = worker(MATH_WORKER);
    config.worker = config
        .worker
        .with_interpreter_dir("/definitely/not/a/python/install");
    let client = BridgeClient::new(config);

    let err = client.initialize().await.unwrap_err();

    assert!(
        matches!(
            err,
            BridgeError::Initialization(SupervisorError::Configuration(_))
        ),
        "got {err:?}"
    );
    assert!(client.status().await.is_none());
}
