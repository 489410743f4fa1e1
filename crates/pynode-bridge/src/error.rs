//! Error types for process supervision and calls.

use std::time::Duration;

/// Failures starting or talking to the worker process.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid worker configuration: {0}")]
    Configuration(String),

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker process is not running")]
    NotRunning,

    #[error("failed to write to worker stdin: {0}")]
    Write(#[source] std::io::Error),
}

/// Why a call (or client operation) did not produce a worker response.
///
/// A worker response with `hasSucceeded: false` is not an error; it is
/// returned as a normal [`CallResponse`](crate::bridge::protocol::CallResponse).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to initialize bridge")]
    Initialization(#[source] SupervisorError),

    #[error("bridge is not initialized")]
    NotInitialized,

    #[error("worker stream error: {0}")]
    Stream(String),

    #[error("worker process exited before responding")]
    WorkerCrashed,

    #[error("worker unavailable: restart limit reached")]
    WorkerUnavailable,

    #[error("bridge was destroyed")]
    Destroyed,

    #[error("too many calls in flight (limit {0})")]
    AtCapacity(usize),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call was cancelled")]
    Cancelled,

    #[error("call completion was dropped without a result")]
    Disconnected,
}

impl BridgeError {
    /// Render the error and its sources, outermost first.
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            rendered.push_str("\n    caused by: ");
            rendered.push_str(&err.to_string());
            source = err.source();
        }
        rendered
    }
}
