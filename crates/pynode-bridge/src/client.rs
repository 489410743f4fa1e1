//! BridgeClient: the public handle for calling worker functions.
//!
//! One client owns:
//! - the event bus and the router subscription that settles pending calls
//! - the pending-call map (requestId -> completion slot)
//! - admission control (max in-flight calls)
//! - the supervisor, created on `initialize()` and kept across `destroy()`
//!
//! Many logical calls share the worker's single stdin/stdout channel; responses
//! complete calls in arrival order, not issue order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{CallResponse, RequestEnvelope, RequestId, WorkerRequest};
use crate::bus::{BridgeEvent, CorrelationBus, EventType};
use crate::error::{BridgeError, SupervisorError};
use crate::pending::PendingCalls;
use crate::supervisor::{
    InterpreterSpawner, ProcessSupervisor, WorkerConfig, WorkerSpawner, WorkerState, WorkerStatus,
};

/// Directory holding the callable modules, relative to the working directory.
pub const DEFAULT_SCRIPTS_DIR: &str = "src/python/scripts";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub worker: WorkerConfig,
    /// Modules are resolved as `scripts_dir/<moduleName>`.
    pub scripts_dir: PathBuf,
    /// Default per-call timeout; None waits indefinitely.
    pub call_timeout: Option<Duration>,
    pub max_in_flight: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(WorkerConfig::default())
    }
}

impl BridgeConfig {
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker,
            scripts_dir: PathBuf::from(DEFAULT_SCRIPTS_DIR),
            call_timeout: Some(Duration::from_secs(300)),
            max_in_flight: 256,
        }
    }

    pub fn with_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_dir = dir.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n;
        self
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Replaces the configured call timeout.
    pub timeout: Option<Duration>,
    /// Abandons the call when cancelled. The worker is not notified.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Function invocation seam.
///
/// Lets the HTTP layer be tested without a worker process.
#[async_trait]
pub trait FunctionBridge: Send + Sync {
    async fn call(
        &self,
        module_name: &str,
        function_name: &str,
        arguments: Value,
    ) -> Result<CallResponse, BridgeError>;
}

struct ClientInner {
    config: BridgeConfig,
    spawner: Arc<dyn WorkerSpawner>,
    bus: Arc<CorrelationBus>,
    pending: Arc<PendingCalls>,
    permits: Arc<Semaphore>,
    supervisor: RwLock<Option<Arc<ProcessSupervisor>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().as_ref() {
            supervisor.abort();
        }
    }
}

/// Cheaply cloneable handle; clones share one worker.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_spawner(config, Arc::new(InterpreterSpawner))
    }

    pub fn with_spawner(config: BridgeConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let bus = Arc::new(CorrelationBus::new());
        let pending = Arc::new(PendingCalls::new());
        for event_type in [EventType::Response, EventType::Error, EventType::Close] {
            let pending = Arc::clone(&pending);
            bus.subscribe(event_type, move |event| pending.route(event));
        }

        let permits = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            inner: Arc::new(ClientInner {
                config,
                spawner,
                bus,
                pending,
                permits,
                supervisor: RwLock::new(None),
            }),
        }
    }

    /// Start the worker. Idempotent while a worker is supervised; after
    /// `destroy()` or restart exhaustion a fresh worker is started.
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        let mut slot = self.inner.supervisor.write().await;
        if let Some(existing) = slot.as_ref() {
            match existing.status().state {
                WorkerState::Destroyed => {}
                WorkerState::Defunct => {
                    existing.destroy().await;
                }
                _ => return Ok(()),
            }
        }

        let supervisor = ProcessSupervisor::start(
            self.inner.config.worker.clone(),
            Arc::clone(&self.inner.spawner),
            Arc::clone(&self.inner.bus),
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Bridge initialization failed");
            BridgeError::Initialization(e)
        })?;

        tracing::info!(pid = ?supervisor.process_id(), "Bridge initialized");
        *slot = Some(supervisor);
        Ok(())
    }

    async fn supervisor(&self) -> Option<Arc<ProcessSupervisor>> {
        self.inner.supervisor.read().await.clone()
    }

    /// Call with the configured timeout and no cancellation.
    pub async fn call(
        &self,
        module_name: &str,
        function_name: &str,
        arguments: Value,
    ) -> Result<CallResponse, BridgeError> {
        self.call_with(module_name, function_name, arguments, CallOptions::default())
            .await
    }

    pub async fn call_with(
        &self,
        module_name: &str,
        function_name: &str,
        arguments: Value,
        options: CallOptions,
    ) -> Result<CallResponse, BridgeError> {
        let supervisor = self.supervisor().await.ok_or(BridgeError::NotInitialized)?;
        let _permit = Arc::clone(&self.inner.permits)
            .try_acquire_owned()
            .map_err(|_| BridgeError::AtCapacity(self.inner.config.max_in_flight))?;

        let request_id = RequestId::new();
        let envelope = RequestEnvelope {
            request_id,
            module_name: module_name.to_string(),
            module_path: self.module_path(module_name),
            function_name: function_name.to_string(),
            function_arguments: arguments,
        };
        let label = format!("{module_name}:{function_name}");

        let exchange = async {
            let completion = loop {
                match supervisor.ready_state().await {
                    WorkerState::Destroyed => return Err(BridgeError::Destroyed),
                    WorkerState::Defunct => return Err(BridgeError::WorkerUnavailable),
                    _ => {}
                }
                // Registered only once a worker is up, so exits of earlier workers
                // cannot settle it.
                let completion = self.inner.pending.register(request_id, label.as_str());
                match self
                    .write_request(&supervisor, WorkerRequest::Call(envelope.clone()))
                    .await
                {
                    Ok(()) => break completion,
                    Err(BridgeError::WorkerCrashed) => {
                        // The worker went away before the request reached it; wait for the next one.
                        self.inner.pending.remove(&request_id);
                        tracing::debug!(request_id = %request_id, "Worker restarting, retrying write");
                    }
                    Err(e) => return Err(e),
                }
            };
            completion.await.unwrap_or(Err(BridgeError::Disconnected))
        };

        let timeout = options.timeout.or(self.inner.config.call_timeout);
        let bounded = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, exchange)
                    .await
                    .unwrap_or(Err(BridgeError::Timeout(limit))),
                None => exchange.await,
            }
        };
        let cancel = options.cancel.unwrap_or_default();
        let outcome = tokio::select! {
            result = bounded => result,
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
        };

        if let Err(e) = &outcome {
            self.inner.pending.remove(&request_id);
            tracing::debug!(
                request_id = %request_id,
                module = module_name,
                function = function_name,
                error = %e,
                "Call failed"
            );
        }
        outcome
    }

    async fn write_request(
        &self,
        supervisor: &ProcessSupervisor,
        request: WorkerRequest,
    ) -> Result<(), BridgeError> {
        match supervisor.send(request).await {
            Ok(()) => Ok(()),
            Err(SupervisorError::NotRunning) => Err(match supervisor.status().state {
                WorkerState::Destroyed => BridgeError::Destroyed,
                WorkerState::Defunct => BridgeError::WorkerUnavailable,
                _ => BridgeError::WorkerCrashed,
            }),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(error = %message, "Failed to write request to worker");
                // The channel is broken for every caller, not just this one.
                self.inner.bus.publish(&BridgeEvent::Error(message.clone()));
                Err(BridgeError::Stream(message))
            }
        }
    }

    fn module_path(&self, module_name: &str) -> PathBuf {
        let path = self.inner.config.scripts_dir.join(module_name);
        std::path::absolute(&path).unwrap_or(path)
    }

    /// Stop the worker and reject every pending call with `Destroyed`.
    ///
    /// Returns whether a live worker process existed. Never fails.
    pub async fn destroy(&self) -> bool {
        let live = match self.supervisor().await {
            Some(supervisor) => supervisor.destroy().await,
            None => false,
        };
        let failed = self.inner.pending.fail_all(|| BridgeError::Destroyed);
        if failed > 0 {
            tracing::warn!(failed, "Rejected pending calls on destroy");
        }
        live
    }

    /// Event bus carrying raw worker events; subscribe to observe the stream.
    pub fn events(&self) -> &Arc<CorrelationBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.inner.config.scripts_dir
    }

    pub async fn status(&self) -> Option<WorkerStatus> {
        self.supervisor().await.map(|s| s.status())
    }

    pub async fn subscribe_status(&self) -> Option<watch::Receiver<WorkerStatus>> {
        self.supervisor().await.map(|s| s.subscribe_status())
    }

    pub async fn process_id(&self) -> Option<u32> {
        self.supervisor().await.and_then(|s| s.process_id())
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

#[async_trait]
impl FunctionBridge for BridgeClient {
    async fn call(
        &self,
        module_name: &str,
        function_name: &str,
        arguments: Value,
    ) -> Result<CallResponse, BridgeError> {
        BridgeClient::call(self, module_name, function_name, arguments).await
    }
}
