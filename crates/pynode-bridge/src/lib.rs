//! pynode-bridge: call functions in a supervised interpreter worker process.

mod error;
mod pending;

pub mod bridge;
pub mod bus;
pub mod client;
pub mod supervisor;
pub mod transport;

pub use bridge::frame::{DecodeError, Frame, FrameBody, FrameDecoder};
pub use bridge::protocol::{CallResponse, RequestId};
pub use bus::{BridgeEvent, CorrelationBus, Delivery, EventType, SubscriptionHandle, WorkerExit};
pub use client::{
    BridgeClient, BridgeConfig, CallOptions, DEFAULT_SCRIPTS_DIR, FunctionBridge,
};
pub use error::{BridgeError, SupervisorError};
pub use supervisor::{
    DEFAULT_WORKER_SCRIPT, InterpreterSpawner, LaunchSpec, ProcessSupervisor, RestartPolicy,
    WorkerConfig, WorkerSpawner, WorkerState, WorkerStatus,
};
pub use tokio_util::sync::CancellationToken;
