//! Wire layer between the host and the worker process.
//!
//! # Architecture
//!
//! - **protocol**: message types (WorkerRequest, ResponseEnvelope, CallResponse)
//! - **codec**: newline JSON for requests, sentinel framing for responses
//! - **frame**: incremental frame extraction and payload decoding

pub mod codec;
pub mod frame;
pub mod protocol;
