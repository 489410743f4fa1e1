//! In-flight call tracking keyed by request id.

use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::bridge::frame::FrameBody;
use crate::bridge::protocol::{CallResponse, RequestId, ResponseEnvelope};
use crate::bus::{BridgeEvent, Delivery};
use crate::error::BridgeError;

pub(crate) type CallResult = Result<CallResponse, BridgeError>;

struct PendingCall {
    tx: oneshot::Sender<CallResult>,
    function: String,
    started_at: Instant,
}

/// Completion slots for calls written to the worker but not yet answered.
///
/// Each slot completes exactly once: whoever removes it from the map owns the
/// sender.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: DashMap<RequestId, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: RequestId,
        function: impl Into<String>,
    ) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                tx,
                function: function.into(),
                started_at: Instant::now(),
            },
        );
        rx
    }

    /// Deliver a worker response. False if no call with this id is pending.
    ///
    /// The id must be the exact string that was sent; other spellings of the
    /// same UUID do not match.
    pub fn complete(&self, raw_id: &str, response: CallResponse) -> bool {
        let Ok(id) = RequestId::parse(raw_id) else {
            return false;
        };
        if id.to_string() != raw_id {
            return false;
        }
        let Some((id, call)) = self.calls.remove(&id) else {
            return false;
        };
        tracing::debug!(
            request_id = %id,
            function = %call.function,
            elapsed_ms = call.started_at.elapsed().as_millis() as u64,
            has_succeeded = response.has_succeeded(),
            "Call completed"
        );
        // Receiver gone means the caller already gave up (timeout or cancel).
        let _ = call.tx.send(Ok(response));
        true
    }

    /// Reject every pending call. Returns how many were rejected.
    pub fn fail_all(&self, error: impl Fn() -> BridgeError) -> usize {
        let ids: Vec<RequestId> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.tx.send(Err(error()));
                failed += 1;
            }
        }
        failed
    }

    pub fn remove(&self, id: &RequestId) -> bool {
        self.calls.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Bus handler: settle pending calls from worker events.
    ///
    /// - RESPONSE with a known id completes that call
    /// - RESPONSE with an unknown id or no id is ignored
    /// - ERROR rejects all pending calls with the stream error
    /// - CLOSE rejects all pending calls (crash or destroy)
    pub fn route(&self, event: &BridgeEvent) -> Delivery {
        match event {
            BridgeEvent::Response(FrameBody::Structured(value)) => {
                let Some(envelope) = value.as_object().and_then(ResponseEnvelope::from_object)
                else {
                    tracing::debug!("Ignoring frame without request_id");
                    return Delivery::Ignored;
                };
                if self.complete(&envelope.request_id, envelope.response) {
                    Delivery::Accepted
                } else {
                    tracing::debug!(
                        request_id = %envelope.request_id,
                        "Ignoring response for unknown request"
                    );
                    Delivery::Ignored
                }
            }
            BridgeEvent::Response(FrameBody::Malformed { error, .. }) => {
                tracing::warn!(error = %error, "Worker produced a malformed frame");
                Delivery::Ignored
            }
            BridgeEvent::Error(message) => {
                let failed = self.fail_all(|| BridgeError::Stream(message.clone()));
                if failed > 0 {
                    tracing::warn!(failed, error = %message, "Rejected pending calls after stream error");
                    Delivery::Accepted
                } else {
                    Delivery::Ignored
                }
            }
            BridgeEvent::Close(exit) => {
                let failed = if exit.requested {
                    self.fail_all(|| BridgeError::Destroyed)
                } else {
                    self.fail_all(|| BridgeError::WorkerCrashed)
                };
                if failed > 0 {
                    tracing::warn!(
                        failed,
                        requested = exit.requested,
                        code = ?exit.code,
                        "Rejected pending calls after worker exit"
                    );
                    Delivery::Accepted
                } else {
                    Delivery::Ignored
                }
            }
            _ => Delivery::Ignored,
        }
    }
}
