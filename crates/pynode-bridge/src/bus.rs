//! Typed publish/subscribe for worker stream events.
//!
//! The supervisor publishes everything it observes on the worker's streams;
//! the client's router and any external observers subscribe. Handlers run
//! synchronously on the publishing task and must not block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::bytes::Bytes;

use crate::bridge::frame::FrameBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Data,
    Response,
    Error,
    End,
    Close,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Response => "response",
            Self::Error => "error",
            Self::End => "end",
            Self::Close => "close",
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub pid: Option<u32>,
    /// None when killed by a signal or the status could not be read.
    pub code: Option<i32>,
    /// True when the exit was requested through `destroy`.
    pub requested: bool,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Raw stdout chunk.
    Data(Bytes),
    /// One decoded frame.
    Response(FrameBody),
    /// Stream or process failure.
    Error(String),
    /// Stdout reached EOF.
    End,
    Close(WorkerExit),
}

impl BridgeEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Data(_) => EventType::Data,
            Self::Response(_) => EventType::Response,
            Self::Error(_) => EventType::Error,
            Self::End => EventType::End,
            Self::Close(_) => EventType::Close,
        }
    }
}

/// Handler verdict. One-shot subscriptions are consumed only on `Accepted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    Ignored,
}

type Handler = dyn Fn(&BridgeEvent) -> Delivery + Send + Sync;

/// Identifies a subscription for [`CorrelationBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    event_type: EventType,
}

impl SubscriptionHandle {
    pub fn event_type(&self) -> EventType {
        self.event_type
    }
}

struct Subscription {
    id: u64,
    event_type: EventType,
    once: bool,
    fired: AtomicBool,
    handler: Box<Handler>,
}

/// Event bus keyed by [`EventType`].
///
/// Publishing works on a snapshot of the subscriber list: handlers added or
/// removed during a publish take effect from the next publish. Handlers for
/// one event run in subscription order.
#[derive(Default)]
pub struct CorrelationBus {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl CorrelationBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn insert<F>(&self, event_type: EventType, once: bool, handler: F) -> SubscriptionHandle
    where
        F: Fn(&BridgeEvent) -> Delivery + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Arc::new(Subscription {
            id,
            event_type,
            once,
            fired: AtomicBool::new(false),
            handler: Box::new(handler),
        }));
        SubscriptionHandle { id, event_type }
    }

    /// Persistent subscription: invoked for every event of `event_type`.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionHandle
    where
        F: Fn(&BridgeEvent) -> Delivery + Send + Sync + 'static,
    {
        self.insert(event_type, false, handler)
    }

    /// Invoked until it first returns [`Delivery::Accepted`], then removed.
    pub fn subscribe_once<F>(&self, event_type: EventType, handler: F) -> SubscriptionHandle
    where
        F: Fn(&BridgeEvent) -> Delivery + Send + Sync + 'static,
    {
        self.insert(event_type, true, handler)
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscriptions = self.lock();
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.id != handle.id);
        subscriptions.len() != before
    }

    /// Deliver `event` to every current subscriber of its type.
    ///
    /// Returns how many handlers accepted it.
    pub fn publish(&self, event: &BridgeEvent) -> usize {
        let event_type = event.event_type();
        let snapshot: Vec<Arc<Subscription>> = self
            .lock()
            .iter()
            .filter(|sub| sub.event_type == event_type)
            .cloned()
            .collect();

        let mut accepted = 0;
        let mut consumed = Vec::new();
        for sub in snapshot {
            if sub.once && sub.fired.load(Ordering::Acquire) {
                continue;
            }
            if (sub.handler)(event) == Delivery::Accepted {
                accepted += 1;
                if sub.once && !sub.fired.swap(true, Ordering::AcqRel) {
                    consumed.push(sub.id);
                }
            }
        }

        if !consumed.is_empty() {
            self.lock().retain(|sub| !consumed.contains(&sub.id));
        }
        tracing::trace!(event = event_type.as_str(), accepted, "Published event");
        accepted
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.lock()
            .iter()
            .filter(|sub| sub.event_type == event_type)
            .count()
    }
}

impl std::fmt::Debug for CorrelationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationBus")
            .field("subscriptions", &self.lock().len())
            .finish()
    }
}
