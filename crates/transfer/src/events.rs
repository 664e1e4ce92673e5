//! Publish/subscribe contract shared by transfer roles.
//!
//! Handlers run synchronously on the emitting task. They are cloned out of
//! the subscriber list before being invoked, so a handler may subscribe or
//! unsubscribe without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Event names a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Progress,
    ChunkReceived,
    Write,
    Complete,
    Error,
    Disconnected,
    Aborted,
    StateChanged,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::ChunkReceived => "receiveChunk",
            Self::Write => "write",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Disconnected => "disconnect",
            Self::Aborted => "abort",
            Self::StateChanged => "stateChanged",
        }
    }
}

/// An event emitted by a sender or receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The transfer has metadata and is moving chunks.
    Started,
    Progress { bytes: u64, total: u64 },
    ChunkReceived { index: u32 },
    /// A block was appended to storage and the snapshot saved.
    Write { saved_chunks: u32 },
    /// Emitted exactly once per transfer.
    Complete { file_url: Option<String> },
    Error { message: String },
    Disconnected,
    Aborted,
    /// Bitrate, status or counters changed.
    StateChanged,
}

impl TransferEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started => EventKind::Started,
            Self::Progress { .. } => EventKind::Progress,
            Self::ChunkReceived { .. } => EventKind::ChunkReceived,
            Self::Write { .. } => EventKind::Write,
            Self::Complete { .. } => EventKind::Complete,
            Self::Error { .. } => EventKind::Error,
            Self::Disconnected => EventKind::Disconnected,
            Self::Aborted => EventKind::Aborted,
            Self::StateChanged => EventKind::StateChanged,
        }
    }
}

/// Callback registered with an [`EventBus`].
pub type EventHandler = Arc<dyn Fn(&TransferEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(handler))
    }

    /// Registers `handler` for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    /// Removes a handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().unwrap();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Invokes every handler subscribed to the event's kind.
    pub fn emit(&self, event: TransferEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = {
            let subs = self.subscriptions.read().unwrap();
            subs.iter()
                .filter(|s| s.kind.is_none_or(|k| k == kind))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().unwrap().len()
    }

    fn insert(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap()
            .push(Subscription { id, kind, handler });
        id
    }
}

/// Implemented by every transfer role to expose its [`EventBus`].
pub trait Subscribe {
    fn events(&self) -> &EventBus;

    fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
        Self: Sized,
    {
        self.events().subscribe(kind, handler)
    }

    fn off(&self, id: SubscriptionId) -> bool {
        self.events().unsubscribe(id)
    }
}
