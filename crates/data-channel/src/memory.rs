//! In-process channel pair.
//!
//! Both ends share one ready state. Messages sent on one end arrive as
//! [`ChannelEvent::Message`] on the other; opening or closing either end
//! delivers `Open`/`Close` to both.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fireside_transfer::BoxFuture;
use tokio::sync::mpsc;
use tracing::trace;

use crate::channel::{ChannelEndpoint, ChannelEvent, ChannelMessage, DataChannel, ReadyState};
use crate::error::DataChannelError;

pub struct MemoryChannel {
    label: String,
    state: Arc<Mutex<ReadyState>>,
    own_events: mpsc::UnboundedSender<ChannelEvent>,
    peer_events: mpsc::UnboundedSender<ChannelEvent>,
    close_calls: AtomicUsize,
    sent: Mutex<Vec<ChannelMessage>>,
}

/// One end of a [`memory_pair`].
pub struct MemoryEnd {
    pub channel: Arc<MemoryChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl MemoryEnd {
    pub fn into_endpoint(self) -> ChannelEndpoint {
        ChannelEndpoint::new(self.channel, self.events)
    }

    /// Returns a handle for inspection alongside the endpoint.
    pub fn split(self) -> (Arc<MemoryChannel>, ChannelEndpoint) {
        let handle = Arc::clone(&self.channel);
        (handle, self.into_endpoint())
    }
}

/// Creates two connected ends in the `Connecting` state.
pub fn memory_pair(label: &str) -> (MemoryEnd, MemoryEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Mutex::new(ReadyState::Connecting));

    let a = MemoryChannel::new(label, Arc::clone(&state), a_tx.clone(), b_tx.clone());
    let b = MemoryChannel::new(label, state, b_tx, a_tx);

    (
        MemoryEnd {
            channel: Arc::new(a),
            events: a_rx,
        },
        MemoryEnd {
            channel: Arc::new(b),
            events: b_rx,
        },
    )
}

impl MemoryChannel {
    fn new(
        label: &str,
        state: Arc<Mutex<ReadyState>>,
        own_events: mpsc::UnboundedSender<ChannelEvent>,
        peer_events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            label: label.to_string(),
            state,
            own_events,
            peer_events,
            close_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Moves the pair to `Open` and notifies both ends.
    pub fn open(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ReadyState::Connecting {
                return;
            }
            *state = ReadyState::Open;
        }
        self.broadcast(ChannelEvent::Open);
    }

    /// Simulates the transport dropping without anyone calling `close`.
    pub fn disconnect(&self) {
        self.shut_down();
    }

    /// How many times `close` was called on this end.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Messages sent from this end, in order.
    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Text messages sent from this end, in order.
    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                ChannelMessage::Text(t) => Some(t.clone()),
                ChannelMessage::Binary(_) => None,
            })
            .collect()
    }

    fn shut_down(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ReadyState::Closed {
                return;
            }
            *state = ReadyState::Closed;
        }
        self.broadcast(ChannelEvent::Close);
    }

    fn broadcast(&self, event: ChannelEvent) {
        // Either end may already have been dropped.
        let _ = self.own_events.send(event.clone());
        let _ = self.peer_events.send(event);
    }
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().unwrap()
    }

    fn send(&self, message: ChannelMessage) -> BoxFuture<'_, Result<(), DataChannelError>> {
        let result = if self.ready_state() == ReadyState::Open {
            trace!(label = %self.label, "memory channel send");
            self.sent.lock().unwrap().push(message.clone());
            self.peer_events
                .send(ChannelEvent::Message(message))
                .map_err(|_| DataChannelError::Closed)
        } else {
            Err(DataChannelError::Closed)
        };
        Box::pin(async move { result })
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.shut_down();
    }
}
