//! Synchronous signal bus with a replay buffer for late subscribers.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Maximum number of events kept for `since()` replays.
pub const EVENT_BUFFER_SIZE: usize = 10_240;

/// Signals emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    #[serde(rename = "workflow.created")]
    WorkflowCreated,
    #[serde(rename = "workflow.modified")]
    WorkflowModified,
    #[serde(rename = "workflow.removed")]
    WorkflowRemoved,
    #[serde(rename = "workflow.capture-executed")]
    CaptureExecuted,
    #[serde(rename = "workflow.step-progressed")]
    StepProgressed,
    #[serde(rename = "logrecord-emitted")]
    LogRecordEmitted,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::WorkflowCreated => "workflow.created",
            Signal::WorkflowModified => "workflow.modified",
            Signal::WorkflowRemoved => "workflow.removed",
            Signal::CaptureExecuted => "workflow.capture-executed",
            Signal::StepProgressed => "workflow.step-progressed",
            Signal::LogRecordEmitted => "logrecord-emitted",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Keyword payload attached to an emission.
pub type Payload = Map<String, Value>;

/// One emission, as buffered and delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub seq: u64,
    pub signal: Signal,
    pub sender: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Wire form consumed by streaming front ends.
    pub fn to_message(&self) -> EventMessage {
        EventMessage {
            event: self.signal.name().to_string(),
            data: Value::Object(self.payload.clone()),
            seq: self.seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub data: Value,
    pub seq: u64,
}

pub type Listener = dyn Fn(&Event) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum ListenerRef {
    Strong(Arc<Listener>),
    Weak(Weak<Listener>),
}

impl ListenerRef {
    fn upgrade(&self) -> Option<Arc<Listener>> {
        match self {
            ListenerRef::Strong(l) => Some(Arc::clone(l)),
            ListenerRef::Weak(l) => l.upgrade(),
        }
    }
}

struct Subscription {
    id: ListenerId,
    signal: Signal,
    sender: Option<String>,
    listener: ListenerRef,
}

struct BusState {
    next_listener: u64,
    next_seq: u64,
    subscriptions: Vec<Subscription>,
    buffer: VecDeque<Event>,
}

/// Named signals with synchronous fan-out.
///
/// The engine hands one bus to every workflow it opens.
pub struct EventBus {
    state: Mutex<BusState>,
    capacity: usize,
    stream: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(BusState {
                next_listener: 0,
                next_seq: 0,
                subscriptions: Vec::new(),
                buffer: VecDeque::with_capacity(capacity.min(1024)),
            }),
            capacity: capacity.max(1),
            stream,
        }
    }

    /// Registers a listener for `signal`, optionally restricted to one sender.
    pub fn connect(
        &self,
        signal: Signal,
        listener: Arc<Listener>,
        sender: Option<&str>,
    ) -> ListenerId {
        self.subscribe_ref(signal, ListenerRef::Strong(listener), sender)
    }

    /// Like `connect`, but the bus only keeps a weak reference. The listener is
    /// dropped from the bus once the caller's `Arc` goes away.
    pub fn connect_weak(
        &self,
        signal: Signal,
        listener: &Arc<Listener>,
        sender: Option<&str>,
    ) -> ListenerId {
        self.subscribe_ref(signal, ListenerRef::Weak(Arc::downgrade(listener)), sender)
    }

    fn subscribe_ref(
        &self,
        signal: Signal,
        listener: ListenerRef,
        sender: Option<&str>,
    ) -> ListenerId {
        let mut state = self.state.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.subscriptions.push(Subscription {
            id,
            signal,
            sender: sender.map(str::to_string),
            listener,
        });
        id
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != id);
        state.subscriptions.len() != before
    }

    /// Emits `signal` and returns the event's sequence number.
    ///
    /// Listeners run on the calling thread in registration order. A panicking
    /// listener is logged and skipped.
    pub fn send(&self, signal: Signal, sender: &str, payload: Payload) -> u64 {
        let (event, listeners) = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            let event = Event {
                seq: state.next_seq,
                signal,
                sender: sender.to_string(),
                payload,
                timestamp: Utc::now(),
            };
            if state.buffer.len() >= self.capacity {
                state.buffer.pop_front();
            }
            state.buffer.push_back(event.clone());

            let mut listeners = Vec::new();
            state.subscriptions.retain(|sub| match sub.listener.upgrade() {
                Some(listener) => {
                    let sender_matches = sub.sender.as_deref().is_none_or(|s| s == sender);
                    if sub.signal == signal && sender_matches {
                        listeners.push(listener);
                    }
                    true
                }
                None => false,
            });
            (event, listeners)
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                log::warn!(
                    "Listener for '{}' (seq {}) panicked; continuing",
                    event.signal,
                    event.seq
                );
            }
        }

        // No active receivers is fine
        let _ = self.stream.send(event.clone());
        event.seq
    }

    /// Buffered events with a sequence number greater than `seq`.
    pub fn since(&self, seq: u64) -> Vec<Event> {
        let state = self.state.lock();
        state
            .buffer
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect()
    }

    /// Sequence number of the most recent emission (0 before the first).
    pub fn last_seq(&self) -> u64 {
        self.state.lock().next_seq
    }

    /// Live subscription for async consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.stream.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("last_seq", &self.last_seq())
            .finish()
    }
}

/// Builds a payload from `key => value` pairs.
#[macro_export]
macro_rules! payload {
    () => { ::serde_json::Map::new() };
    ($($key:literal => $value:expr),+ $(,)?) => {{
        let mut map = ::serde_json::Map::new();
        $( map.insert($key.to_string(), ::serde_json::json!($value)); )+
        map
    }};
}
