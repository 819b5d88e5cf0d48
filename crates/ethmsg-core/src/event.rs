//! Per-endpoint completion and notification events.
//!
//! Producers append at the tail; the client takes events from the head in
//! the order they were produced. A taken event stays outstanding until the
//! client acknowledges it or the endpoint is torn down.
//!
//! The queue's lock is a leaf: nothing else is locked while it is held, so
//! producers may push while holding a connection lock.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ethmsg_wire::ConnAttribute;

use crate::connection::Connection;
use crate::error::{CoreError, Result};

/// Identifies one event within its endpoint. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome carried by completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Success,
    /// The peer refused the connect.
    Rejected,
    /// The connect deadline passed without a reply.
    TimedOut,
    Failed,
}

impl EventStatus {
    pub fn code(self) -> u32 {
        match self {
            EventStatus::Success => 0,
            EventStatus::Rejected => 1,
            EventStatus::TimedOut => 2,
            EventStatus::Failed => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(EventStatus::Success),
            1 => Some(EventStatus::Rejected),
            2 => Some(EventStatus::TimedOut),
            3 => Some(EventStatus::Failed),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == EventStatus::Success
    }
}

#[derive(Debug, Clone)]
pub enum EventKind {
    SendCompleted {
        connection: Arc<Connection>,
        status: EventStatus,
        context: u64,
    },
    MessageReceived {
        connection: Arc<Connection>,
        payload: Bytes,
    },
    /// An inbound connect that must be answered with exactly one accept or reject.
    ConnectRequest {
        connection: Arc<Connection>,
        attribute: ConnAttribute,
        payload: Bytes,
    },
    /// Outcome of a local connect. Failed connects no longer have a connection.
    ConnectCompleted {
        status: EventStatus,
        context: u64,
        connection: Option<Arc<Connection>>,
    },
    AcceptCompleted {
        status: EventStatus,
        context: u64,
        connection: Arc<Connection>,
    },
    ConnectionClosed {
        connection: Arc<Connection>,
    },
    DeviceFailed,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SendCompleted { .. } => "send-completed",
            EventKind::MessageReceived { .. } => "message-received",
            EventKind::ConnectRequest { .. } => "connect-request",
            EventKind::ConnectCompleted { .. } => "connect-completed",
            EventKind::AcceptCompleted { .. } => "accept-completed",
            EventKind::ConnectionClosed { .. } => "connection-closed",
            EventKind::DeviceFailed => "device-failed",
        }
    }

    /// Numeric type used in control-plane event records.
    pub fn code(&self) -> u32 {
        match self {
            EventKind::SendCompleted { .. } => 1,
            EventKind::MessageReceived { .. } => 2,
            EventKind::ConnectRequest { .. } => 3,
            EventKind::ConnectCompleted { .. } => 4,
            EventKind::AcceptCompleted { .. } => 5,
            EventKind::ConnectionClosed { .. } => 6,
            EventKind::DeviceFailed => 7,
        }
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            EventKind::SendCompleted { connection, .. }
            | EventKind::MessageReceived { connection, .. }
            | EventKind::ConnectRequest { connection, .. }
            | EventKind::AcceptCompleted { connection, .. }
            | EventKind::ConnectionClosed { connection } => Some(connection),
            EventKind::ConnectCompleted { connection, .. } => connection.as_ref(),
            EventKind::DeviceFailed => None,
        }
    }

    pub fn status(&self) -> EventStatus {
        match self {
            EventKind::SendCompleted { status, .. }
            | EventKind::ConnectCompleted { status, .. }
            | EventKind::AcceptCompleted { status, .. } => *status,
            EventKind::DeviceFailed => EventStatus::Failed,
            _ => EventStatus::Success,
        }
    }

    pub fn context(&self) -> u64 {
        match self {
            EventKind::SendCompleted { context, .. }
            | EventKind::ConnectCompleted { context, .. }
            | EventKind::AcceptCompleted { context, .. } => *context,
            _ => 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            EventKind::MessageReceived { payload, .. } | EventKind::ConnectRequest { payload, .. } => {
                payload
            }
            _ => &[],
        }
    }
}

/// One delivered or pending event.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    kind: EventKind,
}

impl Event {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn into_kind(self) -> EventKind {
        self.kind
    }

    /// A connect request the client has not accepted or rejected yet.
    pub fn is_unanswered_request(&self) -> bool {
        matches!(&self.kind, EventKind::ConnectRequest { connection, .. } if connection.is_awaiting_reply())
    }
}

struct QueueState {
    next_id: u64,
    pending: VecDeque<Event>,
    outstanding: BTreeMap<EventId, Event>,
    closed: bool,
}

/// FIFO event queue of one endpoint.
pub struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    #[cfg(feature = "async")]
    notify: tokio::sync::Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                pending: VecDeque::new(),
                outstanding: BTreeMap::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            #[cfg(feature = "async")]
            notify: tokio::sync::Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event. `None` once the queue is closed.
    pub fn push(&self, kind: EventKind) -> Option<EventId> {
        self.push_bounded(kind, usize::MAX)
    }

    /// Append an event unless `limit` events are already pending.
    pub fn push_bounded(&self, kind: EventKind, limit: usize) -> Option<EventId> {
        let id = {
            let mut state = self.lock();
            if state.closed || state.pending.len() >= limit {
                return None;
            }
            let id = EventId(state.next_id);
            state.next_id += 1;
            state.pending.push_back(Event { id, kind });
            id
        };
        self.ready.notify_all();
        #[cfg(feature = "async")]
        self.notify.notify_one();
        Some(id)
    }

    /// Take the oldest pending event without blocking. It stays
    /// outstanding until acknowledged.
    pub fn pop(&self) -> Option<Event> {
        let mut state = self.lock();
        let event = state.pending.pop_front()?;
        state.outstanding.insert(event.id, event.clone());
        Some(event)
    }

    /// Release a delivered event.
    pub fn acknowledge(&self, id: EventId) -> Result<Event> {
        let event = self
            .lock()
            .outstanding
            .get(&id)
            .cloned()
            .ok_or(CoreError::EventNotFound(id.0))?;
        // The queue lock is innermost, so the connection is checked
        // without it. A request never becomes unanswered again.
        if event.is_unanswered_request() {
            return Err(CoreError::invalid_state(format!(
                "event {id} is a connect request that was never accepted or rejected"
            )));
        }
        self.lock()
            .outstanding
            .remove(&id)
            .ok_or(CoreError::EventNotFound(id.0))
    }

    /// Block until an event is pending, the queue closes, or `timeout`
    /// passes. Returns whether an event is pending.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if !state.pending.is_empty() {
                return true;
            }
            if state.closed {
                return false;
            }
            state = match deadline {
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Resolve once an event is pending or the queue closes.
    #[cfg(feature = "async")]
    pub async fn readable(&self) {
        loop {
            {
                let state = self.lock();
                if !state.pending.is_empty() || state.closed {
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Events waiting to be taken.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events taken but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the queue and release every pending and outstanding event.
    /// Returns how many were released.
    pub fn close(&self) -> usize {
        let released = {
            let mut state = self.lock();
            state.closed = true;
            let pending = std::mem::take(&mut state.pending);
            let outstanding = std::mem::take(&mut state.outstanding);
            pending.len() + outstanding.len()
        };
        self.ready.notify_all();
        #[cfg(feature = "async")]
        self.notify.notify_waiters();
        released
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventQueue")
            .field("pending", &state.pending.len())
            .field("outstanding", &state.outstanding.len())
            .field("closed", &state.closed)
            .finish()
    }
}
