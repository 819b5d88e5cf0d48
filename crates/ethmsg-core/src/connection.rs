//! Connection state machine.
//!
//! ```text
//!   connect()                         inbound CONNECT_REQUEST
//!      │                                      │
//!      ▼                                      ▼
//!  Requesting ──accept pkt──▶ Connected ◀──accept()── RequestReceived
//!      │                         │                        │
//!      │ timeout or              └─closed pkt──▶ Closed ◀─reject()
//!      └─reject pkt──▶ Failed
//! ```
//!
//! A refused connect is `Failed` like a timed-out one; the refusal itself
//! is reported as `EventStatus::Rejected` on the `ConnectCompleted` event.
//!
//! Every transition happens under the connection's own lock. Accept and
//! reject transmit their wire packet while holding it, so one inbound
//! request is answered on the wire at most once.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use ethmsg_link::MacAddr;
use ethmsg_wire::{ConnAttribute, Locator};

use crate::error::{CoreError, Result};

/// Hardware address and endpoint id of the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub mac: MacAddr,
    pub endpoint_id: u32,
}

impl PeerAddr {
    pub fn new(mac: MacAddr, endpoint_id: u32) -> Self {
        Self { mac, endpoint_id }
    }

    pub fn locator(&self) -> Locator {
        Locator::new(self.mac, self.endpoint_id)
    }
}

impl From<Locator> for PeerAddr {
    fn from(loc: Locator) -> Self {
        Self::new(loc.mac, loc.endpoint_id)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.locator().fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Outbound connect sent, waiting for the peer.
    Requesting,
    /// Inbound connect received, waiting for the local client.
    RequestReceived,
    Connected,
    Closed,
    /// Our connect timed out or the peer refused it.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Requesting => "requesting",
            ConnectionState::RequestReceived => "request-received",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::Failed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ConnectionInner {
    state: ConnectionState,
    peer_conn_id: Option<u32>,
    max_send_size: usize,
    context: u64,
    awaiting_reply: bool,
    deadline: Option<Instant>,
    usable: bool,
}

/// What a local close found, so the caller can tell the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CloseOutcome {
    pub previous: ConnectionState,
    pub peer_conn_id: Option<u32>,
    /// An inbound request was still unanswered.
    pub was_awaiting_reply: bool,
}

/// One connection of an endpoint. Shared between the endpoint's table and
/// any queued event that refers to it.
pub struct Connection {
    id: u32,
    endpoint_id: u32,
    peer: PeerAddr,
    attribute: ConnAttribute,
    /// Deadline the connect was started with; keys the endpoint's timer.
    connect_deadline: Option<Instant>,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub(crate) fn outbound(
        id: u32,
        endpoint_id: u32,
        peer: PeerAddr,
        attribute: ConnAttribute,
        max_send_size: usize,
        context: u64,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            endpoint_id,
            peer,
            attribute,
            connect_deadline: deadline,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Requesting,
                peer_conn_id: None,
                max_send_size,
                context,
                awaiting_reply: false,
                deadline,
                usable: false,
            }),
        }
    }

    pub(crate) fn inbound(
        id: u32,
        endpoint_id: u32,
        peer: PeerAddr,
        attribute: ConnAttribute,
        peer_conn_id: u32,
        max_send_size: usize,
    ) -> Self {
        Self {
            id,
            endpoint_id,
            peer,
            attribute,
            connect_deadline: None,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::RequestReceived,
                peer_conn_id: Some(peer_conn_id),
                max_send_size,
                context: 0,
                awaiting_reply: true,
                deadline: None,
                usable: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Local id. Outbound connections send it as their provisional id in
    /// the connect request; inbound ones reveal it in the accept.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn endpoint_id(&self) -> u32 {
        self.endpoint_id
    }

    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub fn attribute(&self) -> ConnAttribute {
        self.attribute
    }

    pub(crate) fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// The peer's id for this connection, once known.
    pub fn peer_conn_id(&self) -> Option<u32> {
        self.lock().peer_conn_id
    }

    pub fn max_send_size(&self) -> usize {
        self.lock().max_send_size
    }

    /// Client context supplied at connect or accept time.
    pub fn context(&self) -> u64 {
        self.lock().context
    }

    /// An inbound request that still needs an accept or reject.
    pub fn is_awaiting_reply(&self) -> bool {
        self.lock().awaiting_reply
    }

    /// Whether sends are currently allowed.
    pub fn is_usable(&self) -> bool {
        let inner = self.lock();
        inner.usable && inner.state == ConnectionState::Connected
    }

    /// Answer an inbound request positively. `transmit` receives the peer's
    /// provisional id and the negotiated max message size and must put the
    /// accept on the wire; nothing changes if it fails. The connection only
    /// becomes usable after `transmit` returns.
    pub(crate) fn accept_with(
        &self,
        context: u64,
        transmit: impl FnOnce(u32, usize) -> Result<()>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let peer_conn_id = self.answerable(&inner)?;
        transmit(peer_conn_id, inner.max_send_size)?;
        inner.state = ConnectionState::Connected;
        inner.awaiting_reply = false;
        inner.usable = true;
        inner.context = context;
        Ok(())
    }

    /// Answer an inbound request negatively. `transmit` receives the peer's
    /// provisional id and must put the reject on the wire.
    pub(crate) fn reject_with(&self, transmit: impl FnOnce(u32) -> Result<()>) -> Result<()> {
        let mut inner = self.lock();
        let peer_conn_id = self.answerable(&inner)?;
        transmit(peer_conn_id)?;
        inner.state = ConnectionState::Closed;
        inner.awaiting_reply = false;
        Ok(())
    }

    fn answerable(&self, inner: &ConnectionInner) -> Result<u32> {
        if !inner.awaiting_reply || inner.state != ConnectionState::RequestReceived {
            return Err(CoreError::invalid_state(format!(
                "connection {} is {} and has no request to answer",
                self.id, inner.state
            )));
        }
        inner
            .peer_conn_id
            .ok_or_else(|| CoreError::invalid_state("inbound request without peer id"))
    }

    /// Peer accepted our request. Returns the connect context.
    pub(crate) fn on_accept_received(&self, peer_conn_id: u32, peer_max_send: usize) -> Result<u64> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Requesting {
            return Err(CoreError::invalid_state(format!(
                "accept for connection {} in state {}",
                self.id, inner.state
            )));
        }
        inner.state = ConnectionState::Connected;
        inner.peer_conn_id = Some(peer_conn_id);
        inner.max_send_size = inner.max_send_size.min(peer_max_send);
        inner.deadline = None;
        inner.usable = true;
        Ok(inner.context)
    }

    /// Peer refused our request. Returns the connect context.
    pub(crate) fn on_reject_received(&self) -> Result<u64> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Requesting {
            return Err(CoreError::invalid_state(format!(
                "reject for connection {} in state {}",
                self.id, inner.state
            )));
        }
        inner.state = ConnectionState::Failed;
        inner.deadline = None;
        Ok(inner.context)
    }

    /// Fail a pending connect whose deadline is at or before `now`.
    /// Returns the connect context if it expired.
    pub(crate) fn expire(&self, now: Instant) -> Option<u64> {
        let mut inner = self.lock();
        let deadline = inner.deadline;
        match deadline {
            Some(deadline) if inner.state == ConnectionState::Requesting && deadline <= now => {
                inner.state = ConnectionState::Failed;
                inner.deadline = None;
                Some(inner.context)
            }
            _ => None,
        }
    }

    /// Peer closed. Sends stop immediately; the object stays valid for
    /// events that still refer to it.
    pub(crate) fn on_closed_received(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connected {
            return false;
        }
        inner.usable = false;
        inner.state = ConnectionState::Closed;
        true
    }

    /// Close locally, whatever the state.
    pub(crate) fn close(&self) -> CloseOutcome {
        let mut inner = self.lock();
        let outcome = CloseOutcome {
            previous: inner.state,
            peer_conn_id: inner.peer_conn_id,
            was_awaiting_reply: inner.awaiting_reply,
        };
        inner.state = ConnectionState::Closed;
        inner.awaiting_reply = false;
        inner.usable = false;
        inner.deadline = None;
        outcome
    }

    /// Peer id to address a data message of `len` bytes to.
    pub(crate) fn check_send(&self, len: usize) -> Result<u32> {
        let inner = self.lock();
        if inner.state != ConnectionState::Connected || !inner.usable {
            return Err(CoreError::invalid_state(format!(
                "connection {} is {} and cannot send",
                self.id, inner.state
            )));
        }
        if len > inner.max_send_size {
            return Err(CoreError::invalid_argument(format!(
                "message of {len} bytes exceeds max {}",
                inner.max_send_size
            )));
        }
        inner
            .peer_conn_id
            .ok_or_else(|| CoreError::invalid_state("connected without peer id"))
    }

    /// Whether a packet from `peer` claiming connection `peer_conn_id` belongs here.
    pub(crate) fn matches_peer(&self, peer: PeerAddr, peer_conn_id: Option<u32>) -> bool {
        if peer != self.peer {
            return false;
        }
        match (peer_conn_id, self.lock().peer_conn_id) {
            (Some(claimed), Some(known)) => claimed == known,
            _ => true,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint_id", &self.endpoint_id)
            .field("peer", &self.peer)
            .field("attribute", &self.attribute)
            .field("state", &inner.state)
            .field("peer_conn_id", &inner.peer_conn_id)
            .field("max_send_size", &inner.max_send_size)
            .field("awaiting_reply", &inner.awaiting_reply)
            .finish()
    }
}
