//! Endpoints: the addressable transport objects clients talk through.
//!
//! An endpoint is bound to one interface and owns a connection table, an
//! RMA region table, and an event queue. Lock order inside an endpoint is
//! table, then connection, then event queue. The timer map is never held
//! together with another lock.
//!
//! Teardown closes both tables, so a connect or registration that races
//! [`Endpoint::shutdown`] either lands before the drain and is torn down
//! with everything else, or fails without leaving anything behind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ethmsg_link::{LinkError, MacAddr, NetInterface};
use ethmsg_wire::{
    max_send_size_for_mtu, ConnAttribute, Locator, Packet, PacketBody, PacketKind,
};
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionState, PeerAddr};
use crate::error::{CoreError, Result};
use crate::event::{Event, EventId, EventKind, EventQueue, EventStatus};
use crate::handle::HandleTable;
use crate::pin::MemoryPinner;
use crate::rma::{Protection, RegionTable, RmaRegion};

/// Pending connect deadlines, earliest first.
type Timers = BTreeMap<(Instant, u32), Arc<Connection>>;

pub struct Endpoint {
    id: u32,
    interface: Arc<NetInterface>,
    max_send_size: usize,
    config: TransportConfig,
    connections: HandleTable<Arc<Connection>>,
    regions: RegionTable,
    events: EventQueue,
    timers: Mutex<Timers>,
    closing: AtomicBool,
}

impl Endpoint {
    pub(crate) fn new(
        id: u32,
        interface: Arc<NetInterface>,
        pinner: Arc<dyn MemoryPinner>,
        config: &TransportConfig,
    ) -> Result<Self> {
        let max_send_size = max_send_size_for_mtu(interface.mtu()).ok_or_else(|| {
            CoreError::invalid_argument(format!(
                "interface {} MTU {} is too small",
                interface.name(),
                interface.mtu()
            ))
        })?;

        Ok(Self {
            id,
            max_send_size,
            connections: HandleTable::new(
                "connection table",
                config.max_connections_per_endpoint,
            ),
            regions: RegionTable::new(
                pinner,
                config.max_regions_per_endpoint,
                config.large_region_threshold_pages,
            ),
            events: EventQueue::new(),
            timers: Mutex::new(BTreeMap::new()),
            closing: AtomicBool::new(false),
            config: config.clone(),
            interface,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn interface(&self) -> &Arc<NetInterface> {
        &self.interface
    }

    pub fn mac(&self) -> MacAddr {
        self.interface.mac()
    }

    /// Address peers use to reach this endpoint.
    pub fn locator(&self) -> Locator {
        Locator::new(self.mac(), self.id)
    }

    /// Largest message this endpoint can send, derived from the interface MTU.
    pub fn max_send_size(&self) -> usize {
        self.max_send_size
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closing() {
            return Err(CoreError::invalid_state(format!(
                "endpoint {} is closing",
                self.id
            )));
        }
        Ok(())
    }

    fn lock_timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transmit(&self, peer: PeerAddr, body: PacketBody) -> Result<()> {
        if !self.interface.is_up() {
            return Err(LinkError::Down.into());
        }
        let kind = body.kind();
        let packet = Packet::new(peer.mac, self.mac(), peer.endpoint_id, self.id, body);
        let frame = packet.encode()?;
        self.interface.link().transmit(&frame)?;
        trace!(endpoint = self.id, %peer, %kind, len = frame.len(), "transmitted");
        Ok(())
    }

    /// Transmit where failure only merits a warning (teardown notifications).
    fn transmit_best_effort(&self, peer: PeerAddr, body: PacketBody) {
        let kind = body.kind();
        if let Err(err) = self.transmit(peer, body) {
            warn!(endpoint = self.id, %peer, %kind, error = %err, "best-effort transmit failed");
        }
    }

    // ---- Connections ----

    /// Start a connection to `peer`. The result arrives as a
    /// `ConnectCompleted` event; with a `timeout` (or a configured default)
    /// an unanswered request fails with `TimedOut` when events are next read.
    pub fn connect(
        &self,
        peer: PeerAddr,
        attribute: ConnAttribute,
        payload: &[u8],
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<Arc<Connection>> {
        self.ensure_open()?;
        if payload.len() > self.max_send_size {
            return Err(CoreError::invalid_argument(format!(
                "connect payload of {} bytes exceeds max {}",
                payload.len(),
                self.max_send_size
            )));
        }

        let deadline = timeout
            .or(self.config.default_connect_timeout)
            .map(|t| Instant::now() + t);
        let reservation = self.connections.reserve()?;
        let conn = Arc::new(Connection::outbound(
            reservation.id(),
            self.id,
            peer,
            attribute,
            self.max_send_size,
            context,
            deadline,
        ));
        // Published, with its timer armed, before transmitting so a fast
        // reply finds both.
        let conn_id = reservation.publish(Arc::clone(&conn))?;
        if let Some(deadline) = deadline {
            let mut timers = self.lock_timers();
            // Shutdown sets the flag before it clears the timers.
            if !self.is_closing() {
                timers.insert((deadline, conn_id), Arc::clone(&conn));
            }
        }

        let sent = self.transmit(
            peer,
            PacketBody::ConnectRequest {
                src_conn: conn_id,
                attribute,
                max_send_size: self.max_send_size as u32,
                payload: Bytes::copy_from_slice(payload),
            },
        );
        if let Err(err) = sent {
            self.cancel_timer(&conn);
            self.connections
                .remove_if(conn_id, |c| Arc::ptr_eq(c, &conn));
            return Err(err);
        }
        info!(endpoint = self.id, connection = conn_id, %peer, %attribute, "connect requested");
        Ok(conn)
    }

    /// Diagnostic connect request that creates no local connection.
    /// Any reply the peer sends is dropped as unknown.
    pub fn send_probe_connect(&self, peer: PeerAddr) -> Result<()> {
        self.ensure_open()?;
        self.transmit(
            peer,
            PacketBody::ConnectRequest {
                src_conn: u32::MAX,
                attribute: ConnAttribute::default(),
                max_send_size: self.max_send_size as u32,
                payload: Bytes::new(),
            },
        )
    }

    pub fn connection(&self, id: u32) -> Option<Arc<Connection>> {
        self.connections.lookup(id)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .values()
            .into_iter()
            .map(|(_, conn)| conn)
            .collect()
    }

    fn find(&self, id: u32) -> Result<Arc<Connection>> {
        self.connections
            .lookup(id)
            .ok_or(CoreError::ConnectionNotFound(id))
    }

    /// Resolve the connection an event refers to, making sure the table
    /// still holds that same object.
    fn request_connection(&self, event: &Event) -> Result<Arc<Connection>> {
        let EventKind::ConnectRequest { connection, .. } = event.kind() else {
            return Err(CoreError::invalid_argument(format!(
                "event {} is {}, not a connect request",
                event.id(),
                event.kind().name()
            )));
        };
        match self.connections.lookup(connection.id()) {
            Some(current) if Arc::ptr_eq(&current, connection) => Ok(current),
            _ => Err(CoreError::ConnectionNotFound(connection.id())),
        }
    }

    /// Accept an inbound request. Enqueues `AcceptCompleted`.
    pub fn accept(&self, connection_id: u32, context: u64) -> Result<Arc<Connection>> {
        self.ensure_open()?;
        let conn = self.find(connection_id)?;
        self.accept_connection(conn, context)
    }

    /// Accept the request carried by a `ConnectRequest` event.
    pub fn accept_request(&self, event: &Event, context: u64) -> Result<Arc<Connection>> {
        self.ensure_open()?;
        let conn = self.request_connection(event)?;
        self.accept_connection(conn, context)
    }

    fn accept_connection(&self, conn: Arc<Connection>, context: u64) -> Result<Arc<Connection>> {
        let peer = conn.peer();
        conn.accept_with(context, |peer_conn, max_send| {
            self.transmit(
                peer,
                PacketBody::ConnectAccept {
                    dst_conn: peer_conn,
                    src_conn: conn.id(),
                    max_send_size: max_send as u32,
                },
            )?;
            // Queued before the connection turns usable, so it precedes
            // any message the peer sends in reply.
            self.events.push(EventKind::AcceptCompleted {
                status: EventStatus::Success,
                context,
                connection: Arc::clone(&conn),
            });
            Ok(())
        })?;
        info!(endpoint = self.id, connection = conn.id(), %peer, "connection accepted");
        Ok(conn)
    }

    /// Refuse an inbound request. The connection is discarded.
    pub fn reject(&self, connection_id: u32) -> Result<()> {
        self.ensure_open()?;
        let conn = self.find(connection_id)?;
        self.reject_connection(conn)
    }

    /// Refuse the request carried by a `ConnectRequest` event.
    pub fn reject_request(&self, event: &Event) -> Result<()> {
        self.ensure_open()?;
        let conn = self.request_connection(event)?;
        self.reject_connection(conn)
    }

    fn reject_connection(&self, conn: Arc<Connection>) -> Result<()> {
        let peer = conn.peer();
        conn.reject_with(|peer_conn| {
            self.transmit(peer, PacketBody::ConnectReject { dst_conn: peer_conn })
        })?;
        self.connections
            .remove_if(conn.id(), |c| Arc::ptr_eq(c, &conn));
        info!(endpoint = self.id, connection = conn.id(), %peer, "connection rejected");
        Ok(())
    }

    /// Send one message. Enqueues `SendCompleted` once it is on the wire.
    pub fn send(&self, connection_id: u32, payload: impl Into<Bytes>, context: u64) -> Result<()> {
        self.ensure_open()?;
        let payload = payload.into();
        let conn = self.find(connection_id)?;
        let peer_conn = conn.check_send(payload.len())?;
        self.transmit(
            conn.peer(),
            PacketBody::Message {
                dst_conn: peer_conn,
                reliable: conn.attribute().is_reliable(),
                payload,
            },
        )?;
        self.events.push(EventKind::SendCompleted {
            connection: conn,
            status: EventStatus::Success,
            context,
        });
        Ok(())
    }

    /// Close a connection and forget it. A connected peer is notified; an
    /// unanswered inbound request is rejected on the wire first.
    pub fn disconnect(&self, connection_id: u32) -> Result<()> {
        let conn = self
            .connections
            .remove(connection_id)
            .ok_or(CoreError::ConnectionNotFound(connection_id))?;
        self.cancel_timer(&conn);
        self.notify_close(&conn);
        info!(endpoint = self.id, connection = connection_id, "disconnected");
        Ok(())
    }

    fn notify_close(&self, conn: &Connection) {
        let outcome = conn.close();
        let Some(peer_conn) = outcome.peer_conn_id else {
            return;
        };
        if outcome.was_awaiting_reply {
            self.transmit_best_effort(conn.peer(), PacketBody::ConnectReject { dst_conn: peer_conn });
        } else if outcome.previous == ConnectionState::Connected {
            self.transmit_best_effort(
                conn.peer(),
                PacketBody::ConnectionClosed { dst_conn: peer_conn },
            );
        }
    }

    // ---- RMA ----

    /// Pin `[address, address + length)` for remote access.
    pub fn register_region(
        &self,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> Result<u32> {
        self.ensure_open()?;
        self.regions.register(address, length, protection)
    }

    /// Unpin a region. May block while pages are released.
    pub fn deregister_region(&self, region_id: u32) -> Result<()> {
        self.regions.deregister(region_id)
    }

    pub fn region(&self, region_id: u32) -> Option<Arc<RmaRegion>> {
        self.regions.lookup(region_id)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    // ---- Events ----

    /// Take the next event without blocking. Expired connects are failed
    /// first so their `ConnectCompleted` is queued behind earlier events.
    pub fn get_next_event(&self) -> Option<Event> {
        self.expire_connects(Instant::now());
        self.events.pop()
    }

    /// Release a delivered event.
    pub fn acknowledge(&self, id: EventId) -> Result<()> {
        self.events.acknowledge(id).map(drop)
    }

    /// Block until an event is ready or `timeout` passes. Pending connect
    /// deadlines are honoured while waiting.
    pub fn wait_event(&self, timeout: Option<Duration>) -> bool {
        let give_up = timeout.map(|t| Instant::now() + t);
        loop {
            let now = Instant::now();
            self.expire_connects(now);
            if !self.events.is_empty() {
                return true;
            }
            if self.events.is_closed() || give_up.is_some_and(|g| now >= g) {
                return false;
            }
            let wake = match (give_up, self.next_deadline()) {
                (Some(g), Some(d)) => Some(g.min(d)),
                (g, d) => g.or(d),
            };
            if self.events.wait(wake.map(|w| w.saturating_duration_since(now))) {
                return true;
            }
        }
    }

    /// Resolve once an event is ready or the endpoint closes.
    #[cfg(feature = "async")]
    pub async fn readable(&self) {
        loop {
            self.expire_connects(Instant::now());
            if !self.events.is_empty() || self.events.is_closed() {
                return;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    let _ = tokio::time::timeout(wait, self.events.readable()).await;
                }
                None => self.events.readable().await,
            }
        }
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn outstanding_events(&self) -> usize {
        self.events.outstanding()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock_timers().keys().next().map(|(deadline, _)| *deadline)
    }

    /// Drop the connect timer of a connection that left `Requesting`.
    fn cancel_timer(&self, conn: &Arc<Connection>) {
        let Some(deadline) = conn.connect_deadline() else {
            return;
        };
        let mut timers = self.lock_timers();
        let key = (deadline, conn.id());
        if timers.get(&key).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            timers.remove(&key);
        }
    }

    #[cfg(test)]
    fn pending_timers(&self) -> usize {
        self.lock_timers().len()
    }

    fn expire_connects(&self, now: Instant) {
        let due: Vec<Arc<Connection>> = {
            let mut timers = self.lock_timers();
            let mut due = Vec::new();
            while let Some(entry) = timers.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                due.push(entry.remove());
            }
            due
        };

        for conn in due {
            let Some(context) = conn.expire(now) else {
                continue;
            };
            self.connections
                .remove_if(conn.id(), |c| Arc::ptr_eq(c, &conn));
            debug!(endpoint = self.id, connection = conn.id(), "connect timed out");
            self.events.push(EventKind::ConnectCompleted {
                status: EventStatus::TimedOut,
                context,
                connection: None,
            });
        }
    }

    // ---- Receive path ----

    /// Apply one inbound packet addressed to this endpoint. Packets that do
    /// not fit the current state are dropped.
    pub(crate) fn handle_packet(&self, packet: Packet) {
        if self.is_closing() {
            return;
        }
        let peer = PeerAddr::new(packet.src_mac, packet.src_endpoint);
        let kind = packet.kind();

        match packet.body {
            PacketBody::ConnectRequest {
                src_conn,
                attribute,
                max_send_size,
                payload,
            } => self.on_connect_request(peer, src_conn, attribute, max_send_size, payload),
            PacketBody::ConnectAccept {
                dst_conn,
                src_conn,
                max_send_size,
            } => {
                let Some(conn) = self.inbound_target(dst_conn, peer, kind) else {
                    return;
                };
                match conn.on_accept_received(src_conn, max_send_size as usize) {
                    Ok(context) => {
                        self.cancel_timer(&conn);
                        info!(endpoint = self.id, connection = dst_conn, %peer, "connection established");
                        self.events.push(EventKind::ConnectCompleted {
                            status: EventStatus::Success,
                            context,
                            connection: Some(conn),
                        });
                    }
                    Err(err) => debug!(endpoint = self.id, error = %err, "dropping accept"),
                }
            }
            PacketBody::ConnectReject { dst_conn } => {
                let Some(conn) = self.inbound_target(dst_conn, peer, kind) else {
                    return;
                };
                match conn.on_reject_received() {
                    Ok(context) => {
                        self.cancel_timer(&conn);
                        self.connections
                            .remove_if(dst_conn, |c| Arc::ptr_eq(c, &conn));
                        info!(endpoint = self.id, connection = dst_conn, %peer, "connect rejected by peer");
                        self.events.push(EventKind::ConnectCompleted {
                            status: EventStatus::Rejected,
                            context,
                            connection: None,
                        });
                    }
                    Err(err) => debug!(endpoint = self.id, error = %err, "dropping reject"),
                }
            }
            PacketBody::Message {
                dst_conn, payload, ..
            } => {
                let Some(conn) = self.inbound_target(dst_conn, peer, kind) else {
                    return;
                };
                if !conn.is_usable() {
                    debug!(endpoint = self.id, connection = dst_conn, "message on unusable connection dropped");
                    return;
                }
                if payload.len() > conn.max_send_size() {
                    debug!(endpoint = self.id, connection = dst_conn, len = payload.len(), "oversized message dropped");
                    return;
                }
                let queued = self.events.push_bounded(
                    EventKind::MessageReceived {
                        connection: conn,
                        payload,
                    },
                    self.config.max_queued_events,
                );
                if queued.is_none() {
                    warn!(endpoint = self.id, connection = dst_conn, "event queue full, message dropped");
                }
            }
            PacketBody::Rma {
                dst_conn,
                op,
                remote_handle,
                remote_offset,
                payload,
            } => {
                if self.inbound_target(dst_conn, peer, kind).is_none() {
                    return;
                }
                let region = u32::try_from(remote_handle)
                    .ok()
                    .and_then(|id| self.regions.lookup(id));
                let verdict = match region {
                    Some(region) => region
                        .check_access(op, remote_offset, payload.len())
                        .map_err(|err| err.to_string()),
                    None => Err(format!("unknown region {remote_handle}")),
                };
                debug!(
                    endpoint = self.id,
                    connection = dst_conn,
                    ?op,
                    remote_handle,
                    remote_offset,
                    len = payload.len(),
                    valid = verdict.is_ok(),
                    "RMA packet not executed, dropped"
                );
            }
            PacketBody::ConnectionClosed { dst_conn } => {
                let Some(conn) = self.inbound_target(dst_conn, peer, kind) else {
                    return;
                };
                if conn.on_closed_received() {
                    info!(endpoint = self.id, connection = dst_conn, %peer, "connection closed by peer");
                    self.events
                        .push(EventKind::ConnectionClosed { connection: conn });
                }
            }
        }
    }

    /// Connection `dst_conn` if it exists and belongs to `peer`.
    fn inbound_target(
        &self,
        dst_conn: u32,
        peer: PeerAddr,
        kind: PacketKind,
    ) -> Option<Arc<Connection>> {
        let Some(conn) = self.connections.lookup(dst_conn) else {
            debug!(endpoint = self.id, connection = dst_conn, %kind, "unknown connection, dropped");
            return None;
        };
        if !conn.matches_peer(peer, None) {
            debug!(endpoint = self.id, connection = dst_conn, %peer, %kind, "peer mismatch, dropped");
            return None;
        }
        Some(conn)
    }

    fn on_connect_request(
        &self,
        peer: PeerAddr,
        src_conn: u32,
        attribute: ConnAttribute,
        peer_max_send: u32,
        payload: Bytes,
    ) {
        let reservation = match self.connections.reserve() {
            Ok(reservation) => reservation,
            Err(err) => {
                warn!(endpoint = self.id, %peer, error = %err, "refusing connect request");
                self.transmit_best_effort(peer, PacketBody::ConnectReject { dst_conn: src_conn });
                return;
            }
        };

        let max_send = self.max_send_size.min(peer_max_send as usize);
        let conn = Arc::new(Connection::inbound(
            reservation.id(),
            self.id,
            peer,
            attribute,
            src_conn,
            max_send,
        ));
        let conn_id = match reservation.publish(Arc::clone(&conn)) {
            Ok(id) => id,
            Err(err) => {
                debug!(endpoint = self.id, %peer, error = %err, "connect request arrived during teardown");
                self.transmit_best_effort(peer, PacketBody::ConnectReject { dst_conn: src_conn });
                return;
            }
        };
        info!(endpoint = self.id, connection = conn_id, %peer, %attribute, "connect request received");
        self.events.push(EventKind::ConnectRequest {
            connection: conn,
            attribute,
            payload,
        });
    }

    /// Queue a `DeviceFailed` event.
    pub(crate) fn report_device_failure(&self) {
        self.events.push(EventKind::DeviceFailed);
    }

    // ---- Teardown ----

    /// Tear down every connection, region, and event. Connected peers are
    /// told the connection closed. Returns false if already shut down.
    pub fn shutdown(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.lock_timers().clear();
        let connections = self.connections.close();
        for (_, conn) in &connections {
            self.notify_close(conn);
        }
        let regions = self.regions.close();
        let events = self.events.close();
        info!(
            endpoint = self.id,
            connections = connections.len(),
            regions,
            events,
            "endpoint closed"
        );
        true
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("interface", &self.interface.name())
            .field("mac", &self.mac())
            .field("max_send_size", &self.max_send_size)
            .field("connections", &self.connections.len())
            .field("regions", &self.regions.len())
            .field("events", &self.events)
            .field("closing", &self.is_closing())
            .finish()
    }
}
