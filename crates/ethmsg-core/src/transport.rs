//! The transport: interfaces, the endpoint table, and frame dispatch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ethmsg_link::{MacAddr, NetInterface};
use ethmsg_wire::{decode_packet, ConnAttribute, Locator};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::{Connection, PeerAddr};
use crate::device::{InterfaceInfo, InterfaceRegistry};
use crate::endpoint::Endpoint;
use crate::error::{CoreError, Result};
use crate::handle::HandleTable;
use crate::pin::{default_pinner, MemoryPinner};

/// Frames taken from one interface per [`Transport::poll`] pass.
pub const POLL_BUDGET: usize = 64;

/// Process-wide state: registered interfaces and live endpoints.
///
/// Control calls and the receive path share one `Transport` (usually in an
/// `Arc`). The endpoint table lock is held only long enough to resolve an
/// id; endpoint operations run without it.
pub struct Transport {
    config: TransportConfig,
    pinner: Arc<dyn MemoryPinner>,
    interfaces: InterfaceRegistry,
    endpoints: HandleTable<Arc<Endpoint>>,
}

impl Transport {
    /// Transport pinning pages with the platform default pinner.
    pub fn new(config: TransportConfig) -> Self {
        Self::with_pinner(config, default_pinner())
    }

    pub fn with_pinner(config: TransportConfig, pinner: Arc<dyn MemoryPinner>) -> Self {
        Self {
            endpoints: HandleTable::new("endpoint table", config.max_endpoints),
            interfaces: InterfaceRegistry::new(),
            pinner,
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn pinner(&self) -> &Arc<dyn MemoryPinner> {
        &self.pinner
    }

    // ---- Interfaces ----

    pub fn add_interface(&self, iface: Arc<NetInterface>) -> Result<()> {
        self.interfaces.add(iface)
    }

    /// Unregister an interface. Endpoints already bound to it keep working
    /// until closed; new endpoints cannot bind to it.
    pub fn remove_interface(&self, mac: MacAddr) -> Result<Arc<NetInterface>> {
        self.interfaces.remove(mac)
    }

    pub fn interfaces(&self) -> Vec<Arc<NetInterface>> {
        self.interfaces.list()
    }

    pub fn interface(&self, mac: MacAddr) -> Option<Arc<NetInterface>> {
        self.interfaces.get(mac)
    }

    /// Max message size, link rate, and bus location of an interface.
    pub fn query_interface(&self, mac: MacAddr) -> Result<InterfaceInfo> {
        self.interfaces
            .get(mac)
            .map(|iface| InterfaceInfo::of(&iface))
            .ok_or(CoreError::NoSuchDevice(mac))
    }

    pub fn default_interface(&self) -> Option<Arc<NetInterface>> {
        self.interfaces
            .default_interface(self.config.allow_loopback)
    }

    // ---- Endpoints ----

    /// Open an endpoint bound to the interface with address `mac`.
    pub fn create_endpoint(&self, mac: MacAddr) -> Result<Arc<Endpoint>> {
        let iface = self
            .interfaces
            .get(mac)
            .ok_or(CoreError::NoSuchDevice(mac))?;
        let reservation = self.endpoints.reserve()?;
        let endpoint = Arc::new(Endpoint::new(
            reservation.id(),
            iface,
            Arc::clone(&self.pinner),
            &self.config,
        )?);
        let id = reservation.publish(Arc::clone(&endpoint))?;
        info!(endpoint = id, %mac, max_send = endpoint.max_send_size(), "endpoint created");
        Ok(endpoint)
    }

    pub fn endpoint(&self, id: u32) -> Result<Arc<Endpoint>> {
        self.endpoints
            .lookup(id)
            .ok_or(CoreError::EndpointNotFound(id))
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .values()
            .into_iter()
            .map(|(_, ep)| ep)
            .collect()
    }

    /// Close an endpoint and release its id. Everything it owns is torn down.
    pub fn close_endpoint(&self, id: u32) -> Result<()> {
        let endpoint = self
            .endpoints
            .remove(id)
            .ok_or(CoreError::EndpointNotFound(id))?;
        endpoint.shutdown();
        Ok(())
    }

    /// Close every endpoint and refuse new ones. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        let endpoints = self.endpoints.close();
        for (_, endpoint) in &endpoints {
            endpoint.shutdown();
        }
        if !endpoints.is_empty() {
            info!(endpoints = endpoints.len(), "transport shut down");
        }
        endpoints.len()
    }

    /// Connect endpoint `endpoint_id` to the peer named by `locator`. A
    /// malformed locator fails before anything is allocated or sent.
    pub fn connect(
        &self,
        endpoint_id: u32,
        locator: &str,
        attribute: ConnAttribute,
        payload: &[u8],
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<Arc<Connection>> {
        let peer = Locator::parse(locator)?;
        self.endpoint(endpoint_id)?
            .connect(peer.into(), attribute, payload, context, timeout)
    }

    /// Diagnostic connect request that creates no local state.
    pub fn send_connect(&self, endpoint_id: u32, peer: PeerAddr) -> Result<()> {
        self.endpoint(endpoint_id)?.send_probe_connect(peer)
    }

    // ---- Receive path ----

    /// Dispatch one frame received on the interface with address
    /// `iface_mac`. Returns whether it reached an endpoint. Malformed or
    /// misaddressed frames are dropped.
    pub fn process_frame(&self, iface_mac: MacAddr, frame: &Bytes) -> bool {
        let packet = match decode_packet(frame) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(interface = %iface_mac, len = frame.len(), error = %err, "undecodable frame dropped");
                return false;
            }
        };
        if packet.dst_mac != iface_mac && !packet.dst_mac.is_broadcast() {
            debug!(interface = %iface_mac, dst = %packet.dst_mac, "frame for another address dropped");
            return false;
        }
        let Some(endpoint) = self.endpoints.lookup(packet.dst_endpoint) else {
            debug!(endpoint = packet.dst_endpoint, kind = %packet.kind(), "frame for unknown endpoint dropped");
            return false;
        };
        if endpoint.mac() != iface_mac {
            debug!(
                endpoint = packet.dst_endpoint,
                interface = %iface_mac,
                "frame arrived on an interface the endpoint is not bound to"
            );
            return false;
        }
        endpoint.handle_packet(packet);
        true
    }

    /// Drain up to [`POLL_BUDGET`] frames from each interface that is up.
    /// Returns the number of frames taken off the links.
    pub fn poll(&self) -> usize {
        let mut taken = 0;
        for iface in self.interfaces.list() {
            if !iface.is_up() {
                continue;
            }
            for _ in 0..POLL_BUDGET {
                match iface.link().try_receive() {
                    Ok(Some(frame)) => {
                        taken += 1;
                        self.process_frame(iface.mac(), &frame);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(interface = iface.name(), error = %err, "receive failed");
                        break;
                    }
                }
            }
        }
        taken
    }

    /// Mark an interface down and queue `DeviceFailed` on each endpoint
    /// bound to it. Returns how many endpoints were notified.
    pub fn report_device_failure(&self, mac: MacAddr) -> Result<usize> {
        let iface = self
            .interfaces
            .get(mac)
            .ok_or(CoreError::NoSuchDevice(mac))?;
        iface.set_up(false);
        let mut notified = 0;
        for endpoint in self.endpoints() {
            if endpoint.mac() == mac {
                endpoint.report_device_failure();
                notified += 1;
            }
        }
        warn!(interface = iface.name(), %mac, endpoints = notified, "device failed");
        Ok(notified)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("pinner", &self.pinner.name())
            .field("interfaces", &self.interfaces.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}
