//! Binary control plane.
//!
//! Clients drive a [`Transport`] with fixed-size requests and get
//! fixed-size responses back. Every integer is little-endian.
//!
//! Request:
//! ```text
//! ┌────────┬──────────┬──────┬──────┬──────┬─────────┬─────────┬───────┬────────────┬──────────┬──────┬──────┐
//! │ opcode │ endpoint │ arg0 │ arg1 │ arg2 │ context │ MAC+pad │ flags │ timeout ms │ data len │ rsvd │ data │
//! │ (4B)   │ (4B)     │ (8B) │ (8B) │ (8B) │ (8B)    │ (6B+2B) │ (4B)  │ (4B)       │ (4B)     │ (4B) │      │
//! └────────┴──────────┴──────┴──────┴──────┴─────────┴─────────┴───────┴────────────┴──────────┴──────┴──────┘
//! ```
//!
//! Response: status (4B), opcode (4B), three result values (8B each), zero
//! padding to 64 bytes. A successful `GetEvent` appends an event record and
//! its payload.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use ethmsg_link::{MacAddr, PciLocation};
use ethmsg_wire::ConnAttribute;
use tracing::debug;

use crate::connection::PeerAddr;
use crate::error::{CoreError, Result, StatusCode};
use crate::event::{Event, EventId};
use crate::rma::Protection;
use crate::transport::Transport;

/// Size of the fixed request and response headers.
pub const CONTROL_HEADER_SIZE: usize = 64;

/// Size of the event record following a `GetEvent` response header.
pub const EVENT_RECORD_SIZE: usize = 48;

/// Connection id placeholder for events without a connection.
pub const NO_CONNECTION: u32 = u32::MAX;

/// Value reported for an unknown link rate or bus location.
pub const UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// MAC → max message size, link rate, packed bus location.
    GetInfo = 1,
    /// MAC → endpoint id.
    CreateEndpoint = 2,
    GetEvent = 3,
    /// arg0 = event id.
    ReturnEvent = 4,
    /// MAC + arg0 = destination endpoint.
    SendConnect = 5,
    /// arg0 = address, arg1 = length, flags bit 0 = writable → region id.
    RmaRegister = 6,
    /// arg0 = region id.
    RmaDeregister = 7,
    /// MAC + arg0 = peer endpoint, flags = attribute, data = payload → connection id.
    Connect = 8,
    /// arg0 = connection id.
    Accept = 9,
    Reject = 10,
    /// arg0 = connection id, data = message.
    Send = 11,
    Disconnect = 12,
    DestroyEndpoint = 13,
}

impl Opcode {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Opcode::GetInfo,
            2 => Opcode::CreateEndpoint,
            3 => Opcode::GetEvent,
            4 => Opcode::ReturnEvent,
            5 => Opcode::SendConnect,
            6 => Opcode::RmaRegister,
            7 => Opcode::RmaDeregister,
            8 => Opcode::Connect,
            9 => Opcode::Accept,
            10 => Opcode::Reject,
            11 => Opcode::Send,
            12 => Opcode::Disconnect,
            13 => Opcode::DestroyEndpoint,
            _ => return None,
        })
    }
}

/// One decoded control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub opcode: Opcode,
    pub endpoint: u32,
    pub args: [u64; 3],
    pub context: u64,
    pub mac: MacAddr,
    pub flags: u32,
    /// Zero means no timeout.
    pub timeout_ms: u32,
    pub data: Vec<u8>,
}

impl ControlRequest {
    pub fn new(opcode: Opcode, endpoint: u32) -> Self {
        Self {
            opcode,
            endpoint,
            args: [0; 3],
            context: 0,
            mac: MacAddr::default(),
            flags: 0,
            timeout_ms: 0,
            data: Vec::new(),
        }
    }

    pub fn with_arg(mut self, index: usize, value: u64) -> Self {
        self.args[index] = value;
        self
    }

    pub fn with_context(mut self, context: u64) -> Self {
        self.context = context;
        self
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = mac;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(CONTROL_HEADER_SIZE + self.data.len());
        dst.put_u32_le(self.opcode as u32);
        dst.put_u32_le(self.endpoint);
        for arg in self.args {
            dst.put_u64_le(arg);
        }
        dst.put_u64_le(self.context);
        dst.put_slice(&self.mac.octets());
        dst.put_bytes(0, 2);
        dst.put_u32_le(self.flags);
        dst.put_u32_le(self.timeout_ms);
        dst.put_u32_le(self.data.len() as u32);
        dst.put_u32_le(0);
        dst.put_slice(&self.data);
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < CONTROL_HEADER_SIZE {
            return Err(CoreError::invalid_argument(format!(
                "control request of {} bytes is shorter than {CONTROL_HEADER_SIZE}",
                src.len()
            )));
        }
        let mut buf = src;
        let raw_opcode = buf.get_u32_le();
        let opcode = Opcode::from_u32(raw_opcode)
            .ok_or_else(|| CoreError::invalid_argument(format!("unknown opcode {raw_opcode}")))?;
        let endpoint = buf.get_u32_le();
        let args = [buf.get_u64_le(), buf.get_u64_le(), buf.get_u64_le()];
        let context = buf.get_u64_le();
        let mac = MacAddr::from_slice(&buf[..MacAddr::LEN])
            .ok_or_else(|| CoreError::invalid_argument("short MAC"))?;
        buf.advance(MacAddr::LEN + 2);
        let flags = buf.get_u32_le();
        let timeout_ms = buf.get_u32_le();
        let data_len = buf.get_u32_le() as usize;
        buf.advance(4);
        if buf.len() != data_len {
            return Err(CoreError::invalid_argument(format!(
                "control request declares {data_len} data bytes, carries {}",
                buf.len()
            )));
        }
        Ok(Self {
            opcode,
            endpoint,
            args,
            context,
            mac,
            flags,
            timeout_ms,
            data: buf.to_vec(),
        })
    }
}

/// Event as carried in a `GetEvent` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_id: u64,
    pub event_type: u32,
    pub status: u32,
    pub context: u64,
    /// [`NO_CONNECTION`] when the event has no connection.
    pub connection: u32,
    pub peer_endpoint: u32,
    pub peer_mac: MacAddr,
    pub attribute: u32,
    pub payload: Vec<u8>,
}

impl EventRecord {
    pub fn of(event: &Event) -> Self {
        let kind = event.kind();
        let conn = kind.connection();
        let attribute = conn.map_or(0, |c| c.attribute() as u32);
        Self {
            event_id: event.id().0,
            event_type: kind.code(),
            status: kind.status().code(),
            context: kind.context(),
            connection: conn.map_or(NO_CONNECTION, |c| c.id()),
            peer_endpoint: conn.map_or(0, |c| c.peer().endpoint_id),
            peer_mac: conn.map_or(MacAddr::default(), |c| c.peer().mac),
            attribute,
            payload: kind.payload().to_vec(),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(EVENT_RECORD_SIZE + self.payload.len());
        dst.put_u64_le(self.event_id);
        dst.put_u32_le(self.event_type);
        dst.put_u32_le(self.status);
        dst.put_u64_le(self.context);
        dst.put_u32_le(self.connection);
        dst.put_u32_le(self.peer_endpoint);
        dst.put_slice(&self.peer_mac.octets());
        dst.put_bytes(0, 2);
        dst.put_u32_le(self.attribute);
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < EVENT_RECORD_SIZE {
            return Err(CoreError::invalid_argument("truncated event record"));
        }
        let event_id = buf.get_u64_le();
        let event_type = buf.get_u32_le();
        let status = buf.get_u32_le();
        let context = buf.get_u64_le();
        let connection = buf.get_u32_le();
        let peer_endpoint = buf.get_u32_le();
        let peer_mac = MacAddr::from_slice(&buf[..MacAddr::LEN])
            .ok_or_else(|| CoreError::invalid_argument("short MAC"))?;
        buf.advance(MacAddr::LEN + 2);
        let attribute = buf.get_u32_le();
        let payload_len = buf.get_u32_le() as usize;
        if buf.len() != payload_len {
            return Err(CoreError::invalid_argument("event payload length mismatch"));
        }
        Ok(Self {
            event_id,
            event_type,
            status,
            context,
            connection,
            peer_endpoint,
            peer_mac,
            attribute,
            payload: buf.to_vec(),
        })
    }
}

/// One control response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: StatusCode,
    /// Zero when the request could not be decoded.
    pub opcode: u32,
    pub values: [u64; 3],
    pub event: Option<EventRecord>,
}

impl ControlResponse {
    fn ok(opcode: Opcode) -> Self {
        Self {
            status: StatusCode::Ok,
            opcode: opcode as u32,
            values: [0; 3],
            event: None,
        }
    }

    fn value(opcode: Opcode, value: u64) -> Self {
        let mut response = Self::ok(opcode);
        response.values[0] = value;
        response
    }

    fn failure(opcode: u32, status: StatusCode) -> Self {
        Self {
            status,
            opcode,
            values: [0; 3],
            event: None,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(CONTROL_HEADER_SIZE);
        dst.put_i32_le(self.status as i32);
        dst.put_u32_le(self.opcode);
        for value in self.values {
            dst.put_u64_le(value);
        }
        dst.put_bytes(0, CONTROL_HEADER_SIZE - 32);
        if let Some(event) = &self.event {
            event.encode(dst);
        }
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < CONTROL_HEADER_SIZE {
            return Err(CoreError::invalid_argument("truncated control response"));
        }
        let mut buf = src;
        let raw_status = buf.get_i32_le();
        let status = StatusCode::from_i32(raw_status)
            .ok_or_else(|| CoreError::invalid_argument(format!("unknown status {raw_status}")))?;
        let opcode = buf.get_u32_le();
        let values = [buf.get_u64_le(), buf.get_u64_le(), buf.get_u64_le()];
        let rest = &src[CONTROL_HEADER_SIZE..];
        let event = if rest.is_empty() {
            None
        } else {
            Some(EventRecord::decode(rest)?)
        };
        Ok(Self {
            status,
            opcode,
            values,
            event,
        })
    }
}

/// `domain:16 | bus:8 | device:5 | function:3` packed into one value.
pub fn pack_pci(pci: PciLocation) -> u64 {
    (u64::from(pci.domain) << 16)
        | (u64::from(pci.bus) << 8)
        | (u64::from(pci.device & 0x1f) << 3)
        | u64::from(pci.function & 0x7)
}

/// Serves control requests against one transport.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    transport: Arc<Transport>,
}

impl ControlPlane {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Decode a request, run it, and encode the response. Never fails: a
    /// malformed request gets an `InvalidArgument` response.
    pub fn handle(&self, request: &[u8]) -> BytesMut {
        let response = match ControlRequest::decode(request) {
            Ok(request) => self.dispatch(&request),
            Err(err) => {
                debug!(len = request.len(), error = %err, "malformed control request");
                ControlResponse::failure(0, StatusCode::from(&err))
            }
        };
        let mut out = BytesMut::with_capacity(CONTROL_HEADER_SIZE);
        response.encode(&mut out);
        out
    }

    pub fn dispatch(&self, request: &ControlRequest) -> ControlResponse {
        match self.execute(request) {
            Ok(response) => response,
            Err(err) => {
                debug!(opcode = ?request.opcode, endpoint = request.endpoint, error = %err, "control request failed");
                ControlResponse::failure(request.opcode as u32, StatusCode::from(&err))
            }
        }
    }

    fn execute(&self, req: &ControlRequest) -> Result<ControlResponse> {
        let op = req.opcode;
        let t = &self.transport;
        match op {
            Opcode::GetInfo => {
                let iface = t
                    .interface(req.mac)
                    .ok_or(CoreError::NoSuchDevice(req.mac))?;
                let info = t.query_interface(req.mac)?;
                let mut response = ControlResponse::value(op, info.max_send_size.map_or(0, |m| m as u64));
                response.values[1] = info.rate_bps.unwrap_or(UNKNOWN);
                response.values[2] = iface.pci().map_or(UNKNOWN, pack_pci);
                Ok(response)
            }
            Opcode::CreateEndpoint => {
                let endpoint = t.create_endpoint(req.mac)?;
                Ok(ControlResponse::value(op, u64::from(endpoint.id())))
            }
            Opcode::GetEvent => {
                let endpoint = t.endpoint(req.endpoint)?;
                match endpoint.get_next_event() {
                    Some(event) => {
                        let mut response = ControlResponse::ok(op);
                        response.event = Some(EventRecord::of(&event));
                        Ok(response)
                    }
                    None => Ok(ControlResponse::failure(op as u32, StatusCode::Again)),
                }
            }
            Opcode::ReturnEvent => {
                t.endpoint(req.endpoint)?
                    .acknowledge(EventId(req.args[0]))?;
                Ok(ControlResponse::ok(op))
            }
            Opcode::SendConnect => {
                let peer = PeerAddr::new(req.mac, arg_u32(req.args[0], "endpoint id")?);
                t.send_connect(req.endpoint, peer)?;
                Ok(ControlResponse::ok(op))
            }
            Opcode::RmaRegister => {
                let address = arg_usize(req.args[0], "address")?;
                let length = arg_usize(req.args[1], "length")?;
                let region = t.endpoint(req.endpoint)?.register_region(
                    address,
                    length,
                    Protection::from_flags(req.flags),
                )?;
                Ok(ControlResponse::value(op, u64::from(region)))
            }
            Opcode::RmaDeregister => {
                t.endpoint(req.endpoint)?
                    .deregister_region(arg_u32(req.args[0], "region id")?)?;
                Ok(ControlResponse::ok(op))
            }
            Opcode::Connect => {
                let peer = PeerAddr::new(req.mac, arg_u32(req.args[0], "endpoint id")?);
                let attribute = u8::try_from(req.flags)
                    .ok()
                    .and_then(|raw| ConnAttribute::try_from(raw).ok())
                    .ok_or_else(|| {
                        CoreError::invalid_argument(format!("unknown attribute {}", req.flags))
                    })?;
                let timeout =
                    (req.timeout_ms > 0).then(|| Duration::from_millis(u64::from(req.timeout_ms)));
                let conn = t.endpoint(req.endpoint)?.connect(
                    peer,
                    attribute,
                    &req.data,
                    req.context,
                    timeout,
                )?;
                Ok(ControlResponse::value(op, u64::from(conn.id())))
            }
            Opcode::Accept => {
                t.endpoint(req.endpoint)?
                    .accept(arg_u32(req.args[0], "connection id")?, req.context)?;
                Ok(ControlResponse::ok(op))
            }
            Opcode::Reject => {
                t.endpoint(req.endpoint)?
                    .reject(arg_u32(req.args[0], "connection id")?)?;
                Ok(ControlResponse::ok(op))
            }
            Opcode::Send => {
                t.endpoint(req.endpoint)?.send(
                    arg_u32(req.args[0], "connection id")?,
                    req.data.clone(),
                    req.context,
                )?;
                Ok(ControlResponse::ok(op))
            }
            Opcode::Disconnect => {
                t.endpoint(req.endpoint)?
                    .disconnect(arg_u32(req.args[0], "connection id")?)?;
                Ok(ControlResponse::ok(op))
            }
            Opcode::DestroyEndpoint => {
                t.close_endpoint(req.endpoint)?;
                Ok(ControlResponse::ok(op))
            }
        }
    }
}

fn arg_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| CoreError::invalid_argument(format!("{what} {value} out of range")))
}

fn arg_usize(value: u64, what: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| CoreError::invalid_argument(format!("{what} {value} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::pin::TrackedMemory;
    use ethmsg_link::{Link, LoopbackFabric, NetInterface};

    fn plane() -> (ControlPlane, MacAddr, Arc<TrackedMemory>) {
        let fabric = LoopbackFabric::new();
        let mac = MacAddr::new([2, 0, 0, 0, 3, 1]);
        let link: Arc<dyn Link> = Arc::new(fabric.attach(mac, 9000).unwrap());
        let memory = Arc::new(TrackedMemory::new());
        let transport = Transport::with_pinner(
            TransportConfig::default(),
            Arc::clone(&memory) as Arc<dyn crate::pin::MemoryPinner>,
        );
        transport
            .add_interface(Arc::new(
                NetInterface::new("ctl0", link)
                    .with_rate(10_000_000_000)
                    .with_pci(PciLocation {
                        domain: 0,
                        bus: 0x3b,
                        device: 0,
                        function: 1,
                    }),
            ))
            .unwrap();
        (ControlPlane::new(Arc::new(transport)), mac, memory)
    }

    fn call(plane: &ControlPlane, request: ControlRequest) -> ControlResponse {
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        assert_eq!(buf.len(), CONTROL_HEADER_SIZE + request.data.len());
        let out = plane.handle(&buf);
        ControlResponse::decode(&out).unwrap()
    }

    #[test]
    fn get_info_reports_interface() {
        let (plane, mac, _) = plane();
        let resp = call(&plane, ControlRequest::new(Opcode::GetInfo, 0).with_mac(mac));
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(resp.values, [8192, 10_000_000_000, 0x3b01]);

        let missing = call(
            &plane,
            ControlRequest::new(Opcode::GetInfo, 0).with_mac(MacAddr::BROADCAST),
        );
        assert_eq!(missing.status, StatusCode::NoDevice);
    }

    #[test]
    fn empty_queue_answers_again() {
        let (plane, mac, _) = plane();
        let created = call(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(mac));
        let ep = created.values[0] as u32;
        let resp = call(&plane, ControlRequest::new(Opcode::GetEvent, ep));
        assert_eq!(resp.status, StatusCode::Again);
        assert!(resp.event.is_none());

        let unknown = call(&plane, ControlRequest::new(Opcode::GetEvent, ep + 1));
        assert_eq!(unknown.status, StatusCode::NotFound);
    }

    #[test]
    fn region_register_and_deregister() {
        let (plane, mac, memory) = plane();
        memory.map(0x40_000, 0x10_000, true);
        let ep = call(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(mac)).values[0] as u32;

        let reg = call(
            &plane,
            ControlRequest::new(Opcode::RmaRegister, ep)
                .with_arg(0, 0x40_ff0)
                .with_arg(1, 10_000)
                .with_flags(Protection::ReadWrite.flags()),
        );
        assert_eq!(reg.status, StatusCode::Ok);
        assert_eq!(memory.total_pins(), 4);

        let bad = call(
            &plane,
            ControlRequest::new(Opcode::RmaRegister, ep)
                .with_arg(0, 0x90_000)
                .with_arg(1, 10),
        );
        assert_eq!(bad.status, StatusCode::InvalidMemory);

        let dereg = ControlRequest::new(Opcode::RmaDeregister, ep).with_arg(0, reg.values[0]);
        assert_eq!(call(&plane, dereg.clone()).status, StatusCode::Ok);
        assert_eq!(call(&plane, dereg).status, StatusCode::NotFound);
        assert_eq!(memory.total_pins(), 0);
    }

    #[test]
    fn malformed_requests_are_invalid_argument() {
        let (plane, _, _) = plane();
        let short = ControlResponse::decode(&plane.handle(&[1, 0, 0])).unwrap();
        assert_eq!(short.status, StatusCode::InvalidArgument);
        assert_eq!(short.opcode, 0);

        let mut buf = BytesMut::new();
        ControlRequest::new(Opcode::Send, 0).with_data(*b"abc").encode(&mut buf);
        buf.truncate(buf.len() - 1);
        let truncated = ControlResponse::decode(&plane.handle(&buf)).unwrap();
        assert_eq!(truncated.status, StatusCode::InvalidArgument);

        let mut unknown = BytesMut::new();
        ControlRequest::new(Opcode::GetInfo, 0).encode(&mut unknown);
        unknown[0] = 0xee;
        let resp = ControlResponse::decode(&plane.handle(&unknown)).unwrap();
        assert_eq!(resp.status, StatusCode::InvalidArgument);
    }

    #[test]
    fn destroy_endpoint_twice() {
        let (plane, mac, _) = plane();
        let ep = call(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(mac)).values[0] as u32;
        assert_eq!(
            call(&plane, ControlRequest::new(Opcode::DestroyEndpoint, ep)).status,
            StatusCode::Ok
        );
        assert_eq!(
            call(&plane, ControlRequest::new(Opcode::DestroyEndpoint, ep)).status,
            StatusCode::NotFound
        );
    }
}
