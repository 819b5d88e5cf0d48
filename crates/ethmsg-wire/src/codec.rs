use bytes::{Buf, BufMut, Bytes, BytesMut};
use ethmsg_link::{MacAddr, ETH_HEADER_LEN};

use crate::error::{Result, WireError};
use crate::kind::{ConnAttribute, PacketKind, RmaOp};

/// EtherType identifying ethmsg frames.
pub const ETHERTYPE: u16 = 0x88B5;

/// Common header: kind (1) + flags (1) + reserved (2) + dst endpoint (4) + src endpoint (4).
pub const COMMON_HEADER_SIZE: usize = 12;

/// Smallest frame that can hold the Ethernet and common headers.
pub const MIN_HEADER_SIZE: usize = ETH_HEADER_LEN + COMMON_HEADER_SIZE;

/// Largest transport header inside the Ethernet payload (common header + RMA body).
pub const TRANSPORT_HEADER_MAX: usize = COMMON_HEADER_SIZE + PacketKind::Rma.body_len();

/// Largest header of any kind, Ethernet header included.
pub const MAX_HEADER_SIZE: usize = ETH_HEADER_LEN + TRANSPORT_HEADER_MAX;

/// Minimum Ethernet frame without FCS. Shorter frames are zero-padded.
pub const ETH_MIN_FRAME: usize = 60;

/// Set on data messages sent over a reliable connection.
pub const FLAG_RELIABLE: u8 = 0x01;

/// Smallest usable max message size.
const MIN_SEND_SIZE: usize = 64;

/// Max message size for an interface MTU: the largest power of two that fits
/// beside the transport header. `None` if the MTU is too small to be useful.
pub fn max_send_size_for_mtu(mtu: usize) -> Option<usize> {
    let room = mtu.checked_sub(TRANSPORT_HEADER_MAX)?;
    if room < MIN_SEND_SIZE {
        return None;
    }
    Some(1usize << (usize::BITS - 1 - room.leading_zeros()))
}

/// Kind-specific part of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    ConnectRequest {
        /// Sender's provisional connection id.
        src_conn: u32,
        attribute: ConnAttribute,
        /// Largest message the sender can transmit.
        max_send_size: u32,
        payload: Bytes,
    },
    ConnectAccept {
        /// The requester's connection id, echoed back.
        dst_conn: u32,
        /// The acceptor's connection id.
        src_conn: u32,
        /// Negotiated max message size.
        max_send_size: u32,
    },
    ConnectReject {
        dst_conn: u32,
    },
    Message {
        dst_conn: u32,
        reliable: bool,
        payload: Bytes,
    },
    Rma {
        dst_conn: u32,
        op: RmaOp,
        remote_handle: u64,
        remote_offset: u64,
        payload: Bytes,
    },
    ConnectionClosed {
        dst_conn: u32,
    },
}

impl PacketBody {
    pub fn kind(&self) -> PacketKind {
        match self {
            PacketBody::ConnectRequest { .. } => PacketKind::ConnectRequest,
            PacketBody::ConnectAccept { .. } => PacketKind::ConnectAccept,
            PacketBody::ConnectReject { .. } => PacketKind::ConnectReject,
            PacketBody::Message { .. } => PacketKind::Message,
            PacketBody::Rma { .. } => PacketKind::Rma,
            PacketBody::ConnectionClosed { .. } => PacketKind::ConnectionClosed,
        }
    }

    /// Inline payload; empty for kinds that carry none.
    pub fn payload(&self) -> &[u8] {
        match self {
            PacketBody::ConnectRequest { payload, .. }
            | PacketBody::Message { payload, .. }
            | PacketBody::Rma { payload, .. } => payload,
            _ => &[],
        }
    }

    fn flags(&self) -> u8 {
        match self {
            PacketBody::Message { reliable: true, .. } => FLAG_RELIABLE,
            _ => 0,
        }
    }
}

/// One decoded ethmsg frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub dst_endpoint: u32,
    pub src_endpoint: u32,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(
        dst_mac: MacAddr,
        src_mac: MacAddr,
        dst_endpoint: u32,
        src_endpoint: u32,
        body: PacketBody,
    ) -> Self {
        Self {
            dst_mac,
            src_mac,
            dst_endpoint,
            src_endpoint,
            body,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.body.kind()
    }

    /// Bytes on the wire, padding included.
    pub fn wire_size(&self) -> usize {
        let len = MIN_HEADER_SIZE + self.kind().body_len() + self.body.payload().len();
        len.max(ETH_MIN_FRAME)
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        encode_packet(self, &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Encode a packet as one Ethernet frame.
///
/// Wire format (all multi-byte fields big-endian):
/// ```text
/// ┌─────────┬─────────┬───────────┬──────┬───────┬──────────┬─────────┬─────────┬──────┬─────────┐
/// │ dst MAC │ src MAC │ EtherType │ kind │ flags │ reserved │ dst ep  │ src ep  │ body │ payload │
/// │ (6B)    │ (6B)    │ 0x88B5    │ (1B) │ (1B)  │ (2B)     │ (4B)    │ (4B)    │      │         │
/// └─────────┴─────────┴───────────┴──────┴───────┴──────────┴─────────┴─────────┴──────┴─────────┘
/// ```
pub fn encode_packet(packet: &Packet, dst: &mut BytesMut) -> Result<()> {
    let payload = packet.body.payload();
    if payload.len() > u32::MAX as usize {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }

    let start = dst.len();
    dst.reserve(packet.wire_size());
    dst.put_slice(&packet.dst_mac.octets());
    dst.put_slice(&packet.src_mac.octets());
    dst.put_u16(ETHERTYPE);

    dst.put_u8(packet.kind() as u8);
    dst.put_u8(packet.body.flags());
    dst.put_u16(0);
    dst.put_u32(packet.dst_endpoint);
    dst.put_u32(packet.src_endpoint);

    match &packet.body {
        PacketBody::ConnectRequest {
            src_conn,
            attribute,
            max_send_size,
            payload,
        } => {
            dst.put_u32(*src_conn);
            dst.put_u8(*attribute as u8);
            dst.put_bytes(0, 3);
            dst.put_u32(*max_send_size);
            dst.put_u32(payload.len() as u32);
        }
        PacketBody::ConnectAccept {
            dst_conn,
            src_conn,
            max_send_size,
        } => {
            dst.put_u32(*dst_conn);
            dst.put_u32(*src_conn);
            dst.put_u32(*max_send_size);
        }
        PacketBody::ConnectReject { dst_conn } | PacketBody::ConnectionClosed { dst_conn } => {
            dst.put_u32(*dst_conn);
        }
        PacketBody::Message {
            dst_conn, payload, ..
        } => {
            dst.put_u32(*dst_conn);
            dst.put_u32(payload.len() as u32);
        }
        PacketBody::Rma {
            dst_conn,
            op,
            remote_handle,
            remote_offset,
            payload,
        } => {
            dst.put_u32(*dst_conn);
            dst.put_u8(*op as u8);
            dst.put_bytes(0, 3);
            dst.put_u64(*remote_handle);
            dst.put_u64(*remote_offset);
            dst.put_u32(payload.len() as u32);
        }
    }
    dst.put_slice(payload);

    let written = dst.len() - start;
    if written < ETH_MIN_FRAME {
        dst.put_bytes(0, ETH_MIN_FRAME - written);
    }
    Ok(())
}

/// Decode one Ethernet frame.
///
/// The kind byte is validated before any kind-specific field is read.
/// Payloads are zero-copy slices of `frame`; trailing padding is ignored.
pub fn decode_packet(frame: &Bytes) -> Result<Packet> {
    if frame.len() < MIN_HEADER_SIZE {
        return Err(WireError::Truncated {
            len: frame.len(),
            min: MIN_HEADER_SIZE,
        });
    }

    let mut cur = frame.clone();
    let dst_mac = take_mac(&mut cur);
    let src_mac = take_mac(&mut cur);
    let ethertype = cur.get_u16();
    if ethertype != ETHERTYPE {
        return Err(WireError::WrongEtherType(ethertype));
    }

    let kind = PacketKind::try_from(cur.get_u8())?;
    let flags = cur.get_u8();
    let _reserved = cur.get_u16();
    let dst_endpoint = cur.get_u32();
    let src_endpoint = cur.get_u32();

    if cur.remaining() < kind.body_len() {
        return Err(WireError::Truncated {
            len: frame.len(),
            min: MIN_HEADER_SIZE + kind.body_len(),
        });
    }

    let body = match kind {
        PacketKind::ConnectRequest => {
            let src_conn = cur.get_u32();
            let attribute = ConnAttribute::try_from(cur.get_u8())?;
            cur.advance(3);
            let max_send_size = cur.get_u32();
            let payload = take_payload(&mut cur)?;
            PacketBody::ConnectRequest {
                src_conn,
                attribute,
                max_send_size,
                payload,
            }
        }
        PacketKind::ConnectAccept => PacketBody::ConnectAccept {
            dst_conn: cur.get_u32(),
            src_conn: cur.get_u32(),
            max_send_size: cur.get_u32(),
        },
        PacketKind::ConnectReject => PacketBody::ConnectReject {
            dst_conn: cur.get_u32(),
        },
        PacketKind::Message => {
            let dst_conn = cur.get_u32();
            let payload = take_payload(&mut cur)?;
            PacketBody::Message {
                dst_conn,
                reliable: flags & FLAG_RELIABLE != 0,
                payload,
            }
        }
        PacketKind::Rma => {
            let dst_conn = cur.get_u32();
            let op = RmaOp::try_from(cur.get_u8())?;
            cur.advance(3);
            let remote_handle = cur.get_u64();
            let remote_offset = cur.get_u64();
            let payload = take_payload(&mut cur)?;
            PacketBody::Rma {
                dst_conn,
                op,
                remote_handle,
                remote_offset,
                payload,
            }
        }
        PacketKind::ConnectionClosed => PacketBody::ConnectionClosed {
            dst_conn: cur.get_u32(),
        },
    };

    Ok(Packet {
        dst_mac,
        src_mac,
        dst_endpoint,
        src_endpoint,
        body,
    })
}

fn take_mac(cur: &mut Bytes) -> MacAddr {
    let mut octets = [0u8; MacAddr::LEN];
    cur.copy_to_slice(&mut octets);
    MacAddr::new(octets)
}

/// Reads the 4-byte length that ends a body and slices that many payload bytes.
fn take_payload(cur: &mut Bytes) -> Result<Bytes> {
    let declared = cur.get_u32() as usize;
    if declared > cur.remaining() {
        return Err(WireError::PayloadOverrun {
            declared,
            available: cur.remaining(),
        });
    }
    Ok(cur.split_to(declared))
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
    const B: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);

    fn connect_request(payload: &'static [u8]) -> Packet {
        Packet::new(
            B,
            A,
            3,
            7,
            PacketBody::ConnectRequest {
                src_conn: 42,
                attribute: ConnAttribute::ReliableUnordered,
                max_send_size: 1024,
                payload: Bytes::from_static(payload),
            },
        )
    }

    #[test]
    fn header_layout_is_big_endian() {
        let bytes = connect_request(b"hello").encode().unwrap();

        assert_eq!(&bytes[0..6], &B.octets());
        assert_eq!(&bytes[6..12], &A.octets());
        assert_eq!(&bytes[12..14], &[0x88, 0xb5]);
        assert_eq!(bytes[14], PacketKind::ConnectRequest as u8);
        assert_eq!(bytes[15], 0);
        assert_eq!(&bytes[18..22], &[0, 0, 0, 3]);
        assert_eq!(&bytes[22..26], &[0, 0, 0, 7]);
        assert_eq!(&bytes[26..30], &[0, 0, 0, 42]);
        assert_eq!(bytes[30], ConnAttribute::ReliableUnordered as u8);
        assert_eq!(&bytes[38..42], &[0, 0, 0, 5]);
        assert_eq!(&bytes[42..47], b"hello");
    }

    #[test]
    fn short_frames_are_padded() {
        let packet = Packet::new(B, A, 1, 2, PacketBody::ConnectReject { dst_conn: 9 });
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), ETH_MIN_FRAME);
        assert!(bytes[MIN_HEADER_SIZE + 4..].iter().all(|b| *b == 0));
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn padding_is_not_payload() {
        let packet = connect_request(b"hi");
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), ETH_MIN_FRAME);
        let decoded = decode_packet(&bytes).unwrap();
        assert_eq!(decoded.body.payload(), b"hi");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn large_message_is_not_padded() {
        let payload = Bytes::from(vec![7u8; 1024]);
        let packet = Packet::new(
            B,
            A,
            1,
            2,
            PacketBody::Message {
                dst_conn: 5,
                reliable: true,
                payload: payload.clone(),
            },
        );
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), MIN_HEADER_SIZE + 8 + 1024);
        assert_eq!(bytes[15], FLAG_RELIABLE);

        match decode_packet(&bytes).unwrap().body {
            PacketBody::Message {
                dst_conn,
                reliable,
                payload: got,
            } => {
                assert_eq!(dst_conn, 5);
                assert!(reliable);
                assert_eq!(got, payload);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn rma_header_fits_max_header_size() {
        let packet = Packet::new(
            B,
            A,
            1,
            2,
            PacketBody::Rma {
                dst_conn: 1,
                op: RmaOp::Write,
                remote_handle: 0x0102_0304_0506_0708,
                remote_offset: 4096,
                payload: Bytes::new(),
            },
        );
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), ETH_MIN_FRAME);
        assert_eq!(MAX_HEADER_SIZE, 54);
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn rejects_short_frame() {
        let bytes = Bytes::from_static(&[0u8; MIN_HEADER_SIZE - 1]);
        assert_eq!(
            decode_packet(&bytes),
            Err(WireError::Truncated {
                len: MIN_HEADER_SIZE - 1,
                min: MIN_HEADER_SIZE
            })
        );
    }

    #[test]
    fn rejects_foreign_ethertype() {
        let mut raw = BytesMut::from(&connect_request(b"").encode().unwrap()[..]);
        raw[12] = 0x08;
        raw[13] = 0x00;
        assert_eq!(
            decode_packet(&raw.freeze()),
            Err(WireError::WrongEtherType(0x0800))
        );
    }

    #[test]
    fn validates_kind_before_body() {
        let mut raw = BytesMut::from(&connect_request(b"").encode().unwrap()[..]);
        raw[14] = 0x7f;
        assert_eq!(
            decode_packet(&raw.freeze()),
            Err(WireError::UnknownKind(0x7f))
        );
    }

    #[test]
    fn rejects_truncated_body() {
        let mut raw = BytesMut::new();
        raw.put_slice(&B.octets());
        raw.put_slice(&A.octets());
        raw.put_u16(ETHERTYPE);
        raw.put_u8(PacketKind::Rma as u8);
        raw.put_bytes(0, 11);
        raw.put_bytes(0, 10);
        assert!(matches!(
            decode_packet(&raw.freeze()),
            Err(WireError::Truncated { min, .. }) if min == MAX_HEADER_SIZE
        ));
    }

    #[test]
    fn rejects_payload_overrun() {
        let mut raw = BytesMut::from(&connect_request(b"abc").encode().unwrap()[..]);
        raw.truncate(MIN_HEADER_SIZE + 16);
        raw[38..42].copy_from_slice(&100u32.to_be_bytes());
        assert_eq!(
            decode_packet(&raw.freeze()),
            Err(WireError::PayloadOverrun {
                declared: 100,
                available: 0
            })
        );
    }

    #[test]
    fn max_send_size_follows_mtu() {
        assert_eq!(max_send_size_for_mtu(1500), Some(1024));
        assert_eq!(max_send_size_for_mtu(9000), Some(8192));
        assert_eq!(max_send_size_for_mtu(1064), Some(1024));
        assert_eq!(max_send_size_for_mtu(1063), Some(512));
        assert_eq!(max_send_size_for_mtu(100), None);
        assert_eq!(max_send_size_for_mtu(0), None);
    }
}
