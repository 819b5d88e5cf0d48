//! Wire format of the ethmsg transport.
//!
//! Every packet is one Ethernet frame with EtherType `0x88B5`:
//! - The Ethernet header (destination, source, EtherType)
//! - A 12-byte common header (kind, flags, destination and source endpoint)
//! - A kind-specific body (connection ids, attributes, sizes)
//! - Inline application payload, if the kind carries one
//!
//! Frames shorter than the Ethernet minimum are zero-padded on encode.

pub mod codec;
pub mod error;
pub mod kind;
pub mod locator;

pub use codec::{
    decode_packet, encode_packet, max_send_size_for_mtu, Packet, PacketBody, ETHERTYPE,
    ETH_MIN_FRAME, FLAG_RELIABLE, MAX_HEADER_SIZE, MIN_HEADER_SIZE, TRANSPORT_HEADER_MAX,
};
pub use error::{Result, WireError};
pub use kind::{ConnAttribute, PacketKind, RmaOp};
pub use locator::{Locator, LOCATOR_LEN, LOCATOR_PREFIX};
