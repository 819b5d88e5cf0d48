//! Low-latency message transport over raw Ethernet.
//!
//! ethmsg runs its own connection protocol directly inside Ethernet frames
//! and exposes endpoints, connections, registered memory regions, and a
//! per-endpoint completion-event stream.
//!
//! # Crate Structure
//!
//! - [`link`]: Raw Ethernet links (loopback fabric, `AF_PACKET` sockets)
//! - [`wire`]: Packet header codec and textual locators
//! - [`transport`]: Transport, endpoints, connections, RMA regions, events, control plane

/// Re-export link types.
pub mod link {
    pub use ethmsg_link::*;
}

/// Re-export wire types.
pub mod wire {
    pub use ethmsg_wire::*;
}

/// Re-export transport types.
pub mod transport {
    pub use ethmsg_core::*;
}

pub use ethmsg_core::{Endpoint, Transport, TransportConfig};
