//! Raw Ethernet link abstraction.
//!
//! Provides a unified interface over the ways ethmsg can put frames on a wire:
//! - An in-process loopback fabric (tests, demos, single-host deployments)
//! - Raw `AF_PACKET` sockets bound to one interface (Linux)
//!
//! This is the lowest layer of ethmsg. Everything else builds on top of
//! the [`Link`] trait and the [`NetInterface`] description provided here.

pub mod error;
pub mod interface;
pub mod loopback;
pub mod mac;
pub mod traits;

#[cfg(target_os = "linux")]
pub mod packet;

pub use error::{LinkError, Result};
pub use interface::{NetInterface, PciLocation};
pub use loopback::{LoopbackFabric, LoopbackLink};
pub use mac::MacAddr;
pub use traits::{Link, ETH_HEADER_LEN};

#[cfg(target_os = "linux")]
pub use packet::{probe_interface, probe_interface_in, InterfaceProbe, PacketLink};
