//! Endpoints, connections, RMA regions, and completion events.
//!
//! This is the control-plane layer of ethmsg. A [`Transport`] owns the
//! registered interfaces and an endpoint table; each [`Endpoint`] owns its
//! connections, registered memory regions, and a FIFO event queue:
//! - Connections follow a connect / accept / reject state machine
//! - Regions pin the pages behind a client buffer until deregistered
//! - Local completions and inbound packets surface as [`Event`]s
//!
//! Clients either use the Rust API directly or speak the fixed-size binary
//! requests served by [`ControlPlane`].

pub mod config;
pub mod connection;
pub mod control;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod handle;
pub mod pin;
pub mod receiver;
pub mod rma;
pub mod transport;

pub use config::TransportConfig;
pub use connection::{Connection, ConnectionState, PeerAddr};
pub use control::{
    ControlPlane, ControlRequest, ControlResponse, EventRecord, Opcode, CONTROL_HEADER_SIZE,
    EVENT_RECORD_SIZE,
};
pub use device::{InterfaceInfo, InterfaceRegistry};
pub use endpoint::Endpoint;
pub use error::{CoreError, ErrorKind, Result, StatusCode};
pub use event::{Event, EventId, EventKind, EventQueue, EventStatus};
pub use handle::{HandleTable, Reservation};
pub use pin::{default_pinner, MemoryPinner, PinnedPage, TrackedMemory};
pub use receiver::ReceiveLoop;
pub use rma::{Protection, RegionTable, RmaRegion};
pub use transport::{Transport, POLL_BUDGET};

#[cfg(unix)]
pub use pin::LockedPages;
