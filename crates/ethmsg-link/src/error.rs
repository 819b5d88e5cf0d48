use crate::mac::MacAddr;

/// Errors that can occur in link operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Failed to open a raw socket on the named interface.
    #[error("failed to open link on {interface}: {source}")]
    Open {
        interface: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the link.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame does not fit the link MTU.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The frame is shorter than an Ethernet header.
    #[error("frame too short ({0} bytes)")]
    FrameTooShort(usize),

    /// The hardware address is already attached to the fabric.
    #[error("address {0} already attached")]
    AddressInUse(MacAddr),

    /// The link has been detached or shut down.
    #[error("link down")]
    Down,

    /// The interface description could not be parsed.
    #[error("invalid interface attribute {attribute}: {value:?}")]
    InvalidAttribute { attribute: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, LinkError>;
