/// Errors that can occur while encoding or decoding packets and locators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The frame is shorter than the header its kind requires.
    #[error("frame truncated ({len} bytes, need {min})")]
    Truncated { len: usize, min: usize },

    /// The frame belongs to another protocol.
    #[error("unexpected EtherType 0x{0:04x}")]
    WrongEtherType(u16),

    /// The packet kind byte is not one we know.
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),

    /// The connection attribute byte is not one we know.
    #[error("unknown connection attribute {0}")]
    UnknownAttribute(u8),

    /// The RMA operation byte is not one we know.
    #[error("unknown RMA operation {0}")]
    UnknownRmaOp(u8),

    /// The declared payload length runs past the end of the frame.
    #[error("payload length {declared} exceeds the {available} bytes left in the frame")]
    PayloadOverrun { declared: usize, available: usize },

    /// The payload cannot be represented on the wire.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The text is not a well-formed `eth://` locator.
    #[error("invalid locator {0:?}")]
    InvalidLocator(String),
}

pub type Result<T> = std::result::Result<T, WireError>;
