use ethmsg_link::{LinkError, MacAddr};
use ethmsg_wire::WireError;

/// Errors that can occur in endpoint, connection, and region operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A handle table or other bounded resource is full.
    #[error("{0} exhausted")]
    ResourceExhausted(&'static str),

    #[error("endpoint {0} not found")]
    EndpointNotFound(u32),

    #[error("connection {0} not found")]
    ConnectionNotFound(u32),

    #[error("RMA region {0} not found")]
    RegionNotFound(u32),

    #[error("event {0} not found")]
    EventNotFound(u64),

    /// The object exists but the operation does not apply in its current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A memory range could not be pinned.
    #[error("invalid memory range 0x{address:x}+{length}")]
    InvalidMemory { address: usize, length: usize },

    /// No registered interface has this hardware address.
    #[error("no interface with address {0}")]
    NoSuchDevice(MacAddr),

    /// Link-level error.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Wire-format error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Coarse classification used by callers that only branch on the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ResourceExhausted,
    NotFound,
    InvalidState,
    InvalidArgument,
    DeviceUnavailable,
    ProtocolViolation,
    Link,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            CoreError::EndpointNotFound(_)
            | CoreError::ConnectionNotFound(_)
            | CoreError::RegionNotFound(_)
            | CoreError::EventNotFound(_) => ErrorKind::NotFound,
            CoreError::InvalidState(_) => ErrorKind::InvalidState,
            CoreError::InvalidArgument(_)
            | CoreError::InvalidMemory { .. }
            | CoreError::Wire(WireError::InvalidLocator(_)) => ErrorKind::InvalidArgument,
            CoreError::NoSuchDevice(_) => ErrorKind::DeviceUnavailable,
            CoreError::Wire(_) => ErrorKind::ProtocolViolation,
            CoreError::Link(_) => ErrorKind::Link,
        }
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        CoreError::InvalidState(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        CoreError::InvalidArgument(msg.into())
    }
}

/// Result code carried in control-plane responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    /// Nothing to return yet; retry later.
    Again = 1,
    ResourceExhausted = 2,
    NotFound = 3,
    InvalidState = 4,
    InvalidArgument = 5,
    InvalidMemory = 6,
    NoDevice = 7,
    LinkFailure = 8,
}

impl StatusCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Again,
            2 => StatusCode::ResourceExhausted,
            3 => StatusCode::NotFound,
            4 => StatusCode::InvalidState,
            5 => StatusCode::InvalidArgument,
            6 => StatusCode::InvalidMemory,
            7 => StatusCode::NoDevice,
            8 => StatusCode::LinkFailure,
            _ => return None,
        })
    }
}

impl From<&CoreError> for StatusCode {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            CoreError::EndpointNotFound(_)
            | CoreError::ConnectionNotFound(_)
            | CoreError::RegionNotFound(_)
            | CoreError::EventNotFound(_) => StatusCode::NotFound,
            CoreError::InvalidState(_) => StatusCode::InvalidState,
            CoreError::InvalidArgument(_) | CoreError::Wire(_) => StatusCode::InvalidArgument,
            CoreError::InvalidMemory { .. } => StatusCode::InvalidMemory,
            CoreError::NoSuchDevice(_) => StatusCode::NoDevice,
            CoreError::Link(_) => StatusCode::LinkFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
