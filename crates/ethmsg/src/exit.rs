use std::fmt;
use std::io;

use ethmsg_core::{CoreError, ErrorKind};
use ethmsg_link::LinkError;
use ethmsg_wire::WireError;

// Exit codes follow the sysexits-style values the rest of the toolchain uses.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const LINK_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const NOT_FOUND: i32 = 44;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: &io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::NotFound => NOT_FOUND,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn link_error(context: &str, err: LinkError) -> CliError {
    match &err {
        LinkError::Open { source, .. } | LinkError::Io(source) => io_error(context, source),
        LinkError::InvalidAttribute { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        _ => CliError::new(LINK_ERROR, format!("{context}: {err}")),
    }
}

pub fn wire_error(context: &str, err: WireError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn core_error(context: &str, err: CoreError) -> CliError {
    let code = match err.kind() {
        ErrorKind::NotFound | ErrorKind::DeviceUnavailable => NOT_FOUND,
        ErrorKind::InvalidArgument | ErrorKind::ProtocolViolation => DATA_INVALID,
        ErrorKind::Link => return link_error_from_core(context, err),
        ErrorKind::ResourceExhausted | ErrorKind::InvalidState => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}

fn link_error_from_core(context: &str, err: CoreError) -> CliError {
    match err {
        CoreError::Link(link) => link_error(context, link),
        other => CliError::new(LINK_ERROR, format!("{context}: {other}")),
    }
}
