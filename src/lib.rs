pub mod api;
pub mod config;
pub mod naming;
pub mod path;
pub mod rpc;
pub mod storage;

use serde::{Deserialize, Serialize};

/// Well-known port for the naming server's client-facing service interface.
pub const SERVICE_PORT: u16 = 6000;
/// Well-known port for the naming server's registration interface.
pub const REGISTRATION_PORT: u16 = 6001;
/// Default port for a storage server's client (byte access) interface.
pub const STORAGE_CLIENT_PORT: u16 = 7225;
/// Default port for a storage server's command interface.
pub const STORAGE_COMMAND_PORT: u16 = 9325;

/// Errors raised anywhere in the filesystem.
///
/// The enum is serializable so that an error raised inside a remote method
/// travels back in the response envelope and is re-raised on the caller with
/// its kind intact. Transport-level failures always surface as `Rpc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum WireFsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("rpc failure: {0}")]
    Rpc(String),

    /// Misconfiguration: an interface whose methods do not all declare the
    /// transport failure error cannot back a skeleton or a stub.
    #[error("not a remote interface: {0}")]
    NotRemote(String),
}

impl From<std::io::Error> for WireFsError {
    fn from(e: std::io::Error) -> Self {
        WireFsError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WireFsError>;
