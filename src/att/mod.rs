//! The Attribute Protocol (ATT) client.
//!
//! ATT runs over L2CAP channel `0x0004`, which is connected implicitly as
//! soon as the Link-Layer connection exists. The server hosts *attributes*
//! - 16-bit handle, UUID type, value - and the client reads and writes them
//! by handle.
//!
//! This is a pure client: it issues requests, consumes responses, and
//! receives notifications/indications. Requests are strictly serialized -
//! the protocol allows only one outstanding request, and so does
//! [`Client`].

mod client;
mod handle;
mod pdus;

pub use self::client::{Client, NotificationHandler, ATT_MTU_DEFAULT, ATT_MTU_MAX};
pub use self::handle::Handle;
pub use self::pdus::{AttMsg, ErrorCode, Opcode};

use crate::link::LinkError;
use crate::Error;
use core::fmt;

/// Errors surfaced by ATT client operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttError {
    /// Invalid argument (e.g. a value longer than the MTU allows).
    Param,
    /// A request is already outstanding.
    Busy,
    /// The server didn't answer within the request timeout.
    Timeout,
    /// The server answered with `ErrorRsp`, carrying this error code.
    Protocol(ErrorCode),
    /// The connection went down while the request was outstanding.
    Disconnected,
    /// There is no connection to issue requests on.
    NotConnected,
    /// The Link-Layer failed.
    Link(LinkError),
    /// A PDU failed to encode or decode.
    Codec(Error),
}

impl From<LinkError> for AttError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::NotConnected => AttError::NotConnected,
            other => AttError::Link(other),
        }
    }
}

impl From<Error> for AttError {
    fn from(e: Error) -> Self {
        AttError::Codec(e)
    }
}

impl fmt::Display for AttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttError::Param => f.write_str("invalid parameter"),
            AttError::Busy => f.write_str("request already outstanding"),
            AttError::Timeout => f.write_str("request timed out"),
            AttError::Protocol(code) => write!(f, "error response: {:?}", code),
            AttError::Disconnected => f.write_str("disconnected"),
            AttError::NotConnected => f.write_str("not connected"),
            AttError::Link(e) => write!(f, "link: {}", e),
            AttError::Codec(e) => write!(f, "codec: {}", e),
        }
    }
}
