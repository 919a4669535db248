// src/error.rs

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised by the packet transport and the byte-level codec.
#[derive(Debug)]
pub enum TransportError {
    /// I/O failure on the underlying connection.
    Io(std::io::Error),
    /// The transport was closed locally.
    Closed,
    /// The byte stream did not contain a well-formed packet.
    Decode(String),
    /// Declared body length exceeds the configured maximum.
    BodyTooLarge { len: usize, max: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Closed => write!(f, "transport closed"),
            Self::Decode(msg) => write!(f, "malformed packet: {msg}"),
            Self::BodyTooLarge { len, max } => {
                write!(f, "packet body of {len} bytes exceeds maximum of {max}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors surfaced by session operations, streams, and the dispatch loop.
#[derive(Debug)]
pub enum RpcError {
    /// The transport failed underneath the session.
    Transport(TransportError),
    /// Encoding or decoding a JSON body failed.
    Json(serde_json::Error),
    /// The peer violated the protocol.
    Protocol(String),
    /// The peer terminated the call with an error.
    Remote(CallError),
    /// Delivering an inbound packet to its request's pipe did not
    /// complete within the configured window.
    DeliveryTimeout(Duration),
    /// The request's inbound pipe was closed while a packet was being
    /// delivered to it.
    PipeClosed,
    /// The call ended before a response value arrived.
    UnexpectedEnd,
    /// The stream has already been ended locally.
    StreamClosed,
    /// The stream is not yet bound to a request id.
    Unbound,
    /// The request outlived its session.
    SessionClosed,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Remote(e) => write!(f, "remote error: {e}"),
            Self::DeliveryTimeout(window) => {
                write!(f, "inbound delivery exceeded {window:?}")
            }
            Self::PipeClosed => write!(f, "request pipe closed"),
            Self::UnexpectedEnd => write!(f, "call ended without a response"),
            Self::StreamClosed => write!(f, "stream already closed"),
            Self::Unbound => write!(f, "stream not bound to a request id"),
            Self::SessionClosed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// An error value carried in a termination packet body.
///
/// The wire form is `{"name":"Error","message":...,"stack":...}`. The
/// `name` field must be exactly `"Error"`; anything else is rejected as
/// malformed rather than treated as a usable error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub name: String,
    pub message: String,
    pub stack: String,
}

impl CallError {
    /// Build a well-formed error value from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_owned(),
            message: message.into(),
            stack: String::new(),
        }
    }

    /// Parse a termination body as an error value.
    pub fn parse(body: &[u8]) -> Result<Self, RpcError> {
        let err: CallError = serde_json::from_slice(body)?;
        if err.name != "Error" {
            return Err(RpcError::Protocol(format!(
                "error name is {:?}, not \"Error\"",
                err.name
            )));
        }
        Ok(err)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CallError {}
