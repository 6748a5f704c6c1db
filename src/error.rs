use std::io;

use thiserror::Error;

/// Errors produced by the codec, the server session machine and the client.
///
/// Session-level variants display the exact reason text the server puts in an
/// `ERROR` body, so [`Error::from_reason`] can turn a reply back into the variant.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("Buffer overflow: message too long")]
    BufferOverflow,
    #[error("message body too long: {len} bytes (max {max})")]
    MessageTooLong { len: usize, max: usize },
    #[error("{0}")]
    ProtocolViolation(String),
    #[error("request timed out")]
    RequestTimeout,
    #[error("dial timed out")]
    DialTimeout,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Cannot connect to session")]
    AlreadyPaired,
    #[error("Must specify other session")]
    SelfPairing,
    #[error("Session must use same protocol")]
    ProtocolMismatch,
    #[error("Peer session closed")]
    PeerClosed,
    #[error("Service unavailable")]
    ServiceUnavailable,
    #[error("port delta unpredictable: hole punching unsupported on this network")]
    PortDeltaUnpredictable,
    #[error("connection failed: hole punching unsupported on this network")]
    ConnectionFailed,
    #[error("{0}")]
    Rejected(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection closed")]
    Closed,
    #[cfg(feature = "tls")]
    #[error("tls: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

impl Error {
    /// Map the text of an `ERROR` reply back to a typed error.
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "Session not found" => Error::SessionNotFound,
            "Cannot connect to session" => Error::AlreadyPaired,
            "Must specify other session" => Error::SelfPairing,
            "Session must use same protocol" => Error::ProtocolMismatch,
            "Peer session closed" => Error::PeerClosed,
            "Service unavailable" => Error::ServiceUnavailable,
            other => Error::Rejected(other.to_string()),
        }
    }

    /// Errors after which the connection that produced them must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::MalformedMessage(_)
                | Error::BufferOverflow
                | Error::ProtocolViolation(_)
                | Error::Closed
        )
    }
}
