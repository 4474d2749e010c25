//! Crate-wide error type and the standard AMQP error conditions.
//!
//! The error is `Clone` (I/O failures are wrapped in `Arc`) because one
//! terminal failure fans out to every session, link, and in-flight operation
//! on the connection it killed.

use std::sync::Arc;

use thiserror::Error;

use crate::encoding::{CodecError, Symbol};
use crate::frames::RemoteError;

/// Symbolic error conditions defined by the AMQP 1.0 specification.
pub mod condition {
    /// A peer addressed a nonexistent node.
    pub const NOT_FOUND: &str = "amqp:not-found";
    /// A peer lacked permission for an operation.
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    /// A resource limit, such as the idle window, was exceeded.
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    /// The peer violated frame layout rules.
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    /// A frame referenced a handle with no attached link.
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";
    /// A transfer arrived outside the session window.
    pub const WINDOW_VIOLATION: &str = "amqp:session:window-violation";
    /// A message exceeded the link's max-message-size.
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
    /// The link was detached by the peer's administrator.
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    /// The peer used a feature this implementation does not provide.
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
}

/// Any failure surfaced by the connection, session, link, or codec layers.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The underlying byte stream failed. Fatal to the connection.
    #[error("transport error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    /// The peer spoke an incompatible protocol revision.
    #[error("protocol version mismatch: peer offered {peer:?}")]
    VersionMismatch {
        /// The 8-byte protocol header the peer sent.
        peer: [u8; 8],
    },

    /// An incoming frame exceeded the advertised max-frame-size.
    #[error("frame of {size} bytes exceeds max-frame-size {max}")]
    FrameTooLarge {
        /// Size declared in the frame header.
        size: u64,
        /// The limit in force.
        max: u32,
    },

    /// An incoming frame violated the framing layout.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Encoding or decoding a value failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The SASL exchange ended without success.
    #[error("sasl authentication failed: {outcome}")]
    SaslFailed {
        /// The outcome code the server returned.
        outcome: String,
    },

    /// The server offered none of the configured SASL mechanisms.
    #[error("sasl mechanism {0} not offered by server")]
    SaslMechanismUnavailable(Symbol),

    /// No inbound traffic for twice the local idle window.
    #[error("connection idle timeout expired")]
    IdleTimeout,

    /// The connection closed; carries the peer's error when it sent one.
    #[error("connection closed{}", fmt_remote(.0))]
    ConnectionClosed(Option<RemoteError>),

    /// The session ended; carries the peer's error when it sent one.
    #[error("session ended{}", fmt_remote(.0))]
    SessionEnded(Option<RemoteError>),

    /// The link detached; carries the peer's error when it sent one.
    #[error("link detached{}", fmt_remote(.0))]
    LinkDetached(Option<RemoteError>),

    /// The link was closed by a local call.
    #[error("link closed")]
    LinkClosed,

    /// The peer attached with no terminus and refused the link.
    #[error("attach refused by peer{}", fmt_remote(.0))]
    AttachRefused(Option<RemoteError>),

    /// The peer did not honor an explicitly requested settlement mode.
    #[error("settle mode mismatch: requested {requested}, peer granted {granted}")]
    SettleModeMismatch {
        /// The mode the caller asked for.
        requested: &'static str,
        /// The mode the peer returned.
        granted: String,
    },

    /// A supplied delivery tag exceeded the 32-byte limit.
    #[error("delivery tag of {0} bytes exceeds the 32 byte limit")]
    DeliveryTagTooLarge(usize),

    /// An encoded message exceeded the link's max-message-size.
    #[error("encoded message of {size} bytes exceeds max-message-size {max}")]
    MessageTooLarge {
        /// Encoded size of the message.
        size: u64,
        /// Negotiated maximum.
        max: u64,
    },

    /// The peer rejected a delivery.
    #[error("delivery rejected: {0}")]
    Rejected(RemoteError),

    /// A declare or discharge returned an unexpected outcome.
    #[error("unexpected transaction outcome")]
    TransactionOutcome,

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The call is not valid for this endpoint configuration.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
}

fn fmt_remote(err: &Option<RemoteError>) -> String {
    err.as_ref().map(|e| format!(" by peer: {e}")).unwrap_or_default()
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self { Self::Io(Arc::new(err)) }
}

impl Error {
    /// The remote error condition carried by this error, when there is one.
    #[must_use]
    pub fn remote_condition(&self) -> Option<&Symbol> {
        match self {
            Self::ConnectionClosed(Some(e))
            | Self::SessionEnded(Some(e))
            | Self::LinkDetached(Some(e))
            | Self::AttachRefused(Some(e))
            | Self::Rejected(e) => Some(&e.condition),
            _ => None,
        }
    }

    /// `true` when the failure is fatal to the whole connection.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::VersionMismatch { .. }
                | Self::FrameTooLarge { .. }
                | Self::MalformedFrame(_)
                | Self::IdleTimeout
                | Self::ConnectionClosed(_)
                | Self::SaslFailed { .. }
        )
    }
}

/// Canonical result alias used by the public API.
pub type Result<T> = std::result::Result<T, Error>;
