//! Codec error taxonomy.

use thiserror::Error;

use crate::buffer::Truncated;

/// Errors raised while encoding or decoding AMQP values and frames.
///
/// Encoding errors are surfaced to the caller of the operation that produced
/// the bytes (for example a send) and are never fatal to the connection;
/// decoding errors on the frame path are framing errors and terminate the
/// connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The buffer ended before the value was complete.
    #[error("truncated frame: unexpected end of buffer")]
    Truncated,
    /// A format code that this codec does not recognise.
    #[error("invalid format code 0x{0:02x}")]
    InvalidFormatCode(u8),
    /// A format code for a type the codec recognises but does not support.
    #[error("unsupported type: {0}")]
    UnsupportedType(&'static str),
    /// A mandatory composite field was null or absent.
    #[error("mandatory field {0} is null")]
    MissingField(&'static str),
    /// The described value did not carry the expected descriptor.
    #[error("unexpected descriptor: expected 0x{expected:02x}, found 0x{found:02x}")]
    UnexpectedDescriptor {
        expected: u64,
        found: u64,
    },
    /// A composite field decoded to a different type than its definition.
    #[error("field {field} has unexpected type")]
    TypeMismatch {
        field: &'static str,
    },
    /// String bytes that are not valid UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,
    /// A value too large for any wire form (or for its length prefix).
    #[error("{0} too large to encode")]
    ValueTooLarge(&'static str),
    /// Array elements must share a single constructor.
    #[error("array elements are not of a uniform type")]
    MixedArray,
}

impl From<Truncated> for CodecError {
    fn from(_: Truncated) -> Self { Self::Truncated }
}
