//! AMQP 1.0 type system: primitive, compound, described, and array encodings.
//!
//! Every wire value carries a one-byte format code. Encoding always picks the
//! smallest legal form for a value (`uint0`/`smalluint`/`uint` and friends);
//! decoding accepts every form. Composites (the performatives) are described
//! lists built through [`encode::encode_composite`], which elides trailing
//! omitted fields and null-fills interior ones, mirroring the decode side in
//! [`decode::FieldList`].

use bytes::Bytes;

pub mod codes;
pub mod decode;
pub mod encode;
mod error;
mod serial;
mod symbol;

pub use error::CodecError;
pub use serial::SerialNumber;
pub use symbol::Symbol;

/// Named key/value pairs used by performative `properties` fields.
pub type Fields = Vec<(Symbol, Value)>;

/// Descriptor of a described type: a numeric type code or a symbolic name.
#[derive(Clone, Debug, PartialEq)]
pub enum Descriptor {
    /// 64-bit descriptor code, e.g. `0x10` for Open.
    Code(u64),
    /// Symbolic descriptor, e.g. `apache.org:selector-filter:string`.
    Name(Symbol),
}

/// A described value: descriptor plus the value it describes.
#[derive(Clone, Debug, PartialEq)]
pub struct Described {
    /// The descriptor identifying the described type.
    pub descriptor: Descriptor,
    /// The described value itself.
    pub value: Value,
}

/// Dynamic representation of any AMQP 1.0 value.
///
/// Maps preserve insertion order so that encoding is deterministic; AMQP map
/// semantics are unordered, and decode keeps the last occurrence of a
/// duplicated key.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Value {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
    Binary(Bytes),
    String(String),
    Symbol(Symbol),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Array(Vec<Value>),
    Described(Box<Described>),
}

impl Value {
    /// `true` for the `null` value.
    #[must_use]
    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    /// Borrow the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the symbol, if this is a symbol.
    #[must_use]
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Self::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value widened to `u64` for any unsigned variant.
    #[must_use]
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Self::Ubyte(n) => Some(u64::from(*n)),
            Self::Ushort(n) => Some(u64::from(*n)),
            Self::Uint(n) => Some(u64::from(*n)),
            Self::Ulong(n) => Some(*n),
            _ => None,
        }
    }

    /// The boolean content, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self { Self::Null }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Self::String(s.to_owned()) }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self { Self::Uint(n) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Self::Bool(b) }
}
