//! Value and composite encoding.
//!
//! Numeric types are written in their shortest legal form. Compound sizes
//! are reserved up front and back-patched once the content length is known.

use bytes::{BufMut, BytesMut};

use super::{codes, CodecError, Described, Descriptor, Symbol, Value};
use crate::buffer::patch_u32_at;

/// Append the encoding of `value` to `buf`.
pub fn encode_value(buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Null => buf.put_u8(codes::NULL),
        Value::Bool(b) => buf.put_u8(if *b { codes::BOOL_TRUE } else { codes::BOOL_FALSE }),
        Value::Ubyte(n) => {
            buf.put_u8(codes::UBYTE);
            buf.put_u8(*n);
        }
        Value::Ushort(n) => {
            buf.put_u8(codes::USHORT);
            buf.put_u16(*n);
        }
        Value::Uint(n) => write_uint(buf, *n),
        Value::Ulong(n) => write_ulong(buf, *n),
        Value::Byte(n) => {
            buf.put_u8(codes::BYTE);
            buf.put_i8(*n);
        }
        Value::Short(n) => {
            buf.put_u8(codes::SHORT);
            buf.put_i16(*n);
        }
        Value::Int(n) => write_int(buf, *n),
        Value::Long(n) => write_long(buf, *n),
        Value::Float(f) => {
            buf.put_u8(codes::FLOAT);
            buf.put_f32(*f);
        }
        Value::Double(f) => {
            buf.put_u8(codes::DOUBLE);
            buf.put_f64(*f);
        }
        Value::Char(c) => {
            buf.put_u8(codes::CHAR);
            buf.put_u32(*c as u32);
        }
        Value::Timestamp(ms) => write_timestamp(buf, *ms),
        Value::Uuid(bytes) => {
            buf.put_u8(codes::UUID);
            buf.put_slice(bytes);
        }
        Value::Binary(b) => write_binary(buf, b)?,
        Value::String(s) => write_string(buf, s)?,
        Value::Symbol(s) => write_symbol(buf, s)?,
        Value::List(items) => write_list(buf, items)?,
        Value::Map(pairs) => write_map(buf, pairs)?,
        Value::Array(items) => write_array(buf, items)?,
        Value::Described(d) => write_described(buf, d)?,
    }
    Ok(())
}

/// Write a `uint` in its shortest form (`uint0`/`smalluint`/`uint`).
pub fn write_uint(buf: &mut BytesMut, n: u32) {
    if n == 0 {
        buf.put_u8(codes::UINT_0);
    } else if n < 256 {
        buf.put_u8(codes::SMALL_UINT);
        buf.put_u8(n as u8);
    } else {
        buf.put_u8(codes::UINT);
        buf.put_u32(n);
    }
}

/// Write a `ulong` in its shortest form (`ulong0`/`smallulong`/`ulong`).
pub fn write_ulong(buf: &mut BytesMut, n: u64) {
    if n == 0 {
        buf.put_u8(codes::ULONG_0);
    } else if n < 256 {
        buf.put_u8(codes::SMALL_ULONG);
        buf.put_u8(n as u8);
    } else {
        buf.put_u8(codes::ULONG);
        buf.put_u64(n);
    }
}

/// Write an `int`, using `smallint` when the value fits in a byte.
pub fn write_int(buf: &mut BytesMut, n: i32) {
    if (-128..128).contains(&n) {
        buf.put_u8(codes::SMALL_INT);
        buf.put_i8(n as i8);
    } else {
        buf.put_u8(codes::INT);
        buf.put_i32(n);
    }
}

/// Write a `long`, using `smalllong` when the value fits in a byte.
pub fn write_long(buf: &mut BytesMut, n: i64) {
    if (-128..128).contains(&n) {
        buf.put_u8(codes::SMALL_LONG);
        buf.put_i8(n as i8);
    } else {
        buf.put_u8(codes::LONG);
        buf.put_i64(n);
    }
}

/// Write a timestamp: milliseconds since the Unix epoch.
pub fn write_timestamp(buf: &mut BytesMut, ms: i64) {
    buf.put_u8(codes::TIMESTAMP);
    buf.put_i64(ms);
}

/// Write a string as `str8` or `str32` by length.
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    variable_width(buf, codes::STR8, codes::STR32, s.as_bytes(), "string")
}

/// Write a symbol as `sym8` or `sym32` by length.
pub fn write_symbol(buf: &mut BytesMut, s: &Symbol) -> Result<(), CodecError> {
    variable_width(buf, codes::SYM8, codes::SYM32, s.as_str().as_bytes(), "symbol")
}

/// Write binary data as `vbin8` or `vbin32` by length.
pub fn write_binary(buf: &mut BytesMut, b: &[u8]) -> Result<(), CodecError> {
    variable_width(buf, codes::VBIN8, codes::VBIN32, b, "binary")
}

fn variable_width(
    buf: &mut BytesMut,
    narrow: u8,
    wide: u8,
    bytes: &[u8],
    what: &'static str,
) -> Result<(), CodecError> {
    if bytes.len() < 256 {
        buf.put_u8(narrow);
        buf.put_u8(bytes.len() as u8);
    } else if u32::try_from(bytes.len()).is_ok() {
        buf.put_u8(wide);
        buf.put_u32(bytes.len() as u32);
    } else {
        return Err(CodecError::ValueTooLarge(what));
    }
    buf.put_slice(bytes);
    Ok(())
}

/// Write a list as `list0` or `list32`.
pub fn write_list(buf: &mut BytesMut, items: &[Value]) -> Result<(), CodecError> {
    if items.is_empty() {
        buf.put_u8(codes::LIST_0);
        return Ok(());
    }
    let count = u32::try_from(items.len()).map_err(|_| CodecError::ValueTooLarge("list"))?;
    buf.put_u8(codes::LIST32);
    let size_at = buf.len();
    buf.put_u32(0);
    let body_start = buf.len();
    buf.put_u32(count);
    for item in items {
        encode_value(buf, item)?;
    }
    patch_compound_size(buf, size_at, body_start, "list")
}

/// Write a map as `map32`, preserving pair order.
pub fn write_map(buf: &mut BytesMut, pairs: &[(Value, Value)]) -> Result<(), CodecError> {
    let count = pairs
        .len()
        .checked_mul(2)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(CodecError::ValueTooLarge("map"))?;
    buf.put_u8(codes::MAP32);
    let size_at = buf.len();
    buf.put_u32(0);
    let body_start = buf.len();
    buf.put_u32(count);
    for (key, val) in pairs {
        encode_value(buf, key)?;
        encode_value(buf, val)?;
    }
    patch_compound_size(buf, size_at, body_start, "map")
}

fn patch_compound_size(
    buf: &mut BytesMut,
    size_at: usize,
    body_start: usize,
    what: &'static str,
) -> Result<(), CodecError> {
    let size =
        u32::try_from(buf.len() - body_start).map_err(|_| CodecError::ValueTooLarge(what))?;
    patch_u32_at(buf, size_at, size);
    Ok(())
}

/// Constructor used for every element of an array.
///
/// Array elements are written in their raw (constructor-less) form, so one
/// fixed format code must cover all of them; the wide form is always chosen
/// for variable-width types.
fn array_constructor(items: &[Value]) -> Result<u8, CodecError> {
    let code = match &items[0] {
        Value::Bool(_) => codes::BOOL,
        Value::Ubyte(_) => codes::UBYTE,
        Value::Ushort(_) => codes::USHORT,
        Value::Uint(_) => codes::UINT,
        Value::Ulong(_) => codes::ULONG,
        Value::Byte(_) => codes::BYTE,
        Value::Short(_) => codes::SHORT,
        Value::Int(_) => codes::INT,
        Value::Long(_) => codes::LONG,
        Value::Float(_) => codes::FLOAT,
        Value::Double(_) => codes::DOUBLE,
        Value::Timestamp(_) => codes::TIMESTAMP,
        Value::Uuid(_) => codes::UUID,
        Value::Binary(_) => codes::VBIN32,
        Value::String(_) => codes::STR32,
        Value::Symbol(_) => codes::SYM32,
        _ => return Err(CodecError::UnsupportedType("array element")),
    };
    let uniform = items
        .iter()
        .all(|v| std::mem::discriminant(v) == std::mem::discriminant(&items[0]));
    if !uniform {
        return Err(CodecError::MixedArray);
    }
    Ok(code)
}

fn write_array_element(buf: &mut BytesMut, item: &Value) {
    match item {
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::Ubyte(n) => buf.put_u8(*n),
        Value::Ushort(n) => buf.put_u16(*n),
        Value::Uint(n) => buf.put_u32(*n),
        Value::Ulong(n) => buf.put_u64(*n),
        Value::Byte(n) => buf.put_i8(*n),
        Value::Short(n) => buf.put_i16(*n),
        Value::Int(n) => buf.put_i32(*n),
        Value::Long(n) => buf.put_i64(*n),
        Value::Float(f) => buf.put_f32(*f),
        Value::Double(f) => buf.put_f64(*f),
        Value::Timestamp(ms) => buf.put_i64(*ms),
        Value::Uuid(bytes) => buf.put_slice(bytes),
        Value::Binary(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        Value::String(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Symbol(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_str().as_bytes());
        }
        // array_constructor rejects everything else
        _ => unreachable!("non-array element type"),
    }
}

/// Write an array of uniformly typed values.
pub fn write_array(buf: &mut BytesMut, items: &[Value]) -> Result<(), CodecError> {
    if items.is_empty() {
        // empty array: array8 with zero elements and the null constructor
        buf.put_u8(codes::ARRAY8);
        buf.put_u8(2);
        buf.put_u8(0);
        buf.put_u8(codes::NULL);
        return Ok(());
    }
    let constructor = array_constructor(items)?;

    let mut body = BytesMut::new();
    for item in items {
        write_array_element(&mut body, item);
    }

    // size covers count + constructor + elements for array8 (count is one
    // byte there, four for array32)
    let count = u32::try_from(items.len()).map_err(|_| CodecError::ValueTooLarge("array"))?;
    if body.len() + 2 <= u8::MAX as usize && count < 256 {
        buf.put_u8(codes::ARRAY8);
        buf.put_u8((body.len() + 2) as u8);
        buf.put_u8(count as u8);
    } else {
        let size =
            u32::try_from(body.len() + 5).map_err(|_| CodecError::ValueTooLarge("array"))?;
        buf.put_u8(codes::ARRAY32);
        buf.put_u32(size);
        buf.put_u32(count);
    }
    buf.put_u8(constructor);
    buf.put_slice(&body);
    Ok(())
}

fn write_described(buf: &mut BytesMut, described: &Described) -> Result<(), CodecError> {
    buf.put_u8(codes::DESCRIBED);
    match &described.descriptor {
        Descriptor::Code(code) => write_ulong(buf, *code),
        Descriptor::Name(name) => write_symbol(buf, name)?,
    }
    encode_value(buf, &described.value)
}

/// Write the `0x00 smallulong` descriptor prefix of a composite.
pub fn write_descriptor(buf: &mut BytesMut, code: u64) {
    buf.put_u8(codes::DESCRIBED);
    write_ulong(buf, code);
}

/// Encode a described list composite.
///
/// `fields` are positional; `None` marks an omitted field. Trailing omitted
/// fields are elided entirely, interior ones are encoded as null, and a
/// composite with no set fields at all collapses to `list0`.
pub fn encode_composite(
    buf: &mut BytesMut,
    code: u64,
    fields: &[Option<Value>],
) -> Result<(), CodecError> {
    let last_set = fields.iter().rposition(Option::is_some);

    write_descriptor(buf, code);
    let Some(last_set) = last_set else {
        buf.put_u8(codes::LIST_0);
        return Ok(());
    };

    buf.put_u8(codes::LIST32);
    let size_at = buf.len();
    buf.put_u32(0);
    let body_start = buf.len();
    buf.put_u32((last_set + 1) as u32);
    for field in &fields[..=last_set] {
        match field {
            Some(value) => encode_value(buf, value)?,
            None => buf.put_u8(codes::NULL),
        }
    }
    patch_compound_size(buf, size_at, body_start, "composite")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &Value) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, value).expect("encode");
        buf.to_vec()
    }

    #[test]
    fn uint_short_forms() {
        assert_eq!(encoded(&Value::Uint(0)), vec![0x43]);
        assert_eq!(encoded(&Value::Uint(5)), vec![0x52, 5]);
        assert_eq!(encoded(&Value::Uint(256)), vec![0x70, 0, 0, 1, 0]);
    }

    #[test]
    fn ulong_short_forms() {
        assert_eq!(encoded(&Value::Ulong(0)), vec![0x44]);
        assert_eq!(encoded(&Value::Ulong(255)), vec![0x53, 255]);
        assert_eq!(
            encoded(&Value::Ulong(256)),
            vec![0x80, 0, 0, 0, 0, 0, 0, 1, 0]
        );
    }

    #[test]
    fn signed_small_forms() {
        assert_eq!(encoded(&Value::Int(-1)), vec![0x54, 0xff]);
        assert_eq!(encoded(&Value::Long(127)), vec![0x55, 127]);
        assert_eq!(encoded(&Value::Int(128)), vec![0x71, 0, 0, 0, 128]);
    }

    #[test]
    fn string_width_by_length() {
        assert_eq!(encoded(&Value::from("hi")), vec![0xa1, 2, b'h', b'i']);
        let long = "x".repeat(300);
        let bytes = encoded(&Value::String(long));
        assert_eq!(bytes[0], 0xb1);
        assert_eq!(&bytes[1..5], &300u32.to_be_bytes());
    }

    #[test]
    fn empty_composite_is_list0() {
        let mut buf = BytesMut::new();
        encode_composite(&mut buf, 0x17, &[None]).expect("encode");
        assert_eq!(buf.to_vec(), vec![0x00, 0x53, 0x17, 0x45]);
    }

    #[test]
    fn composite_elides_trailing_and_nulls_interior() {
        let mut buf = BytesMut::new();
        encode_composite(
            &mut buf,
            0x18,
            &[None, Some(Value::Uint(1)), None, None],
        )
        .expect("encode");
        // descriptor, list32, size, count=2, null, smalluint 1
        assert_eq!(
            buf.to_vec(),
            vec![0x00, 0x53, 0x18, 0xd0, 0, 0, 0, 7, 0, 0, 0, 2, 0x40, 0x52, 1]
        );
    }
}
