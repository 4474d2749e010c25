//! Value and composite decoding.

use bytes::Bytes;

use super::{codes, CodecError, Described, Descriptor, Symbol, Value};
use crate::buffer::ReadCursor;

/// Read one complete value, constructor included.
pub fn read_value(cur: &mut ReadCursor<'_>) -> Result<Value, CodecError> {
    let code = cur.read_u8()?;
    if code == codes::DESCRIBED {
        let descriptor = read_descriptor(cur)?;
        let value = read_value(cur)?;
        return Ok(Value::Described(Box::new(Described { descriptor, value })));
    }
    read_raw(cur, code)
}

fn read_descriptor(cur: &mut ReadCursor<'_>) -> Result<Descriptor, CodecError> {
    match read_value(cur)? {
        Value::Ulong(code) => Ok(Descriptor::Code(code)),
        Value::Symbol(name) => Ok(Descriptor::Name(name)),
        _ => Err(CodecError::UnsupportedType("descriptor")),
    }
}

/// Read the constructor-less form of a value whose format code is `code`.
///
/// Used both after reading a constructor byte and for array elements, which
/// share one constructor for the whole array.
fn read_raw(cur: &mut ReadCursor<'_>, code: u8) -> Result<Value, CodecError> {
    let value = match code {
        codes::NULL => Value::Null,
        codes::BOOL_TRUE => Value::Bool(true),
        codes::BOOL_FALSE => Value::Bool(false),
        codes::BOOL => Value::Bool(cur.read_u8()? != 0),
        codes::UBYTE => Value::Ubyte(cur.read_u8()?),
        codes::USHORT => Value::Ushort(cur.read_u16()?),
        codes::UINT_0 => Value::Uint(0),
        codes::SMALL_UINT => Value::Uint(u32::from(cur.read_u8()?)),
        codes::UINT => Value::Uint(cur.read_u32()?),
        codes::ULONG_0 => Value::Ulong(0),
        codes::SMALL_ULONG => Value::Ulong(u64::from(cur.read_u8()?)),
        codes::ULONG => Value::Ulong(cur.read_u64()?),
        codes::BYTE => Value::Byte(cur.read_u8()? as i8),
        codes::SHORT => Value::Short(cur.read_u16()? as i16),
        codes::SMALL_INT => Value::Int(i32::from(cur.read_u8()? as i8)),
        codes::INT => Value::Int(cur.read_u32()? as i32),
        codes::SMALL_LONG => Value::Long(i64::from(cur.read_u8()? as i8)),
        codes::LONG => Value::Long(cur.read_u64()? as i64),
        codes::FLOAT => Value::Float(f32::from_bits(cur.read_u32()?)),
        codes::DOUBLE => Value::Double(f64::from_bits(cur.read_u64()?)),
        codes::CHAR => {
            let n = cur.read_u32()?;
            Value::Char(char::from_u32(n).ok_or(CodecError::UnsupportedType("char"))?)
        }
        codes::TIMESTAMP => Value::Timestamp(cur.read_u64()? as i64),
        codes::UUID => {
            let bytes = cur.read_bytes(16)?;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(bytes);
            Value::Uuid(uuid)
        }
        codes::VBIN8 => {
            let len = cur.read_u8()? as usize;
            Value::Binary(Bytes::copy_from_slice(cur.read_bytes(len)?))
        }
        codes::VBIN32 => {
            let len = cur.read_u32()? as usize;
            Value::Binary(Bytes::copy_from_slice(cur.read_bytes(len)?))
        }
        codes::STR8 => {
            let len = cur.read_u8()? as usize;
            Value::String(read_utf8(cur, len)?)
        }
        codes::STR32 => {
            let len = cur.read_u32()? as usize;
            Value::String(read_utf8(cur, len)?)
        }
        codes::SYM8 => {
            let len = cur.read_u8()? as usize;
            Value::Symbol(Symbol::new(read_utf8(cur, len)?))
        }
        codes::SYM32 => {
            let len = cur.read_u32()? as usize;
            Value::Symbol(Symbol::new(read_utf8(cur, len)?))
        }
        codes::LIST_0 => Value::List(Vec::new()),
        codes::LIST8 => {
            let (mut body, count) = compound_body(cur, true)?;
            Value::List(read_elements(&mut body, count)?)
        }
        codes::LIST32 => {
            let (mut body, count) = compound_body(cur, false)?;
            Value::List(read_elements(&mut body, count)?)
        }
        codes::MAP8 => {
            let (mut body, count) = compound_body(cur, true)?;
            Value::Map(read_pairs(&mut body, count)?)
        }
        codes::MAP32 => {
            let (mut body, count) = compound_body(cur, false)?;
            Value::Map(read_pairs(&mut body, count)?)
        }
        codes::ARRAY8 => {
            let (mut body, count) = compound_body(cur, true)?;
            read_array(&mut body, count)?
        }
        codes::ARRAY32 => {
            let (mut body, count) = compound_body(cur, false)?;
            read_array(&mut body, count)?
        }
        codes::DECIMAL32 | codes::DECIMAL64 | codes::DECIMAL128 => {
            return Err(CodecError::UnsupportedType("decimal"));
        }
        other => return Err(CodecError::InvalidFormatCode(other)),
    };
    Ok(value)
}

fn read_utf8(cur: &mut ReadCursor<'_>, len: usize) -> Result<String, CodecError> {
    let bytes = cur.read_bytes(len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Consume a compound's size and count headers, returning a cursor over the
/// element bytes and the element count.
fn compound_body<'a>(
    cur: &mut ReadCursor<'a>,
    narrow: bool,
) -> Result<(ReadCursor<'a>, u32), CodecError> {
    let (size, count) = if narrow {
        (cur.read_u8()? as usize, u32::from(cur.read_u8()?))
    } else {
        (cur.read_u32()? as usize, cur.read_u32()?)
    };
    // size includes the count field itself
    let count_width = if narrow { 1 } else { 4 };
    let body_len = size
        .checked_sub(count_width)
        .ok_or(CodecError::Truncated)?;
    Ok((ReadCursor::new(cur.read_bytes(body_len)?), count))
}

fn read_elements(cur: &mut ReadCursor<'_>, count: u32) -> Result<Vec<Value>, CodecError> {
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        items.push(read_value(cur)?);
    }
    Ok(items)
}

fn read_pairs(cur: &mut ReadCursor<'_>, count: u32) -> Result<Vec<(Value, Value)>, CodecError> {
    if count % 2 != 0 {
        return Err(CodecError::UnsupportedType("map with odd element count"));
    }
    let mut pairs: Vec<(Value, Value)> = Vec::with_capacity((count / 2).min(512) as usize);
    for _ in 0..count / 2 {
        let key = read_value(cur)?;
        let val = read_value(cur)?;
        // duplicate keys keep the last occurrence
        if let Some(existing) = pairs.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = val;
        } else {
            pairs.push((key, val));
        }
    }
    Ok(pairs)
}

fn read_array(cur: &mut ReadCursor<'_>, count: u32) -> Result<Value, CodecError> {
    let constructor = cur.read_u8()?;
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        items.push(read_raw(cur, constructor)?);
    }
    Ok(Value::Array(items))
}

/// Positional accessor over a decoded composite's field list.
///
/// Fields a peer elided (a short list) and fields transmitted as null both
/// read back as `None`; mandatory fields map that to
/// [`CodecError::MissingField`].
#[derive(Debug)]
pub struct FieldList {
    fields: Vec<Value>,
}

impl FieldList {
    /// Unwrap `value` as a described list carrying descriptor `code`.
    pub fn from_value(value: Value, code: u64) -> Result<Self, CodecError> {
        let Value::Described(described) = value else {
            return Err(CodecError::UnsupportedType("expected described composite"));
        };
        let found = match described.descriptor {
            Descriptor::Code(found) => found,
            Descriptor::Name(_) => {
                return Err(CodecError::UnsupportedType("symbolic performative descriptor"));
            }
        };
        if found != code {
            return Err(CodecError::UnexpectedDescriptor {
                expected: code,
                found,
            });
        }
        let Value::List(fields) = described.value else {
            return Err(CodecError::UnsupportedType("composite body is not a list"));
        };
        Ok(Self { fields })
    }

    /// The field at `idx`, with null and short-list elision reading as `None`.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        match self.fields.get(idx) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        }
    }

    /// Take ownership of the field at `idx`.
    #[must_use]
    pub fn take(&mut self, idx: usize) -> Option<Value> {
        let v = self.fields.get_mut(idx).map(std::mem::take)?;
        if v.is_null() { None } else { Some(v) }
    }

    /// A string field.
    pub fn string(&mut self, idx: usize, field: &'static str) -> Result<Option<String>, CodecError> {
        match self.take(idx) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// A symbol field.
    pub fn symbol(&mut self, idx: usize, field: &'static str) -> Result<Option<Symbol>, CodecError> {
        match self.take(idx) {
            None => Ok(None),
            Some(Value::Symbol(s)) => Ok(Some(s)),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// A binary field.
    pub fn binary(&mut self, idx: usize, field: &'static str) -> Result<Option<Bytes>, CodecError> {
        match self.take(idx) {
            None => Ok(None),
            Some(Value::Binary(b)) => Ok(Some(b)),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// A ubyte field.
    pub fn ubyte(&self, idx: usize, field: &'static str) -> Result<Option<u8>, CodecError> {
        match self.get(idx) {
            None => Ok(None),
            Some(Value::Ubyte(n)) => Ok(Some(*n)),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// A ushort field.
    pub fn ushort(&self, idx: usize, field: &'static str) -> Result<Option<u16>, CodecError> {
        match self.get(idx) {
            None => Ok(None),
            Some(Value::Ushort(n)) => Ok(Some(*n)),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// A uint field.
    pub fn uint(&self, idx: usize, field: &'static str) -> Result<Option<u32>, CodecError> {
        match self.get(idx) {
            None => Ok(None),
            Some(Value::Uint(n)) => Ok(Some(*n)),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// A ulong field.
    pub fn ulong(&self, idx: usize, field: &'static str) -> Result<Option<u64>, CodecError> {
        match self.get(idx) {
            None => Ok(None),
            Some(Value::Ulong(n)) => Ok(Some(*n)),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// A boolean field.
    pub fn boolean(&self, idx: usize, field: &'static str) -> Result<Option<bool>, CodecError> {
        match self.get(idx) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// Multi-value symbol fields arrive either as a lone symbol or an array.
    pub fn symbols(&mut self, idx: usize, field: &'static str) -> Result<Vec<Symbol>, CodecError> {
        match self.take(idx) {
            None => Ok(Vec::new()),
            Some(Value::Symbol(s)) => Ok(vec![s]),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::Symbol(s) => Ok(s),
                    _ => Err(CodecError::TypeMismatch { field }),
                })
                .collect(),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }

    /// A `fields`-typed map keyed by symbols.
    pub fn properties(
        &mut self,
        idx: usize,
        field: &'static str,
    ) -> Result<Option<super::Fields>, CodecError> {
        match self.take(idx) {
            None => Ok(None),
            Some(Value::Map(pairs)) => pairs
                .into_iter()
                .map(|(k, v)| match k {
                    Value::Symbol(s) => Ok((s, v)),
                    _ => Err(CodecError::TypeMismatch { field }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(CodecError::TypeMismatch { field }),
        }
    }
}

/// Turn an optional field into a mandatory one.
pub fn required<T>(value: Option<T>, field: &'static str) -> Result<T, CodecError> {
    value.ok_or(CodecError::MissingField(field))
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::encoding::encode::encode_value;

    fn roundtrip(value: &Value) -> Value {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, value).expect("encode");
        let mut cur = ReadCursor::new(&buf);
        let back = read_value(&mut cur).expect("decode");
        assert!(cur.is_empty(), "decoder left {} bytes", cur.remaining());
        back
    }

    #[test]
    fn roundtrips_primitives() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Ubyte(7),
            Value::Ushort(300),
            Value::Uint(0),
            Value::Uint(90),
            Value::Uint(1 << 20),
            Value::Ulong(u64::MAX),
            Value::Byte(-3),
            Value::Short(-300),
            Value::Int(-129),
            Value::Long(1 << 40),
            Value::Float(1.5),
            Value::Double(-2.25),
            Value::Char('λ'),
            Value::Timestamp(1_700_000_000_000),
            Value::Uuid([9; 16]),
            Value::Binary(Bytes::from_static(b"\x00\x01\x02")),
            Value::from("hello"),
            Value::Symbol(Symbol::from("amqp:link:detach-forced")),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn roundtrips_compounds() {
        let v = Value::Map(vec![
            (Value::from("a"), Value::Uint(1)),
            (
                Value::from("b"),
                Value::List(vec![Value::Bool(false), Value::Null]),
            ),
        ]);
        assert_eq!(roundtrip(&v), v);

        let arr = Value::Array(vec![
            Value::Symbol(Symbol::from("x")),
            Value::Symbol(Symbol::from("yy")),
        ]);
        assert_eq!(roundtrip(&arr), arr);
    }

    #[test]
    fn duplicate_map_keys_keep_last() {
        // encode a map with a duplicated key by hand
        let mut buf = BytesMut::new();
        encode_value(
            &mut buf,
            &Value::Map(vec![(Value::from("k"), Value::Uint(1))]),
        )
        .expect("encode");
        // splice a second k=2 pair in by re-encoding manually
        let mut manual = BytesMut::new();
        let pairs = [
            (Value::from("k"), Value::Uint(1)),
            (Value::from("k"), Value::Uint(2)),
        ];
        crate::encoding::encode::write_map(&mut manual, &pairs).expect("encode");
        let mut cur = ReadCursor::new(&manual);
        let decoded = read_value(&mut cur).expect("decode");
        assert_eq!(
            decoded,
            Value::Map(vec![(Value::from("k"), Value::Uint(2))])
        );
    }

    #[test]
    fn truncated_input_is_reported() {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &Value::from("hello world")).expect("encode");
        let mut cur = ReadCursor::new(&buf[..buf.len() - 1]);
        assert_eq!(read_value(&mut cur), Err(CodecError::Truncated));
    }

    #[test]
    fn short_list_fields_read_as_none() {
        let mut buf = BytesMut::new();
        crate::encoding::encode::encode_composite(
            &mut buf,
            0x13,
            &[Some(Value::Uint(1)), None, Some(Value::Uint(3)), None],
        )
        .expect("encode");
        let mut cur = ReadCursor::new(&buf);
        let value = read_value(&mut cur).expect("decode");
        let mut fields = FieldList::from_value(value, 0x13).expect("composite");
        assert_eq!(fields.uint(0, "a").expect("a"), Some(1));
        assert_eq!(fields.uint(1, "b").expect("b"), None);
        assert_eq!(fields.uint(2, "c").expect("c"), Some(3));
        assert_eq!(fields.uint(3, "d").expect("d"), None);
        assert_eq!(fields.uint(9, "z").expect("z"), None);
        assert!(matches!(
            required(fields.uint(1, "b").expect("b"), "b"),
            Err(CodecError::MissingField("b"))
        ));
    }
}
