//! Wire layout of the AMQP 1.0 message body.
//!
//! A message on the wire is a sequence of described sections: header,
//! delivery annotations, message annotations, properties, application
//! properties, one or more data sections (or an amqp-value / amqp-sequence
//! body), and a footer. The helpers here stay close to the wire; richer
//! property manipulation is the application's business.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::buffer::ReadCursor;
use crate::encoding::{
    decode::{read_value, FieldList},
    encode::encode_composite,
    CodecError, Described, Descriptor, Symbol, Value,
};
use crate::frames::RemoteError;

/// Section descriptor codes.
mod section {
    pub const HEADER: u64 = 0x70;
    pub const DELIVERY_ANNOTATIONS: u64 = 0x71;
    pub const MESSAGE_ANNOTATIONS: u64 = 0x72;
    pub const PROPERTIES: u64 = 0x73;
    pub const APPLICATION_PROPERTIES: u64 = 0x74;
    pub const DATA: u64 = 0x75;
    pub const SEQUENCE: u64 = 0x76;
    pub const VALUE: u64 = 0x77;
    pub const FOOTER: u64 = 0x78;
}

/// Annotation maps are keyed by symbol or ulong.
pub type Annotations = Vec<(Value, Value)>;

/// The transport header section.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Header {
    /// Retain the message across intermediary restarts.
    pub durable: bool,
    /// Relative priority; the wire default is 4.
    pub priority: Option<u8>,
    /// Time the message stays live after arrival.
    pub ttl: Option<Duration>,
    /// `true` until the message might have been acquired before.
    pub first_acquirer: bool,
    /// Number of previous failed delivery attempts.
    pub delivery_count: u32,
}

/// The immutable properties section.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties {
    /// Application message identifier.
    pub message_id: Option<Value>,
    /// Identity of the producing user.
    pub user_id: Option<Bytes>,
    /// Destination node address.
    pub to: Option<String>,
    /// Message subject.
    pub subject: Option<String>,
    /// Node to send replies to.
    pub reply_to: Option<String>,
    /// Application correlation identifier.
    pub correlation_id: Option<Value>,
    /// MIME type of the body.
    pub content_type: Option<Symbol>,
    /// MIME encoding of the body.
    pub content_encoding: Option<Symbol>,
    /// Moment after which the message may be dropped.
    pub absolute_expiry_time: Option<i64>,
    /// Moment the message was created.
    pub creation_time: Option<i64>,
    /// Group the message belongs to.
    pub group_id: Option<String>,
    /// Position within the group.
    pub group_sequence: Option<u32>,
    /// Group the reply belongs to.
    pub reply_to_group_id: Option<String>,
}

/// A message as handed to [`Sender::send`](crate::Sender::send) or returned
/// by [`Receiver::receive`](crate::Receiver::receive).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// Message format code carried on the first transfer. 0 is plain AMQP.
    pub format: u32,
    /// Delivery tag; assigned by the sender when absent.
    pub delivery_tag: Option<Bytes>,
    /// Request pre-settled delivery in mixed mode.
    pub send_settled: bool,

    /// Transport header section.
    pub header: Option<Header>,
    /// Delivery annotations section (consumed by intermediaries).
    pub delivery_annotations: Option<Annotations>,
    /// Message annotations section.
    pub annotations: Option<Annotations>,
    /// Properties section.
    pub properties: Option<Properties>,
    /// Application properties section, keyed by string.
    pub application_properties: Option<Vec<(String, Value)>>,
    /// Opaque binary body, one section per chunk.
    pub data: Vec<Bytes>,
    /// Structured single-value body.
    pub value: Option<Value>,
    /// Structured sequence body, one section per list.
    pub sequence: Vec<Vec<Value>>,
    /// Footer section.
    pub footer: Option<Annotations>,

    pub(crate) delivery_id: Option<crate::encoding::SerialNumber>,
    pub(crate) state: Option<crate::frames::DeliveryState>,
}

impl Message {
    /// A message whose body is a single data section.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            data: vec![body.into()],
            ..Self::default()
        }
    }

    /// A message whose body is a single amqp-value section.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    /// The first data section, when the body is binary.
    #[must_use]
    pub fn body(&self) -> Option<&Bytes> { self.data.first() }

    /// The delivery state the peer communicated for this message, if any.
    #[must_use]
    pub fn state(&self) -> Option<&crate::frames::DeliveryState> { self.state.as_ref() }

    /// Encode every present section in wire order.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if let Some(header) = &self.header {
            encode_composite(
                buf,
                section::HEADER,
                &[
                    header.durable.then_some(Value::Bool(true)),
                    header.priority.map(Value::Ubyte),
                    header
                        .ttl
                        .map(|t| Value::Uint(t.as_millis().min(u128::from(u32::MAX)) as u32)),
                    header.first_acquirer.then_some(Value::Bool(true)),
                    (header.delivery_count != 0).then_some(Value::Uint(header.delivery_count)),
                ],
            )?;
        }
        if let Some(map) = &self.delivery_annotations {
            annotations_section(buf, section::DELIVERY_ANNOTATIONS, map)?;
        }
        if let Some(map) = &self.annotations {
            annotations_section(buf, section::MESSAGE_ANNOTATIONS, map)?;
        }
        if let Some(props) = &self.properties {
            encode_composite(
                buf,
                section::PROPERTIES,
                &[
                    props.message_id.clone(),
                    props.user_id.as_ref().map(|b| Value::Binary(b.clone())),
                    props.to.as_deref().map(Value::from),
                    props.subject.as_deref().map(Value::from),
                    props.reply_to.as_deref().map(Value::from),
                    props.correlation_id.clone(),
                    props.content_type.clone().map(Value::Symbol),
                    props.content_encoding.clone().map(Value::Symbol),
                    props.absolute_expiry_time.map(Value::Timestamp),
                    props.creation_time.map(Value::Timestamp),
                    props.group_id.as_deref().map(Value::from),
                    props.group_sequence.map(Value::Uint),
                    props.reply_to_group_id.as_deref().map(Value::from),
                ],
            )?;
        }
        if let Some(props) = &self.application_properties {
            let map = Value::Map(
                props
                    .iter()
                    .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                    .collect(),
            );
            described_section(buf, section::APPLICATION_PROPERTIES, &map)?;
        }
        for chunk in &self.data {
            described_section(buf, section::DATA, &Value::Binary(chunk.clone()))?;
        }
        for seq in &self.sequence {
            described_section(buf, section::SEQUENCE, &Value::List(seq.clone()))?;
        }
        if let Some(value) = &self.value {
            described_section(buf, section::VALUE, value)?;
        }
        if let Some(map) = &self.footer {
            annotations_section(buf, section::FOOTER, map)?;
        }
        Ok(())
    }

    /// Decode a reassembled payload into its sections.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut message = Self::default();
        let mut cur = ReadCursor::new(payload);
        while !cur.is_empty() {
            let value = read_value(&mut cur)?;
            let Value::Described(described) = value else {
                return Err(CodecError::UnsupportedType("bare message section"));
            };
            let Descriptor::Code(code) = described.descriptor else {
                return Err(CodecError::UnsupportedType("symbolic section descriptor"));
            };
            let Described { value, .. } = *described;
            match code {
                section::HEADER => {
                    let f = FieldList::from_value(rewrap(code, value), code)?;
                    message.header = Some(Header {
                        durable: f.boolean(0, "durable")?.unwrap_or(false),
                        priority: f.ubyte(1, "priority")?,
                        ttl: f
                            .uint(2, "ttl")?
                            .map(|ms| Duration::from_millis(u64::from(ms))),
                        first_acquirer: f.boolean(3, "first-acquirer")?.unwrap_or(false),
                        delivery_count: f.uint(4, "delivery-count")?.unwrap_or(0),
                    });
                }
                section::DELIVERY_ANNOTATIONS => {
                    message.delivery_annotations = Some(map_section(value)?);
                }
                section::MESSAGE_ANNOTATIONS => {
                    message.annotations = Some(map_section(value)?);
                }
                section::PROPERTIES => {
                    let mut f = FieldList::from_value(rewrap(code, value), code)?;
                    message.properties = Some(Properties {
                        message_id: f.take(0),
                        user_id: f.binary(1, "user-id")?,
                        to: f.string(2, "to")?,
                        subject: f.string(3, "subject")?,
                        reply_to: f.string(4, "reply-to")?,
                        correlation_id: f.take(5),
                        content_type: f.symbol(6, "content-type")?,
                        content_encoding: f.symbol(7, "content-encoding")?,
                        absolute_expiry_time: timestamp(f.take(8), "absolute-expiry-time")?,
                        creation_time: timestamp(f.take(9), "creation-time")?,
                        group_id: f.string(10, "group-id")?,
                        group_sequence: f.uint(11, "group-sequence")?,
                        reply_to_group_id: f.string(12, "reply-to-group-id")?,
                    });
                }
                section::APPLICATION_PROPERTIES => {
                    let Value::Map(pairs) = value else {
                        return Err(CodecError::TypeMismatch {
                            field: "application-properties",
                        });
                    };
                    message.application_properties = Some(
                        pairs
                            .into_iter()
                            .map(|(k, v)| match k {
                                Value::String(s) => Ok((s, v)),
                                _ => Err(CodecError::TypeMismatch {
                                    field: "application-properties",
                                }),
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                    );
                }
                section::DATA => {
                    let Value::Binary(bytes) = value else {
                        return Err(CodecError::TypeMismatch { field: "data" });
                    };
                    message.data.push(bytes);
                }
                section::SEQUENCE => {
                    let Value::List(items) = value else {
                        return Err(CodecError::TypeMismatch { field: "amqp-sequence" });
                    };
                    message.sequence.push(items);
                }
                section::VALUE => message.value = Some(value),
                section::FOOTER => message.footer = Some(map_section(value)?),
                _ => return Err(CodecError::UnsupportedType("unknown message section")),
            }
        }
        Ok(message)
    }

    /// Encode every section into one contiguous buffer.
    pub(crate) fn encoded(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn rewrap(code: u64, value: Value) -> Value {
    Value::Described(Box::new(Described {
        descriptor: Descriptor::Code(code),
        value,
    }))
}

fn described_section(buf: &mut BytesMut, code: u64, value: &Value) -> Result<(), CodecError> {
    crate::encoding::encode::write_descriptor(buf, code);
    crate::encoding::encode::encode_value(buf, value)
}

fn annotations_section(
    buf: &mut BytesMut,
    code: u64,
    map: &Annotations,
) -> Result<(), CodecError> {
    described_section(buf, code, &Value::Map(map.clone()))
}

fn map_section(value: Value) -> Result<Annotations, CodecError> {
    match value {
        Value::Map(pairs) => Ok(pairs),
        _ => Err(CodecError::TypeMismatch { field: "annotations" }),
    }
}

fn timestamp(value: Option<Value>, field: &'static str) -> Result<Option<i64>, CodecError> {
    match value {
        None => Ok(None),
        Some(Value::Timestamp(ms)) => Ok(Some(ms)),
        Some(_) => Err(CodecError::TypeMismatch { field }),
    }
}

/// Outcome reported for a received message that was rejected by the
/// application.
#[derive(Clone, Debug, Default)]
pub struct ModifyOptions {
    /// Count this delivery as a failed attempt.
    pub delivery_failed: bool,
    /// Do not redeliver to this receiver.
    pub undeliverable_here: bool,
    /// Annotations to merge into the message.
    pub message_annotations: Option<crate::encoding::Fields>,
}

/// Convenience constructor for the rejection error carried by
/// [`Receiver::reject`](crate::Receiver::reject).
#[must_use]
pub fn rejection(condition: &str, description: &str) -> RemoteError {
    RemoteError::new(condition).with_description(description)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_section_layout() {
        let msg = Message::new(&b"hello"[..]);
        let bytes = msg.encoded().expect("encode");
        assert_eq!(
            bytes.as_ref(),
            &[0x00, 0x53, 0x75, 0xa0, 0x05, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[test]
    fn roundtrips_sections() {
        let msg = Message {
            header: Some(Header {
                durable: true,
                priority: Some(9),
                ttl: Some(Duration::from_millis(1500)),
                ..Header::default()
            }),
            annotations: Some(vec![(
                Value::Symbol(Symbol::from("x-opt-partition")),
                Value::Uint(3),
            )]),
            properties: Some(Properties {
                message_id: Some(Value::from("m-1")),
                to: Some("queue-a".into()),
                content_type: Some(Symbol::from("application/octet-stream")),
                ..Properties::default()
            }),
            application_properties: Some(vec![("retries".into(), Value::Int(2))]),
            data: vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")],
            ..Message::default()
        };
        let bytes = msg.encoded().expect("encode");
        let back = Message::decode(&bytes).expect("decode");
        assert_eq!(back.header, msg.header);
        assert_eq!(back.annotations, msg.annotations);
        assert_eq!(back.properties, msg.properties);
        assert_eq!(back.application_properties, msg.application_properties);
        assert_eq!(back.data, msg.data);
    }

    #[test]
    fn value_body_roundtrips() {
        let msg = Message::from_value(Value::Map(vec![(
            Value::from("k"),
            Value::from("v"),
        )]));
        let bytes = msg.encoded().expect("encode");
        let back = Message::decode(&bytes).expect("decode");
        assert_eq!(back.value, msg.value);
        assert!(back.data.is_empty());
    }
}
