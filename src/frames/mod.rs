//! Framed performatives: the typed bodies of AMQP and SASL frames.
//!
//! Each performative is a described list with positional fields; trailing
//! fields equal to their defaults are omitted on encode, and short lists on
//! decode fill the defaults back in. Mandatory fields that arrive null are a
//! decoding error naming the field.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::encoding::{
    decode::{read_value, required, FieldList},
    encode::encode_composite,
    CodecError, Fields, SerialNumber, Symbol, Value,
};
use crate::buffer::ReadCursor;

mod codec;
mod types;

pub use codec::{FrameDecoder, FrameEncoder, MIN_MAX_FRAME_SIZE};
pub use types::{
    AttachTarget, Coordinator, DeliveryState, Durability, ExpiryPolicy, ReceiverSettleMode,
    RemoteError, Role, SenderSettleMode, Source, Target,
};

use types::{composite_value, fields_value, symbols_value};

/// Performative and composite descriptor codes.
#[allow(missing_docs)]
pub mod descriptor {
    pub const OPEN: u64 = 0x10;
    pub const BEGIN: u64 = 0x11;
    pub const ATTACH: u64 = 0x12;
    pub const FLOW: u64 = 0x13;
    pub const TRANSFER: u64 = 0x14;
    pub const DISPOSITION: u64 = 0x15;
    pub const DETACH: u64 = 0x16;
    pub const END: u64 = 0x17;
    pub const CLOSE: u64 = 0x18;

    pub const ERROR: u64 = 0x1d;

    pub const RECEIVED: u64 = 0x23;
    pub const ACCEPTED: u64 = 0x24;
    pub const REJECTED: u64 = 0x25;
    pub const RELEASED: u64 = 0x26;
    pub const MODIFIED: u64 = 0x27;

    pub const SOURCE: u64 = 0x28;
    pub const TARGET: u64 = 0x29;

    pub const COORDINATOR: u64 = 0x30;
    pub const DECLARE: u64 = 0x31;
    pub const DISCHARGE: u64 = 0x32;
    pub const DECLARED: u64 = 0x33;
    pub const TRANSACTIONAL_STATE: u64 = 0x34;

    pub const SASL_MECHANISMS: u64 = 0x40;
    pub const SASL_INIT: u64 = 0x41;
    pub const SASL_CHALLENGE: u64 = 0x42;
    pub const SASL_RESPONSE: u64 = 0x43;
    pub const SASL_OUTCOME: u64 = 0x44;
}

/// Wire default for `max-frame-size` and `handle-max`.
pub const UINT_MAX_DEFAULT: u32 = u32::MAX;
/// Wire default for `channel-max`.
pub const CHANNEL_MAX_DEFAULT: u16 = u16::MAX;

/// One decoded AMQP or SASL frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// The session channel the frame belongs to (0 for connection scope).
    pub channel: u16,
    /// The performative, or [`FrameBody::Empty`] for a keepalive.
    pub body: FrameBody,
}

impl Frame {
    /// A connection-scoped frame on channel 0.
    #[must_use]
    pub fn connection(body: FrameBody) -> Self { Self { channel: 0, body } }

    /// An empty keepalive frame.
    #[must_use]
    pub fn keepalive() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }
}

/// The body of a frame.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum FrameBody {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
    SaslMechanisms(SaslMechanisms),
    SaslInit(SaslInit),
    SaslChallenge(SaslChallenge),
    SaslResponse(SaslResponse),
    SaslOutcome(SaslOutcome),
    /// A keepalive: a frame with no body at all.
    Empty,
}

impl FrameBody {
    /// `true` when the body belongs to the SASL frame type.
    #[must_use]
    pub fn is_sasl(&self) -> bool {
        matches!(
            self,
            Self::SaslMechanisms(_)
                | Self::SaslInit(_)
                | Self::SaslChallenge(_)
                | Self::SaslResponse(_)
                | Self::SaslOutcome(_)
        )
    }

    /// Short name used in trace logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "Open",
            Self::Begin(_) => "Begin",
            Self::Attach(_) => "Attach",
            Self::Flow(_) => "Flow",
            Self::Transfer(_) => "Transfer",
            Self::Disposition(_) => "Disposition",
            Self::Detach(_) => "Detach",
            Self::End(_) => "End",
            Self::Close(_) => "Close",
            Self::SaslMechanisms(_) => "SaslMechanisms",
            Self::SaslInit(_) => "SaslInit",
            Self::SaslChallenge(_) => "SaslChallenge",
            Self::SaslResponse(_) => "SaslResponse",
            Self::SaslOutcome(_) => "SaslOutcome",
            Self::Empty => "Empty",
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Self::Open(p) => p.encode(buf),
            Self::Begin(p) => p.encode(buf),
            Self::Attach(p) => p.encode(buf),
            Self::Flow(p) => p.encode(buf),
            Self::Transfer(p) => p.encode(buf),
            Self::Disposition(p) => p.encode(buf),
            Self::Detach(p) => p.encode(buf),
            Self::End(p) => p.encode(buf),
            Self::Close(p) => p.encode(buf),
            Self::SaslMechanisms(p) => p.encode(buf),
            Self::SaslInit(p) => p.encode(buf),
            Self::SaslChallenge(p) => p.encode(buf),
            Self::SaslResponse(p) => p.encode(buf),
            Self::SaslOutcome(p) => p.encode(buf),
            Self::Empty => Ok(()),
        }
    }

    /// Decode a frame body (performative plus, for Transfer, its payload).
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Ok(Self::Empty);
        }
        let mut cur = ReadCursor::new(bytes);
        let value = read_value(&mut cur)?;
        let code = match &value {
            Value::Described(d) => match d.descriptor {
                crate::encoding::Descriptor::Code(code) => code,
                crate::encoding::Descriptor::Name(_) => {
                    return Err(CodecError::UnsupportedType("symbolic performative descriptor"));
                }
            },
            _ => return Err(CodecError::UnsupportedType("frame body")),
        };
        match code {
            descriptor::OPEN => Open::decode(value).map(Self::Open),
            descriptor::BEGIN => Begin::decode(value).map(Self::Begin),
            descriptor::ATTACH => Attach::decode(value).map(Self::Attach),
            descriptor::FLOW => Flow::decode(value).map(Self::Flow),
            descriptor::TRANSFER => {
                let payload = Bytes::copy_from_slice(cur.read_rest());
                Transfer::decode(value, payload).map(Self::Transfer)
            }
            descriptor::DISPOSITION => Disposition::decode(value).map(Self::Disposition),
            descriptor::DETACH => Detach::decode(value).map(Self::Detach),
            descriptor::END => End::decode(value).map(Self::End),
            descriptor::CLOSE => Close::decode(value).map(Self::Close),
            descriptor::SASL_MECHANISMS => SaslMechanisms::decode(value).map(Self::SaslMechanisms),
            descriptor::SASL_INIT => SaslInit::decode(value).map(Self::SaslInit),
            descriptor::SASL_CHALLENGE => SaslChallenge::decode(value).map(Self::SaslChallenge),
            descriptor::SASL_RESPONSE => SaslResponse::decode(value).map(Self::SaslResponse),
            descriptor::SASL_OUTCOME => SaslOutcome::decode(value).map(Self::SaslOutcome),
            _ => Err(CodecError::UnsupportedType("unknown performative")),
        }
    }
}

/// Connection negotiation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Open {
    /// Unique identifier of the sending container. Mandatory.
    pub container_id: String,
    /// Host name of the node being addressed.
    pub hostname: Option<String>,
    /// Largest frame the sender accepts; defaults to `u32::MAX`.
    pub max_frame_size: Option<u32>,
    /// Highest usable channel number; defaults to `u16::MAX`.
    pub channel_max: Option<u16>,
    /// Idle window after which the sender may consider the peer gone.
    pub idle_timeout: Option<Duration>,
    /// Locales the sender can send.
    pub outgoing_locales: Vec<Symbol>,
    /// Locales the sender can receive.
    pub incoming_locales: Vec<Symbol>,
    /// Extension capabilities the sender supports.
    pub offered_capabilities: Vec<Symbol>,
    /// Extension capabilities the sender wants.
    pub desired_capabilities: Vec<Symbol>,
    /// Connection properties.
    pub properties: Option<Fields>,
}

impl Open {
    /// Effective max-frame-size with the wire default applied.
    #[must_use]
    pub fn effective_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(UINT_MAX_DEFAULT)
    }

    /// Effective channel-max with the wire default applied.
    #[must_use]
    pub fn effective_channel_max(&self) -> u16 {
        self.channel_max.unwrap_or(CHANNEL_MAX_DEFAULT)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::OPEN,
            &[
                Some(Value::String(self.container_id.clone())),
                self.hostname.as_deref().map(Value::from),
                self.max_frame_size
                    .filter(|m| *m != UINT_MAX_DEFAULT)
                    .map(Value::Uint),
                self.channel_max
                    .filter(|m| *m != CHANNEL_MAX_DEFAULT)
                    .map(Value::Ushort),
                self.idle_timeout
                    .filter(|t| !t.is_zero())
                    .map(|t| Value::Uint(t.as_millis().min(u128::from(u32::MAX)) as u32)),
                symbols_value(&self.outgoing_locales),
                symbols_value(&self.incoming_locales),
                symbols_value(&self.offered_capabilities),
                symbols_value(&self.desired_capabilities),
                fields_value(self.properties.as_ref()),
            ],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::OPEN)?;
        Ok(Self {
            container_id: required(f.string(0, "container-id")?, "container-id")?,
            hostname: f.string(1, "hostname")?,
            max_frame_size: f.uint(2, "max-frame-size")?,
            channel_max: f.ushort(3, "channel-max")?,
            idle_timeout: f
                .uint(4, "idle-time-out")?
                .map(|ms| Duration::from_millis(u64::from(ms))),
            outgoing_locales: f.symbols(5, "outgoing-locales")?,
            incoming_locales: f.symbols(6, "incoming-locales")?,
            offered_capabilities: f.symbols(7, "offered-capabilities")?,
            desired_capabilities: f.symbols(8, "desired-capabilities")?,
            properties: f.properties(9, "properties")?,
        })
    }
}

/// Session negotiation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Begin {
    /// Set when answering a remotely initiated Begin: the initiating channel.
    pub remote_channel: Option<u16>,
    /// Transfer-id of the first outgoing transfer. Mandatory.
    pub next_outgoing_id: SerialNumber,
    /// Initial incoming window. Mandatory.
    pub incoming_window: u32,
    /// Initial outgoing window. Mandatory.
    pub outgoing_window: u32,
    /// Highest usable link handle; defaults to `u32::MAX`.
    pub handle_max: Option<u32>,
    /// Extension capabilities the sender supports.
    pub offered_capabilities: Vec<Symbol>,
    /// Extension capabilities the sender wants.
    pub desired_capabilities: Vec<Symbol>,
    /// Session properties.
    pub properties: Option<Fields>,
}

impl Begin {
    /// Effective handle-max with the wire default applied.
    #[must_use]
    pub fn effective_handle_max(&self) -> u32 { self.handle_max.unwrap_or(UINT_MAX_DEFAULT) }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::BEGIN,
            &[
                self.remote_channel.map(Value::Ushort),
                Some(Value::Uint(self.next_outgoing_id.value())),
                Some(Value::Uint(self.incoming_window)),
                Some(Value::Uint(self.outgoing_window)),
                self.handle_max
                    .filter(|m| *m != UINT_MAX_DEFAULT)
                    .map(Value::Uint),
                symbols_value(&self.offered_capabilities),
                symbols_value(&self.desired_capabilities),
                fields_value(self.properties.as_ref()),
            ],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::BEGIN)?;
        Ok(Self {
            remote_channel: f.ushort(0, "remote-channel")?,
            next_outgoing_id: SerialNumber(required(
                f.uint(1, "next-outgoing-id")?,
                "next-outgoing-id",
            )?),
            incoming_window: required(f.uint(2, "incoming-window")?, "incoming-window")?,
            outgoing_window: required(f.uint(3, "outgoing-window")?, "outgoing-window")?,
            handle_max: f.uint(4, "handle-max")?,
            offered_capabilities: f.symbols(5, "offered-capabilities")?,
            desired_capabilities: f.symbols(6, "desired-capabilities")?,
            properties: f.properties(7, "properties")?,
        })
    }
}

/// Link establishment.
#[derive(Clone, Debug, PartialEq)]
pub struct Attach {
    /// Link name; with the role it identifies the link connection-wide.
    pub name: String,
    /// Handle chosen by the sending endpoint. Mandatory.
    pub handle: u32,
    /// Role of the sending endpoint. Mandatory.
    pub role: Role,
    /// Sender settlement policy; defaults to mixed.
    pub snd_settle_mode: Option<SenderSettleMode>,
    /// Receiver settlement policy; defaults to first.
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    /// Source terminus.
    pub source: Option<Source>,
    /// Target terminus (a node, or the transaction coordinator).
    pub target: Option<AttachTarget>,
    /// Unsettled delivery state carried across reattach, keyed by tag.
    pub unsettled: Option<Vec<(Bytes, Option<DeliveryState>)>>,
    /// `true` when the unsettled map was truncated to fit the frame.
    pub incomplete_unsettled: bool,
    /// Sender's starting delivery-count; mandatory for senders.
    pub initial_delivery_count: Option<SerialNumber>,
    /// Largest message the endpoint accepts; 0 or absent means unlimited.
    pub max_message_size: Option<u64>,
    /// Extension capabilities the sender supports.
    pub offered_capabilities: Vec<Symbol>,
    /// Extension capabilities the sender wants.
    pub desired_capabilities: Vec<Symbol>,
    /// Link properties.
    pub properties: Option<Fields>,
}

impl Attach {
    /// Max-message-size with "0 means unlimited" folded into `None`.
    #[must_use]
    pub fn effective_max_message_size(&self) -> Option<u64> {
        self.max_message_size.filter(|m| *m != 0)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let unsettled = self.unsettled.as_ref().filter(|u| !u.is_empty()).map(|u| {
            Value::Map(
                u.iter()
                    .map(|(tag, state)| {
                        (
                            Value::Binary(tag.clone()),
                            state
                                .as_ref()
                                .map_or(Value::Null, DeliveryState::to_value),
                        )
                    })
                    .collect(),
            )
        });
        encode_composite(
            buf,
            descriptor::ATTACH,
            &[
                Some(Value::String(self.name.clone())),
                Some(Value::Uint(self.handle)),
                Some(self.role.to_value()),
                self.snd_settle_mode.map(SenderSettleMode::to_value),
                self.rcv_settle_mode.map(ReceiverSettleMode::to_value),
                self.source.as_ref().map(Source::to_value),
                self.target.as_ref().map(AttachTarget::to_value),
                unsettled,
                self.incomplete_unsettled.then_some(Value::Bool(true)),
                self.initial_delivery_count.map(|c| Value::Uint(c.value())),
                self.max_message_size
                    .filter(|m| *m != 0)
                    .map(Value::Ulong),
                symbols_value(&self.offered_capabilities),
                symbols_value(&self.desired_capabilities),
                fields_value(self.properties.as_ref()),
            ],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::ATTACH)?;
        let unsettled = match f.take(7) {
            None => None,
            Some(Value::Map(pairs)) => Some(
                pairs
                    .into_iter()
                    .map(|(k, v)| {
                        let Value::Binary(tag) = k else {
                            return Err(CodecError::TypeMismatch { field: "unsettled" });
                        };
                        let state = if v.is_null() {
                            None
                        } else {
                            Some(DeliveryState::from_value(v)?)
                        };
                        Ok((tag, state))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(_) => return Err(CodecError::TypeMismatch { field: "unsettled" }),
        };
        Ok(Self {
            name: required(f.string(0, "name")?, "name")?,
            handle: required(f.uint(1, "handle")?, "handle")?,
            role: Role::from_bool(required(f.boolean(2, "role")?, "role")?),
            snd_settle_mode: f
                .ubyte(3, "snd-settle-mode")?
                .map(SenderSettleMode::from_ubyte)
                .transpose()?,
            rcv_settle_mode: f
                .ubyte(4, "rcv-settle-mode")?
                .map(ReceiverSettleMode::from_ubyte)
                .transpose()?,
            source: f.take(5).map(Source::from_value).transpose()?,
            target: f.take(6).map(AttachTarget::from_value).transpose()?,
            unsettled,
            incomplete_unsettled: f.boolean(8, "incomplete-unsettled")?.unwrap_or(false),
            initial_delivery_count: f.uint(9, "initial-delivery-count")?.map(SerialNumber),
            max_message_size: f.ulong(10, "max-message-size")?,
            offered_capabilities: f.symbols(11, "offered-capabilities")?,
            desired_capabilities: f.symbols(12, "desired-capabilities")?,
            properties: f.properties(13, "properties")?,
        })
    }
}

/// Session and link flow-control state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Flow {
    /// Expected transfer-id of the next incoming transfer.
    pub next_incoming_id: Option<SerialNumber>,
    /// Transfers the endpoint can currently receive. Mandatory.
    pub incoming_window: u32,
    /// Transfer-id the next outgoing transfer will carry. Mandatory.
    pub next_outgoing_id: SerialNumber,
    /// Transfers the endpoint could currently send. Mandatory.
    pub outgoing_window: u32,
    /// When set, the flow also carries link state for this handle.
    pub handle: Option<u32>,
    /// Sender's delivery-count (echoed by receivers).
    pub delivery_count: Option<SerialNumber>,
    /// Messages the receiver is prepared to accept.
    pub link_credit: Option<u32>,
    /// Messages the sender has ready and waiting for credit.
    pub available: Option<u32>,
    /// Request that the sender consume all credit immediately.
    pub drain: bool,
    /// Request an immediate reply carrying peer state.
    pub echo: bool,
    /// Extension properties.
    pub properties: Option<Fields>,
}

impl Flow {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::FLOW,
            &[
                self.next_incoming_id.map(|n| Value::Uint(n.value())),
                Some(Value::Uint(self.incoming_window)),
                Some(Value::Uint(self.next_outgoing_id.value())),
                Some(Value::Uint(self.outgoing_window)),
                self.handle.map(Value::Uint),
                self.delivery_count.map(|n| Value::Uint(n.value())),
                self.link_credit.map(Value::Uint),
                self.available.map(Value::Uint),
                self.drain.then_some(Value::Bool(true)),
                self.echo.then_some(Value::Bool(true)),
                fields_value(self.properties.as_ref()),
            ],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::FLOW)?;
        Ok(Self {
            next_incoming_id: f.uint(0, "next-incoming-id")?.map(SerialNumber),
            incoming_window: required(f.uint(1, "incoming-window")?, "incoming-window")?,
            next_outgoing_id: SerialNumber(required(
                f.uint(2, "next-outgoing-id")?,
                "next-outgoing-id",
            )?),
            outgoing_window: required(f.uint(3, "outgoing-window")?, "outgoing-window")?,
            handle: f.uint(4, "handle")?,
            delivery_count: f.uint(5, "delivery-count")?.map(SerialNumber),
            link_credit: f.uint(6, "link-credit")?,
            available: f.uint(7, "available")?,
            drain: f.boolean(8, "drain")?.unwrap_or(false),
            echo: f.boolean(9, "echo")?.unwrap_or(false),
            properties: f.properties(10, "properties")?,
        })
    }
}

/// One chunk of a delivery.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transfer {
    /// Link the delivery travels on. Mandatory.
    pub handle: u32,
    /// Delivery-id; carried on the first transfer of a delivery only.
    pub delivery_id: Option<SerialNumber>,
    /// Delivery-tag; carried on the first transfer of a delivery only.
    pub delivery_tag: Option<Bytes>,
    /// Message format; carried on the first transfer of a delivery only.
    pub message_format: Option<u32>,
    /// Settlement flag; unset means false on the first transfer.
    pub settled: Option<bool>,
    /// `true` when more transfers of this delivery follow.
    pub more: bool,
    /// Per-delivery receiver settlement override.
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    /// Sender's view of the delivery state.
    pub state: Option<DeliveryState>,
    /// Reassociates an unsettled delivery after resume.
    pub resume: bool,
    /// Abandons the delivery; partial payload must be discarded.
    pub aborted: bool,
    /// Hint that dispositions may be batched.
    pub batchable: bool,
    /// The payload bytes carried after the performative.
    pub payload: Bytes,
}

impl Transfer {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::TRANSFER,
            &[
                Some(Value::Uint(self.handle)),
                self.delivery_id.map(|n| Value::Uint(n.value())),
                self.delivery_tag.as_ref().map(|t| Value::Binary(t.clone())),
                self.message_format.map(Value::Uint),
                self.settled.filter(|s| *s).map(Value::Bool),
                self.more.then_some(Value::Bool(true)),
                self.rcv_settle_mode.map(ReceiverSettleMode::to_value),
                self.state.as_ref().map(DeliveryState::to_value),
                self.resume.then_some(Value::Bool(true)),
                self.aborted.then_some(Value::Bool(true)),
                self.batchable.then_some(Value::Bool(true)),
            ],
        )?;
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    fn decode(value: Value, payload: Bytes) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::TRANSFER)?;
        Ok(Self {
            handle: required(f.uint(0, "handle")?, "handle")?,
            delivery_id: f.uint(1, "delivery-id")?.map(SerialNumber),
            delivery_tag: f.binary(2, "delivery-tag")?,
            message_format: f.uint(3, "message-format")?,
            settled: f.boolean(4, "settled")?,
            more: f.boolean(5, "more")?.unwrap_or(false),
            rcv_settle_mode: f
                .ubyte(6, "rcv-settle-mode")?
                .map(ReceiverSettleMode::from_ubyte)
                .transpose()?,
            state: f.take(7).map(DeliveryState::from_value).transpose()?,
            resume: f.boolean(8, "resume")?.unwrap_or(false),
            aborted: f.boolean(9, "aborted")?.unwrap_or(false),
            batchable: f.boolean(10, "batchable")?.unwrap_or(false),
            payload,
        })
    }
}

/// Settlement state for a contiguous range of delivery-ids.
#[derive(Clone, Debug, PartialEq)]
pub struct Disposition {
    /// Which endpoint's deliveries the state applies to. Mandatory.
    pub role: Role,
    /// Lower bound of the delivery-id range. Mandatory.
    pub first: SerialNumber,
    /// Upper bound of the range; absent means equal to `first`.
    pub last: Option<SerialNumber>,
    /// `true` when the issuing endpoint considers the range settled.
    pub settled: bool,
    /// State communicated for the range.
    pub state: Option<DeliveryState>,
    /// Hint that dispositions may be batched.
    pub batchable: bool,
}

impl Disposition {
    /// The inclusive upper bound of the range.
    #[must_use]
    pub fn last_or_first(&self) -> SerialNumber { self.last.unwrap_or(self.first) }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::DISPOSITION,
            &[
                Some(self.role.to_value()),
                Some(Value::Uint(self.first.value())),
                self.last.map(|n| Value::Uint(n.value())),
                self.settled.then_some(Value::Bool(true)),
                self.state.as_ref().map(DeliveryState::to_value),
                self.batchable.then_some(Value::Bool(true)),
            ],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::DISPOSITION)?;
        Ok(Self {
            role: Role::from_bool(required(f.boolean(0, "role")?, "role")?),
            first: SerialNumber(required(f.uint(1, "first")?, "first")?),
            last: f.uint(2, "last")?.map(SerialNumber),
            settled: f.boolean(3, "settled")?.unwrap_or(false),
            state: f.take(4).map(DeliveryState::from_value).transpose()?,
            batchable: f.boolean(5, "batchable")?.unwrap_or(false),
        })
    }
}

/// Link teardown.
#[derive(Clone, Debug, PartialEq)]
pub struct Detach {
    /// Handle of the link being detached. Mandatory.
    pub handle: u32,
    /// `true` closes the link; `false` merely suspends it.
    pub closed: bool,
    /// Error that caused the detach.
    pub error: Option<RemoteError>,
}

impl Detach {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::DETACH,
            &[
                Some(Value::Uint(self.handle)),
                self.closed.then_some(Value::Bool(true)),
                self.error.as_ref().map(RemoteError::to_value),
            ],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::DETACH)?;
        Ok(Self {
            handle: required(f.uint(0, "handle")?, "handle")?,
            closed: f.boolean(1, "closed")?.unwrap_or(false),
            error: f.take(2).map(RemoteError::from_value).transpose()?,
        })
    }
}

/// Session teardown.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct End {
    /// Error that caused the end.
    pub error: Option<RemoteError>,
}

impl End {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::END,
            &[self.error.as_ref().map(RemoteError::to_value)],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::END)?;
        Ok(Self {
            error: f.take(0).map(RemoteError::from_value).transpose()?,
        })
    }
}

/// Connection teardown.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Close {
    /// Error that caused the close.
    pub error: Option<RemoteError>,
}

impl Close {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::CLOSE,
            &[self.error.as_ref().map(RemoteError::to_value)],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::CLOSE)?;
        Ok(Self {
            error: f.take(0).map(RemoteError::from_value).transpose()?,
        })
    }
}

/// Server's advertisement of supported SASL mechanisms.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SaslMechanisms {
    /// Mechanisms the server supports. Mandatory.
    pub mechanisms: Vec<Symbol>,
}

impl SaslMechanisms {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::SASL_MECHANISMS,
            &[symbols_value(&self.mechanisms)],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::SASL_MECHANISMS)?;
        let mechanisms = f.symbols(0, "sasl-server-mechanisms")?;
        if mechanisms.is_empty() {
            return Err(CodecError::MissingField("sasl-server-mechanisms"));
        }
        Ok(Self { mechanisms })
    }
}

/// Client's mechanism selection and initial response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SaslInit {
    /// Chosen mechanism. Mandatory.
    pub mechanism: Symbol,
    /// Mechanism-specific initial response.
    pub initial_response: Option<Bytes>,
    /// Host name the client is addressing.
    pub hostname: Option<String>,
}

impl SaslInit {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::SASL_INIT,
            &[
                Some(Value::Symbol(self.mechanism.clone())),
                self.initial_response
                    .as_ref()
                    .map(|b| Value::Binary(b.clone())),
                self.hostname.as_deref().map(Value::from),
            ],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::SASL_INIT)?;
        Ok(Self {
            mechanism: required(f.symbol(0, "mechanism")?, "mechanism")?,
            initial_response: f.binary(1, "initial-response")?,
            hostname: f.string(2, "hostname")?,
        })
    }
}

/// Server challenge in a multi-step mechanism.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SaslChallenge {
    /// Challenge data. Mandatory.
    pub challenge: Bytes,
}

impl SaslChallenge {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::SASL_CHALLENGE,
            &[Some(Value::Binary(self.challenge.clone()))],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::SASL_CHALLENGE)?;
        Ok(Self {
            challenge: required(f.binary(0, "challenge")?, "challenge")?,
        })
    }
}

/// Client reply to a challenge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SaslResponse {
    /// Response data. Mandatory.
    pub response: Bytes,
}

impl SaslResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::SASL_RESPONSE,
            &[Some(Value::Binary(self.response.clone()))],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::SASL_RESPONSE)?;
        Ok(Self {
            response: required(f.binary(0, "response")?, "response")?,
        })
    }
}

/// Result of the SASL exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaslCode {
    /// Authentication succeeded.
    Ok,
    /// Authentication failed due to bad credentials.
    Auth,
    /// Authentication failed due to a system error.
    Sys,
    /// Authentication failed due to an unrecoverable server error.
    SysPerm,
    /// Authentication failed due to a transient server error.
    SysTemp,
}

impl SaslCode {
    fn from_ubyte(n: u8) -> Result<Self, CodecError> {
        match n {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Auth),
            2 => Ok(Self::Sys),
            3 => Ok(Self::SysPerm),
            4 => Ok(Self::SysTemp),
            _ => Err(CodecError::TypeMismatch { field: "code" }),
        }
    }

    fn to_ubyte(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Auth => 1,
            Self::Sys => 2,
            Self::SysPerm => 3,
            Self::SysTemp => 4,
        }
    }
}

impl std::fmt::Display for SaslCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Auth => "auth",
            Self::Sys => "sys",
            Self::SysPerm => "sys-perm",
            Self::SysTemp => "sys-temp",
        })
    }
}

/// Final SASL outcome from the server.
#[derive(Clone, Debug, PartialEq)]
pub struct SaslOutcome {
    /// Outcome code. Mandatory.
    pub code: SaslCode,
    /// Mechanism-specific additional data.
    pub additional_data: Option<Bytes>,
}

impl SaslOutcome {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_composite(
            buf,
            descriptor::SASL_OUTCOME,
            &[
                Some(Value::Ubyte(self.code.to_ubyte())),
                self.additional_data
                    .as_ref()
                    .map(|b| Value::Binary(b.clone())),
            ],
        )
    }

    fn decode(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::SASL_OUTCOME)?;
        Ok(Self {
            code: SaslCode::from_ubyte(required(f.ubyte(0, "code")?, "code")?)?,
            additional_data: f.binary(1, "additional-data")?,
        })
    }
}

/// Body of a Declare message sent to the transaction coordinator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Declare {
    /// Global transaction id, for distributed transactions.
    pub global_id: Option<Bytes>,
}

impl Declare {
    /// The described-list value placed in the message body.
    #[must_use]
    pub fn to_value(&self) -> Value {
        composite_value(
            descriptor::DECLARE,
            vec![self.global_id.as_ref().map(|b| Value::Binary(b.clone()))],
        )
    }
}

/// Body of a Discharge message sent to the transaction coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct Discharge {
    /// The transaction being discharged.
    pub txn_id: Bytes,
    /// `true` rolls the transaction back, `false` commits it.
    pub fail: bool,
}

impl Discharge {
    /// The described-list value placed in the message body.
    #[must_use]
    pub fn to_value(&self) -> Value {
        composite_value(
            descriptor::DISCHARGE,
            vec![
                Some(Value::Binary(self.txn_id.clone())),
                self.fail.then_some(Value::Bool(true)),
            ],
        )
    }
}

#[cfg(test)]
mod tests;
