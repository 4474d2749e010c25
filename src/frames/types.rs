//! Wire types shared across performatives: roles, settlement modes, termini,
//! delivery states, and the `error` composite.

use bytes::Bytes;

use crate::encoding::{
    decode::{required, FieldList},
    CodecError, Described, Descriptor, Fields, Symbol, Value,
};

use super::descriptor;

/// Which end of a link a peer plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The endpoint producing transfers.
    Sender,
    /// The endpoint issuing credit and consuming transfers.
    Receiver,
}

impl Role {
    pub(crate) fn to_value(self) -> Value { Value::Bool(self == Self::Receiver) }

    pub(crate) fn from_bool(receiver: bool) -> Self {
        if receiver { Self::Receiver } else { Self::Sender }
    }
}

/// Settlement policy of a sender.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SenderSettleMode {
    /// Every delivery is sent unsettled and awaits a disposition.
    Unsettled,
    /// Every delivery is sent pre-settled.
    Settled,
    /// Settlement is decided per message.
    #[default]
    Mixed,
}

impl SenderSettleMode {
    pub(crate) fn to_value(self) -> Value {
        Value::Ubyte(match self {
            Self::Unsettled => 0,
            Self::Settled => 1,
            Self::Mixed => 2,
        })
    }

    pub(crate) fn from_ubyte(n: u8) -> Result<Self, CodecError> {
        match n {
            0 => Ok(Self::Unsettled),
            1 => Ok(Self::Settled),
            2 => Ok(Self::Mixed),
            _ => Err(CodecError::TypeMismatch {
                field: "snd-settle-mode",
            }),
        }
    }
}

impl std::fmt::Display for SenderSettleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unsettled => "unsettled",
            Self::Settled => "settled",
            Self::Mixed => "mixed",
        })
    }
}

/// Settlement policy of a receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// The receiver settles as soon as a delivery arrives.
    #[default]
    First,
    /// The receiver settles only after the sender settles its disposition.
    Second,
}

impl ReceiverSettleMode {
    pub(crate) fn to_value(self) -> Value {
        Value::Ubyte(match self {
            Self::First => 0,
            Self::Second => 1,
        })
    }

    pub(crate) fn from_ubyte(n: u8) -> Result<Self, CodecError> {
        match n {
            0 => Ok(Self::First),
            1 => Ok(Self::Second),
            _ => Err(CodecError::TypeMismatch {
                field: "rcv-settle-mode",
            }),
        }
    }
}

impl std::fmt::Display for ReceiverSettleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::First => "first",
            Self::Second => "second",
        })
    }
}

/// Terminus durability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// No state is retained.
    #[default]
    None,
    /// Only configuration is retained.
    Configuration,
    /// Configuration and unsettled state are retained.
    UnsettledState,
}

impl Durability {
    fn to_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Configuration => 1,
            Self::UnsettledState => 2,
        }
    }

    fn from_u32(n: u32) -> Result<Self, CodecError> {
        match n {
            0 => Ok(Self::None),
            1 => Ok(Self::Configuration),
            2 => Ok(Self::UnsettledState),
            _ => Err(CodecError::TypeMismatch { field: "durable" }),
        }
    }
}

/// When a terminus expires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Expires when the link detaches.
    LinkDetach,
    /// Expires when the session ends.
    #[default]
    SessionEnd,
    /// Expires when the connection closes.
    ConnectionClose,
    /// Never expires.
    Never,
}

impl ExpiryPolicy {
    fn as_symbol(self) -> Symbol {
        Symbol::from(match self {
            Self::LinkDetach => "link-detach",
            Self::SessionEnd => "session-end",
            Self::ConnectionClose => "connection-close",
            Self::Never => "never",
        })
    }

    fn from_symbol(s: &Symbol) -> Result<Self, CodecError> {
        match s.as_str() {
            "link-detach" => Ok(Self::LinkDetach),
            "session-end" => Ok(Self::SessionEnd),
            "connection-close" => Ok(Self::ConnectionClose),
            "never" => Ok(Self::Never),
            _ => Err(CodecError::TypeMismatch {
                field: "expiry-policy",
            }),
        }
    }
}

pub(crate) fn symbols_value(symbols: &[Symbol]) -> Option<Value> {
    match symbols {
        [] => None,
        [one] => Some(Value::Symbol(one.clone())),
        many => Some(Value::Array(
            many.iter().cloned().map(Value::Symbol).collect(),
        )),
    }
}

pub(crate) fn fields_value(fields: Option<&Fields>) -> Option<Value> {
    let fields = fields?;
    if fields.is_empty() {
        return None;
    }
    Some(Value::Map(
        fields
            .iter()
            .map(|(k, v)| (Value::Symbol(k.clone()), v.clone()))
            .collect(),
    ))
}

/// The source terminus of a link.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Source {
    /// Node address messages originate from.
    pub address: Option<String>,
    /// What the node retains across recovery.
    pub durable: Durability,
    /// When the node expires.
    pub expiry_policy: ExpiryPolicy,
    /// Seconds the node lives after its expiry trigger.
    pub timeout: u32,
    /// Request the peer to create a node and name it.
    pub dynamic: bool,
    /// Named filters constraining which messages flow.
    pub filter: Option<Fields>,
    /// Extension capabilities of the node.
    pub capabilities: Vec<Symbol>,
}

impl Source {
    pub(crate) fn to_value(&self) -> Value {
        let fields = vec![
            self.address.as_deref().map(Value::from),
            (self.durable != Durability::None).then(|| Value::Uint(self.durable.to_u32())),
            (self.expiry_policy != ExpiryPolicy::SessionEnd)
                .then(|| Value::Symbol(self.expiry_policy.as_symbol())),
            (self.timeout != 0).then_some(Value::Uint(self.timeout)),
            self.dynamic.then_some(Value::Bool(true)),
            None, // dynamic-node-properties
            None, // distribution-mode
            fields_value(self.filter.as_ref()),
            None, // default-outcome
            None, // outcomes
            symbols_value(&self.capabilities),
        ];
        composite_value(descriptor::SOURCE, fields)
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::SOURCE)?;
        Ok(Self {
            address: f.string(0, "address")?,
            durable: f
                .uint(1, "durable")?
                .map_or(Ok(Durability::None), Durability::from_u32)?,
            expiry_policy: f
                .symbol(2, "expiry-policy")?
                .map_or(Ok(ExpiryPolicy::SessionEnd), |s| {
                    ExpiryPolicy::from_symbol(&s)
                })?,
            timeout: f.uint(3, "timeout")?.unwrap_or(0),
            dynamic: f.boolean(4, "dynamic")?.unwrap_or(false),
            filter: f.properties(7, "filter")?,
            capabilities: f.symbols(10, "capabilities")?,
        })
    }
}

/// The target terminus of a link.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Target {
    /// Node address messages are sent to.
    pub address: Option<String>,
    /// What the node retains across recovery.
    pub durable: Durability,
    /// When the node expires.
    pub expiry_policy: ExpiryPolicy,
    /// Seconds the node lives after its expiry trigger.
    pub timeout: u32,
    /// Request the peer to create a node and name it.
    pub dynamic: bool,
    /// Extension capabilities of the node.
    pub capabilities: Vec<Symbol>,
}

impl Target {
    pub(crate) fn to_value(&self) -> Value {
        let fields = vec![
            self.address.as_deref().map(Value::from),
            (self.durable != Durability::None).then(|| Value::Uint(self.durable.to_u32())),
            (self.expiry_policy != ExpiryPolicy::SessionEnd)
                .then(|| Value::Symbol(self.expiry_policy.as_symbol())),
            (self.timeout != 0).then_some(Value::Uint(self.timeout)),
            self.dynamic.then_some(Value::Bool(true)),
            None, // dynamic-node-properties
            symbols_value(&self.capabilities),
        ];
        composite_value(descriptor::TARGET, fields)
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::TARGET)?;
        Ok(Self {
            address: f.string(0, "address")?,
            durable: f
                .uint(1, "durable")?
                .map_or(Ok(Durability::None), Durability::from_u32)?,
            expiry_policy: f
                .symbol(2, "expiry-policy")?
                .map_or(Ok(ExpiryPolicy::SessionEnd), |s| {
                    ExpiryPolicy::from_symbol(&s)
                })?,
            timeout: f.uint(3, "timeout")?.unwrap_or(0),
            dynamic: f.boolean(4, "dynamic")?.unwrap_or(false),
            capabilities: f.symbols(6, "capabilities")?,
        })
    }
}

/// The coordinator terminus a transaction controller attaches to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Coordinator {
    /// Transaction capabilities the coordinator offers or desires.
    pub capabilities: Vec<Symbol>,
}

impl Coordinator {
    pub(crate) fn to_value(&self) -> Value {
        composite_value(
            descriptor::COORDINATOR,
            vec![symbols_value(&self.capabilities)],
        )
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::COORDINATOR)?;
        Ok(Self {
            capabilities: f.symbols(0, "capabilities")?,
        })
    }
}

/// The target field of an Attach: a regular node or the txn coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum AttachTarget {
    /// An addressable message node.
    Node(Target),
    /// The transaction coordinator.
    Coordinator(Coordinator),
}

impl AttachTarget {
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Self::Node(t) => t.to_value(),
            Self::Coordinator(c) => c.to_value(),
        }
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, CodecError> {
        match &value {
            Value::Described(d)
                if d.descriptor == Descriptor::Code(descriptor::COORDINATOR) =>
            {
                Coordinator::from_value(value).map(Self::Coordinator)
            }
            _ => Target::from_value(value).map(Self::Node),
        }
    }

    /// The node address, when this is a regular target.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Node(t) => t.address.as_deref(),
            Self::Coordinator(_) => None,
        }
    }
}

/// Error information carried by Close, End, Detach, and Rejected.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{condition}{}", .description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct RemoteError {
    /// Symbolic error condition, e.g. `amqp:not-found`.
    pub condition: Symbol,
    /// Human-readable detail.
    pub description: Option<String>,
    /// Peer-supplied supplementary map.
    pub info: Option<Fields>,
}

impl RemoteError {
    /// Construct an error carrying only a condition.
    pub fn new(condition: impl Into<Symbol>) -> Self {
        Self {
            condition: condition.into(),
            description: None,
            info: None,
        }
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub(crate) fn to_value(&self) -> Value {
        composite_value(
            descriptor::ERROR,
            vec![
                Some(Value::Symbol(self.condition.clone())),
                self.description.as_deref().map(Value::from),
                fields_value(self.info.as_ref()),
            ],
        )
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, CodecError> {
        let mut f = FieldList::from_value(value, descriptor::ERROR)?;
        Ok(Self {
            condition: required(f.symbol(0, "condition")?, "condition")?,
            description: f.string(1, "description")?,
            info: f.properties(2, "info")?,
        })
    }
}

/// Terminal and intermediate delivery states.
#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryState {
    /// Partial receipt checkpoint.
    Received {
        /// Number of the last section received in full.
        section_number: u32,
        /// Byte offset within that section.
        section_offset: u64,
    },
    /// The delivery was accepted.
    Accepted,
    /// The delivery was rejected with an optional error.
    Rejected(Option<RemoteError>),
    /// The delivery was released back to the sender.
    Released,
    /// The delivery was modified and released.
    Modified {
        /// Count this delivery as a failed attempt.
        delivery_failed: bool,
        /// Do not redeliver to this receiver.
        undeliverable_here: bool,
        /// Annotations to merge into the message.
        message_annotations: Option<Fields>,
    },
    /// A transaction was declared; carries its id.
    Declared {
        /// The coordinator-assigned transaction id.
        txn_id: Bytes,
    },
    /// A delivery performed inside a transaction.
    Transactional {
        /// The enrolling transaction.
        txn_id: Bytes,
        /// Provisional outcome within the transaction.
        outcome: Option<Box<DeliveryState>>,
    },
}

impl DeliveryState {
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Self::Received {
                section_number,
                section_offset,
            } => composite_value(
                descriptor::RECEIVED,
                vec![
                    Some(Value::Uint(*section_number)),
                    Some(Value::Ulong(*section_offset)),
                ],
            ),
            Self::Accepted => composite_value(descriptor::ACCEPTED, vec![]),
            Self::Rejected(error) => composite_value(
                descriptor::REJECTED,
                vec![error.as_ref().map(RemoteError::to_value)],
            ),
            Self::Released => composite_value(descriptor::RELEASED, vec![]),
            Self::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => composite_value(
                descriptor::MODIFIED,
                vec![
                    delivery_failed.then_some(Value::Bool(true)),
                    undeliverable_here.then_some(Value::Bool(true)),
                    fields_value(message_annotations.as_ref()),
                ],
            ),
            Self::Declared { txn_id } => composite_value(
                descriptor::DECLARED,
                vec![Some(Value::Binary(txn_id.clone()))],
            ),
            Self::Transactional { txn_id, outcome } => composite_value(
                descriptor::TRANSACTIONAL_STATE,
                vec![
                    Some(Value::Binary(txn_id.clone())),
                    outcome.as_ref().map(|o| o.to_value()),
                ],
            ),
        }
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, CodecError> {
        let Value::Described(ref d) = value else {
            return Err(CodecError::UnsupportedType("delivery state"));
        };
        let Descriptor::Code(code) = d.descriptor else {
            return Err(CodecError::UnsupportedType("delivery state descriptor"));
        };
        match code {
            descriptor::RECEIVED => {
                let f = FieldList::from_value(value, code)?;
                Ok(Self::Received {
                    section_number: required(f.uint(0, "section-number")?, "section-number")?,
                    section_offset: required(f.ulong(1, "section-offset")?, "section-offset")?,
                })
            }
            descriptor::ACCEPTED => Ok(Self::Accepted),
            descriptor::REJECTED => {
                let mut f = FieldList::from_value(value, code)?;
                let error = f.take(0).map(RemoteError::from_value).transpose()?;
                Ok(Self::Rejected(error))
            }
            descriptor::RELEASED => Ok(Self::Released),
            descriptor::MODIFIED => {
                let mut f = FieldList::from_value(value, code)?;
                Ok(Self::Modified {
                    delivery_failed: f.boolean(0, "delivery-failed")?.unwrap_or(false),
                    undeliverable_here: f.boolean(1, "undeliverable-here")?.unwrap_or(false),
                    message_annotations: f.properties(2, "message-annotations")?,
                })
            }
            descriptor::DECLARED => {
                let mut f = FieldList::from_value(value, code)?;
                Ok(Self::Declared {
                    txn_id: required(f.binary(0, "txn-id")?, "txn-id")?,
                })
            }
            descriptor::TRANSACTIONAL_STATE => {
                let mut f = FieldList::from_value(value, code)?;
                Ok(Self::Transactional {
                    txn_id: required(f.binary(0, "txn-id")?, "txn-id")?,
                    outcome: f
                        .take(1)
                        .map(DeliveryState::from_value)
                        .transpose()?
                        .map(Box::new),
                })
            }
            _ => Err(CodecError::UnsupportedType("delivery state")),
        }
    }
}

pub(crate) fn composite_value(code: u64, fields: Vec<Option<Value>>) -> Value {
    let last_set = fields.iter().rposition(Option::is_some);
    let list = match last_set {
        None => Vec::new(),
        Some(last) => fields
            .into_iter()
            .take(last + 1)
            .map(|f| f.unwrap_or(Value::Null))
            .collect(),
    };
    Value::Described(Box::new(Described {
        descriptor: Descriptor::Code(code),
        value: Value::List(list),
    }))
}
