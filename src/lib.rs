#![doc(html_root_url = "https://docs.rs/wireflow/latest")]
//! Client-side core of an AMQP 1.0 messaging library.
//!
//! `wireflow` implements the binary type codec, the connection, session,
//! and link state machines, the credit-based flow-control engine, and the
//! message-transfer and disposition pipeline. A client opens a
//! [`Connection`] over any transport, multiplexes [`Session`]s over it,
//! attaches [`Sender`] and [`Receiver`] links, and exchanges settled or
//! unsettled deliveries subject to link credit and session windows.
//!
//! Transport establishment (TCP, TLS) is the caller's business: anything
//! `AsyncRead + AsyncWrite` works, which also keeps the protocol machinery
//! testable against in-memory duplex streams.

pub mod buffer;
pub mod connection;
pub mod encoding;
mod error;
pub mod frames;
mod link;
pub mod message;
mod receiver;
mod sasl;
mod sender;
mod session;
mod shutdown;
mod txn;

pub use connection::{ConnOptions, Connection};
pub use error::{condition, Error, Result};
pub use message::{Message, ModifyOptions};
pub use receiver::{CreditMode, Receiver, ReceiverOptions};
pub use sasl::SaslConfig;
pub use sender::{Sender, SenderOptions};
pub use session::{Session, SessionOptions};
pub use txn::{TransactionController, TransactionControllerOptions};
