//! Transaction controller: Declare and Discharge over a coordinator link.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::encoding::Symbol;
use crate::error::{Error, Result};
use crate::frames::{DeliveryState, Declare, Discharge};
use crate::message::Message;
use crate::sender::{Sender, SenderOptions};
use crate::session::{Session, SessionOptions};

/// Options accepted by [`Connection::new_transaction_controller`].
#[derive(Clone, Debug, Default)]
pub struct TransactionControllerOptions {
    /// Extension capabilities requested of the coordinator.
    pub capabilities: Vec<Symbol>,
}

/// A control link to a transaction coordinator.
///
/// The controller owns a dedicated session carrying a single sending link
/// attached to the coordinator target; no other traffic flows on it.
pub struct TransactionController {
    session: Session,
    sender: Sender,
}

impl Connection {
    /// Attach a transaction controller on a dedicated session.
    pub async fn new_transaction_controller(
        &self,
        ct: &CancellationToken,
        options: TransactionControllerOptions,
    ) -> Result<TransactionController> {
        let session = self.begin_session(ct, SessionOptions::default()).await?;
        let sender = session
            .new_coordinator_sender(ct, options.capabilities)
            .await?;
        Ok(TransactionController { session, sender })
    }
}

impl TransactionController {
    /// Declare a transaction, returning its coordinator-assigned id.
    pub async fn declare(&self, ct: &CancellationToken) -> Result<Bytes> {
        let message = Message::from_value(Declare::default().to_value());
        match self.sender.send_raw(ct, &message).await? {
            Some(DeliveryState::Declared { txn_id }) => Ok(txn_id),
            Some(DeliveryState::Rejected(error)) => Err(Error::Rejected(error.unwrap_or_else(
                || crate::frames::RemoteError::new("amqp:transaction:unknown-id"),
            ))),
            _ => Err(Error::TransactionOutcome),
        }
    }

    /// Discharge a transaction: commit it, or roll it back when `fail`.
    pub async fn discharge(
        &self,
        ct: &CancellationToken,
        txn_id: Bytes,
        fail: bool,
    ) -> Result<()> {
        let message = Message::from_value(Discharge { txn_id, fail }.to_value());
        match self.sender.send_raw(ct, &message).await? {
            None | Some(DeliveryState::Accepted) => Ok(()),
            Some(DeliveryState::Rejected(error)) => Err(Error::Rejected(error.unwrap_or_else(
                || crate::frames::RemoteError::new("amqp:transaction:unknown-id"),
            ))),
            _ => Err(Error::TransactionOutcome),
        }
    }

    /// Close the coordinator link and its session.
    pub async fn close(&self, ct: &CancellationToken) -> Result<()> {
        self.sender.close(ct).await?;
        self.session.end(ct).await
    }
}

impl Session {
    /// Attach a sender whose target is the transaction coordinator.
    pub(crate) async fn new_coordinator_sender(
        &self,
        ct: &CancellationToken,
        capabilities: Vec<Symbol>,
    ) -> Result<Sender> {
        self.new_sender_with_target(
            ct,
            crate::frames::AttachTarget::Coordinator(crate::frames::Coordinator { capabilities }),
            SenderOptions {
                // declarations must settle through dispositions
                settlement_mode: Some(crate::frames::SenderSettleMode::Unsettled),
                ignore_disposition_errors: true,
                ..SenderOptions::default()
            },
        )
        .await
    }
}
