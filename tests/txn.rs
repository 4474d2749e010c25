//! Transaction controller: declare and discharge through the coordinator.

mod common;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use common::*;
use wireflow::frames::{AttachTarget, DeliveryState, FrameBody, RemoteError, Role};
use wireflow::{ConnOptions, Connection, Error, TransactionControllerOptions};

const TXN_ID: &[u8] = b"\x00\x00\x00\x2a";

fn coordinator_responder(
) -> impl FnMut(&wireflow::frames::Frame) -> Vec<wireflow::frames::Frame> + Send + 'static {
    lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => {
            assert!(
                matches!(a.target, Some(AttachTarget::Coordinator(_))),
                "the controller must attach to the coordinator"
            );
            Some(vec![
                attach_echo(frame.channel, a),
                flow_credit(frame.channel, 0, 100),
            ])
        }
        FrameBody::Transfer(transfer) => {
            let delivery_id = transfer.delivery_id.expect("delivery id").value();
            // a Declare body is a described list with code 0x31; a
            // Discharge with code 0x32 and fail=true is rolled back
            let payload = transfer.payload.as_ref();
            let state = if payload.windows(2).any(|w| w == [0x53, 0x31]) {
                DeliveryState::Declared {
                    txn_id: Bytes::from_static(TXN_ID),
                }
            } else if payload.windows(3).any(|w| w == [0x53, 0x32, 0xd0])
                && payload.ends_with(&[0x41])
            {
                DeliveryState::Rejected(Some(
                    RemoteError::new("amqp:transaction:rollback")
                        .with_description("rolled back"),
                ))
            } else {
                DeliveryState::Accepted
            };
            Some(vec![disposition(
                frame.channel,
                Role::Receiver,
                delivery_id,
                None,
                true,
                state,
            )])
        }
        _ => None,
    })
}

#[tokio::test]
async fn declare_returns_the_coordinator_txn_id() {
    let (transport, _peer) = spawn_peer(coordinator_responder());
    let ct = CancellationToken::new();
    let conn = Connection::open(&ct, transport, ConnOptions::default())
        .await
        .expect("connection opens");

    let controller = conn
        .new_transaction_controller(&ct, TransactionControllerOptions::default())
        .await
        .expect("controller attaches");

    let txn_id = controller.declare(&ct).await.expect("declared");
    assert_eq!(txn_id.as_ref(), TXN_ID);

    controller
        .discharge(&ct, txn_id, false)
        .await
        .expect("committed");
    controller.close(&ct).await.expect("controller closes");
}

#[tokio::test]
async fn failed_discharge_surfaces_the_rejection() {
    let (transport, _peer) = spawn_peer(coordinator_responder());
    let ct = CancellationToken::new();
    let conn = Connection::open(&ct, transport, ConnOptions::default())
        .await
        .expect("connection opens");

    let controller = conn
        .new_transaction_controller(&ct, TransactionControllerOptions::default())
        .await
        .expect("controller attaches");

    let txn_id = controller.declare(&ct).await.expect("declared");
    let err = controller
        .discharge(&ct, txn_id, true)
        .await
        .expect_err("rollback discharge is rejected by this peer");
    let Error::Rejected(remote) = err else {
        panic!("expected a rejection, got {err}");
    };
    assert_eq!(remote.condition, "amqp:transaction:rollback");
}
