//! Receiver and flow-engine scenarios against a scripted peer.

mod common;

use tokio_util::sync::CancellationToken;

use common::*;
use wireflow::encoding::SerialNumber;
use wireflow::frames::{DeliveryState, Frame, FrameBody, ReceiverSettleMode, Role};
use wireflow::{
    ConnOptions, Connection, CreditMode, Error, Message, ReceiverOptions, SessionOptions,
};

async fn connect(transport: tokio::io::DuplexStream) -> Connection {
    let ct = CancellationToken::new();
    Connection::open(&ct, transport, ConnOptions::default())
        .await
        .expect("connection opens")
}

#[tokio::test]
async fn receive_mode_first_settles_on_receipt() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        // the first flow grants credit; answer it with one message
        FrameBody::Flow(flow) if flow.link_credit == Some(1) && flow.handle.is_some() => {
            Some(vec![transfer_message(frame.channel, 0, 1, b"hello")])
        }
        FrameBody::Flow(_) => Some(Vec::new()),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let receiver = session
        .new_receiver(&ct, "queue-a", ReceiverOptions::default())
        .await
        .expect("receiver attaches");

    // the opening flow extends the default single credit
    let opening = peer
        .next_matching(|f| match &f.body {
            FrameBody::Flow(flow) if flow.handle.is_some() => Some(flow.clone()),
            _ => None,
        })
        .await;
    assert_eq!(opening.link_credit, Some(1));

    let message = receiver.receive(&ct).await.expect("message arrives");
    assert_eq!(message.body().map(AsRef::as_ref), Some(&b"hello"[..]));
    assert_eq!(receiver.unsettled_count(), 0);

    // mode first settles the delivery the moment it is handed over
    let disposition = peer
        .next_matching(|f| match &f.body {
            FrameBody::Disposition(d) => Some(d.clone()),
            _ => None,
        })
        .await;
    assert_eq!(disposition.role, Role::Receiver);
    assert_eq!(disposition.first.value(), 1);
    assert!(disposition.settled);
    assert_eq!(disposition.state, Some(DeliveryState::Accepted));

    // and the window refills to the configured maximum
    let refill = peer
        .next_matching(|f| match &f.body {
            FrameBody::Flow(flow) if flow.handle.is_some() => Some(flow.clone()),
            _ => None,
        })
        .await;
    assert_eq!(refill.link_credit, Some(1));

    // a later explicit accept is a no-op
    receiver.accept(&ct, &message).await.expect("idempotent accept");
}

#[tokio::test]
async fn receive_mode_second_holds_credit_until_accept() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Flow(flow) if flow.link_credit == Some(1) && flow.handle.is_some() => {
            Some(vec![transfer_message(frame.channel, 0, 1, b"hello")])
        }
        FrameBody::Flow(_) => Some(Vec::new()),
        // the settled sender ack completes the mode-second exchange
        FrameBody::Disposition(d) if d.role == Role::Receiver && !d.settled => {
            Some(vec![disposition(
                frame.channel,
                Role::Sender,
                d.first.value(),
                d.last.map(|l| l.value()),
                true,
                DeliveryState::Accepted,
            )])
        }
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let receiver = session
        .new_receiver(&ct, "queue-a", ReceiverOptions {
            settlement_mode: Some(ReceiverSettleMode::Second),
            ..ReceiverOptions::default()
        })
        .await
        .expect("receiver attaches");

    let message = receiver.receive(&ct).await.expect("message arrives");
    assert_eq!(receiver.unsettled_count(), 1);

    // all credit is consumed and none is replenished before settlement
    while let Ok(frame) = peer.sent.try_recv() {
        assert!(
            !matches!(
                &frame.body,
                FrameBody::Flow(flow) if flow.handle.is_some()
                    && flow.delivery_count.map(|c| c.value()) == Some(1)
            ),
            "no refill may happen while the delivery is unsettled"
        );
    }

    receiver.accept(&ct, &message).await.expect("accept settles");
    assert_eq!(receiver.unsettled_count(), 0);

    let disposition = peer
        .next_matching(|f| match &f.body {
            FrameBody::Disposition(d) => Some(d.clone()),
            _ => None,
        })
        .await;
    assert_eq!(disposition.first.value(), 1);
    assert!(!disposition.settled, "mode second settles after the sender's ack");
    assert_eq!(disposition.state, Some(DeliveryState::Accepted));

    // settlement replenishes the window
    let refill = peer
        .next_matching(|f| match &f.body {
            FrameBody::Flow(flow)
                if flow.handle.is_some() && flow.delivery_count.map(|c| c.value()) == Some(1) =>
            {
                Some(flow.clone())
            }
            _ => None,
        })
        .await;
    assert_eq!(refill.link_credit, Some(1));
}

#[tokio::test]
async fn multi_transfer_delivery_is_reassembled() {
    use bytes::{Bytes, BytesMut};
    use wireflow::encoding::SerialNumber;
    use wireflow::frames::{Frame, Transfer};

    let (transport, _peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Flow(flow) if flow.link_credit == Some(1) && flow.handle.is_some() => {
            let mut payload = BytesMut::new();
            Message::new(Bytes::from_static(b"hello world"))
                .encode_into(&mut payload)
                .expect("message encodes");
            let payload = payload.freeze();
            let (head, tail) = payload.split_at(7);
            Some(vec![
                Frame {
                    channel: frame.channel,
                    body: FrameBody::Transfer(Transfer {
                        handle: 0,
                        delivery_id: Some(SerialNumber(4)),
                        delivery_tag: Some(Bytes::from_static(b"t4")),
                        message_format: Some(0),
                        more: true,
                        payload: Bytes::copy_from_slice(head),
                        ..Transfer::default()
                    }),
                },
                Frame {
                    channel: frame.channel,
                    body: FrameBody::Transfer(Transfer {
                        handle: 0,
                        more: false,
                        payload: Bytes::copy_from_slice(tail),
                        ..Transfer::default()
                    }),
                },
            ])
        }
        FrameBody::Flow(_) => Some(Vec::new()),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let receiver = session
        .new_receiver(&ct, "queue-a", ReceiverOptions::default())
        .await
        .expect("receiver attaches");

    let message = receiver.receive(&ct).await.expect("reassembled message");
    assert_eq!(message.body().map(AsRef::as_ref), Some(&b"hello world"[..]));
    assert_eq!(message.delivery_tag.as_deref(), Some(&b"t4"[..]));
}

#[tokio::test]
async fn aborted_delivery_is_discarded() {
    use bytes::Bytes;
    use wireflow::encoding::SerialNumber;
    use wireflow::frames::{Frame, Transfer};

    let (transport, _peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Flow(flow) if flow.link_credit == Some(2) && flow.handle.is_some() => {
            Some(vec![
                Frame {
                    channel: frame.channel,
                    body: FrameBody::Transfer(Transfer {
                        handle: 0,
                        delivery_id: Some(SerialNumber(1)),
                        delivery_tag: Some(Bytes::from_static(b"dead")),
                        message_format: Some(0),
                        more: true,
                        payload: Bytes::from_static(b"\x00\x53\x75"),
                        ..Transfer::default()
                    }),
                },
                Frame {
                    channel: frame.channel,
                    body: FrameBody::Transfer(Transfer {
                        handle: 0,
                        aborted: true,
                        ..Transfer::default()
                    }),
                },
                transfer_message(frame.channel, 0, 2, b"alive"),
            ])
        }
        FrameBody::Flow(_) => Some(Vec::new()),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let receiver = session
        .new_receiver(&ct, "queue-a", ReceiverOptions {
            credit: CreditMode::Auto(2),
            ..ReceiverOptions::default()
        })
        .await
        .expect("receiver attaches");

    // only the delivery after the abort surfaces
    let message = receiver.receive(&ct).await.expect("live message");
    assert_eq!(message.body().map(AsRef::as_ref), Some(&b"alive"[..]));
}

#[tokio::test]
async fn manual_credit_and_drain() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        // echo a drain: credit zeroed, delivery-count advanced over it
        FrameBody::Flow(flow) if flow.drain => Some(vec![Frame {
            channel: frame.channel,
            body: FrameBody::Flow(wireflow::frames::Flow {
                next_incoming_id: Some(SerialNumber(0)),
                incoming_window: 1000,
                next_outgoing_id: SerialNumber(0),
                outgoing_window: 1000,
                handle: Some(0),
                delivery_count: Some(
                    flow.delivery_count
                        .unwrap_or(SerialNumber(0))
                        .add(flow.link_credit.unwrap_or(0)),
                ),
                link_credit: Some(0),
                drain: true,
                ..wireflow::frames::Flow::default()
            }),
        }]),
        FrameBody::Flow(_) => Some(Vec::new()),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let receiver = session
        .new_receiver(&ct, "queue-a", ReceiverOptions {
            credit: CreditMode::Manual,
            ..ReceiverOptions::default()
        })
        .await
        .expect("receiver attaches");

    receiver.issue_credit(5).await.expect("credit issued");
    let flow = peer
        .next_matching(|f| match &f.body {
            FrameBody::Flow(flow) if flow.handle.is_some() => Some(flow.clone()),
            _ => None,
        })
        .await;
    assert_eq!(flow.link_credit, Some(5));
    assert!(!flow.drain);

    receiver.drain_credit(&ct).await.expect("drain confirmed");
    let drain = peer
        .next_matching(|f| match &f.body {
            FrameBody::Flow(flow) if flow.drain => Some(flow.clone()),
            _ => None,
        })
        .await;
    assert_eq!(drain.link_credit, Some(5));
}

#[tokio::test]
async fn credit_calls_require_manual_mode() {
    let (transport, _peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Flow(_) => Some(Vec::new()),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let receiver = session
        .new_receiver(&ct, "queue-a", ReceiverOptions::default())
        .await
        .expect("receiver attaches");

    let err = receiver.issue_credit(1).await.expect_err("auto mode");
    assert!(matches!(err, Error::InvalidOperation(_)));
    let err = receiver.drain_credit(&ct).await.expect_err("auto mode");
    assert!(matches!(err, Error::InvalidOperation(_)));
}
