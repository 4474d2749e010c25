//! Sender scenarios against a scripted peer.

mod common;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use common::*;
use wireflow::frames::{DeliveryState, Frame, FrameBody, RemoteError, Role, SenderSettleMode};
use wireflow::{ConnOptions, Connection, Error, Message, SenderOptions, SessionOptions};

async fn connect(transport: tokio::io::DuplexStream) -> Connection {
    let ct = CancellationToken::new();
    Connection::open(&ct, transport, ConnOptions::default())
        .await
        .expect("connection opens")
}

#[tokio::test]
async fn send_unsettled_single_transfer() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => Some(vec![
            attach_echo(frame.channel, a),
            flow_credit(frame.channel, 0, 1),
        ]),
        FrameBody::Transfer(transfer) => Some(vec![disposition(
            frame.channel,
            Role::Receiver,
            transfer.delivery_id.expect("delivery id").value(),
            None,
            true,
            DeliveryState::Accepted,
        )]),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let sender = session
        .new_sender(&ct, "queue-a", SenderOptions {
            settlement_mode: Some(SenderSettleMode::Unsettled),
            ..SenderOptions::default()
        })
        .await
        .expect("sender attaches");

    sender
        .send(&ct, &Message::new(&b"hello"[..]))
        .await
        .expect("send settles");

    let transfer = peer
        .next_matching(|f| match &f.body {
            FrameBody::Transfer(t) => Some(t.clone()),
            _ => None,
        })
        .await;
    assert_eq!(transfer.delivery_id.map(|id| id.value()), Some(0));
    assert_eq!(
        transfer.delivery_tag.as_deref(),
        Some(&[0, 0, 0, 0, 0, 0, 0, 0][..])
    );
    assert!(!transfer.more);
    assert_ne!(transfer.settled, Some(true));
    assert_eq!(
        transfer.payload.as_ref(),
        &[0x00, 0x53, 0x75, 0xa0, 0x05, b'h', b'e', b'l', b'l', b'o']
    );
    assert_eq!(sender.unsettled_count(), 0);
}

#[tokio::test]
async fn send_settled_completes_without_disposition() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => Some(vec![
            attach_echo(frame.channel, a),
            flow_credit(frame.channel, 0, 10),
        ]),
        // no disposition on purpose
        FrameBody::Transfer(_) => Some(Vec::new()),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let sender = session
        .new_sender(&ct, "queue-a", SenderOptions {
            settlement_mode: Some(SenderSettleMode::Settled),
            ..SenderOptions::default()
        })
        .await
        .expect("sender attaches");

    sender
        .send(&ct, &Message::new(&b"test"[..]))
        .await
        .expect("pre-settled send completes at the writer");

    let transfer = peer
        .next_matching(|f| match &f.body {
            FrameBody::Transfer(t) => Some(t.clone()),
            _ => None,
        })
        .await;
    assert_eq!(transfer.settled, Some(true));
    assert_eq!(sender.unsettled_count(), 0);
}

#[tokio::test]
async fn send_fragments_across_max_frame_size() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Open(_) => Some(vec![open_with_max_frame(128)]),
        FrameBody::Attach(a) => Some(vec![
            attach_echo(frame.channel, a),
            flow_credit(frame.channel, 0, 1),
        ]),
        FrameBody::Transfer(transfer) if !transfer.more => Some(vec![disposition(
            frame.channel,
            Role::Receiver,
            0,
            None,
            true,
            DeliveryState::Accepted,
        )]),
        _ => None,
    }));
    let conn = connect(transport).await;
    assert_eq!(conn.max_frame_size(), 128);
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let sender = session
        .new_sender(&ct, "queue-a", SenderOptions {
            settlement_mode: Some(SenderSettleMode::Unsettled),
            ..SenderOptions::default()
        })
        .await
        .expect("sender attaches");

    let body: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
    sender
        .send(&ct, &Message::new(body))
        .await
        .expect("send settles");

    // a 512 byte body encodes to 520 bytes; at 128 − 66 = 62 bytes per
    // transfer that is nine frames, the first eight flagged `more`
    let mut transfers = Vec::new();
    while transfers.last().map_or(true, |t: &wireflow::frames::Transfer| t.more) {
        let transfer = peer
            .next_matching(|f| match &f.body {
                FrameBody::Transfer(t) => Some(t.clone()),
                _ => None,
            })
            .await;
        transfers.push(transfer);
    }
    assert_eq!(transfers.len(), 9);
    assert_eq!(transfers[0].delivery_id.map(|id| id.value()), Some(0));
    assert!(transfers[0].delivery_tag.is_some());
    for continuation in &transfers[1..] {
        assert_eq!(continuation.delivery_id, None);
        assert_eq!(continuation.delivery_tag, None);
        assert_eq!(continuation.message_format, None);
    }
    for transfer in &transfers[..8] {
        assert!(transfer.more);
        assert_eq!(transfer.payload.len(), 62);
    }
    assert!(!transfers[8].more);
    assert_eq!(transfers[8].payload.len(), 520 - 8 * 62);
}

#[tokio::test]
async fn rejected_send_surfaces_error_and_detaches() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => Some(vec![
            attach_echo(frame.channel, a),
            flow_credit(frame.channel, 0, 1),
        ]),
        FrameBody::Transfer(_) => Some(vec![disposition(
            frame.channel,
            Role::Receiver,
            0,
            None,
            true,
            DeliveryState::Rejected(Some(
                RemoteError::new("rejected").with_description("nope"),
            )),
        )]),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let sender = session
        .new_sender(&ct, "queue-a", SenderOptions {
            settlement_mode: Some(SenderSettleMode::Unsettled),
            ..SenderOptions::default()
        })
        .await
        .expect("sender attaches");

    let err = sender
        .send(&ct, &Message::new(&b"hello"[..]))
        .await
        .expect_err("rejected send fails");
    let Error::Rejected(remote) = err else {
        panic!("expected a rejection, got {err}");
    };
    assert_eq!(remote.condition, "rejected");
    assert_eq!(remote.description.as_deref(), Some("nope"));
    assert_eq!(sender.unsettled_count(), 0);

    // the default policy closes the link on rejection
    let detach = peer
        .next_matching(|f| match &f.body {
            FrameBody::Detach(d) => Some(d.clone()),
            _ => None,
        })
        .await;
    assert!(detach.closed);
}

#[tokio::test]
async fn mode_second_send_settles_after_the_ack() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => Some(vec![
            attach_echo(frame.channel, a),
            flow_credit(frame.channel, 0, 1),
        ]),
        // a mode-second peer settles only after our ack: its disposition
        // arrives unsettled
        FrameBody::Transfer(transfer) => Some(vec![disposition(
            frame.channel,
            Role::Receiver,
            transfer.delivery_id.expect("delivery id").value(),
            None,
            false,
            DeliveryState::Accepted,
        )]),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let sender = session
        .new_sender(&ct, "queue-a", SenderOptions {
            settlement_mode: Some(SenderSettleMode::Unsettled),
            requested_receiver_settle_mode: Some(
                wireflow::frames::ReceiverSettleMode::Second,
            ),
            ..SenderOptions::default()
        })
        .await
        .expect("sender attaches");

    sender
        .send(&ct, &Message::new(&b"exactly-once"[..]))
        .await
        .expect("send settles after the ack");

    // the delivery leaves the unsettled map only once the settled ack is
    // on its way back
    let ack = peer
        .next_matching(|f| match &f.body {
            FrameBody::Disposition(d) if d.role == Role::Sender => Some(d.clone()),
            _ => None,
        })
        .await;
    assert!(ack.settled);
    assert_eq!(ack.first.value(), 0);
    assert_eq!(sender.unsettled_count(), 0);
}

#[tokio::test]
async fn oversized_delivery_tag_never_reaches_the_wire() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => Some(vec![
            attach_echo(frame.channel, a),
            flow_credit(frame.channel, 0, 1),
        ]),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let sender = session
        .new_sender(&ct, "queue-a", SenderOptions::default())
        .await
        .expect("sender attaches");

    let mut message = Message::new(&b"x"[..]);
    message.delivery_tag = Some(Bytes::from(vec![0u8; 33]));
    let err = sender.send(&ct, &message).await.expect_err("tag too large");
    assert!(matches!(err, Error::DeliveryTagTooLarge(33)));

    // nothing was transferred; the link closes cleanly
    sender.close(&ct).await.expect("close succeeds");
    while let Ok(frame) = peer.sent.try_recv() {
        assert!(
            !matches!(frame.body, FrameBody::Transfer(_)),
            "no transfer may be emitted for an oversized tag"
        );
    }
}

#[tokio::test]
async fn message_over_negotiated_size_fails_locally() {
    let (transport, _peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => {
            let mut echo = attach_echo(frame.channel, a);
            if let FrameBody::Attach(attach) = &mut echo.body {
                attach.max_message_size = Some(16);
            }
            Some(vec![echo, flow_credit(frame.channel, 0, 1)])
        }
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let sender = session
        .new_sender(&ct, "queue-a", SenderOptions::default())
        .await
        .expect("sender attaches");
    assert_eq!(sender.max_message_size(), Some(16));

    let err = sender
        .send(&ct, &Message::new(&b"a message that is too big"[..]))
        .await
        .expect_err("message too large");
    assert!(matches!(err, Error::MessageTooLarge { max: 16, .. }));
}

#[tokio::test]
async fn send_blocks_without_credit_until_cancelled() {
    let (transport, _peer) = spawn_peer(lifecycle_responder(|_| None));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let sender = session
        .new_sender(&ct, "queue-a", SenderOptions::default())
        .await
        .expect("sender attaches");

    // no flow frame was sent, so the delivery sits waiting for credit
    let send_ct = CancellationToken::new();
    let message = Message::new(&b"waiting"[..]);
    let send = sender.send(&send_ct, &message);
    tokio::pin!(send);
    tokio::select! {
        res = &mut send => panic!("send completed without credit: {res:?}"),
        () = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
    }
    send_ct.cancel();
    let err = send.await.expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn attach_refused_by_peer_surfaces_detach_error() {
    let (transport, mut peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => {
            let mut refusal = attach_echo(frame.channel, a);
            if let FrameBody::Attach(attach) = &mut refusal.body {
                attach.source = None;
                attach.target = None;
            }
            Some(vec![
                refusal,
                Frame {
                    channel: frame.channel,
                    body: FrameBody::Detach(wireflow::frames::Detach {
                        handle: 0,
                        closed: true,
                        error: Some(
                            RemoteError::new("amqp:not-found")
                                .with_description("no such queue"),
                        ),
                    }),
                },
            ])
        }
        // the client's closing Detach acknowledges ours; no reply follows
        FrameBody::Detach(_) => Some(Vec::new()),
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let err = session
        .new_sender(&ct, "missing", SenderOptions::default())
        .await
        .expect_err("attach is refused");
    let Error::AttachRefused(Some(remote)) = err else {
        panic!("expected a refusal, got {err}");
    };
    assert_eq!(remote.condition, "amqp:not-found");

    // the refusing detach is acknowledged
    let detach = peer
        .next_matching(|f| match &f.body {
            FrameBody::Detach(d) => Some(d.clone()),
            _ => None,
        })
        .await;
    assert!(detach.closed);
}

#[tokio::test]
async fn settle_mode_downgrade_fails_attach() {
    let (transport, _peer) = spawn_peer(lifecycle_responder(|frame| match &frame.body {
        FrameBody::Attach(a) => {
            let mut echo = attach_echo(frame.channel, a);
            if let FrameBody::Attach(attach) = &mut echo.body {
                attach.snd_settle_mode = Some(SenderSettleMode::Unsettled);
            }
            Some(vec![echo])
        }
        _ => None,
    }));
    let conn = connect(transport).await;
    let ct = CancellationToken::new();

    let session = conn
        .begin_session(&ct, SessionOptions::default())
        .await
        .expect("session begins");
    let err = session
        .new_sender(&ct, "queue-a", SenderOptions {
            settlement_mode: Some(SenderSettleMode::Settled),
            ..SenderOptions::default()
        })
        .await
        .expect_err("mode mismatch fails attach");
    assert!(matches!(err, Error::SettleModeMismatch { .. }));
}
