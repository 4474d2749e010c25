use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rstest::rstest;
use tokio_util::codec::{Decoder, Encoder};

use super::*;
use crate::error::Error;

fn roundtrip(frame: Frame) -> (Frame, usize) {
    let mut buf = BytesMut::new();
    FrameEncoder
        .encode(frame, &mut buf)
        .expect("frame encodes");
    let encoded_len = buf.len();
    let decoded = FrameDecoder::new(u32::MAX)
        .decode(&mut buf)
        .expect("frame decodes")
        .expect("frame complete");
    assert!(buf.is_empty(), "decoder left {} bytes", buf.len());
    (decoded, encoded_len)
}

#[test]
fn keepalive_is_eight_bytes() {
    let mut buf = BytesMut::new();
    FrameEncoder
        .encode(Frame::keepalive(), &mut buf)
        .expect("keepalive encodes");
    assert_eq!(&buf[..], &[0, 0, 0, 8, 2, 0, 0, 0]);
    let (decoded, len) = roundtrip(Frame::keepalive());
    assert_eq!(len, 8);
    assert_eq!(decoded.body, FrameBody::Empty);
}

#[test]
fn size_field_matches_wire_length() {
    let frame = Frame::connection(FrameBody::Open(Open {
        container_id: "client-1".into(),
        hostname: Some("broker.example".into()),
        max_frame_size: Some(65536),
        channel_max: Some(1023),
        idle_timeout: Some(Duration::from_secs(30)),
        ..Open::default()
    }));
    let mut buf = BytesMut::new();
    FrameEncoder
        .encode(frame, &mut buf)
        .expect("frame encodes");
    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    assert_eq!(declared, buf.len());
    assert!(declared >= 8);
}

#[test]
fn oversized_frame_is_rejected() {
    let frame = Frame {
        channel: 3,
        body: FrameBody::Transfer(Transfer {
            handle: 0,
            payload: Bytes::from(vec![0u8; 4096]),
            ..Transfer::default()
        }),
    };
    let mut buf = BytesMut::new();
    FrameEncoder
        .encode(frame, &mut buf)
        .expect("frame encodes");
    let err = FrameDecoder::new(512).decode(&mut buf).expect_err("too large");
    assert!(matches!(err, Error::FrameTooLarge { max: 512, .. }));
}

#[test]
fn open_defaults_apply_on_short_list() {
    let frame = Frame::connection(FrameBody::Open(Open {
        container_id: "c".into(),
        ..Open::default()
    }));
    let (decoded, _) = roundtrip(frame);
    let FrameBody::Open(open) = decoded.body else {
        panic!("expected Open");
    };
    assert_eq!(open.container_id, "c");
    assert_eq!(open.effective_max_frame_size(), u32::MAX);
    assert_eq!(open.effective_channel_max(), u16::MAX);
    assert_eq!(open.idle_timeout, None);
}

#[test]
fn begin_roundtrips_with_windows() {
    let frame = Frame {
        channel: 1,
        body: FrameBody::Begin(Begin {
            remote_channel: Some(1),
            next_outgoing_id: SerialNumber(7),
            incoming_window: 5000,
            outgoing_window: 2000,
            handle_max: Some(31),
            ..Begin::default()
        }),
    };
    let (decoded, _) = roundtrip(frame.clone());
    assert_eq!(decoded, frame);
}

#[test]
fn attach_roundtrips_with_termini() {
    let frame = Frame {
        channel: 0,
        body: FrameBody::Attach(Attach {
            name: "orders-sender".into(),
            handle: 2,
            role: Role::Sender,
            snd_settle_mode: Some(SenderSettleMode::Unsettled),
            rcv_settle_mode: Some(ReceiverSettleMode::Second),
            source: Some(Source {
                address: Some("local".into()),
                durable: Durability::Configuration,
                expiry_policy: ExpiryPolicy::Never,
                timeout: 30,
                ..Source::default()
            }),
            target: Some(AttachTarget::Node(Target {
                address: Some("orders".into()),
                ..Target::default()
            })),
            unsettled: Some(vec![(
                Bytes::from_static(b"\x00\x01"),
                Some(DeliveryState::Accepted),
            )]),
            incomplete_unsettled: false,
            initial_delivery_count: Some(SerialNumber(0)),
            max_message_size: Some(1 << 20),
            offered_capabilities: vec![Symbol::from("a"), Symbol::from("b")],
            desired_capabilities: Vec::new(),
            properties: Some(vec![(Symbol::from("priority"), crate::encoding::Value::Int(4))]),
        }),
    };
    let (decoded, _) = roundtrip(frame.clone());
    assert_eq!(decoded, frame);
}

#[test]
fn attach_to_coordinator_roundtrips() {
    let frame = Frame::connection(FrameBody::Attach(Attach {
        name: "txn-controller".into(),
        handle: 0,
        role: Role::Sender,
        snd_settle_mode: Some(SenderSettleMode::Unsettled),
        rcv_settle_mode: None,
        source: Some(Source::default()),
        target: Some(AttachTarget::Coordinator(Coordinator {
            capabilities: vec![Symbol::from("amqp:local-transactions")],
        })),
        unsettled: None,
        incomplete_unsettled: false,
        initial_delivery_count: Some(SerialNumber(0)),
        max_message_size: None,
        offered_capabilities: Vec::new(),
        desired_capabilities: Vec::new(),
        properties: None,
    }));
    let (decoded, _) = roundtrip(frame.clone());
    assert_eq!(decoded, frame);
}

#[test]
fn transfer_keeps_payload_after_performative() {
    let frame = Frame {
        channel: 2,
        body: FrameBody::Transfer(Transfer {
            handle: 1,
            delivery_id: Some(SerialNumber(9)),
            delivery_tag: Some(Bytes::from_static(b"tag-9")),
            message_format: Some(0),
            settled: None,
            more: true,
            payload: Bytes::from_static(b"\x00\x53\x75\xa0\x02hi"),
            ..Transfer::default()
        }),
    };
    let (decoded, _) = roundtrip(frame.clone());
    assert_eq!(decoded, frame);
}

#[rstest]
#[case(DeliveryState::Accepted)]
#[case(DeliveryState::Released)]
#[case(DeliveryState::Rejected(Some(
    RemoteError::new("amqp:not-found").with_description("no such node")
)))]
#[case(DeliveryState::Modified {
    delivery_failed: true,
    undeliverable_here: false,
    message_annotations: None,
})]
#[case(DeliveryState::Received { section_number: 1, section_offset: 512 })]
#[case(DeliveryState::Declared { txn_id: Bytes::from_static(b"\x01\x02") })]
fn disposition_states_roundtrip(#[case] state: DeliveryState) {
    let frame = Frame {
        channel: 0,
        body: FrameBody::Disposition(Disposition {
            role: Role::Receiver,
            first: SerialNumber(4),
            last: Some(SerialNumber(6)),
            settled: true,
            state: Some(state),
            batchable: false,
        }),
    };
    let (decoded, _) = roundtrip(frame.clone());
    assert_eq!(decoded, frame);
}

#[test]
fn detach_end_close_roundtrip() {
    let error = RemoteError::new("amqp:link:detach-forced").with_description("administrative");
    for body in [
        FrameBody::Detach(Detach {
            handle: 3,
            closed: true,
            error: Some(error.clone()),
        }),
        FrameBody::End(End {
            error: Some(error.clone()),
        }),
        FrameBody::Close(Close { error: Some(error) }),
        FrameBody::Detach(Detach {
            handle: 0,
            closed: true,
            error: None,
        }),
    ] {
        let frame = Frame { channel: 5, body };
        let (decoded, _) = roundtrip(frame.clone());
        assert_eq!(decoded, frame);
    }
}

#[test]
fn sasl_bodies_use_sasl_frame_type() {
    let frame = Frame::connection(FrameBody::SaslInit(SaslInit {
        mechanism: Symbol::from("PLAIN"),
        initial_response: Some(Bytes::from_static(b"\x00user\x00pass")),
        hostname: Some("broker".into()),
    }));
    let mut buf = BytesMut::new();
    FrameEncoder
        .encode(frame.clone(), &mut buf)
        .expect("frame encodes");
    assert_eq!(buf[5], 1, "SASL bodies carry frame type 1");
    let (decoded, _) = roundtrip(frame.clone());
    assert_eq!(decoded, frame);
}

#[test]
fn mandatory_null_field_is_an_error() {
    // an Attach without a name: descriptor 0x12, list with one null
    let mut buf = BytesMut::new();
    crate::encoding::encode::encode_composite(&mut buf, descriptor::ATTACH, &[
        None,
        Some(crate::encoding::Value::Uint(0)),
        Some(crate::encoding::Value::Bool(false)),
    ])
    .expect("composite encodes");
    let err = FrameBody::decode(&buf).expect_err("missing name");
    assert_eq!(err, crate::encoding::CodecError::MissingField("name"));
}

#[test]
fn truncated_body_is_a_codec_error() {
    let mut buf = BytesMut::new();
    FrameEncoder
        .encode(
            Frame::connection(FrameBody::Open(Open {
                container_id: "container".into(),
                ..Open::default()
            })),
            &mut buf,
        )
        .expect("frame encodes");
    // corrupt the frame: shrink the body but keep the declared size intact
    let truncated = buf.len() - 4;
    let body = FrameBody::decode(&buf[8..truncated]);
    assert_eq!(body, Err(crate::encoding::CodecError::Truncated));
}
