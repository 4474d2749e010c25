#![allow(dead_code)]
//! Scripted mock peer used by the scenario tests.
//!
//! The peer owns one end of an in-memory duplex stream, answers the
//! protocol-header exchange, and feeds every decoded frame to a
//! test-supplied responder. Everything the client sends is also forwarded
//! to the test for assertions, and frames can be injected outside the
//! request/response rhythm.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use wireflow::encoding::SerialNumber;
use wireflow::frames::{
    Attach, Begin, DeliveryState, Detach, Disposition, End, Flow, Frame, FrameBody, FrameDecoder,
    FrameEncoder, Open, Role, Transfer,
};
use wireflow::Message;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// The test side of a running mock peer.
pub struct Peer {
    /// Every frame the client sent, in order.
    pub sent: mpsc::UnboundedReceiver<Frame>,
    /// Frames pushed to the client outside the responder.
    pub inject: mpsc::UnboundedSender<Frame>,
}

impl Peer {
    /// The next frame the client sent, failing the test on a stall.
    pub async fn next_sent(&mut self) -> Frame {
        tokio::time::timeout(RECV_TIMEOUT, self.sent.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("peer task ended")
    }

    /// The next frame matching `pick`, skipping any others.
    pub async fn next_matching<T>(&mut self, mut pick: impl FnMut(&Frame) -> Option<T>) -> T {
        loop {
            let frame = self.next_sent().await;
            if let Some(found) = pick(&frame) {
                return found;
            }
        }
    }
}

/// Spawn a peer; `responder` maps each client frame to zero or more replies.
pub fn spawn_peer<F>(mut responder: F) -> (DuplexStream, Peer)
where
    F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
{
    let (client, server) = duplex(256 * 1024);
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        let (mut read, mut write) = tokio::io::split(server);
        let mut header = [0u8; 8];
        if read.read_exact(&mut header).await.is_err() {
            return;
        }
        if write.write_all(&header).await.is_err() {
            return;
        }

        let mut reader = FramedRead::new(read, FrameDecoder::new(u32::MAX));
        let mut writer = FramedWrite::new(write, FrameEncoder::default());
        loop {
            tokio::select! {
                Some(frame) = inject_rx.recv() => {
                    if writer.send(frame).await.is_err() {
                        return;
                    }
                }
                frame = reader.next() => {
                    let Some(Ok(frame)) = frame else { return };
                    let replies = responder(&frame);
                    let _ = sent_tx.send(frame);
                    for reply in replies {
                        if writer.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    (client, Peer {
        sent: sent_rx,
        inject: inject_tx,
    })
}

/// A responder covering the ordinary lifecycle; `special` intercepts first.
pub fn lifecycle_responder(
    mut special: impl FnMut(&Frame) -> Option<Vec<Frame>> + Send + 'static,
) -> impl FnMut(&Frame) -> Vec<Frame> + Send + 'static {
    move |frame: &Frame| {
        if let Some(replies) = special(frame) {
            return replies;
        }
        match &frame.body {
            FrameBody::Open(_) => vec![open_ok()],
            FrameBody::Begin(_) => vec![begin_ok(frame.channel)],
            FrameBody::Attach(attach) => vec![attach_echo(frame.channel, attach)],
            FrameBody::Detach(detach) => vec![detach_ok(frame.channel, detach.handle)],
            FrameBody::End(_) => vec![end_ok(frame.channel)],
            FrameBody::Close(_) => vec![close_ok()],
            _ => Vec::new(),
        }
    }
}

pub fn open_ok() -> Frame {
    Frame::connection(FrameBody::Open(Open {
        container_id: "mock-peer".into(),
        ..Open::default()
    }))
}

pub fn open_with_max_frame(max_frame_size: u32) -> Frame {
    Frame::connection(FrameBody::Open(Open {
        container_id: "mock-peer".into(),
        max_frame_size: Some(max_frame_size),
        ..Open::default()
    }))
}

pub fn begin_ok(channel: u16) -> Frame {
    Frame {
        channel,
        body: FrameBody::Begin(Begin {
            remote_channel: Some(channel),
            next_outgoing_id: SerialNumber(0),
            incoming_window: 1000,
            outgoing_window: 1000,
            ..Begin::default()
        }),
    }
}

/// Echo an attach the way a cooperative peer does: same name, flipped
/// role, both termini present, settlement modes honored.
pub fn attach_echo(channel: u16, attach: &Attach) -> Frame {
    let role = match attach.role {
        Role::Sender => Role::Receiver,
        Role::Receiver => Role::Sender,
    };
    Frame {
        channel,
        body: FrameBody::Attach(Attach {
            name: attach.name.clone(),
            handle: 0,
            role,
            snd_settle_mode: attach.snd_settle_mode,
            rcv_settle_mode: attach.rcv_settle_mode,
            source: attach.source.clone(),
            target: attach.target.clone(),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: (role == Role::Sender).then_some(SerialNumber(0)),
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }),
    }
}

pub fn detach_ok(channel: u16, handle: u32) -> Frame {
    Frame {
        channel,
        body: FrameBody::Detach(Detach {
            handle,
            closed: true,
            error: None,
        }),
    }
}

pub fn end_ok(channel: u16) -> Frame {
    Frame {
        channel,
        body: FrameBody::End(End::default()),
    }
}

pub fn close_ok() -> Frame { Frame::connection(FrameBody::Close(wireflow::frames::Close::default())) }

/// Link credit from the peer's receiving endpoint.
pub fn flow_credit(channel: u16, handle: u32, link_credit: u32) -> Frame {
    Frame {
        channel,
        body: FrameBody::Flow(Flow {
            next_incoming_id: Some(SerialNumber(0)),
            incoming_window: 1000,
            next_outgoing_id: SerialNumber(0),
            outgoing_window: 1000,
            handle: Some(handle),
            delivery_count: Some(SerialNumber(0)),
            link_credit: Some(link_credit),
            ..Flow::default()
        }),
    }
}

pub fn disposition(
    channel: u16,
    role: Role,
    first: u32,
    last: Option<u32>,
    settled: bool,
    state: DeliveryState,
) -> Frame {
    Frame {
        channel,
        body: FrameBody::Disposition(Disposition {
            role,
            first: SerialNumber(first),
            last: last.map(SerialNumber),
            settled,
            state: Some(state),
            batchable: false,
        }),
    }
}

/// A single-frame transfer carrying `body` as one data section.
pub fn transfer_message(channel: u16, handle: u32, delivery_id: u32, body: &[u8]) -> Frame {
    let mut payload = BytesMut::new();
    Message::new(Bytes::copy_from_slice(body))
        .encode_into(&mut payload)
        .expect("message encodes");
    Frame {
        channel,
        body: FrameBody::Transfer(Transfer {
            handle,
            delivery_id: Some(SerialNumber(delivery_id)),
            delivery_tag: Some(Bytes::copy_from_slice(&delivery_id.to_be_bytes())),
            message_format: Some(0),
            payload: payload.freeze(),
            ..Transfer::default()
        }),
    }
}
