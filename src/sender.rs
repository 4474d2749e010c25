//! Sending links: fragmentation, delivery tags, and credit-gated transfer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::encoding::{Fields, SerialNumber, Symbol};
use crate::error::{Error, Result};
use crate::frames::{
    Attach, AttachTarget, DeliveryState, Disposition, Durability, ExpiryPolicy, Flow, FrameBody,
    ReceiverSettleMode, Role, SenderSettleMode, Source, Target,
};
use crate::link::{LinkCore, LinkExterior};
use crate::message::Message;
use crate::session::{Session, TransferRequest};

/// Frame-header overhead reserved per transfer when fragmenting a message.
const TRANSFER_FRAME_OVERHEAD: u32 = 66;

/// Longest delivery tag the wire format allows.
const MAX_DELIVERY_TAG_LEN: usize = 32;

/// Options accepted by [`Session::new_sender`].
#[derive(Clone, Debug, Default)]
pub struct SenderOptions {
    /// Link name; generated when absent. The name+role pair identifies the
    /// link across the connection.
    pub name: Option<String>,
    /// Settlement mode to request; the attach fails if the peer does not
    /// honor an explicit request.
    pub settlement_mode: Option<SenderSettleMode>,
    /// Receiver settlement mode to request from the peer.
    pub requested_receiver_settle_mode: Option<ReceiverSettleMode>,
    /// Address of the source node.
    pub source_address: Option<String>,
    /// Source durability.
    pub durability: Durability,
    /// Source expiry policy.
    pub expiry_policy: ExpiryPolicy,
    /// Source expiry timeout in seconds.
    pub expiry_timeout: u32,
    /// Source capabilities.
    pub capabilities: Vec<Symbol>,
    /// Target capabilities.
    pub target_capabilities: Vec<Symbol>,
    /// Target durability.
    pub target_durability: Durability,
    /// Target expiry policy.
    pub target_expiry_policy: ExpiryPolicy,
    /// Target expiry timeout in seconds.
    pub target_expiry_timeout: u32,
    /// Ask the peer to create the target node and assign its address.
    pub dynamic_address: bool,
    /// Link properties sent on attach.
    pub properties: Option<Fields>,
    /// Largest message this endpoint will send; resolved against the peer's
    /// limit on attach.
    pub max_message_size: Option<u64>,
    /// Keep the link open when a delivery is rejected. By default a
    /// rejection detaches the link unless the peer settles in mode second.
    pub ignore_disposition_errors: bool,
}

#[derive(Debug)]
struct MarshalState {
    buf: BytesMut,
    next_delivery_tag: u64,
}

/// A sending link.
///
/// `send` is safe to call from multiple tasks; the marshal buffer is the
/// only serialization point, so while one unsettled send awaits its
/// disposition further sends proceed.
#[derive(Debug)]
pub struct Sender {
    name: String,
    address: Option<String>,
    max_message_size: Option<u64>,
    snd_settle_mode: SenderSettleMode,
    max_payload: usize,

    exterior: LinkExterior,
    transfers: mpsc::Sender<TransferRequest>,
    marshal: Mutex<MarshalState>,
    unsettled: Arc<AtomicUsize>,
}

impl Session {
    /// Attach a sending link to `target` on this session.
    pub async fn new_sender(
        &self,
        ct: &CancellationToken,
        target: impl Into<String>,
        options: SenderOptions,
    ) -> Result<Sender> {
        let target = target.into();
        let target = AttachTarget::Node(Target {
            address: (!options.dynamic_address).then_some(target),
            durable: options.target_durability,
            expiry_policy: options.target_expiry_policy,
            timeout: options.target_expiry_timeout,
            dynamic: options.dynamic_address,
            capabilities: options.target_capabilities.clone(),
        });
        self.new_sender_with_target(ct, target, options).await
    }

    /// Attach a sending link with an explicit target terminus (a node, or
    /// the transaction coordinator).
    pub(crate) async fn new_sender_with_target(
        &self,
        ct: &CancellationToken,
        target: AttachTarget,
        options: SenderOptions,
    ) -> Result<Sender> {
        let (mut core, exterior) = LinkCore::new(options.name.clone(), Role::Sender, self.inner.clone());
        core.requested_snd = options.settlement_mode;
        core.requested_rcv = options.requested_receiver_settle_mode;
        core.snd_settle_mode = options.settlement_mode.unwrap_or_default();
        core.max_message_size = options.max_message_size;

        let attach = Attach {
            name: core.name.clone(),
            handle: 0,
            role: Role::Sender,
            snd_settle_mode: options.settlement_mode,
            rcv_settle_mode: options.requested_receiver_settle_mode,
            source: Some(Source {
                address: options.source_address.clone(),
                durable: options.durability,
                expiry_policy: options.expiry_policy,
                timeout: options.expiry_timeout,
                capabilities: options.capabilities.clone(),
                ..Source::default()
            }),
            target: Some(target),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(SerialNumber(0)),
            max_message_size: options.max_message_size,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: options.properties.clone(),
        };

        let (core, resp) = core.attach(attach, ct).await?;
        let address = resp
            .target
            .as_ref()
            .and_then(AttachTarget::address)
            .map(str::to_owned);

        let max_payload = core
            .session
            .conn
            .peer_max_frame_size
            .saturating_sub(TRANSFER_FRAME_OVERHEAD)
            .max(1) as usize;

        let (transfer_in_tx, transfer_in_rx) = mpsc::channel(32);
        let sender = Sender {
            name: core.name.clone(),
            address,
            max_message_size: core.max_message_size,
            snd_settle_mode: core.snd_settle_mode,
            max_payload,
            exterior,
            transfers: transfer_in_tx,
            marshal: Mutex::new(MarshalState {
                buf: BytesMut::new(),
                next_delivery_tag: 0,
            }),
            unsettled: Arc::new(AtomicUsize::new(0)),
        };

        let driver = SenderDriver {
            core,
            transfers_rx: transfer_in_rx,
            transfers_open: true,
            ignore_disposition_errors: options.ignore_disposition_errors,
            requested_rcv: options.requested_receiver_settle_mode,
            stash: VecDeque::new(),
            pending: VecDeque::new(),
        };
        tokio::spawn(driver.run());

        Ok(sender)
    }
}

impl Sender {
    /// The link name in use.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// The target address, including a peer-assigned dynamic address.
    #[must_use]
    pub fn address(&self) -> Option<&str> { self.address.as_deref() }

    /// The negotiated max-message-size; `None` is unlimited.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> { self.max_message_size }

    /// Number of sent deliveries whose settlement is still pending.
    #[must_use]
    pub fn unsettled_count(&self) -> usize { self.unsettled.load(Ordering::Relaxed) }

    /// Send a message, blocking until it is settled (or, for pre-settled
    /// deliveries, handed to the connection writer).
    ///
    /// A rejection surfaces as [`Error::Rejected`] carrying the peer's error.
    pub async fn send(&self, ct: &CancellationToken, message: &Message) -> Result<()> {
        match self.send_raw(ct, message).await? {
            Some(DeliveryState::Rejected(error)) => Err(Error::Rejected(error.unwrap_or_else(
                || crate::frames::RemoteError::new("amqp:internal-error"),
            ))),
            _ => Ok(()),
        }
    }

    /// Send a message and return the peer's terminal delivery state (`None`
    /// for pre-settled deliveries).
    pub(crate) async fn send_raw(
        &self,
        ct: &CancellationToken,
        message: &Message,
    ) -> Result<Option<DeliveryState>> {
        if self.exterior.shutdown.is_closed() {
            return Err(self.exterior.terminal_error());
        }
        if let Some(tag) = &message.delivery_tag {
            if tag.len() > MAX_DELIVERY_TAG_LEN {
                return Err(Error::DeliveryTagTooLarge(tag.len()));
            }
        }

        let done = {
            let mut marshal = self.marshal.lock().await;
            marshal.buf.clear();
            message.encode_into(&mut marshal.buf)?;
            if let Some(max) = self.max_message_size {
                if marshal.buf.len() as u64 > max {
                    return Err(Error::MessageTooLarge {
                        size: marshal.buf.len() as u64,
                        max,
                    });
                }
            }

            let tag = message.delivery_tag.clone().unwrap_or_else(|| {
                let mut tag = BytesMut::with_capacity(8);
                tag.put_u64(marshal.next_delivery_tag);
                marshal.next_delivery_tag += 1;
                tag.freeze()
            });
            let settled = match self.snd_settle_mode {
                SenderSettleMode::Settled => true,
                SenderSettleMode::Unsettled => false,
                SenderSettleMode::Mixed => message.send_settled,
            };

            let mut payload = marshal.buf.split().freeze();
            let (done_tx, done_rx) = oneshot::channel();
            let mut done_tx = Some(done_tx);
            let mut first = true;
            loop {
                let chunk = payload.split_to(payload.len().min(self.max_payload));
                let more = !payload.is_empty();
                let request = TransferRequest {
                    handle: 0, // stamped by the link driver
                    tag: first.then(|| tag.clone()),
                    message_format: first.then_some(message.format),
                    payload: chunk,
                    more,
                    settled: !more && settled,
                    aborted: false,
                    done: if more { None } else { done_tx.take() },
                    unsettled: (!more && !settled).then(|| self.unsettled.clone()),
                };
                tokio::select! {
                    res = self.transfers.send(request) => {
                        if res.is_err() {
                            return Err(self.exterior.terminal_error());
                        }
                    }
                    () = ct.cancelled() => {
                        if !first {
                            // the delivery is mid-flight; abort it (still
                            // under the marshal lock, so no other delivery
                            // can interleave) before reporting cancellation
                            let abort = TransferRequest {
                                handle: 0,
                                tag: None,
                                message_format: None,
                                payload: Bytes::new(),
                                more: false,
                                settled: false,
                                aborted: true,
                                done: None,
                                unsettled: None,
                            };
                            let _ = tokio::time::timeout(
                                crate::link::CLEANUP_DEADLINE,
                                self.transfers.send(abort),
                            )
                            .await;
                        }
                        return Err(Error::Cancelled);
                    }
                }
                first = false;
                if !more {
                    break;
                }
            }
            done_rx
            // the marshal lock drops here, keeping one delivery's transfers
            // contiguous on the link
        };

        tokio::select! {
            state = done => state.map_err(|_| self.exterior.terminal_error())?,
            () = self.exterior.shutdown.closed() => Err(self.exterior.terminal_error()),
            () = ct.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Close the link: a closing Detach handshake with the peer.
    pub async fn close(&self, ct: &CancellationToken) -> Result<()> {
        self.exterior.close(ct).await
    }
}

struct SenderDriver {
    core: LinkCore,
    transfers_rx: mpsc::Receiver<TransferRequest>,
    transfers_open: bool,
    ignore_disposition_errors: bool,
    requested_rcv: Option<ReceiverSettleMode>,
    /// Inbound frames picked up while blocked pushing into the session.
    stash: VecDeque<FrameBody>,
    /// Outbound acks and flow replies awaiting the session queue.
    pending: VecDeque<FrameBody>,
}

impl SenderDriver {
    async fn run(mut self) {
        let err = match self.drive().await {
            Ok(()) | Err(Error::LinkClosed) => Error::LinkClosed,
            Err(err) => err,
        };
        log::debug!("sender {}: terminating: {err}", self.core.name);
        if !self.core.session.shutdown.is_closed() {
            let _ = tokio::time::timeout(crate::link::CLEANUP_DEADLINE, self.core.close(None)).await;
        }
        self.core.shutdown.close(err);
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            if let Some(frame) = self.stash.pop_front() {
                self.on_frame(frame)?;
                continue;
            }
            if let Some(body) = self.pending.pop_front() {
                self.push_session_frame(body).await?;
                continue;
            }

            let transfers_ready = self.transfers_open && self.core.link_credit > 0;
            tokio::select! {
                biased;

                () = self.core.close_signal.cancelled() => return Err(Error::LinkClosed),

                () = self.core.session.shutdown.closed() => {
                    return Err(self.core.session.terminal_error());
                }

                body = self.core.rx.recv() => match body {
                    Some(body) => self.on_frame(body)?,
                    None => return Err(self.core.session.terminal_error()),
                },

                req = self.transfers_rx.recv(), if transfers_ready => match req {
                    Some(req) => self.push_transfer(req).await?,
                    // every public handle is gone; the link stays attached
                    // until close or connection teardown
                    None => self.transfers_open = false,
                },
            }
        }
    }

    fn on_frame(&mut self, body: FrameBody) -> Result<()> {
        match body {
            FrameBody::Flow(flow) => self.on_flow(&flow),
            FrameBody::Disposition(disposition) => self.on_disposition(disposition),
            other => match self.core.handle_common_frame(&other) {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    /// Recompute credit from the receiver's view:
    /// `credit = peer.delivery_count + peer.link_credit − local.delivery_count`.
    fn on_flow(&mut self, flow: &Flow) -> Result<()> {
        if let Some(link_credit) = flow.link_credit {
            let base = flow.delivery_count.unwrap_or(SerialNumber(0));
            self.core.link_credit = base.add(link_credit).since(self.core.delivery_count);
            log::trace!(
                "sender {}: credit now {}",
                self.core.name,
                self.core.link_credit
            );
        }
        if flow.echo {
            self.pending.push_back(FrameBody::Flow(Flow {
                handle: Some(self.core.handle),
                delivery_count: Some(self.core.delivery_count),
                link_credit: Some(self.core.link_credit),
                ..Flow::default()
            }));
        }
        Ok(())
    }

    fn on_disposition(&mut self, disposition: Disposition) -> Result<()> {
        if let Some(DeliveryState::Rejected(error)) = &disposition.state {
            if self.detach_on_rejection() {
                return Err(Error::Rejected(error.clone().unwrap_or_else(|| {
                    crate::frames::RemoteError::new("amqp:internal-error")
                })));
            }
        }
        if !disposition.settled {
            // peer settles in mode second: confirm so it can drop the
            // delivery; the session settles our side on this ack
            self.pending.push_back(FrameBody::Disposition(Disposition {
                role: Role::Sender,
                first: disposition.first,
                last: disposition.last,
                settled: true,
                state: disposition.state,
                batchable: false,
            }));
        }
        Ok(())
    }

    /// A rejection closes the link unless the caller opted out or the peer
    /// settles in mode second (its rejection already needs our ack).
    fn detach_on_rejection(&self) -> bool {
        !self.ignore_disposition_errors
            && (self.requested_rcv.is_none()
                || self.core.rcv_settle_mode == ReceiverSettleMode::First)
    }

    async fn push_transfer(&mut self, mut req: TransferRequest) -> Result<()> {
        req.handle = self.core.handle;
        let last = !req.more;
        let mut req = Some(req);
        loop {
            tokio::select! {
                biased;

                () = self.core.close_signal.cancelled() => return Err(Error::LinkClosed),

                () = self.core.session.shutdown.closed() => {
                    return Err(self.core.session.terminal_error());
                }

                permit = self.core.session.transfer_tx.reserve() => {
                    let permit = permit.map_err(|_| self.core.session.terminal_error())?;
                    permit.send(req.take().expect("transfer request"));
                    break;
                }

                body = self.core.rx.recv() => match body {
                    Some(body) => self.stash.push_back(body),
                    None => return Err(self.core.session.terminal_error()),
                },
            }
        }

        if last {
            self.core.delivery_count = self.core.delivery_count.succ();
            self.core.link_credit = self.core.link_credit.saturating_sub(1);
        }
        Ok(())
    }

    async fn push_session_frame(&mut self, body: FrameBody) -> Result<()> {
        let mut body = Some(body);
        loop {
            tokio::select! {
                biased;

                () = self.core.close_signal.cancelled() => return Err(Error::LinkClosed),

                () = self.core.session.shutdown.closed() => {
                    return Err(self.core.session.terminal_error());
                }

                permit = self.core.session.frame_tx.reserve() => {
                    let permit = permit.map_err(|_| self.core.session.terminal_error())?;
                    permit.send(body.take().expect("frame body"));
                    return Ok(());
                }

                frame = self.core.rx.recv() => match frame {
                    Some(frame) => self.stash.push_back(frame),
                    None => return Err(self.core.session.terminal_error()),
                },
            }
        }
    }
}
