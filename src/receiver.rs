//! Receiving links: reassembly, the message queue, and the credit engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::encoding::{Fields, SerialNumber, Symbol};
use crate::error::{condition, Error, Result};
use crate::frames::{
    Attach, AttachTarget, DeliveryState, Disposition, Durability, ExpiryPolicy, Flow, FrameBody,
    ReceiverSettleMode, RemoteError, Role, SenderSettleMode, Source, Target, Transfer,
};
use crate::link::{LinkCore, LinkExterior};
use crate::message::{Message, ModifyOptions};
use crate::session::Session;

/// How a receiver extends credit to the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreditMode {
    /// Keep the credit window topped up to the given maximum.
    Auto(u32),
    /// Credit is extended only by explicit [`Receiver::issue_credit`] calls.
    Manual,
}

impl Default for CreditMode {
    fn default() -> Self { Self::Auto(1) }
}

/// Options accepted by [`Session::new_receiver`].
#[derive(Clone, Debug, Default)]
pub struct ReceiverOptions {
    /// Link name; generated when absent.
    pub name: Option<String>,
    /// Receiver settlement mode to request; the attach fails if the peer
    /// does not honor an explicit request.
    pub settlement_mode: Option<ReceiverSettleMode>,
    /// Sender settlement mode to request from the peer.
    pub requested_sender_settle_mode: Option<SenderSettleMode>,
    /// Credit policy; the default keeps one credit outstanding.
    pub credit: CreditMode,
    /// Target durability.
    pub durability: Durability,
    /// Target expiry policy.
    pub expiry_policy: ExpiryPolicy,
    /// Target expiry timeout in seconds.
    pub expiry_timeout: u32,
    /// Target capabilities.
    pub capabilities: Vec<Symbol>,
    /// Ask the peer to create the source node and assign its address.
    pub dynamic_address: bool,
    /// Named filters applied at the source.
    pub filters: Option<Fields>,
    /// Link properties sent on attach.
    pub properties: Option<Fields>,
    /// Largest message this endpoint accepts; larger deliveries detach the
    /// link with `amqp:link:message-size-exceeded`.
    pub max_message_size: Option<u64>,
}

enum ReceiverCommand {
    Receive {
        reply: oneshot::Sender<Result<Message>>,
    },
    Dispose {
        delivery_id: SerialNumber,
        state: DeliveryState,
        reply: oneshot::Sender<Result<()>>,
    },
    IssueCredit {
        credit: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    Drain {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A receiving link.
pub struct Receiver {
    name: String,
    address: Option<String>,
    exterior: LinkExterior,
    commands: mpsc::Sender<ReceiverCommand>,
    unsettled: Arc<AtomicUsize>,
}

impl Session {
    /// Attach a receiving link to `source` on this session.
    pub async fn new_receiver(
        &self,
        ct: &CancellationToken,
        source: impl Into<String>,
        options: ReceiverOptions,
    ) -> Result<Receiver> {
        let source = source.into();
        let (mut core, exterior) =
            LinkCore::new(options.name.clone(), Role::Receiver, self.inner.clone());
        core.requested_rcv = options.settlement_mode;
        core.requested_snd = options.requested_sender_settle_mode;
        core.rcv_settle_mode = options.settlement_mode.unwrap_or_default();
        core.max_message_size = options.max_message_size;

        let attach = Attach {
            name: core.name.clone(),
            handle: 0,
            role: Role::Receiver,
            snd_settle_mode: options.requested_sender_settle_mode,
            rcv_settle_mode: options.settlement_mode,
            source: Some(Source {
                address: (!options.dynamic_address).then_some(source),
                dynamic: options.dynamic_address,
                filter: options.filters.clone(),
                ..Source::default()
            }),
            target: Some(AttachTarget::Node(Target {
                durable: options.durability,
                expiry_policy: options.expiry_policy,
                timeout: options.expiry_timeout,
                capabilities: options.capabilities.clone(),
                ..Target::default()
            })),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: options.max_message_size,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: options.properties.clone(),
        };

        let (mut core, resp) = core.attach(attach, ct).await?;
        let address = resp
            .source
            .as_ref()
            .and_then(|s| s.address.clone());
        // the sender owns delivery-count; adopt its initial value
        core.delivery_count = resp.initial_delivery_count.unwrap_or(SerialNumber(0));

        let (command_tx, command_rx) = mpsc::channel(32);
        let unsettled = Arc::new(AtomicUsize::new(0));
        let receiver = Receiver {
            name: core.name.clone(),
            address,
            exterior,
            commands: command_tx,
            unsettled: unsettled.clone(),
        };

        let driver = ReceiverDriver {
            core,
            commands_rx: command_rx,
            credit_mode: options.credit,
            messages: VecDeque::new(),
            waiters: VecDeque::new(),
            partial: None,
            tracked: HashMap::new(),
            pending_settle: HashMap::new(),
            drain_waiter: None,
            stash: VecDeque::new(),
            pending: VecDeque::new(),
            unsettled,
        };
        tokio::spawn(driver.run());

        Ok(receiver)
    }
}

impl Receiver {
    /// The link name in use.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// The source address, including a peer-assigned dynamic address.
    #[must_use]
    pub fn address(&self) -> Option<&str> { self.address.as_deref() }

    /// Number of received deliveries not yet settled.
    #[must_use]
    pub fn unsettled_count(&self) -> usize { self.unsettled.load(Ordering::Relaxed) }

    /// Receive the next message, blocking until one arrives.
    pub async fn receive(&self, ct: &CancellationToken) -> Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ReceiverCommand::Receive { reply: reply_tx }).await?;
        tokio::select! {
            res = reply_rx => res.map_err(|_| self.exterior.terminal_error())?,
            () = ct.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Accept a received message.
    pub async fn accept(&self, ct: &CancellationToken, message: &Message) -> Result<()> {
        self.dispose(ct, message, DeliveryState::Accepted).await
    }

    /// Reject a received message with an error.
    pub async fn reject(
        &self,
        ct: &CancellationToken,
        message: &Message,
        error: Option<RemoteError>,
    ) -> Result<()> {
        self.dispose(ct, message, DeliveryState::Rejected(error)).await
    }

    /// Release a received message back to the sender.
    pub async fn release(&self, ct: &CancellationToken, message: &Message) -> Result<()> {
        self.dispose(ct, message, DeliveryState::Released).await
    }

    /// Modify and release a received message.
    pub async fn modify(
        &self,
        ct: &CancellationToken,
        message: &Message,
        options: ModifyOptions,
    ) -> Result<()> {
        self.dispose(
            ct,
            message,
            DeliveryState::Modified {
                delivery_failed: options.delivery_failed,
                undeliverable_here: options.undeliverable_here,
                message_annotations: options.message_annotations,
            },
        )
        .await
    }

    /// Extend `credit` messages of link credit. Manual-credit links only.
    pub async fn issue_credit(&self, credit: u32) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ReceiverCommand::IssueCredit {
            credit,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| self.exterior.terminal_error())?
    }

    /// Ask the sender to consume all outstanding credit and wait for its
    /// confirmation. Manual-credit links only.
    pub async fn drain_credit(&self, ct: &CancellationToken) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ReceiverCommand::Drain { reply: reply_tx }).await?;
        tokio::select! {
            res = reply_rx => res.map_err(|_| self.exterior.terminal_error())?,
            () = ct.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Close the link: a closing Detach handshake with the peer.
    pub async fn close(&self, ct: &CancellationToken) -> Result<()> {
        self.exterior.close(ct).await
    }

    async fn dispose(
        &self,
        ct: &CancellationToken,
        message: &Message,
        state: DeliveryState,
    ) -> Result<()> {
        let Some(delivery_id) = message.delivery_id else {
            // not delivered by this link, or already settled in mode first
            return Ok(());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ReceiverCommand::Dispose {
            delivery_id,
            state,
            reply: reply_tx,
        })
        .await?;
        tokio::select! {
            res = reply_rx => res.map_err(|_| self.exterior.terminal_error())?,
            () = ct.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn command(&self, command: ReceiverCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.exterior.terminal_error())
    }
}

struct PartialDelivery {
    delivery_id: SerialNumber,
    delivery_tag: Option<bytes::Bytes>,
    message_format: u32,
    payload: BytesMut,
}

struct ReceiverDriver {
    core: LinkCore,
    commands_rx: mpsc::Receiver<ReceiverCommand>,
    credit_mode: CreditMode,

    messages: VecDeque<Message>,
    waiters: VecDeque<oneshot::Sender<Result<Message>>>,
    partial: Option<PartialDelivery>,
    /// Deliveries handed to the application and not yet settled locally.
    tracked: HashMap<u32, ()>,
    /// Mode-second dispositions awaiting the sender's settled ack.
    pending_settle: HashMap<u32, oneshot::Sender<Result<()>>>,
    drain_waiter: Option<oneshot::Sender<Result<()>>>,

    /// Inbound frames picked up while blocked pushing into the session.
    stash: VecDeque<FrameBody>,
    /// Outbound flows and dispositions awaiting the session queue.
    pending: VecDeque<FrameBody>,
    unsettled: Arc<AtomicUsize>,
}

impl ReceiverDriver {
    async fn run(mut self) {
        // the opening flow extends the initial credit window
        if let CreditMode::Auto(_) = self.credit_mode {
            self.top_up();
        }

        let err = match self.drive().await {
            Ok(()) | Err(Error::LinkClosed) => Error::LinkClosed,
            Err(err) => err,
        };
        log::debug!("receiver {}: terminating: {err}", self.core.name);

        let detach_error = match &err {
            Error::MessageTooLarge { .. } => Some(
                RemoteError::new(condition::MESSAGE_SIZE_EXCEEDED)
                    .with_description("incoming message exceeds max-message-size"),
            ),
            _ => None,
        };
        if !self.core.session.shutdown.is_closed() {
            let _ = tokio::time::timeout(
                crate::link::CLEANUP_DEADLINE,
                self.core.close(detach_error),
            )
            .await;
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        for (_, reply) in self.pending_settle.drain() {
            let _ = reply.send(Err(err.clone()));
        }
        if let Some(reply) = self.drain_waiter.take() {
            let _ = reply.send(Err(err.clone()));
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

                Some(command) = self.commands_rx.recv() => self.on_command(command),
            }
        }
    }

    fn on_frame(&mut self, body: FrameBody) -> Result<()> {
        match body {
            FrameBody::Transfer(transfer) => self.on_transfer(transfer),
            FrameBody::Flow(flow) => {
                self.on_flow(&flow);
                Ok(())
            }
            FrameBody::Disposition(disposition) => {
                self.on_disposition(&disposition);
                Ok(())
            }
            other => match self.core.handle_common_frame(&other) {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    fn on_transfer(&mut self, transfer: Transfer) -> Result<()> {
        if transfer.aborted {
            // an aborted delivery is implicitly settled; nothing to report
            self.partial = None;
            return Ok(());
        }

        if self.partial.is_none() {
            let Some(delivery_id) = transfer.delivery_id else {
                return Err(Error::MalformedFrame(
                    "transfer continuation without a delivery in progress",
                ));
            };
            self.partial = Some(PartialDelivery {
                delivery_id,
                delivery_tag: transfer.delivery_tag.clone(),
                message_format: transfer.message_format.unwrap_or(0),
                payload: BytesMut::new(),
            });
        }
        let partial = self.partial.as_mut().expect("partial just ensured");
        partial.payload.extend_from_slice(&transfer.payload);

        if let Some(max) = self.core.max_message_size {
            if partial.payload.len() as u64 > max {
                return Err(Error::MessageTooLarge {
                    size: partial.payload.len() as u64,
                    max,
                });
            }
        }
        if transfer.more {
            return Ok(());
        }

        let partial = self.partial.take().expect("partial just inserted");
        let mut message = Message::decode(&partial.payload)?;
        message.format = partial.message_format;
        message.delivery_tag = partial.delivery_tag;
        message.delivery_id = Some(partial.delivery_id);
        message.state = transfer.state;
        let pre_settled = transfer.settled.unwrap_or(false);

        self.core.delivery_count = self.core.delivery_count.succ();
        self.core.link_credit = self.core.link_credit.saturating_sub(1);

        self.deliver(message, pre_settled);
        Ok(())
    }

    /// Hand a completed message to a waiting `receive` call or queue it.
    fn deliver(&mut self, mut message: Message, pre_settled: bool) {
        if pre_settled {
            // the sender settled on its side; no disposition may be sent
            message.delivery_id = None;
        }
        let delivery_id = message.delivery_id;
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Ok(message)) {
                Ok(()) => {
                    self.on_delivered(delivery_id);
                    return;
                }
                // the receive call was cancelled; try the next waiter
                Err(Ok(returned)) => message = returned,
                Err(Err(_)) => return,
            }
        }
        self.messages.push_back(message);
    }

    /// Bookkeeping for a message that reached the application. `None` marks
    /// a delivery the sender pre-settled.
    fn on_delivered(&mut self, delivery_id: Option<SerialNumber>) {
        if let Some(delivery_id) = delivery_id {
            match self.core.rcv_settle_mode {
                ReceiverSettleMode::First => {
                    // settle on receipt
                    self.pending.push_back(FrameBody::Disposition(Disposition {
                        role: Role::Receiver,
                        first: delivery_id,
                        last: None,
                        settled: true,
                        state: Some(DeliveryState::Accepted),
                        batchable: false,
                    }));
                }
                ReceiverSettleMode::Second => {
                    self.tracked.insert(delivery_id.value(), ());
                    self.unsettled.store(self.tracked.len(), Ordering::Relaxed);
                }
            }
        }
        if let CreditMode::Auto(_) = self.credit_mode {
            self.top_up();
        }
    }

    fn on_command(&mut self, command: ReceiverCommand) {
        match command {
            ReceiverCommand::Receive { reply } => {
                if let Some(message) = self.messages.pop_front() {
                    let delivery_id = message.delivery_id;
                    match reply.send(Ok(message)) {
                        Ok(()) => self.on_delivered(delivery_id),
                        // the caller vanished between command and reply;
                        // the message goes back to the head of the queue
                        Err(Ok(returned)) => self.messages.push_front(returned),
                        Err(Err(_)) => {}
                    }
                } else {
                    self.waiters.push_back(reply);
                }
            }
            ReceiverCommand::Dispose {
                delivery_id,
                state,
                reply,
            } => self.on_dispose(delivery_id, state, reply),
            ReceiverCommand::IssueCredit { credit, reply } => {
                if self.credit_mode != CreditMode::Manual {
                    let _ = reply.send(Err(Error::InvalidOperation(
                        "credit can only be issued on manual-credit links",
                    )));
                    return;
                }
                self.core.link_credit += credit;
                self.push_link_flow(false);
                let _ = reply.send(Ok(()));
            }
            ReceiverCommand::Drain { reply } => {
                if self.credit_mode != CreditMode::Manual {
                    let _ = reply.send(Err(Error::InvalidOperation(
                        "drain can only be used on manual-credit links",
                    )));
                    return;
                }
                if self.drain_waiter.is_some() {
                    let _ = reply.send(Err(Error::InvalidOperation("drain already in progress")));
                    return;
                }
                self.drain_waiter = Some(reply);
                self.push_link_flow(true);
            }
        }
    }

    fn on_dispose(
        &mut self,
        delivery_id: SerialNumber,
        state: DeliveryState,
        reply: oneshot::Sender<Result<()>>,
    ) {
        // only mode-second deliveries are tracked; everything else is
        // already settled and the disposition is a no-op
        if !self.tracked.contains_key(&delivery_id.value()) {
            let _ = reply.send(Ok(()));
            return;
        }
        // keep the delivery until the sender's settled ack arrives
        self.pending_settle.insert(delivery_id.value(), reply);
        self.pending.push_back(FrameBody::Disposition(Disposition {
            role: Role::Receiver,
            first: delivery_id,
            last: None,
            settled: false,
            state: Some(state),
            batchable: false,
        }));
    }

    fn on_disposition(&mut self, disposition: &Disposition) {
        if disposition.role != Role::Sender || !disposition.settled {
            return;
        }
        let first = disposition.first;
        let last = disposition.last_or_first();
        let ids: Vec<u32> = self
            .tracked
            .keys()
            .copied()
            .filter(|id| {
                let id = SerialNumber(*id);
                first.le(id) && id.le(last)
            })
            .collect();
        for id in ids {
            self.tracked.remove(&id);
            if let Some(reply) = self.pending_settle.remove(&id) {
                let _ = reply.send(Ok(()));
            }
        }
        self.unsettled.store(self.tracked.len(), Ordering::Relaxed);
        if let CreditMode::Auto(_) = self.credit_mode {
            self.top_up();
        }
    }

    fn on_flow(&mut self, flow: &Flow) {
        if flow.drain {
            // the drain confirmation advances delivery-count over the unused
            // credit and zeroes the window
            if let Some(count) = flow.delivery_count {
                self.core.delivery_count = count;
            }
            self.core.link_credit = 0;
            if let Some(reply) = self.drain_waiter.take() {
                let _ = reply.send(Ok(()));
            }
        }
        if flow.echo {
            self.push_link_flow(false);
        }
    }

    /// Top the credit window back up to the configured maximum, counting
    /// deliveries the application still holds unsettled against it.
    fn top_up(&mut self) {
        let CreditMode::Auto(max_credit) = self.credit_mode else {
            return;
        };
        let in_use = u32::try_from(self.tracked.len()).unwrap_or(u32::MAX);
        let desired = max_credit.saturating_sub(in_use);
        if desired > self.core.link_credit {
            self.core.link_credit = desired;
            self.push_link_flow(false);
        }
    }

    fn push_link_flow(&mut self, drain: bool) {
        self.pending.push_back(FrameBody::Flow(Flow {
            handle: Some(self.core.handle),
            delivery_count: Some(self.core.delivery_count),
            link_credit: Some(self.core.link_credit),
            drain,
            ..Flow::default()
        }));
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
