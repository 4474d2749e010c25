//! Session multiplexer: windows, handles, delivery-ids, and frame dispatch.
//!
//! A session owns one driver task. Everything the session mutates — window
//! counters, the handle allocator, the link routing maps, the in-flight
//! settlement map — lives inside that task; links and the public [`Session`]
//! handle talk to it through bounded queues.
//!
//! The driver is also the session's serialization point for outbound frames:
//! link performatives arrive on one queue, transfers on another (gated on the
//! peer's incoming window), and the driver assigns delivery-ids and stamps
//! session flow state on the way out.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnShared;
use crate::encoding::SerialNumber;
use crate::error::{condition, Error, Result};
use crate::frames::{
    Attach, Begin, DeliveryState, Detach, Disposition, End, Flow, Frame, FrameBody, RemoteError,
    Role, Transfer,
};
use crate::shutdown::Shutdown;

/// Options accepted by [`Connection::begin_session`](crate::Connection::begin_session).
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Number of transfer frames the session will buffer from the peer.
    pub incoming_window: u32,
    /// Number of transfer frames the session is prepared to have in flight.
    pub outgoing_window: u32,
    /// Highest link handle usable on this session.
    pub handle_max: Option<u32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            incoming_window: 5000,
            outgoing_window: 5000,
            handle_max: None,
        }
    }
}

/// Completion for one delivery: the peer's terminal state (None when the
/// delivery was pre-settled) or the error that killed it.
pub(crate) type DeliveryResult = std::result::Result<Option<DeliveryState>, Error>;

/// One fragment of a delivery queued by a sender link driver.
pub(crate) struct TransferRequest {
    pub handle: u32,
    /// Set on the first fragment of a delivery.
    pub tag: Option<bytes::Bytes>,
    pub message_format: Option<u32>,
    pub payload: bytes::Bytes,
    pub more: bool,
    pub settled: bool,
    /// Abandons a partially transferred delivery.
    pub aborted: bool,
    /// Set on the last fragment; resolved at settlement (or at the writer
    /// hand-off for pre-settled deliveries).
    pub done: Option<oneshot::Sender<DeliveryResult>>,
    /// The owning link's unsettled gauge, adjusted as the delivery enters
    /// and leaves the in-flight map.
    pub unsettled: Option<std::sync::Arc<std::sync::atomic::AtomicUsize>>,
}

pub(crate) enum SessionControl {
    AttachLink {
        attach: Attach,
        link_tx: mpsc::Sender<FrameBody>,
        reply: oneshot::Sender<Result<u32>>,
    },
    DeallocateHandle {
        handle: u32,
    },
    End {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A mapped AMQP session: a channel multiplexing any number of links.
///
/// Dropping the handle does not end the session; call
/// [`end`](Session::end) (or close the connection) for an orderly End
/// handshake.
#[derive(Debug)]
pub struct Session {
    pub(crate) inner: std::sync::Arc<SessionHandle>,
}

/// The parts of a session its links hold on to.
#[derive(Debug)]
pub(crate) struct SessionHandle {
    pub channel: u16,
    pub conn: std::sync::Arc<ConnShared>,
    pub control_tx: mpsc::Sender<SessionControl>,
    pub frame_tx: mpsc::Sender<FrameBody>,
    pub transfer_tx: mpsc::Sender<TransferRequest>,
    pub shutdown: Shutdown,
}

impl SessionHandle {
    /// The error a dead session surfaces to its links.
    pub fn terminal_error(&self) -> Error {
        self.shutdown
            .error()
            .or_else(|| self.conn.shutdown.error())
            .unwrap_or(Error::SessionEnded(None))
    }
}

impl Session {
    /// The channel number this session occupies on the connection.
    #[must_use]
    pub fn channel(&self) -> u16 { self.inner.channel }

    /// End the session: send End, await the peer's End, release the channel.
    ///
    /// Links on the session observe [`Error::SessionEnded`].
    pub async fn end(&self, ct: &CancellationToken) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .control_tx
            .send(SessionControl::End { reply: reply_tx })
            .await
            .map_err(|_| self.inner.terminal_error())?;
        tokio::select! {
            res = reply_rx => res.map_err(|_| self.inner.terminal_error())?,
            () = ct.cancelled() => Err(Error::Cancelled),
            () = self.inner.shutdown.closed() => {
                // an End racing session teardown still ended the session
                Ok(())
            }
        }
    }
}

/// Lowest-free allocator over the handle space `[0, handle_max]`.
struct HandleAllocator {
    in_use: BTreeSet<u32>,
    max: u32,
}

impl HandleAllocator {
    fn new(max: u32) -> Self {
        Self {
            in_use: BTreeSet::new(),
            max,
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        let mut candidate = 0u32;
        for used in &self.in_use {
            if *used != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        (candidate <= self.max).then(|| {
            self.in_use.insert(candidate);
            candidate
        })
    }

    fn release(&mut self, handle: u32) { self.in_use.remove(&handle); }
}

struct LinkEntry {
    tx: mpsc::Sender<FrameBody>,
    role: Role,
    name: String,
}

struct InFlightDelivery {
    handle: u32,
    done: Option<oneshot::Sender<DeliveryResult>>,
    /// Last unsettled state the peer communicated, delivered on settlement.
    state: Option<DeliveryState>,
    unsettled: Option<std::sync::Arc<std::sync::atomic::AtomicUsize>>,
}

impl InFlightDelivery {
    /// Resolve the delivery exactly once, releasing its unsettled slot.
    fn settle(mut self, result: DeliveryResult) {
        if let Some(gauge) = self.unsettled.take() {
            gauge.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

enum SessionState {
    Mapped,
    EndSent,
}

/// The session driver task.
pub(crate) struct SessionDriver {
    channel: u16,
    conn: std::sync::Arc<ConnShared>,
    shutdown: Shutdown,

    incoming_rx: mpsc::Receiver<FrameBody>,
    control_rx: mpsc::Receiver<SessionControl>,
    frame_rx: mpsc::Receiver<FrameBody>,
    transfer_rx: mpsc::Receiver<TransferRequest>,

    state: SessionState,
    end_reply: Option<oneshot::Sender<Result<()>>>,

    /// Configured incoming window, restored on every refresh.
    incoming_window_max: u32,
    incoming_window: u32,
    outgoing_window: u32,
    next_incoming_id: Option<SerialNumber>,
    next_outgoing_id: SerialNumber,
    next_delivery_id: SerialNumber,
    remote_incoming_window: u32,
    remote_outgoing_window: u32,

    handles: HandleAllocator,
    links_by_local: HashMap<u32, LinkEntry>,
    links_by_name: HashMap<String, u32>,
    remote_to_local: HashMap<u32, u32>,

    in_flight: BTreeMap<u32, InFlightDelivery>,
}

pub(crate) struct SessionBootstrap {
    pub channel: u16,
    pub conn: std::sync::Arc<ConnShared>,
    pub incoming_rx: mpsc::Receiver<FrameBody>,
    pub options: SessionOptions,
    pub remote: Begin,
}

impl SessionDriver {
    /// Build the session handle and spawn the driver task.
    pub fn spawn(bootstrap: SessionBootstrap) -> Session {
        let SessionBootstrap {
            channel,
            conn,
            incoming_rx,
            options,
            remote,
        } = bootstrap;

        let (control_tx, control_rx) = mpsc::channel(8);
        let (frame_tx, frame_rx) = mpsc::channel(32);
        let (transfer_tx, transfer_rx) = mpsc::channel(32);
        let shutdown = conn.shutdown.child();

        let handle = std::sync::Arc::new(SessionHandle {
            channel,
            conn: conn.clone(),
            control_tx,
            frame_tx,
            transfer_tx,
            shutdown: shutdown.clone(),
        });

        let driver = Self {
            channel,
            conn,
            shutdown,
            incoming_rx,
            control_rx,
            frame_rx,
            transfer_rx,
            state: SessionState::Mapped,
            end_reply: None,
            incoming_window_max: options.incoming_window,
            incoming_window: options.incoming_window,
            outgoing_window: options.outgoing_window,
            next_incoming_id: Some(remote.next_outgoing_id),
            next_outgoing_id: SerialNumber(0),
            next_delivery_id: SerialNumber(0),
            remote_incoming_window: remote.incoming_window,
            remote_outgoing_window: remote.outgoing_window,
            handles: HandleAllocator::new(
                options
                    .handle_max
                    .unwrap_or(u32::MAX)
                    .min(remote.effective_handle_max()),
            ),
            links_by_local: HashMap::new(),
            links_by_name: HashMap::new(),
            remote_to_local: HashMap::new(),
            in_flight: BTreeMap::new(),
        };
        tokio::spawn(driver.run());

        Session { inner: handle }
    }

    async fn run(mut self) {
        let err = self.drive().await.err();
        let cause = err.unwrap_or(Error::SessionEnded(None));
        log::debug!("session ch={} terminating: {cause}", self.channel);

        // settle everything that will now never settle
        for (_, delivery) in std::mem::take(&mut self.in_flight) {
            delivery.settle(Err(cause.clone()));
        }
        // dropping the link queues wakes every link driver
        self.links_by_local.clear();
        // release before resolving End so a follow-up Begin can reuse the
        // channel: the reader processes control messages in order
        self.conn.release_channel(self.channel).await;
        if let Some(reply) = self.end_reply.take() {
            let _ = reply.send(Ok(()));
        }
        self.shutdown.close(cause);
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let can_transfer = self.remote_incoming_window > 0;
            tokio::select! {
                biased;

                () = self.conn.shutdown.closed() => {
                    return Err(self.conn.shutdown.error_or(Error::ConnectionClosed(None)));
                }

                body = self.incoming_rx.recv() => {
                    match body {
                        Some(body) => {
                            if self.handle_incoming(body).await? {
                                return Ok(());
                            }
                        }
                        None => {
                            return Err(self
                                .conn
                                .shutdown
                                .error_or(Error::ConnectionClosed(None)));
                        }
                    }
                }

                Some(control) = self.control_rx.recv() => {
                    self.handle_control(control).await?;
                }

                Some(body) = self.frame_rx.recv() => {
                    self.handle_outgoing(body).await?;
                }

                Some(req) = self.transfer_rx.recv(), if can_transfer => {
                    self.handle_transfer_request(req).await?;
                }
            }
        }
    }

    async fn send_frame(&self, body: FrameBody) -> Result<()> {
        self.conn
            .send_frame(Frame {
                channel: self.channel,
                body,
            })
            .await
    }

    /// Returns `Ok(true)` when the session reached its orderly end.
    async fn handle_incoming(&mut self, body: FrameBody) -> Result<bool> {
        match body {
            FrameBody::Attach(attach) => self.handle_remote_attach(attach).await?,
            FrameBody::Flow(flow) => self.handle_remote_flow(flow).await?,
            FrameBody::Transfer(transfer) => self.handle_remote_transfer(transfer).await?,
            FrameBody::Disposition(disposition) => {
                self.handle_remote_disposition(disposition).await?;
            }
            FrameBody::Detach(detach) => self.route_detach(detach).await?,
            FrameBody::End(end) => {
                if matches!(self.state, SessionState::EndSent) {
                    return Ok(true);
                }
                // peer-initiated end: acknowledge, then surface the error
                self.send_frame(FrameBody::End(End::default())).await?;
                return Err(Error::SessionEnded(end.error));
            }
            FrameBody::Begin(_) | FrameBody::Empty => {}
            other => {
                log::warn!("session ch={}: unexpected frame {}", self.channel, other.name());
            }
        }
        Ok(false)
    }

    async fn handle_remote_attach(&mut self, attach: Attach) -> Result<()> {
        let Some(&local) = self.links_by_name.get(&attach.name) else {
            return self
                .session_error(condition::UNATTACHED_HANDLE, "attach for unknown link name")
                .await;
        };
        self.remote_to_local.insert(attach.handle, local);
        self.forward_to_link(local, FrameBody::Attach(attach)).await;
        Ok(())
    }

    async fn handle_remote_flow(&mut self, flow: Flow) -> Result<()> {
        // session flow state first
        self.remote_outgoing_window = flow.outgoing_window;
        self.remote_incoming_window = match flow.next_incoming_id {
            Some(nid) => nid
                .add(flow.incoming_window)
                .since(self.next_outgoing_id),
            None => flow.incoming_window,
        };

        log::trace!(
            "session ch={}: remote windows in={} out={}",
            self.channel,
            self.remote_incoming_window,
            self.remote_outgoing_window
        );

        let echo_session = flow.echo && flow.handle.is_none();
        if let Some(remote_handle) = flow.handle {
            let Some(&local) = self.remote_to_local.get(&remote_handle) else {
                return self
                    .session_error(condition::UNATTACHED_HANDLE, "flow for unattached handle")
                    .await;
            };
            self.forward_to_link(local, FrameBody::Flow(flow)).await;
        }
        if echo_session {
            let reply = self.session_flow();
            self.send_frame(FrameBody::Flow(reply)).await?;
        }
        Ok(())
    }

    async fn handle_remote_transfer(&mut self, transfer: Transfer) -> Result<()> {
        if self.incoming_window == 0 {
            return self
                .session_error(condition::WINDOW_VIOLATION, "transfer outside incoming window")
                .await;
        }
        self.next_incoming_id = Some(
            self.next_incoming_id
                .map_or(SerialNumber(0), SerialNumber::succ),
        );
        self.incoming_window -= 1;

        let Some(&local) = self.remote_to_local.get(&transfer.handle) else {
            return self
                .session_error(condition::UNATTACHED_HANDLE, "transfer for unattached handle")
                .await;
        };
        self.forward_to_link(local, FrameBody::Transfer(transfer)).await;

        // refresh the window once half of it is consumed
        if self.incoming_window <= self.incoming_window_max / 2 {
            self.incoming_window = self.incoming_window_max;
            let flow = self.session_flow();
            self.send_frame(FrameBody::Flow(flow)).await?;
        }
        Ok(())
    }

    async fn handle_remote_disposition(&mut self, disposition: Disposition) -> Result<()> {
        if disposition.role == Role::Receiver {
            // state for our outgoing deliveries
            let first = disposition.first;
            let last = disposition.last_or_first();
            let mut touched_handles = BTreeSet::new();
            let ids: Vec<u32> = self
                .in_flight
                .keys()
                .copied()
                .filter(|id| {
                    let id = SerialNumber(*id);
                    first.le(id) && id.le(last)
                })
                .collect();
            for id in ids {
                if disposition.settled {
                    let entry = self.in_flight.remove(&id).expect("id from keys");
                    touched_handles.insert(entry.handle);
                    let state = disposition.state.clone().or_else(|| entry.state.clone());
                    entry.settle(Ok(state));
                } else {
                    let entry = self.in_flight.get_mut(&id).expect("id from keys");
                    touched_handles.insert(entry.handle);
                    entry.state.clone_from(&disposition.state);
                }
            }
            // the owning sender links still see the disposition: mode-second
            // acks and the reject-detach policy live there
            for handle in touched_handles {
                self.forward_to_link(handle, FrameBody::Disposition(disposition.clone()))
                    .await;
            }
        } else {
            // state for incoming deliveries: receivers track their own ids
            let receivers: Vec<u32> = self
                .links_by_local
                .iter()
                .filter(|(_, entry)| entry.role == Role::Receiver)
                .map(|(handle, _)| *handle)
                .collect();
            for handle in receivers {
                self.forward_to_link(handle, FrameBody::Disposition(disposition.clone()))
                    .await;
            }
        }
        Ok(())
    }

    async fn route_detach(&mut self, detach: Detach) -> Result<()> {
        let Some(&local) = self.remote_to_local.get(&detach.handle) else {
            return self
                .session_error(condition::UNATTACHED_HANDLE, "detach for unattached handle")
                .await;
        };
        self.forward_to_link(local, FrameBody::Detach(detach)).await;
        Ok(())
    }

    async fn handle_control(&mut self, control: SessionControl) -> Result<()> {
        match control {
            SessionControl::AttachLink {
                mut attach,
                link_tx,
                reply,
            } => {
                let Some(handle) = self.handles.allocate() else {
                    let _ = reply.send(Err(Error::InvalidOperation(
                        "no free link handle on session",
                    )));
                    return Ok(());
                };
                attach.handle = handle;
                self.links_by_local.insert(
                    handle,
                    LinkEntry {
                        tx: link_tx,
                        role: attach.role,
                        name: attach.name.clone(),
                    },
                );
                self.links_by_name.insert(attach.name.clone(), handle);
                self.send_frame(FrameBody::Attach(attach)).await?;
                let _ = reply.send(Ok(handle));
            }
            SessionControl::DeallocateHandle { handle } => {
                if let Some(entry) = self.links_by_local.remove(&handle) {
                    self.links_by_name.remove(&entry.name);
                }
                self.remote_to_local.retain(|_, local| *local != handle);
                self.handles.release(handle);
            }
            SessionControl::End { reply } => {
                if self.end_reply.is_none() {
                    self.state = SessionState::EndSent;
                    self.end_reply = Some(reply);
                    self.send_frame(FrameBody::End(End::default())).await?;
                } else {
                    let _ = reply.send(Err(Error::InvalidOperation("session already ending")));
                }
            }
        }
        Ok(())
    }

    async fn handle_outgoing(&mut self, body: FrameBody) -> Result<()> {
        match body {
            FrameBody::Flow(mut flow) => {
                // links fill their half of the flow; the session state is ours
                let session = self.session_flow();
                flow.next_incoming_id = session.next_incoming_id;
                flow.incoming_window = session.incoming_window;
                flow.next_outgoing_id = session.next_outgoing_id;
                flow.outgoing_window = session.outgoing_window;
                self.send_frame(FrameBody::Flow(flow)).await
            }
            FrameBody::Disposition(disposition) => {
                // the settled sender ack is the point a mode-second delivery
                // leaves the in-flight map
                if disposition.role == Role::Sender && disposition.settled {
                    let first = disposition.first;
                    let last = disposition.last_or_first();
                    let ids: Vec<u32> = self
                        .in_flight
                        .keys()
                        .copied()
                        .filter(|id| {
                            let id = SerialNumber(*id);
                            first.le(id) && id.le(last)
                        })
                        .collect();
                    for id in ids {
                        let mut entry = self.in_flight.remove(&id).expect("id from keys");
                        let state = entry.state.take();
                        entry.settle(Ok(state));
                    }
                }
                self.send_frame(FrameBody::Disposition(disposition)).await
            }
            other => self.send_frame(other).await,
        }
    }

    async fn handle_transfer_request(&mut self, req: TransferRequest) -> Result<()> {
        let first_of_delivery = req.tag.is_some();
        let delivery_id = if first_of_delivery {
            let id = self.next_delivery_id;
            self.next_delivery_id = id.succ();
            Some(id)
        } else {
            None
        };

        let transfer = Transfer {
            handle: req.handle,
            delivery_id,
            delivery_tag: req.tag,
            message_format: req.message_format,
            settled: req.settled.then_some(true),
            more: req.more,
            aborted: req.aborted,
            payload: req.payload,
            ..Transfer::default()
        };
        // continuations belong to the most recently assigned delivery
        let current_delivery = delivery_id.unwrap_or_else(|| self.next_delivery_id.add(u32::MAX));

        self.next_outgoing_id = self.next_outgoing_id.succ();
        self.remote_incoming_window -= 1;
        self.send_frame(FrameBody::Transfer(transfer)).await?;

        if !req.more {
            if req.settled || req.aborted {
                // an aborted delivery is implicitly settled
                if let Some(done) = req.done {
                    let _ = done.send(Ok(None));
                }
            } else if let Some(done) = req.done {
                if let Some(gauge) = &req.unsettled {
                    gauge.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                self.in_flight.insert(
                    current_delivery.value(),
                    InFlightDelivery {
                        handle: req.handle,
                        done: Some(done),
                        state: None,
                        unsettled: req.unsettled,
                    },
                );
            }
        }
        Ok(())
    }

    /// The session half of a Flow performative.
    fn session_flow(&self) -> Flow {
        Flow {
            next_incoming_id: self.next_incoming_id,
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            ..Flow::default()
        }
    }

    async fn forward_to_link(&mut self, local: u32, body: FrameBody) {
        if let Some(entry) = self.links_by_local.get(&local) {
            if entry.tx.send(body).await.is_err() {
                log::debug!(
                    "session ch={}: link {local} gone, dropping {} frame",
                    self.channel,
                    entry.name
                );
            }
        }
    }

    /// End the session with an error of our own making.
    async fn session_error(&mut self, cond: &str, description: &str) -> Result<()> {
        let error = RemoteError::new(cond).with_description(description);
        self.state = SessionState::EndSent;
        self.send_frame(FrameBody::End(End {
            error: Some(error.clone()),
        }))
        .await?;
        Err(Error::SessionEnded(Some(error)))
    }
}
