//! State and handshake logic shared by sender and receiver links.
//!
//! A link is identified connection-wide by its name and role. The core here
//! owns the attach/detach handshake, settlement-mode reconciliation, and the
//! detach bookkeeping both link drivers delegate to; the role-specific
//! drivers live in [`sender`](crate::sender) and [`receiver`](crate::receiver).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::encoding::SerialNumber;
use crate::error::{condition, Error, Result};
use crate::frames::{
    Attach, Detach, FrameBody, ReceiverSettleMode, RemoteError, Role, SenderSettleMode,
};
use crate::session::{SessionControl, SessionHandle};
use crate::shutdown::Shutdown;

/// Deadline for finishing a detach handshake the caller abandoned.
pub(crate) const CLEANUP_DEADLINE: Duration = Duration::from_secs(5);

/// Queue depth for frames routed from the session to one link.
pub(crate) const LINK_RX_DEPTH: usize = 64;

static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// A unique name: prefix, process-wide counter, process id.
pub(crate) fn unique_name(prefix: &str) -> String {
    let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{seq}-{:x}", std::process::id())
}

/// A unique link name for the given role.
pub(crate) fn unique_link_name(role: Role) -> String {
    unique_name(match role {
        Role::Sender => "sender",
        Role::Receiver => "receiver",
    })
}

/// State common to both link roles, owned by the link's driver task.
pub(crate) struct LinkCore {
    pub name: String,
    pub role: Role,
    /// Our handle, assigned by the session on attach.
    pub handle: u32,
    /// The peer's handle for the same link.
    pub remote_handle: Option<u32>,
    /// Modes the caller explicitly asked for; a peer that does not echo an
    /// explicit request fails the attach.
    pub requested_snd: Option<SenderSettleMode>,
    pub requested_rcv: Option<ReceiverSettleMode>,
    /// Modes in force after reconciliation.
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    /// `min(local non-zero, peer non-zero)`; `None` is unlimited.
    pub max_message_size: Option<u64>,
    pub delivery_count: SerialNumber,
    pub link_credit: u32,

    pub session: Arc<SessionHandle>,
    pub rx: mpsc::Receiver<FrameBody>,
    pub shutdown: Shutdown,
    /// Cancelled by the public handle to request a local close.
    pub close_signal: CancellationToken,
    pub detach_received: bool,
}

impl LinkCore {
    pub fn new(name: Option<String>, role: Role, session: Arc<SessionHandle>) -> (Self, LinkExterior) {
        let (_unused_tx, rx) = mpsc::channel(1);
        let shutdown = session.shutdown.child();
        let close_signal = CancellationToken::new();
        let exterior = LinkExterior {
            shutdown: shutdown.clone(),
            close_signal: close_signal.clone(),
        };
        (
            Self {
                name: name.unwrap_or_else(|| unique_link_name(role)),
                role,
                handle: 0,
                remote_handle: None,
                requested_snd: None,
                requested_rcv: None,
                snd_settle_mode: SenderSettleMode::default(),
                rcv_settle_mode: ReceiverSettleMode::default(),
                max_message_size: None,
                delivery_count: SerialNumber(0),
                link_credit: 0,
                session,
                rx,
                shutdown,
                close_signal,
                detach_received: false,
            },
            exterior,
        )
    }

    /// Run the attach handshake. Consumes the core so an abandoned handshake
    /// can move into a bounded background cleanup.
    pub async fn attach(mut self, mut attach: Attach, ct: &CancellationToken) -> Result<(Self, Attach)> {
        let (link_tx, link_rx) = mpsc::channel(LINK_RX_DEPTH);
        self.rx = link_rx;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.session
            .control_tx
            .send(SessionControl::AttachLink {
                attach: {
                    attach.name.clone_from(&self.name);
                    attach.role = self.role;
                    attach
                },
                link_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.session.terminal_error())?;
        let handle = tokio::select! {
            res = &mut reply_rx => res.map_err(|_| self.session.terminal_error())??,
            () = ct.cancelled() => {
                // the Attach may already be on the wire; learn our handle
                // and run the detach handshake in the background
                tokio::spawn(async move {
                    if let Ok(Ok(handle)) = reply_rx.await {
                        self.handle = handle;
                        let _ = tokio::time::timeout(CLEANUP_DEADLINE, self.close(None)).await;
                    }
                });
                return Err(Error::Cancelled);
            }
        };
        self.handle = handle;

        // the Attach is on the wire: from here on, an abandoned wait must
        // still run the detach handshake so the handle is not left dangling
        let resp = match self.wait_frame(ct).await {
            Ok(FrameBody::Attach(resp)) => resp,
            Ok(FrameBody::Detach(detach)) => {
                let err = detach.error.clone();
                self.detach_received = true;
                self.close(None).await;
                return Err(Error::AttachRefused(err));
            }
            Ok(other) => {
                log::warn!("link {}: unexpected {} while attaching", self.name, other.name());
                self.spawn_cleanup();
                return Err(Error::MalformedFrame("unexpected frame during attach"));
            }
            Err(Error::Cancelled) => {
                self.spawn_cleanup();
                return Err(Error::Cancelled);
            }
            Err(err) => return Err(err),
        };

        // a refusing peer attaches with no terminus at all, then detaches
        if resp.source.is_none() && resp.target.is_none() {
            let err = match self.wait_frame(ct).await {
                Ok(FrameBody::Detach(detach)) => detach.error,
                Ok(_) => None,
                Err(Error::Cancelled) => {
                    self.spawn_cleanup();
                    return Err(Error::Cancelled);
                }
                Err(err) => return Err(err),
            };
            self.detach_received = true;
            self.close(None).await;
            return Err(Error::AttachRefused(err));
        }

        self.remote_handle = Some(resp.handle);
        self.reconcile(&resp).await?;
        log::debug!(
            "link {} attached: local handle {}, remote handle {:?}, modes {}/{}",
            self.name,
            self.handle,
            self.remote_handle,
            self.snd_settle_mode,
            self.rcv_settle_mode
        );
        Ok((self, resp))
    }

    /// Resolve settle modes and max-message-size from the peer's Attach.
    async fn reconcile(&mut self, resp: &Attach) -> Result<()> {
        let peer_snd = resp.snd_settle_mode.unwrap_or_default();
        let peer_rcv = resp.rcv_settle_mode.unwrap_or_default();
        if let Some(requested) = self.requested_snd {
            if requested != peer_snd {
                self.close(None).await;
                return Err(Error::SettleModeMismatch {
                    requested: "sender settle mode",
                    granted: peer_snd.to_string(),
                });
            }
        }
        if let Some(requested) = self.requested_rcv {
            if requested != peer_rcv {
                self.close(None).await;
                return Err(Error::SettleModeMismatch {
                    requested: "receiver settle mode",
                    granted: peer_rcv.to_string(),
                });
            }
        }
        self.snd_settle_mode = peer_snd;
        self.rcv_settle_mode = peer_rcv;
        self.max_message_size = match (self.max_message_size, resp.effective_max_message_size()) {
            (Some(local), Some(peer)) => Some(local.min(peer)),
            (local, peer) => peer.or(local),
        };
        Ok(())
    }

    /// Wait for the next frame routed to this link.
    pub async fn wait_frame(&mut self, ct: &CancellationToken) -> Result<FrameBody> {
        tokio::select! {
            () = ct.cancelled() => Err(Error::Cancelled),
            () = self.session.shutdown.closed() => Err(self.session.terminal_error()),
            body = self.rx.recv() => body.ok_or_else(|| self.session.terminal_error()),
        }
    }

    /// Handle frames neither driver consumes itself.
    ///
    /// Returns the link's terminal error when the frame ends the link.
    pub fn handle_common_frame(&mut self, body: &FrameBody) -> Option<Error> {
        match body {
            FrameBody::Detach(detach) => {
                if !detach.closed {
                    // suspend/resume is not supported; treat as fatal
                    self.detach_received = true;
                    return Some(Error::LinkDetached(Some(
                        RemoteError::new(condition::NOT_IMPLEMENTED)
                            .with_description("non-closing detach is not supported"),
                    )));
                }
                self.detach_received = true;
                Some(Error::LinkDetached(detach.error.clone()))
            }
            other => {
                log::debug!("link {}: ignoring {} frame", self.name, other.name());
                None
            }
        }
    }

    /// Close the link: send a closing Detach, await the peer's, free the
    /// handle. Skips the wait when the peer already detached.
    pub async fn close(&mut self, error: Option<RemoteError>) {
        let detach = Detach {
            handle: self.handle,
            closed: true,
            error,
        };
        if self
            .session
            .frame_tx
            .send(FrameBody::Detach(detach))
            .await
            .is_err()
        {
            // session is gone and took the handle space with it
            return;
        }

        if !self.detach_received {
            let deadline = tokio::time::sleep(CLEANUP_DEADLINE);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    () = &mut deadline => {
                        // without the ack the handle may still be attached
                        // peer-side; leave it allocated
                        return;
                    }
                    () = self.session.shutdown.closed() => return,
                    body = self.rx.recv() => match body {
                        Some(FrameBody::Detach(detach)) if detach.closed => break,
                        Some(_) => {}
                        None => return,
                    }
                }
            }
        }

        let _ = self
            .session
            .control_tx
            .send(SessionControl::DeallocateHandle {
                handle: self.handle,
            })
            .await;
    }

    /// Finish an abandoned handshake in the background, bounded by
    /// [`CLEANUP_DEADLINE`].
    pub fn spawn_cleanup(mut self) {
        tokio::spawn(async move {
            let _ = tokio::time::timeout(CLEANUP_DEADLINE, self.close(None)).await;
        });
    }
}

/// The pieces of link state the public `Sender`/`Receiver` handles keep.
#[derive(Debug)]
pub(crate) struct LinkExterior {
    pub shutdown: Shutdown,
    pub close_signal: CancellationToken,
}

impl LinkExterior {
    /// Terminal error observed by the public handle.
    pub fn terminal_error(&self) -> Error { self.shutdown.error_or(Error::LinkClosed) }

    /// Request a close and wait for the driver to finish.
    pub async fn close(&self, ct: &CancellationToken) -> Result<()> {
        self.close_signal.cancel();
        tokio::select! {
            () = self.shutdown.closed() => {}
            () = ct.cancelled() => return Err(Error::Cancelled),
        }
        match self.terminal_error() {
            // a clean close, locally initiated or acknowledged by a peer
            // detach without error, reports success
            Error::LinkClosed | Error::LinkDetached(None) => Ok(()),
            err => Err(err),
        }
    }
}
