//! Connection driver: handshake, frame routing, and the writer task.
//!
//! A connection owns exactly two tasks once open. The reader task turns
//! socket bytes into performatives and routes them by channel to session
//! drivers; the writer task serializes every outbound frame and injects
//! keepalives when the peer advertised an idle timeout. The protocol-header
//! exchange, the optional SASL handshake, and Open negotiation all happen
//! inline before either task is spawned.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::encoding::Fields;
use crate::error::{condition, Error, Result};
use crate::frames::{
    Begin, Close, Frame, FrameBody, FrameDecoder, FrameEncoder, Open, RemoteError,
    MIN_MAX_FRAME_SIZE,
};
use crate::link::unique_name;
use crate::sasl::{self, SaslConfig};
use crate::session::{Session, SessionBootstrap, SessionDriver, SessionOptions};
use crate::shutdown::Shutdown;

/// Default local max-frame-size advertised in Open.
const DEFAULT_MAX_FRAME_SIZE: u32 = 65536;

/// Default local idle window advertised in Open.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Options accepted by [`Connection::open`].
#[derive(Clone, Debug)]
pub struct ConnOptions {
    /// Container id sent in Open; generated when absent.
    pub container_id: Option<String>,
    /// Host name sent in Open (and SASL init).
    pub hostname: Option<String>,
    /// Largest frame this endpoint accepts; at least 512.
    pub max_frame_size: u32,
    /// Highest channel number this endpoint accepts.
    pub channel_max: u16,
    /// Idle window advertised to the peer; zero disables idle handling.
    pub idle_timeout: Duration,
    /// SASL configuration; `None` skips the SASL layer entirely.
    pub sasl: Option<SaslConfig>,
    /// Connection properties sent in Open.
    pub properties: Option<Fields>,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            container_id: None,
            hostname: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: u16::MAX,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sasl: None,
            properties: None,
        }
    }
}

pub(crate) enum ConnControl {
    AllocateChannel {
        incoming: mpsc::Sender<FrameBody>,
        reply: oneshot::Sender<Result<u16>>,
    },
    ReleaseChannel {
        channel: u16,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// State shared between the public handle, sessions, and links.
#[derive(Debug)]
pub(crate) struct ConnShared {
    pub container_id: String,
    pub peer_open: Open,
    /// `min(local, peer)` max-frame-size, bounding outgoing frames.
    pub peer_max_frame_size: u32,
    pub channel_max: u16,
    pub writer_tx: mpsc::Sender<Frame>,
    pub control_tx: mpsc::Sender<ConnControl>,
    pub shutdown: Shutdown,
}

impl ConnShared {
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| self.shutdown.error_or(Error::ConnectionClosed(None)))
    }

    pub async fn release_channel(&self, channel: u16) {
        let _ = self
            .control_tx
            .send(ConnControl::ReleaseChannel { channel })
            .await;
    }
}

/// An open AMQP 1.0 connection multiplexing any number of sessions.
#[derive(Debug)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

impl Connection {
    /// Open a connection over an established transport.
    ///
    /// Runs the protocol-header exchange, the SASL exchange when configured,
    /// and Open negotiation, then spawns the reader and writer tasks.
    pub async fn open<T>(
        ct: &CancellationToken,
        transport: T,
        options: ConnOptions,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::select! {
            res = Self::open_inner(transport, options) => res,
            () = ct.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn open_inner<T>(transport: T, options: ConnOptions) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let container_id = options
            .container_id
            .clone()
            .unwrap_or_else(|| unique_name("container"));
        let local_max_frame = options.max_frame_size.max(MIN_MAX_FRAME_SIZE);

        let (read_half, write_half) = tokio::io::split(transport);
        let mut handshake = Handshake {
            read: read_half,
            write: write_half,
            buf: BytesMut::with_capacity(8 * 1024),
            out: BytesMut::with_capacity(8 * 1024),
            decoder: FrameDecoder::new(local_max_frame),
            encoder: FrameEncoder,
        };

        if let Some(sasl_config) = &options.sasl {
            handshake.exchange_header(sasl::PROTOCOL_ID).await?;
            sasl::negotiate(&mut handshake, sasl_config, options.hostname.as_deref()).await?;
        }
        handshake.exchange_header(0).await?;

        let open = Open {
            container_id: container_id.clone(),
            hostname: options.hostname.clone(),
            max_frame_size: Some(local_max_frame),
            channel_max: Some(options.channel_max),
            idle_timeout: (!options.idle_timeout.is_zero()).then_some(options.idle_timeout),
            properties: options.properties.clone(),
            ..Open::default()
        };
        handshake
            .write_frame(Frame::connection(FrameBody::Open(open)))
            .await?;

        let peer_open = loop {
            match handshake.read_frame().await?.body {
                FrameBody::Open(open) => break open,
                FrameBody::Close(close) => return Err(Error::ConnectionClosed(close.error)),
                FrameBody::Empty => {}
                other => {
                    log::warn!("expected Open, got {}", other.name());
                    return Err(Error::MalformedFrame("expected Open from peer"));
                }
            }
        };

        let peer_max_frame_size = peer_open
            .effective_max_frame_size()
            .min(local_max_frame)
            .max(MIN_MAX_FRAME_SIZE);
        let channel_max = peer_open.effective_channel_max().min(options.channel_max);
        let keepalive = peer_open.idle_timeout.map(|t| t / 2);
        let read_timeout = (!options.idle_timeout.is_zero()).then(|| options.idle_timeout * 2);

        let Handshake {
            read,
            write,
            buf,
            decoder,
            encoder,
            ..
        } = handshake;

        let mut framed_read = FramedRead::new(read, decoder);
        // bytes the peer pipelined behind its Open stay in the stream
        framed_read.read_buffer_mut().extend_from_slice(&buf);
        let framed_write = FramedWrite::new(write, encoder);

        let shutdown = Shutdown::new();
        let (writer_tx, writer_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(16);

        let shared = Arc::new(ConnShared {
            container_id,
            peer_open,
            peer_max_frame_size,
            channel_max,
            writer_tx: writer_tx.clone(),
            control_tx,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(
            Writer {
                framed: framed_write,
                writer_rx,
                keepalive,
                shutdown: shutdown.clone(),
            }
            .run(),
        );
        tokio::spawn(
            Reader {
                framed: framed_read,
                control_rx,
                writer_tx,
                read_timeout,
                channel_max,
                channels: BTreeSet::new(),
                sessions: HashMap::new(),
                by_remote: HashMap::new(),
                close_reply: None,
                shutdown,
            }
            .run(),
        );

        Ok(Self { shared })
    }

    /// The container id advertised in Open.
    #[must_use]
    pub fn container_id(&self) -> &str { &self.shared.container_id }

    /// The peer's Open performative, as received.
    #[must_use]
    pub fn peer_open(&self) -> &Open { &self.shared.peer_open }

    /// The effective max-frame-size for outgoing frames.
    #[must_use]
    pub fn max_frame_size(&self) -> u32 { self.shared.peer_max_frame_size }

    /// The effective channel-max for this connection.
    #[must_use]
    pub fn channel_max(&self) -> u16 { self.shared.channel_max }

    /// Begin a new session on a free channel.
    pub async fn begin_session(
        &self,
        ct: &CancellationToken,
        options: SessionOptions,
    ) -> Result<Session> {
        let (incoming_tx, mut incoming_rx) = mpsc::channel(256);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .control_tx
            .send(ConnControl::AllocateChannel {
                incoming: incoming_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.terminal_error())?;
        let channel = reply_rx.await.map_err(|_| self.terminal_error())??;

        let begin = Begin {
            next_outgoing_id: crate::encoding::SerialNumber(0),
            incoming_window: options.incoming_window,
            outgoing_window: options.outgoing_window,
            handle_max: options.handle_max,
            ..Begin::default()
        };
        self.shared
            .send_frame(Frame {
                channel,
                body: FrameBody::Begin(begin),
            })
            .await?;

        let remote = loop {
            let body = tokio::select! {
                body = incoming_rx.recv() => body,
                () = self.shared.shutdown.closed() => return Err(self.terminal_error()),
                () = ct.cancelled() => {
                    // the Begin is on the wire: finish the handshake and
                    // end the session so the channel is reusable
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        let _ = tokio::time::timeout(
                            crate::link::CLEANUP_DEADLINE,
                            abandon_session(&shared, channel, incoming_rx),
                        )
                        .await;
                    });
                    return Err(Error::Cancelled);
                }
            };
            match body {
                Some(FrameBody::Begin(begin)) => break begin,
                Some(FrameBody::End(end)) => {
                    self.shared.release_channel(channel).await;
                    return Err(Error::SessionEnded(end.error));
                }
                Some(other) => {
                    log::warn!("expected Begin on ch={channel}, got {}", other.name());
                }
                None => return Err(self.terminal_error()),
            }
        };

        Ok(SessionDriver::spawn(SessionBootstrap {
            channel,
            conn: self.shared.clone(),
            incoming_rx,
            options,
            remote,
        }))
    }

    /// Close the connection: send Close, await the peer's Close, shut down
    /// every session and link.
    pub async fn close(&self, ct: &CancellationToken) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .shared
            .control_tx
            .send(ConnControl::Close { reply: reply_tx })
            .await
            .is_err()
        {
            // already terminated; a clean prior close reports success
            return match self.shared.shutdown.error_or(Error::ConnectionClosed(None)) {
                Error::ConnectionClosed(None) => Ok(()),
                err => Err(err),
            };
        }
        tokio::select! {
            res = reply_rx => res.unwrap_or(Ok(())),
            () = ct.cancelled() => Err(Error::Cancelled),
        }
    }

    fn terminal_error(&self) -> Error {
        self.shared.shutdown.error_or(Error::ConnectionClosed(None))
    }
}

/// Finish an abandoned Begin handshake: consume the peer Begin, then End.
async fn abandon_session(
    shared: &Arc<ConnShared>,
    channel: u16,
    mut incoming_rx: mpsc::Receiver<FrameBody>,
) {
    while let Some(body) = incoming_rx.recv().await {
        match body {
            FrameBody::Begin(_) => {
                let _ = shared
                    .send_frame(Frame {
                        channel,
                        body: FrameBody::End(crate::frames::End::default()),
                    })
                    .await;
            }
            FrameBody::End(_) => break,
            _ => {}
        }
    }
    shared.release_channel(channel).await;
}

/// Raw-buffer framing used before the reader and writer tasks exist.
pub(crate) struct Handshake<T> {
    read: ReadHalf<T>,
    write: WriteHalf<T>,
    buf: BytesMut,
    out: BytesMut,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Handshake<T> {
    /// Write our protocol header and require the identical one back.
    async fn exchange_header(&mut self, protocol_id: u8) -> Result<()> {
        let header = [b'A', b'M', b'Q', b'P', protocol_id, 1, 0, 0];
        self.write.write_all(&header).await?;
        while self.buf.len() < 8 {
            if self.read.read_buf(&mut self.buf).await? == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
        let peer: [u8; 8] = self.buf.split_to(8)[..].try_into().expect("8 bytes");
        if peer != header {
            return Err(Error::VersionMismatch { peer });
        }
        Ok(())
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        use tokio_util::codec::Decoder;
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(frame);
            }
            if self.read.read_buf(&mut self.buf).await? == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    pub(crate) async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        use tokio_util::codec::Encoder;
        self.out.clear();
        self.encoder.encode(frame, &mut self.out)?;
        self.write.write_all(&self.out).await?;
        Ok(())
    }
}

struct Writer<T> {
    framed: FramedWrite<WriteHalf<T>, FrameEncoder>,
    writer_rx: mpsc::Receiver<Frame>,
    /// Half the peer's idle window; `None` disables keepalives.
    keepalive: Option<Duration>,
    shutdown: Shutdown,
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Writer<T> {
    async fn run(mut self) {
        match self.drive().await {
            Ok(()) => {
                // shutdown: flush frames already queued (a Close may be
                // among them) before dropping the transport
                while let Ok(frame) = self.writer_rx.try_recv() {
                    if self.framed.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            Err(err) => {
                log::debug!("connection writer terminating: {err}");
                self.shutdown.close(err);
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let mut last_write = Instant::now();
        loop {
            let keepalive_at = self.keepalive.map(|k| last_write + k);
            tokio::select! {
                biased;

                () = self.shutdown.closed() => return Ok(()),

                frame = self.writer_rx.recv() => match frame {
                    Some(frame) => {
                        self.framed.send(frame).await?;
                        last_write = Instant::now();
                    }
                    None => return Ok(()),
                },

                () = sleep_until(keepalive_at), if keepalive_at.is_some() => {
                    self.framed.send(Frame::keepalive()).await?;
                    last_write = Instant::now();
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Reader<T> {
    framed: FramedRead<ReadHalf<T>, FrameDecoder>,
    control_rx: mpsc::Receiver<ConnControl>,
    writer_tx: mpsc::Sender<Frame>,
    /// Twice the local idle window; `None` disables enforcement.
    read_timeout: Option<Duration>,
    channel_max: u16,
    channels: BTreeSet<u16>,
    sessions: HashMap<u16, mpsc::Sender<FrameBody>>,
    by_remote: HashMap<u16, u16>,
    close_reply: Option<oneshot::Sender<Result<()>>>,
    shutdown: Shutdown,
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Reader<T> {
    async fn run(mut self) {
        let err = match self.drive().await {
            Ok(()) => Error::ConnectionClosed(None),
            Err(err) => err,
        };
        log::debug!("connection reader terminating: {err}");
        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(match &err {
                Error::ConnectionClosed(None) => Ok(()),
                other => Err(other.clone()),
            });
        }
        self.shutdown.close(err);
        // dropping the session queues wakes any driver not yet watching
        // the shutdown token
        self.sessions.clear();
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let frame = tokio::select! {
                biased;

                () = self.shutdown.closed() => {
                    return Err(self.shutdown.error_or(Error::ConnectionClosed(None)));
                }

                Some(control) = self.control_rx.recv() => {
                    self.handle_control(control).await?;
                    continue;
                }

                frame = read_with_timeout(&mut self.framed, self.read_timeout) => match frame {
                    Ok(frame) => frame,
                    Err(Error::IdleTimeout) => {
                        let error = RemoteError::new(condition::RESOURCE_LIMIT_EXCEEDED)
                            .with_description("no traffic within twice the idle timeout");
                        let _ = self
                            .writer_tx
                            .send(Frame::connection(FrameBody::Close(Close {
                                error: Some(error),
                            })))
                            .await;
                        return Err(Error::IdleTimeout);
                    }
                    Err(err) => return Err(err),
                },
            };

            match frame.body {
                FrameBody::Close(close) => return self.handle_close(close).await,
                FrameBody::Empty => {}
                body => self.route(frame.channel, body).await?,
            }
        }
    }

    async fn handle_control(&mut self, control: ConnControl) -> Result<()> {
        match control {
            ConnControl::AllocateChannel { incoming, reply } => {
                let _ = reply.send(self.allocate_channel(incoming));
            }
            ConnControl::ReleaseChannel { channel } => {
                self.channels.remove(&channel);
                self.sessions.remove(&channel);
                self.by_remote.retain(|_, local| *local != channel);
            }
            ConnControl::Close { reply } => {
                if self.close_reply.is_some() {
                    let _ = reply.send(Ok(()));
                } else {
                    self.close_reply = Some(reply);
                    self.writer_tx
                        .send(Frame::connection(FrameBody::Close(Close::default())))
                        .await
                        .map_err(|_| {
                            self.shutdown.error_or(Error::ConnectionClosed(None))
                        })?;
                }
            }
        }
        Ok(())
    }

    fn allocate_channel(&mut self, incoming: mpsc::Sender<FrameBody>) -> Result<u16> {
        let mut candidate = 0u16;
        for used in &self.channels {
            if *used != candidate {
                break;
            }
            candidate = candidate
                .checked_add(1)
                .ok_or(Error::InvalidOperation("channel space exhausted"))?;
        }
        if candidate > self.channel_max {
            return Err(Error::InvalidOperation("no free channel on connection"));
        }
        self.channels.insert(candidate);
        self.sessions.insert(candidate, incoming);
        Ok(candidate)
    }

    async fn route(&mut self, channel: u16, body: FrameBody) -> Result<()> {
        if channel > self.channel_max {
            return self
                .framing_error("frame channel above negotiated channel-max")
                .await;
        }
        let local = if let FrameBody::Begin(begin) = &body {
            let Some(local) = begin.remote_channel else {
                return self.framing_error("peer Begin without remote-channel").await;
            };
            self.by_remote.insert(channel, local);
            local
        } else {
            match self.by_remote.get(&channel) {
                Some(local) => *local,
                None => return self.framing_error("frame on unmapped channel").await,
            }
        };

        if let Some(session) = self.sessions.get(&local) {
            if session.send(body).await.is_err() {
                log::debug!("dropping frame for finished session on ch={local}");
            }
        } else {
            return self.framing_error("frame for unknown session").await;
        }
        Ok(())
    }

    async fn handle_close(&mut self, close: Close) -> Result<()> {
        if self.close_reply.is_some() {
            // our Close is already out; the peer's ack completes the
            // handshake cleanly
            return Ok(());
        }
        let error = close.error;
        let _ = self
            .writer_tx
            .send(Frame::connection(FrameBody::Close(Close::default())))
            .await;
        Err(Error::ConnectionClosed(error))
    }

    /// Terminate with a framing error, telling the peer why.
    async fn framing_error(&mut self, description: &'static str) -> Result<()> {
        let error = RemoteError::new(condition::FRAMING_ERROR).with_description(description);
        let _ = self
            .writer_tx
            .send(Frame::connection(FrameBody::Close(Close {
                error: Some(error),
            })))
            .await;
        Err(Error::MalformedFrame(description))
    }
}

async fn read_with_timeout<T>(
    framed: &mut FramedRead<ReadHalf<T>, FrameDecoder>,
    timeout: Option<Duration>,
) -> Result<Frame>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let next = async {
        match framed.next().await {
            Some(frame) => frame,
            None => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
        }
    };
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, next)
            .await
            .map_err(|_| Error::IdleTimeout)?,
        None => next.await,
    }
}
