//! Transport core: one TCP (or TLS) connection, a frame read loop, a frame
//! write loop, keepalive probing, server-driven backpressure and
//! exponential-backoff reconnection.
//!
//! Connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Ready -> Draining -> Closed
//!                     ^                          |
//!                     +------- Reconnecting <----+
//! ```
//!
//! Exactly one task reads from the socket and exactly one writes; both are
//! driven cooperatively by the supervisor. Requests are multiplexed by
//! correlation id; server-initiated frames arrive with correlation id 0 and
//! are handled inline by transport policy.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use lwp_core::{KEEPALIVE_IDLE_SECS, KEEPALIVE_PROBE_SECS, MAX_PAYLOAD_LEN};
use lwp_wire::{
    encode_frame, parse_frame, Frame, HelloAckPayload, HelloPayload, Opcode, TlsClientConfig,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::config::ReconnectConfig;
use crate::error::{ClientError, Result};
use crate::multiplexer::Multiplexer;

/// Wrapper enum for TCP and TLS streams to avoid dynamic dispatch.
#[allow(clippy::large_enum_variant)]
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
    Draining,
    Closed,
}

/// Transport tuning knobs shared by all three façades.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect: ReconnectConfig,
    /// Inbound idle time before a PING probe.
    pub keepalive_idle: Duration,
    /// Time allowed for any inbound frame after a PING probe.
    pub keepalive_probe: Duration,
    /// How long a server pause may last before the client resumes on its own.
    pub backpressure_grace: Duration,
    /// Bounded depth of the outgoing frame queue.
    pub write_queue_depth: usize,
    pub tls: Option<TlsClientConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
            keepalive_idle: Duration::from_secs(KEEPALIVE_IDLE_SECS),
            keepalive_probe: Duration::from_secs(KEEPALIVE_PROBE_SECS),
            backpressure_grace: Duration::from_secs(10),
            write_queue_depth: 128,
            tls: None,
        }
    }
}

struct Shared {
    pending: Multiplexer,
    next_correlation: AtomicU64,
    state_tx: watch::Sender<ConnState>,
    paused_tx: watch::Sender<bool>,
    payload_cap: AtomicU32,
    request_timeout: Duration,
}

impl Shared {
    fn set_state(&self, state: ConnState) {
        let _ = self.state_tx.send(state);
    }

    fn set_paused(&self, paused: bool) {
        let _ = self.paused_tx.send(paused);
    }

    fn allocate_correlation(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::SeqCst)
    }

    fn payload_cap(&self) -> u32 {
        self.payload_cap.load(Ordering::Relaxed)
    }
}

/// Handle to an in-flight request: awaiting it yields the paired response.
///
/// Dropping the handle (or timing out) abandons the completion; a late
/// response is drained by the read loop and discarded.
pub struct PendingReply {
    correlation_id: u64,
    request_opcode: Opcode,
    rx: oneshot::Receiver<Result<Frame>>,
    shared: Arc<Shared>,
}

impl PendingReply {
    #[must_use]
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Wait for the response, enforcing the transport's request timeout.
    pub async fn await_reply(self) -> Result<Frame> {
        let timeout = self.shared.request_timeout;
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => {
                self.shared.pending.abandon(self.correlation_id);
                Err(ClientError::Timeout)
            }
            // Completion dropped without firing: the supervisor tore the
            // connection down between registration and fail_all.
            Ok(Err(_)) => Err(ClientError::Connection(io::Error::other(
                "connection closed with request in flight",
            ))),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Ok(Ok(frame))) => {
                if frame.opcode == Opcode::Error {
                    return Err(ClientError::from_error_frame(&frame));
                }
                let expected = self.request_opcode.response_of();
                if frame.opcode != expected {
                    return Err(ClientError::InvalidFrame(format!(
                        "expected {:?} in reply to {:?}, got {:?}",
                        expected, self.request_opcode, frame.opcode
                    )));
                }
                Ok(frame)
            }
        }
    }
}

/// One LWP connection with multiplexed requests.
pub struct Transport {
    shared: Arc<Shared>,
    write_tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnState>,
    paused_rx: watch::Receiver<bool>,
}

impl Transport {
    /// Spawn the connection supervisor without waiting for Ready.
    #[must_use]
    pub fn start(host: impl Into<String>, port: u16, config: TransportConfig) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
        let (paused_tx, paused_rx) = watch::channel(false);
        let (write_tx, write_rx) = mpsc::channel(config.write_queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            pending: Multiplexer::new(),
            next_correlation: AtomicU64::new(1),
            state_tx,
            paused_tx,
            payload_cap: AtomicU32::new(MAX_PAYLOAD_LEN),
            request_timeout: config.request_timeout,
        });

        let supervisor_shared = shared.clone();
        let host = host.into();
        tokio::spawn(async move {
            supervise(host, port, config, supervisor_shared, write_rx, shutdown_rx).await;
        });

        Arc::new(Self {
            shared,
            write_tx,
            shutdown_tx,
            state_rx,
            paused_rx,
        })
    }

    /// Connect and wait until the handshake completes.
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        config: TransportConfig,
    ) -> Result<Arc<Self>> {
        let transport = Self::start(host, port, config);
        transport.wait_ready().await?;
        Ok(transport)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// True while the server has production paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused_rx.borrow()
    }

    /// Negotiated payload cap (16 MiB until HELLO_ACK says otherwise).
    #[must_use]
    pub fn payload_cap(&self) -> u32 {
        self.shared.payload_cap()
    }

    /// Allocate the next correlation id. Strictly monotonic per transport.
    #[must_use]
    pub fn next_correlation(&self) -> u64 {
        self.shared.allocate_correlation()
    }

    /// Block until the transport reaches Ready, or fail if it closes first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                ConnState::Ready => return Ok(()),
                ConnState::Closed => {
                    return Err(ClientError::Connection(io::Error::other(
                        "transport closed before becoming ready",
                    )))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::Closed);
            }
        }
    }

    /// Register a completion and enqueue the frame for writing.
    ///
    /// The frame must already carry a correlation id from
    /// [`Transport::next_correlation`]. Frames are placed on the wire in
    /// submission order, so callers that need ordering submit from one task.
    pub async fn submit(&self, frame: Frame) -> Result<PendingReply> {
        match self.state() {
            ConnState::Closed | ConnState::Draining => return Err(ClientError::Closed),
            _ => {}
        }

        let correlation_id = frame.correlation_id;
        let request_opcode = frame.opcode;
        let rx = self.shared.pending.register(correlation_id, request_opcode);

        if self.write_tx.send(encode_frame(&frame)).await.is_err() {
            self.shared.pending.abandon(correlation_id);
            return Err(ClientError::Closed);
        }

        Ok(PendingReply {
            correlation_id,
            request_opcode,
            rx,
            shared: self.shared.clone(),
        })
    }

    /// Submit a request and wait for its paired response.
    pub async fn request(&self, frame: Frame) -> Result<Frame> {
        self.submit(frame).await?.await_reply().await
    }

    /// Round-trip a PING and return the latency.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let frame = Frame::ping(self.next_correlation());
        self.request(frame).await?;
        Ok(start.elapsed())
    }

    /// Drain outstanding responses (bounded by the request timeout), then
    /// close the connection.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == ConnState::Closed {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state())
            .field("paused", &self.is_paused())
            .finish()
    }
}

enum Exit {
    Shutdown,
    Failed(ClientError),
}

enum EstablishError {
    /// Worth another attempt: refused, timeout, I/O failure mid-handshake.
    Transient(ClientError),
    /// Protocol violation during the handshake; retrying cannot help.
    Fatal(ClientError),
}

async fn supervise(
    host: String,
    port: u16,
    config: TransportConfig,
    shared: Arc<Shared>,
    mut write_rx: mpsc::Receiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow_and_update() {
            finish(&shared, || ClientError::Closed);
            return;
        }

        shared.set_state(ConnState::Connecting);
        let established = tokio::select! {
            result = establish(&host, port, &config, &shared) => result,
            _ = shutdown_rx.changed() => {
                finish(&shared, || ClientError::Closed);
                return;
            }
        };

        match established {
            Ok(stream) => {
                attempt = 0;
                shared.set_paused(false);
                shared.set_state(ConnState::Ready);
                debug!(host = %host, port, "transport ready");

                match run_ready(stream, &config, &shared, &mut write_rx, &mut shutdown_rx).await {
                    Exit::Shutdown => {
                        finish(&shared, || ClientError::Closed);
                        return;
                    }
                    Exit::Failed(ClientError::Closed) => {
                        // Every handle is gone; nothing left to reconnect for.
                        finish(&shared, || ClientError::Closed);
                        return;
                    }
                    Exit::Failed(err) => {
                        warn!(error = %err, "connection lost");
                        shared.pending.fail_all(|| {
                            ClientError::Connection(io::Error::other("connection closed"))
                        });
                        if !config.auto_reconnect {
                            shared.set_state(ConnState::Closed);
                            return;
                        }
                    }
                }
            }
            Err(EstablishError::Fatal(err)) => {
                warn!(error = %err, "handshake failed");
                finish(&shared, move || err.duplicate());
                return;
            }
            Err(EstablishError::Transient(err)) => {
                debug!(error = %err, attempt, "connect attempt failed");
                if !config.auto_reconnect {
                    finish(&shared, || {
                        ClientError::Connection(io::Error::other("connect failed"))
                    });
                    return;
                }
            }
        }

        attempt += 1;
        if config.reconnect.max_attempts > 0 && attempt > config.reconnect.max_attempts {
            warn!(attempt, "giving up after max reconnect attempts");
            finish(&shared, || {
                ClientError::Connection(io::Error::other("max reconnect attempts exceeded"))
            });
            return;
        }

        shared.set_state(ConnState::Reconnecting);
        let delay = config.reconnect.delay_for_attempt(attempt - 1);
        trace!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                finish(&shared, || ClientError::Closed);
                return;
            }
        }
    }
}

fn finish(shared: &Shared, make_err: impl Fn() -> ClientError) {
    shared.pending.fail_all(make_err);
    shared.set_state(ConnState::Closed);
}

async fn establish(
    host: &str,
    port: u16,
    config: &TransportConfig,
    shared: &Shared,
) -> std::result::Result<ClientStream, EstablishError> {
    let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| EstablishError::Transient(ClientError::Timeout))?
        .map_err(|e| EstablishError::Transient(ClientError::Connection(e)))?;

    tcp.set_nodelay(true)
        .map_err(|e| EstablishError::Transient(ClientError::Connection(e)))?;

    let mut stream = match &config.tls {
        Some(tls) => {
            let connector = tls.connector().map_err(|e| {
                EstablishError::Fatal(ClientError::Connection(io::Error::other(e.to_string())))
            })?;
            let sni = tls.sni_for(host).map_err(|e| {
                EstablishError::Fatal(ClientError::Connection(io::Error::other(e.to_string())))
            })?;
            let tls_stream = connector.connect(sni, tcp).await.map_err(|e| {
                EstablishError::Transient(ClientError::Connection(e))
            })?;
            ClientStream::Tls(tls_stream)
        }
        None => ClientStream::Tcp(tcp),
    };

    shared.set_state(ConnState::Handshaking);

    let hello_corr = shared.allocate_correlation();
    let hello = Frame::hello(hello_corr, HelloPayload::CAP_LZ4);
    stream
        .write_all(&encode_frame(&hello))
        .await
        .map_err(|e| EstablishError::Transient(ClientError::Connection(e)))?;

    let frame = read_one_frame(&mut stream, config.connect_timeout).await?;
    if frame.correlation_id != hello_corr {
        return Err(EstablishError::Fatal(ClientError::InvalidFrame(format!(
            "HELLO_ACK correlation mismatch: sent {}, got {}",
            hello_corr, frame.correlation_id
        ))));
    }

    match frame.opcode {
        Opcode::HelloAck => {
            let ack = HelloAckPayload::parse(&frame.payload)
                .map_err(|e| EstablishError::Fatal(ClientError::from(e)))?;
            let cap = if ack.max_payload_len == 0 {
                MAX_PAYLOAD_LEN
            } else {
                ack.max_payload_len.min(MAX_PAYLOAD_LEN)
            };
            shared.payload_cap.store(cap, Ordering::Relaxed);
            debug!(server_version = ack.version, payload_cap = cap, "handshake complete");
            Ok(stream)
        }
        Opcode::Error => Err(EstablishError::Fatal(ClientError::from_error_frame(&frame))),
        other => Err(EstablishError::Fatal(ClientError::InvalidFrame(format!(
            "expected HELLO_ACK, got {:?}",
            other
        )))),
    }
}

/// Read exactly one frame off the stream (handshake only; the read loop
/// takes over afterwards).
async fn read_one_frame(
    stream: &mut ClientStream,
    timeout: Duration,
) -> std::result::Result<Frame, EstablishError> {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        match parse_frame(&buf, MAX_PAYLOAD_LEN) {
            Ok(Some((frame, _consumed))) => return Ok(frame),
            Ok(None) => {}
            Err(e) => return Err(EstablishError::Fatal(ClientError::from(e))),
        }

        tokio::select! {
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => {
                    return Err(EstablishError::Transient(ClientError::Connection(
                        io::Error::new(io::ErrorKind::UnexpectedEof, "server closed during handshake"),
                    )))
                }
                Ok(_) => {}
                Err(e) => return Err(EstablishError::Transient(ClientError::Connection(e))),
            },
            _ = &mut deadline => return Err(EstablishError::Transient(ClientError::Timeout)),
        }
    }
}

async fn run_ready(
    stream: ClientStream,
    config: &TransportConfig,
    shared: &Arc<Shared>,
    write_rx: &mut mpsc::Receiver<Bytes>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Exit {
    let (read_half, write_half) = tokio::io::split(stream);
    // Control frames (PONG replies) bypass the pausable data queue.
    let (control_tx, control_rx) = mpsc::channel::<Bytes>(8);
    let start = Instant::now();
    let last_inbound = Arc::new(AtomicU64::new(0));

    let read_fut = read_loop(read_half, shared, control_tx, last_inbound.clone(), start);
    let write_fut = write_loop(
        write_half,
        write_rx,
        control_rx,
        shared,
        config,
        last_inbound,
        start,
    );
    tokio::pin!(read_fut);
    tokio::pin!(write_fut);

    if !*shutdown_rx.borrow_and_update() {
        loop {
            tokio::select! {
                err = &mut read_fut => return Exit::Failed(err),
                err = &mut write_fut => return Exit::Failed(err),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow_and_update() {
                        break;
                    }
                }
            }
        }
    }

    // Draining: outstanding responses get up to request_timeout to land.
    shared.set_state(ConnState::Draining);
    debug!("draining transport");
    let deadline = tokio::time::sleep(config.request_timeout);
    tokio::pin!(deadline);

    loop {
        if shared.pending.is_empty() {
            return Exit::Shutdown;
        }
        tokio::select! {
            _ = &mut read_fut => return Exit::Shutdown,
            _ = &mut write_fut => return Exit::Shutdown,
            _ = &mut deadline => return Exit::Shutdown,
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    }
}

/// Parse frames end-to-end; returns only on error.
async fn read_loop(
    mut rd: ReadHalf<ClientStream>,
    shared: &Arc<Shared>,
    control_tx: mpsc::Sender<Bytes>,
    last_inbound: Arc<AtomicU64>,
    start: Instant,
) -> ClientError {
    let mut buf = BytesMut::with_capacity(64 * 1024);

    loop {
        loop {
            match parse_frame(&buf, shared.payload_cap()) {
                Ok(Some((frame, consumed))) => {
                    buf.advance(consumed);
                    last_inbound.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                    handle_inbound(frame, shared, &control_tx).await;
                }
                Ok(None) => break,
                // Protocol corruption forces a disconnect; in-flight callers
                // are failed by the supervisor.
                Err(e) => return ClientError::from(e),
            }
        }

        match rd.read_buf(&mut buf).await {
            Ok(0) => {
                return ClientError::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ))
            }
            Ok(_) => {}
            Err(e) => return ClientError::Connection(e),
        }
    }
}

async fn handle_inbound(frame: Frame, shared: &Arc<Shared>, control_tx: &mpsc::Sender<Bytes>) {
    // Correlation id 0 marks server-initiated frames; they are transport
    // policy, not routed through the multiplexer.
    if frame.correlation_id == 0 {
        match frame.opcode {
            Opcode::Backpressure => {
                warn!("server signaled backpressure, pausing writes");
                shared.set_paused(true);
            }
            Opcode::Resume => {
                debug!("server resumed, unpausing writes");
                shared.set_paused(false);
            }
            Opcode::Ping => {
                let pong = encode_frame(&Frame::pong(0));
                let _ = control_tx.send(pong).await;
            }
            other => trace!(opcode = ?other, "ignoring server frame"),
        }
        return;
    }

    if shared.pending.complete(frame.correlation_id, frame.clone()) {
        return;
    }

    if frame.opcode == Opcode::Pong {
        // Keepalive probe reply; the inbound timestamp already cleared the miss.
        trace!(correlation_id = frame.correlation_id, "keepalive pong");
    } else {
        warn!(
            correlation_id = frame.correlation_id,
            opcode = ?frame.opcode,
            "response for unknown correlation id, dropping"
        );
    }
}

/// Serialize outgoing frames from the bounded queue; returns only on error.
///
/// While the server has us paused, only control frames drain; accepted data
/// frames stay queued, so new submissions block once the queue fills.
async fn write_loop(
    mut wr: WriteHalf<ClientStream>,
    write_rx: &mut mpsc::Receiver<Bytes>,
    mut control_rx: mpsc::Receiver<Bytes>,
    shared: &Arc<Shared>,
    config: &TransportConfig,
    last_inbound: Arc<AtomicU64>,
    start: Instant,
) -> ClientError {
    let mut paused_rx = shared.paused_tx.subscribe();
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut ping_sent_at: Option<Instant> = None;
    let mut paused_since: Option<Instant> = None;

    loop {
        let paused = *paused_rx.borrow_and_update();

        tokio::select! {
            maybe = control_rx.recv() => {
                let Some(bytes) = maybe else {
                    return ClientError::Connection(io::Error::other("read loop gone"));
                };
                if let Err(e) = write_frame(&mut wr, &bytes).await {
                    return ClientError::Connection(e);
                }
            }
            maybe = write_rx.recv(), if !paused => {
                // None means every Transport handle was dropped.
                let Some(bytes) = maybe else { return ClientError::Closed };
                if let Err(e) = write_frame(&mut wr, &bytes).await {
                    return ClientError::Connection(e);
                }
            }
            _ = paused_rx.changed() => {}
            _ = tick.tick() => {
                let now = Instant::now();
                let inbound_ms = last_inbound.load(Ordering::Relaxed);

                // Keepalive: probe after idle, reconnect on a missed probe.
                if let Some(sent) = ping_sent_at {
                    let sent_ms = sent.duration_since(start).as_millis() as u64;
                    if inbound_ms > sent_ms {
                        ping_sent_at = None;
                    } else if sent.elapsed() >= config.keepalive_probe {
                        return ClientError::Connection(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "keepalive miss: no inbound frame after PING",
                        ));
                    }
                } else {
                    let idle = (start.elapsed().as_millis() as u64).saturating_sub(inbound_ms);
                    if idle >= config.keepalive_idle.as_millis() as u64 {
                        trace!("idle connection, sending keepalive PING");
                        let ping = encode_frame(&Frame::ping(shared.allocate_correlation()));
                        if let Err(e) = write_frame(&mut wr, &ping).await {
                            return ClientError::Connection(e);
                        }
                        ping_sent_at = Some(now);
                    }
                }

                // Backpressure grace: a pause with no RESUME eventually lifts.
                if paused {
                    match paused_since {
                        None => paused_since = Some(now),
                        Some(since) if since.elapsed() >= config.backpressure_grace => {
                            warn!("backpressure grace elapsed, resuming writes");
                            shared.set_paused(false);
                            paused_since = None;
                        }
                        Some(_) => {}
                    }
                } else {
                    paused_since = None;
                }
            }
        }
    }
}

async fn write_frame(wr: &mut WriteHalf<ClientStream>, bytes: &Bytes) -> io::Result<()> {
    wr.write_all(bytes).await?;
    wr.flush().await
}
