//! One client ↔ backend pair, owned by a single task.
//!
//! ```text
//! CONNECTING ──dial ok──▶ RELAYING ──leg closes──▶ CLOSING ──handshakes done──▶ CLOSED
//!     │                                               ▲
//!     └──dial failed / client gone / shutdown ────────┘
//! ```
//!
//! While connecting, client frames are queued in arrival order and flushed to
//! the backend once it is open. A close observed on one leg is replayed on the
//! other with a code the transport is allowed to send. Each leg is closed at
//! most once; the registry slot is released when the pair is dropped.

use futures_util::{
    future,
    sink::{Sink, SinkExt},
    stream::{Stream, StreamExt},
};
use std::{collections::VecDeque, fmt, future::Future, pin::Pin, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
    time::{self, Instant, Interval, MissedTickBehavior, timeout},
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as WsError, Message, Utf8Bytes,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::{dialer::DialError, lifecycle::shutdown_requested, registry::ConnectionLease};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
pub const CLOSE_TLS_FAILURE: u16 = 1015;

pub const SHUTDOWN_REASON: &str = "Server shutting down";
pub const QUEUE_OVERFLOW_REASON: &str = "Backend not ready";

/// Close frames carry at most 125 payload bytes, two of which are the code.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Maps a close code observed on one leg to one that may be sent on the other.
///
/// 1004, 1005, 1006 and 1015 are never put on the wire, and anything outside
/// 1000..=4999 is not a valid application code; all of them become 1000.
#[must_use]
pub const fn relayable_close_code(code: u16) -> u16 {
    match code {
        1004 | CLOSE_NO_STATUS | CLOSE_ABNORMAL | CLOSE_TLS_FAILURE => CLOSE_NORMAL,
        1000..=4999 => code,
        _ => CLOSE_NORMAL,
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Backend,
            Self::Backend => Self::Client,
        }
    }

    const fn default_close_reason(self) -> &'static str {
        match self {
            Self::Client => "Client closed",
            Self::Backend => "Backend closed",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Backend => f.write_str("backend"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Connecting,
    Relaying,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub ping_interval: Duration,
    /// Bound on any single write to a leg and on waiting for the peer's close answer.
    pub close_timeout: Duration,
    pub max_queued_messages: usize,
}

#[derive(Debug, Clone)]
pub struct PairInfo {
    pub id: u64,
    pub source_ip: String,
    pub path: String,
}

type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type FrameSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegStatus {
    Open,
    /// Close seen or sent; only the close handshake remains.
    Closed,
    /// A write failed or stalled; the socket is dropped without further I/O.
    Terminated,
}

struct Leg {
    side: Side,
    sink: FrameSink,
    source: FrameSource,
    status: LegStatus,
}

impl Leg {
    fn new<S>(side: Side, socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = socket.split();
        Self {
            side,
            sink: Box::pin(sink),
            source: Box::pin(source),
            status: LegStatus::Open,
        }
    }

    fn is_open(&self) -> bool {
        self.status == LegStatus::Open
    }

    async fn send_close(&mut self, code: u16, reason: &str, limit: Duration) {
        self.status = LegStatus::Closed;
        let reason = truncate_reason(reason);
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from(reason.to_string()),
        };

        match timeout(limit, self.sink.send(Message::Close(Some(frame)))).await {
            Ok(Ok(())) => debug!(leg = %self.side, code, reason, "Close frame sent"),
            Ok(Err(e)) => {
                warn!(leg = %self.side, error = %e, "Failed to close leg cleanly, terminating");
                self.status = LegStatus::Terminated;
            }
            Err(_) => {
                warn!(leg = %self.side, "Timed out closing leg, terminating");
                self.status = LegStatus::Terminated;
            }
        }
    }

    /// Sends one data frame. A peer that stops reading fails the send once `limit` elapses.
    async fn send_data(&mut self, message: Message, limit: Duration) -> Result<(), String> {
        match timeout(limit, self.sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("write stalled for {limit:?}")),
        }
    }

    async fn ping(&mut self, limit: Duration) {
        match timeout(limit, self.sink.send(Message::Ping(Vec::new().into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(leg = %self.side, error = %e, "Keepalive ping failed"),
            Err(_) => debug!(leg = %self.side, "Keepalive ping timed out"),
        }
    }

    /// Reads until the peer finishes the close handshake or the socket fails.
    async fn drain(&mut self) {
        if self.status == LegStatus::Terminated {
            return;
        }
        while let Some(Ok(_)) = self.source.next().await {}
    }
}

enum Event {
    Frame(Side, Message),
    Closed { side: Side, code: u16, reason: String },
    Failed { side: Side, error: String },
    Keepalive,
    Shutdown,
    Ignored,
}

impl Event {
    fn read(side: Side, item: Option<Result<Message, WsError>>) -> Self {
        match item {
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => Self::Frame(side, message),
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame.map_or_else(
                    || (CLOSE_NO_STATUS, String::new()),
                    |frame| (u16::from(frame.code), frame.reason.as_str().to_owned()),
                );
                Self::Closed { side, code, reason }
            }
            // Pings are answered by the transport; pongs and raw frames carry nothing to relay.
            Some(Ok(_)) => Self::Ignored,
            Some(Err(e)) => Self::Failed {
                side,
                error: e.to_string(),
            },
            None => Self::Closed {
                side,
                code: CLOSE_ABNORMAL,
                reason: String::new(),
            },
        }
    }
}

struct PendingQueue {
    messages: VecDeque<Message>,
    limit: usize,
}

impl PendingQueue {
    fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit,
        }
    }

    /// Returns `false` when the queue is full; the message is not kept.
    fn push(&mut self, message: Message) -> bool {
        if self.messages.len() >= self.limit {
            return false;
        }
        self.messages.push_back(message);
        true
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn take(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.messages)
    }
}

struct ConnectionPair {
    settings: RelaySettings,
    state: PairState,
    client: Leg,
    backend: Option<Leg>,
    pending: PendingQueue,
    keepalive: Interval,
    shutdown: watch::Receiver<bool>,
    _lease: ConnectionLease,
}

/// Runs one pair from accepted client upgrade to full teardown.
///
/// `dial` opens the backend leg; client frames that arrive before it resolves
/// are queued. The registry slot held by `lease` is released when this returns.
#[tracing::instrument(
    name = "pair",
    skip_all,
    fields(pair_id = info.id, client_ip = %info.source_ip, path = %info.path)
)]
pub async fn run<C, B, D>(
    info: PairInfo,
    settings: RelaySettings,
    client: WebSocketStream<C>,
    dial: D,
    shutdown: watch::Receiver<bool>,
    lease: ConnectionLease,
) where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: Future<Output = Result<WebSocketStream<B>, DialError>>,
{
    info!("New connection");
    let mut pair = ConnectionPair::new(settings, client, shutdown, lease);

    if let Some(backend) = pair.connect(dial).await {
        pair.relay(backend).await;
    }
    pair.finish().await;
}

impl ConnectionPair {
    fn new<C>(
        settings: RelaySettings,
        client: WebSocketStream<C>,
        shutdown: watch::Receiver<bool>,
        lease: ConnectionLease,
    ) -> Self
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut keepalive = time::interval_at(
            Instant::now() + settings.ping_interval,
            settings.ping_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            settings,
            state: PairState::Connecting,
            client: Leg::new(Side::Client, client),
            backend: None,
            pending: PendingQueue::new(settings.max_queued_messages),
            keepalive,
            shutdown,
            _lease: lease,
        }
    }

    fn transition(&mut self, next: PairState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Pair state change");
            self.state = next;
        }
    }

    fn leg_mut(&mut self, side: Side) -> Option<&mut Leg> {
        match side {
            Side::Client => Some(&mut self.client),
            Side::Backend => self.backend.as_mut(),
        }
    }

    /// CONNECTING: waits for the dial while queueing client frames.
    async fn connect<B, D>(&mut self, dial: D) -> Option<WebSocketStream<B>>
    where
        D: Future<Output = Result<WebSocketStream<B>, DialError>>,
    {
        tokio::pin!(dial);
        let close_timeout = self.settings.close_timeout;

        loop {
            let event = tokio::select! {
                result = &mut dial => return self.dial_finished(result).await,
                item = self.client.source.next() => Event::read(Side::Client, item),
                _ = self.keepalive.tick() => Event::Keepalive,
                () = shutdown_requested(&mut self.shutdown) => Event::Shutdown,
            };

            match event {
                Event::Frame(_, message) => {
                    if !self.pending.push(message) {
                        warn!(
                            limit = self.settings.max_queued_messages,
                            "Queue full before backend connected, closing client"
                        );
                        self.client
                            .send_close(CLOSE_TRY_AGAIN_LATER, QUEUE_OVERFLOW_REASON, close_timeout)
                            .await;
                        return None;
                    }
                    debug!(queued = self.pending.len(), "Queued message (backend not ready)");
                }
                Event::Closed { code, reason, .. } => {
                    info!(code, reason = %reason, "Client disconnected before backend connected");
                    self.client.status = LegStatus::Closed;
                    return None;
                }
                Event::Failed { error, .. } => {
                    warn!(error = %error, "Client error before backend connected");
                    self.client.status = LegStatus::Closed;
                    return None;
                }
                Event::Keepalive => self.client.ping(close_timeout).await,
                Event::Shutdown => {
                    self.client
                        .send_close(CLOSE_GOING_AWAY, SHUTDOWN_REASON, close_timeout)
                        .await;
                    return None;
                }
                Event::Ignored => {}
            }
        }
    }

    async fn dial_finished<B>(
        &mut self,
        result: Result<WebSocketStream<B>, DialError>,
    ) -> Option<WebSocketStream<B>> {
        match result {
            Ok(backend) => Some(backend),
            Err(err) => {
                if let DialError::Rejected { status, body } = &err {
                    warn!(status, body = %body, "Backend rejected upgrade");
                } else {
                    warn!(error = %err, "Backend dial failed");
                }
                self.client
                    .send_close(
                        CLOSE_INTERNAL_ERROR,
                        &err.close_reason(),
                        self.settings.close_timeout,
                    )
                    .await;
                None
            }
        }
    }

    /// RELAYING: flushes the queue, then forwards until both legs are closed.
    async fn relay<B>(&mut self, backend: WebSocketStream<B>)
    where
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.backend = Some(Leg::new(Side::Backend, backend));
        info!("Backend connection established");

        let queued = self.pending.take();
        if !queued.is_empty() {
            debug!(count = queued.len(), "Sending queued messages to backend");
        }
        for message in queued {
            self.forward(Side::Client, message).await;
        }
        self.transition(PairState::Relaying);

        loop {
            let Some(backend) = self.backend.as_mut() else {
                break;
            };
            let client = &mut self.client;
            if !client.is_open() && !backend.is_open() {
                break;
            }

            let event = tokio::select! {
                item = client.source.next(), if client.is_open() => Event::read(Side::Client, item),
                item = backend.source.next(), if backend.is_open() => Event::read(Side::Backend, item),
                _ = self.keepalive.tick() => Event::Keepalive,
                () = shutdown_requested(&mut self.shutdown) => Event::Shutdown,
            };
            self.handle(event).await;
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Frame(from, message) => self.forward(from, message).await,
            Event::Closed { side, code, reason } => self.leg_closed(side, code, reason).await,
            Event::Failed { side, error } => self.leg_failed(side, &error).await,
            Event::Keepalive => self.keepalive().await,
            Event::Shutdown => self.shut_down().await,
            Event::Ignored => {}
        }
    }

    async fn forward(&mut self, from: Side, message: Message) {
        let to = from.peer();
        let bytes = message.len();
        let limit = self.settings.close_timeout;
        let Some(target) = self.leg_mut(to) else {
            return;
        };
        if !target.is_open() {
            debug!(from = %from, bytes, "Destination leg not open, dropping message");
            return;
        }

        debug!(from = %from, bytes, "Forwarding message");
        if let Err(error) = target.send_data(message, limit).await {
            self.leg_failed(to, &error).await;
        }
    }

    /// A broken leg closes like an abnormal disconnect, then is never touched again.
    async fn leg_failed(&mut self, side: Side, error: &str) {
        warn!(leg = %side, error, "Leg transport error");
        self.leg_closed(side, CLOSE_ABNORMAL, String::new()).await;
        if let Some(leg) = self.leg_mut(side) {
            leg.status = LegStatus::Terminated;
        }
    }

    /// Records that `side` closed and closes the other leg to match.
    async fn leg_closed(&mut self, side: Side, code: u16, reason: String) {
        let Some(leg) = self.leg_mut(side) else {
            return;
        };
        if !leg.is_open() {
            return;
        }
        leg.status = LegStatus::Closed;
        info!(leg = %side, code, reason = %reason, "Leg disconnected");
        self.transition(PairState::Closing);

        let code = relayable_close_code(code);
        let reason = if reason.is_empty() {
            side.default_close_reason().to_string()
        } else {
            reason
        };
        let close_timeout = self.settings.close_timeout;
        if let Some(peer) = self.leg_mut(side.peer()) {
            if peer.is_open() {
                peer.send_close(code, &reason, close_timeout).await;
            }
        }
    }

    async fn keepalive(&mut self) {
        let limit = self.settings.close_timeout;
        if self.client.is_open() {
            self.client.ping(limit).await;
        }
        if let Some(backend) = self.backend.as_mut() {
            if backend.is_open() {
                backend.ping(limit).await;
            }
        }
    }

    async fn shut_down(&mut self) {
        let limit = self.settings.close_timeout;
        if self.client.is_open() {
            info!("Closing client for shutdown");
            self.client
                .send_close(CLOSE_GOING_AWAY, SHUTDOWN_REASON, limit)
                .await;
            self.transition(PairState::Closing);
        }
        if let Some(backend) = self.backend.as_mut() {
            if backend.is_open() {
                backend
                    .send_close(CLOSE_GOING_AWAY, SHUTDOWN_REASON, limit)
                    .await;
            }
        }
    }

    /// CLOSING → CLOSED: lets both close handshakes finish, bounded, then drops everything.
    async fn finish(mut self) {
        self.transition(PairState::Closing);

        let limit = self.settings.close_timeout;
        let client = &mut self.client;
        let backend = self.backend.as_mut();
        let drained = timeout(limit, async move {
            match backend {
                Some(backend) => {
                    future::join(client.drain(), backend.drain()).await;
                }
                None => client.drain().await,
            }
        })
        .await;
        if drained.is_err() {
            debug!("Close handshake did not finish in time, terminating");
        }

        self.transition(PairState::Closed);
        info!("Connection closed");
    }
}
