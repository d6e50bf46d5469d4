use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use proto::{
    ChannelArgs, ChannelNode, ErrorCode, Frame, GoAway, KeepaliveAction, KeepaliveState,
    KeepaliveThrottle, PingStrikeCounter, PingVerdict, Side, Status, StreamId, ThrottleOutcome,
    TraceContext,
};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant as TokioInstant, Sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace};

use crate::{mutex::Mutex, transport::Io};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// How a connection participates in the protocol
pub(crate) enum Role {
    /// Opens streams; reports `too_many_pings` to `throttle`
    Client {
        keepalive: Option<Duration>,
        throttle: Option<Arc<KeepaliveThrottle>>,
        channelz: Arc<ChannelNode>,
    },
    /// Accepts streams, handing them to `incoming`
    Server {
        incoming: mpsc::UnboundedSender<IncomingStream>,
    },
}

/// Stream opened by a peer
#[derive(Debug)]
pub(crate) struct IncomingStream {
    pub(crate) stream: StreamId,
    pub(crate) path: Arc<str>,
    pub(crate) authority: Option<Arc<str>>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) trace: Option<TraceContext>,
    /// Cancelled when the peer resets the stream or the connection dies
    pub(crate) cancel: CancellationToken,
}

/// Headers of a stream this side opens
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) path: Arc<str>,
    pub(crate) authority: Option<Arc<str>>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) trace: Option<TraceContext>,
}

/// Counted handle to a connection
///
/// When the last handle is dropped the connection is closed with a graceful GOAWAY. The
/// driver task does not count as a handle.
#[derive(Debug)]
pub(crate) struct ConnectionRef(Arc<ConnectionInner>);

impl ConnectionRef {
    /// Take over `io` and spawn the task driving it
    pub(crate) fn new(io: Io, args: &ChannelArgs, role: Role) -> Self {
        let now = crate::now();
        let (side, interval, incoming, throttle, channelz) = match role {
            Role::Client {
                keepalive,
                throttle,
                channelz,
            } => (Side::Client, keepalive, None, throttle, Some(channelz)),
            Role::Server { incoming } => (
                Side::Server,
                args.get_keepalive_time(),
                Some(incoming),
                None,
                None,
            ),
        };
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, %side, keepalive = ?interval, "connection established");

        let inner = Arc::new(ConnectionInner {
            state: Mutex::new(State {
                id,
                side,
                tx: Some(io.tx),
                rx: io.rx,
                bdp_probe: args.get_bdp_probe() && side.is_client(),
                drain_grace_period: args.get_drain_grace_period(),
                keepalive: KeepaliveState::new(args, interval, now),
                strikes: PingStrikeCounter::new(args),
                streams: FxHashMap::default(),
                next_stream: Some(StreamId::FIRST_CLIENT),
                last_peer_stream: StreamId::ZERO,
                incoming,
                throttle,
                channelz,
                user_pings: FxHashMap::default(),
                bdp_outstanding: None,
                goaway_received: None,
                drain_deadline: None,
                timer: None,
                timer_deadline: None,
                driver: None,
                error: None,
                closed: CancellationToken::new(),
                ref_count: 1,
            }),
        });
        tokio::spawn(ConnectionDriver(inner.clone()));
        Self(inner)
    }

    /// Open a stream carrying `request`
    ///
    /// The receiver yields the stream's final status. Fails if the connection is closed or
    /// the peer announced a GOAWAY, in which case another connection should be used.
    pub(crate) fn open_stream(
        &self,
        request: Request,
    ) -> Result<(StreamId, oneshot::Receiver<Status>), ConnectionError> {
        let now = crate::now();
        let mut state = self.0.state.lock("open_stream");
        if let Some(ref e) = state.error {
            return Err(e.clone());
        }
        if let Some(ref goaway) = state.goaway_received {
            return Err(ConnectionError::GoAway(goaway.clone()));
        }
        let stream = state
            .next_stream
            .ok_or(ConnectionError::StreamIdsExhausted)?;
        state.next_stream = stream.next();

        let (tx, rx) = oneshot::channel();
        state.streams.insert(stream, StreamSlot::Client { done: tx });
        state.send_stream_frame(Frame::Headers {
            stream,
            path: request.path,
            authority: request.authority,
            timeout: request.deadline.map(|x| x.saturating_duration_since(now)),
            trace: request.trace,
        });
        state.keepalive.on_streams_active(now);
        state.wake();
        Ok((stream, rx))
    }

    /// Abandon a stream this side opened or accepted
    pub(crate) fn cancel_stream(&self, stream: StreamId, code: ErrorCode) {
        let mut state = self.0.state.lock("cancel_stream");
        if state.streams.remove(&stream).is_some() {
            state.send_stream_frame(Frame::Reset { stream, code });
            state.wake();
        }
    }

    /// Complete an accepted stream with `status`
    ///
    /// Returns `false` if the stream was already gone.
    pub(crate) fn send_trailers(&self, stream: StreamId, status: Status) -> bool {
        let mut state = self.0.state.lock("send_trailers");
        if state.streams.remove(&stream).is_none() {
            return false;
        }
        state.send_stream_frame(Frame::Trailers { stream, status });
        state.wake();
        true
    }

    /// Send a ping; the receiver resolves when it is acknowledged or the connection dies
    pub(crate) fn ping(&self) -> oneshot::Receiver<Result<(), ConnectionError>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.0.state.lock("ping");
        if let Some(ref e) = state.error {
            let _ = tx.send(Err(e.clone()));
            return rx;
        }
        let payload = rand::random();
        state.user_pings.insert(payload, tx);
        state.send(Frame::Ping {
            ack: false,
            payload,
        });
        state.keepalive.record_ping_sent(crate::now());
        state.wake();
        rx
    }

    /// Announce a graceful shutdown and close once in-flight streams finish
    pub(crate) fn shutdown(&self, debug: &str) {
        let mut state = self.0.state.lock("shutdown");
        let goaway = GoAway::graceful(state.last_peer_stream, debug);
        state.begin_drain(goaway, crate::now());
        state.wake();
    }

    /// Resolves with the reason once the connection is closed
    pub(crate) fn closed(&self) -> impl Future<Output = ConnectionError> + Send + 'static {
        let token = self.0.state.lock("closed").closed.clone();
        let inner = self.0.clone();
        async move {
            token.cancelled().await;
            let state = inner.state.lock("closed");
            state.error.clone().unwrap_or(ConnectionError::LocallyClosed)
        }
    }

    /// Whether new streams may be opened
    pub(crate) fn is_usable(&self) -> bool {
        let state = self.0.state.lock("is_usable");
        state.error.is_none() && state.goaway_received.is_none()
    }

    /// Keepalive interval the connection was established with
    pub(crate) fn keepalive_interval(&self) -> Option<Duration> {
        self.0.state.lock("keepalive_interval").keepalive.interval()
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.state.lock("id").id
    }
}

impl Clone for ConnectionRef {
    fn clone(&self) -> Self {
        self.0.state.lock("clone").ref_count += 1;
        Self(self.0.clone())
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        let state = &mut *self.0.state.lock("drop");
        if let Some(x) = state.ref_count.checked_sub(1) {
            state.ref_count = x;
            if x == 0 && state.error.is_none() {
                // If the driver is alive, it's just it and us, so we'd better shut it down
                state.implicit_close();
            }
        }
    }
}

/// Future driving the protocol logic of one connection
///
/// Processes incoming frames in arrival order, runs the keepalive and drain timers, and
/// completes once the connection is closed.
#[must_use = "connection drivers must be spawned for their connections to function"]
#[derive(Debug)]
struct ConnectionDriver(Arc<ConnectionInner>);

impl Future for ConnectionDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let conn = &mut *self.0.state.lock("poll");

        let span = info_span!("drive", id = conn.id, side = %conn.side);
        let _guard = span.enter();

        loop {
            if let Err(e) = conn.process_frames(cx) {
                conn.terminate(e);
            }
            // Firing a timer may send a ping or close the connection, and receiving frames may
            // move a deadline, so loop until neither happens.
            let keep_going = conn.error.is_none() && conn.drive_timer(cx);
            conn.check_drained(crate::now());
            if conn.error.is_some() {
                return Poll::Ready(());
            }
            if !keep_going {
                break;
            }
        }

        conn.driver = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[derive(Debug)]
struct ConnectionInner {
    state: Mutex<State>,
}

enum StreamSlot {
    Client { done: oneshot::Sender<Status> },
    Server { cancel: CancellationToken },
}

struct State {
    id: u64,
    side: Side,
    /// `None` once closed, which closes the link for the peer
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    bdp_probe: bool,
    drain_grace_period: Duration,
    keepalive: KeepaliveState,
    strikes: PingStrikeCounter,
    streams: FxHashMap<StreamId, StreamSlot>,
    next_stream: Option<StreamId>,
    /// Newest stream accepted from the peer
    last_peer_stream: StreamId,
    incoming: Option<mpsc::UnboundedSender<IncomingStream>>,
    throttle: Option<Arc<KeepaliveThrottle>>,
    channelz: Option<Arc<ChannelNode>>,
    user_pings: FxHashMap<u64, oneshot::Sender<Result<(), ConnectionError>>>,
    bdp_outstanding: Option<u64>,
    goaway_received: Option<GoAway>,
    /// Set once this side sent a GOAWAY
    drain_deadline: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
    timer_deadline: Option<TokioInstant>,
    driver: Option<Waker>,
    error: Option<ConnectionError>,
    closed: CancellationToken,
    ref_count: usize,
}

impl State {
    fn process_frames(&mut self, cx: &mut Context<'_>) -> Result<(), ConnectionError> {
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(frame)) => {
                    trace!(?frame, "recv");
                    self.handle_frame(frame, crate::now())?;
                }
                Poll::Ready(None) => return Err(ConnectionError::TransportClosed),
                Poll::Pending => return Ok(()),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) -> Result<(), ConnectionError> {
        match frame {
            Frame::Headers {
                stream,
                path,
                authority,
                timeout,
                trace,
            } => {
                self.on_stream_activity_received(now);
                self.accept_stream(IncomingStream {
                    stream,
                    path,
                    authority,
                    deadline: timeout.map(|x| now + x),
                    trace,
                    cancel: CancellationToken::new(),
                });
            }
            Frame::Trailers { stream, status } => {
                self.on_stream_activity_received(now);
                match self.streams.remove(&stream) {
                    Some(StreamSlot::Client { done }) => {
                        let _ = done.send(status);
                        self.probe_bandwidth(now);
                    }
                    Some(slot @ StreamSlot::Server { .. }) => {
                        self.streams.insert(stream, slot);
                        debug!(stream = stream.0, "ignoring trailers for accepted stream");
                    }
                    None => trace!(stream = stream.0, "trailers for unknown stream"),
                }
            }
            Frame::Reset { stream, code } => {
                self.on_stream_activity_received(now);
                match self.streams.remove(&stream) {
                    Some(StreamSlot::Client { done }) => {
                        let _ = done.send(reset_status(code));
                    }
                    Some(StreamSlot::Server { cancel }) => cancel.cancel(),
                    None => {}
                }
            }
            Frame::Ping {
                ack: false,
                payload,
            } => {
                self.send(Frame::Ping { ack: true, payload });
                let active = !self.streams.is_empty();
                let verdict = self
                    .strikes
                    .on_ping_received(now, active, self.last_peer_stream);
                if let PingVerdict::TooManyPings(goaway) = verdict {
                    self.begin_drain(goaway, now);
                }
            }
            Frame::Ping { ack: true, payload } => {
                if self.keepalive.on_ping_ack(payload, now) {
                    trace!("keepalive acknowledged");
                } else if self.bdp_outstanding == Some(payload) {
                    self.bdp_outstanding = None;
                } else if let Some(waiter) = self.user_pings.remove(&payload) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Frame::GoAway(goaway) => return self.on_goaway(goaway, now),
        }
        Ok(())
    }

    fn accept_stream(&mut self, stream: IncomingStream) {
        let id = stream.stream;
        let acceptable = self.drain_deadline.is_none()
            && id.initiator() == Side::Client
            && id > self.last_peer_stream;
        let incoming = match self.incoming {
            Some(ref x) if acceptable => x.clone(),
            _ => {
                debug!(stream = id.0, "refusing stream");
                self.send_stream_frame(Frame::Reset {
                    stream: id,
                    code: ErrorCode::REFUSED_STREAM,
                });
                return;
            }
        };
        self.last_peer_stream = id;
        let cancel = stream.cancel.clone();
        if incoming.send(stream).is_err() {
            self.send_stream_frame(Frame::Reset {
                stream: id,
                code: ErrorCode::REFUSED_STREAM,
            });
            return;
        }
        self.streams.insert(id, StreamSlot::Server { cancel });
    }

    fn on_goaway(&mut self, goaway: GoAway, now: Instant) -> Result<(), ConnectionError> {
        if self.side.is_server() {
            debug!(%goaway, "client went away");
            return Err(ConnectionError::GoAway(goaway));
        }
        if goaway.is_too_many_pings() {
            info!(%goaway, "peer objects to our ping rate");
            self.report_too_many_pings(&goaway, now);
            return Err(ConnectionError::GoAway(goaway));
        }

        debug!(%goaway, "peer is draining the connection");
        // Streams the peer never saw may be retried elsewhere
        let unprocessed = self
            .streams
            .keys()
            .filter(|x| **x > goaway.last_stream_id)
            .copied()
            .collect::<Vec<_>>();
        for stream in unprocessed {
            if let Some(StreamSlot::Client { done }) = self.streams.remove(&stream) {
                let _ = done.send(Status::unavailable(format!(
                    "stream not processed before {goaway}"
                )));
            }
        }
        self.goaway_received = Some(goaway);
        Ok(())
    }

    fn report_too_many_pings(&self, goaway: &GoAway, now: Instant) {
        let (throttle, used) = match (&self.throttle, self.keepalive.interval()) {
            (Some(throttle), Some(used)) => (throttle, used),
            _ => return,
        };
        if let ThrottleOutcome::Raised { to, .. } = throttle.on_goaway_received(goaway, used) {
            if let Some(ref channelz) = self.channelz {
                channelz.record_keepalive_throttled(now, to);
            }
        }
    }

    /// Send `goaway` and stop accepting streams
    fn begin_drain(&mut self, goaway: GoAway, now: Instant) {
        if self.drain_deadline.is_some() || self.error.is_some() {
            return;
        }
        self.send(Frame::GoAway(goaway));
        self.drain_deadline = Some(now + self.drain_grace_period);
    }

    /// Close the connection if draining is complete
    fn check_drained(&mut self, now: Instant) {
        if self.error.is_some() {
            return;
        }
        let reason = match (self.drain_deadline, &self.goaway_received) {
            (Some(deadline), _) if self.streams.is_empty() || deadline <= now => {
                ConnectionError::LocallyClosed
            }
            (_, Some(goaway)) if self.streams.is_empty() => ConnectionError::GoAway(goaway.clone()),
            _ => return,
        };
        self.terminate(reason);
    }

    fn probe_bandwidth(&mut self, now: Instant) {
        if !self.bdp_probe || self.bdp_outstanding.is_some() || !self.keepalive.may_send_ping(now) {
            return;
        }
        let payload = rand::random();
        trace!("probing bandwidth");
        self.send(Frame::Ping {
            ack: false,
            payload,
        });
        self.keepalive.record_ping_sent(now);
        self.bdp_outstanding = Some(payload);
    }

    fn poll_timeout(&self) -> Option<Instant> {
        let keepalive = self.keepalive.poll_timeout(!self.streams.is_empty());
        match (keepalive, self.drain_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn drive_timer(&mut self, cx: &mut Context<'_>) -> bool {
        // Check whether we need to (re)set the timer. If so, we must poll again to ensure the
        // timer is registered with the runtime (and check whether it's already expired).
        let deadline = match self.poll_timeout() {
            Some(x) => TokioInstant::from_std(x),
            None => {
                self.timer_deadline = None;
                return false;
            }
        };
        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(sleep_until(deadline)));
        if self.timer_deadline != Some(deadline) {
            timer.as_mut().reset(deadline);
            self.timer_deadline = Some(deadline);
        }
        if timer.as_mut().poll(cx).is_pending() {
            return false;
        }

        self.timer_deadline = None;
        self.handle_timeout(crate::now());
        true
    }

    fn handle_timeout(&mut self, now: Instant) {
        match self.keepalive.handle_timeout(now, !self.streams.is_empty()) {
            Some(KeepaliveAction::SendPing) => {
                let payload = rand::random();
                trace!("sending keepalive ping");
                self.send(Frame::Ping {
                    ack: false,
                    payload,
                });
                self.keepalive.on_ping_sent(payload, now);
            }
            Some(KeepaliveAction::TimedOut) => {
                info!("keepalive ping was not acknowledged");
                self.terminate(ConnectionError::KeepaliveTimedOut);
            }
            None => {}
        }
    }

    fn on_stream_activity_received(&mut self, now: Instant) {
        self.keepalive.on_data_received(now);
        self.strikes.on_stream_activity();
    }

    fn send_stream_frame(&mut self, frame: Frame) {
        self.keepalive.on_data_sent();
        self.strikes.on_stream_activity();
        self.send(frame);
    }

    fn send(&mut self, frame: Frame) {
        if let Some(ref tx) = self.tx {
            trace!(?frame, "send");
            // A failure means the peer is gone, which the driver notices on its own
            let _ = tx.send(frame);
        }
    }

    /// Wake up a blocked driver task to process state changes
    fn wake(&mut self) {
        if let Some(x) = self.driver.take() {
            x.wake();
        }
    }

    fn implicit_close(&mut self) {
        let goaway = GoAway::graceful(self.last_peer_stream, "connection released");
        self.send(Frame::GoAway(goaway));
        self.terminate(ConnectionError::LocallyClosed);
    }

    /// Fail everything waiting on the connection and close the link
    fn terminate(&mut self, reason: ConnectionError) {
        if self.error.is_some() {
            return;
        }
        debug!(%reason, "connection closed");
        self.error = Some(reason.clone());
        self.tx = None;
        self.rx.close();
        self.incoming = None;
        self.timer = None;
        self.timer_deadline = None;
        for (_, slot) in self.streams.drain() {
            match slot {
                StreamSlot::Client { done } => {
                    let _ = done.send(Status::unavailable(reason.to_string()));
                }
                StreamSlot::Server { cancel } => cancel.cancel(),
            }
        }
        for (_, waiter) in self.user_pings.drain() {
            let _ = waiter.send(Err(reason.clone()));
        }
        self.closed.cancel();
        self.wake();
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("streams", &self.streams.len())
            .field("keepalive", &self.keepalive)
            .field("strikes", &self.strikes)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

fn reset_status(code: ErrorCode) -> Status {
    match code {
        ErrorCode::REFUSED_STREAM => Status::unavailable("stream refused by peer"),
        ErrorCode::CANCEL => Status::cancelled("stream cancelled by peer"),
        _ => Status::new(proto::Code::Internal, format!("stream reset: {code}")),
    }
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The link could not be established
    #[error("connection attempt failed: {message}")]
    Connect {
        /// Kind of the underlying I/O error
        kind: io::ErrorKind,
        /// Description of the underlying I/O error
        message: String,
    },
    /// The peer sent a GOAWAY
    #[error("closed by peer: {0}")]
    GoAway(GoAway),
    /// The link was closed without a GOAWAY
    #[error("transport closed")]
    TransportClosed,
    /// A keepalive ping was not acknowledged within the keepalive timeout
    #[error("keepalive ping timed out")]
    KeepaliveTimedOut,
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
    /// Every stream id has been used
    #[error("stream ids exhausted")]
    StreamIdsExhausted,
}

impl From<io::Error> for ConnectionError {
    fn from(x: io::Error) -> Self {
        Self::Connect {
            kind: x.kind(),
            message: x.to_string(),
        }
    }
}
