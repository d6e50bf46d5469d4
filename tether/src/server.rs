use std::{fmt, sync::Arc};

use proto::{ChannelArgs, ConfigError, ErrorCode, Status, StreamId, TraceContext};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
    channel::{Channel, ChannelInner, ServerTransport, Stack},
    connection::{ConnectionRef, IncomingStream, Role},
    mem::{Listener, MemoryNetwork},
    mutex::Mutex,
    transport::Address,
};

/// Accepts connections and hands out the calls clients make on them
///
/// Every accepted connection gets its own server-side [`Channel`] and ping-strike policy,
/// both configured from the arguments the server was bound with.
pub struct Server {
    address: Address,
    calls: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerCall>>,
    connections: Arc<Mutex<FxHashMap<u64, ConnectionRef>>>,
    stop: CancellationToken,
}

impl Server {
    /// Listen on `address` within `network`
    ///
    /// Must be called within a tokio runtime.
    pub fn bind(
        network: &MemoryNetwork,
        address: impl Into<Address>,
        args: ChannelArgs,
    ) -> Result<Self, ServerError> {
        args.validate()?;
        let address = address.into();
        let listener = network
            .bind(address.clone())
            .map_err(|_| ServerError::AddrInUse(address.clone()))?;
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(Mutex::new(FxHashMap::default()));
        let stop = CancellationToken::new();
        debug!(%address, "server listening");
        tokio::spawn(
            accept(
                listener,
                args,
                calls_tx,
                connections.clone(),
                stop.clone(),
            )
            .instrument(info_span!("accept", %address)),
        );
        Ok(Self {
            address,
            calls: tokio::sync::Mutex::new(calls_rx),
            connections,
            stop,
        })
    }

    /// Wait for the next call from any client
    ///
    /// Returns `None` once the server stopped accepting and every accepted connection is gone.
    pub async fn request_call(&self) -> Option<ServerCall> {
        self.calls.lock().await.recv().await
    }

    /// Stop accepting connections and ask clients to finish up
    ///
    /// Every open connection is sent a graceful GOAWAY and closes once its in-flight calls end.
    pub fn shutdown(&self) {
        self.stop.cancel();
        for conn in self.connections.lock("shutdown").values() {
            conn.shutdown("server shutting down");
        }
    }

    /// Address the server is bound to
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Number of open connections
    pub fn connections(&self) -> usize {
        self.connections.lock("connections").len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
        self.connections.lock("drop").clear();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

async fn accept(
    mut listener: Listener,
    args: ChannelArgs,
    calls: mpsc::UnboundedSender<ServerCall>,
    connections: Arc<Mutex<FxHashMap<u64, ConnectionRef>>>,
    stop: CancellationToken,
) {
    loop {
        let io = tokio::select! {
            _ = stop.cancelled() => break,
            x = listener.accept() => match x {
                Some(x) => x,
                None => break,
            },
        };
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let conn = ConnectionRef::new(io, &args, Role::Server { incoming: incoming_tx });
        let id = conn.id();
        let transport = ServerTransport(conn.clone());
        let channel = match Channel::create(
            listener.address().as_str(),
            args.clone(),
            Stack::Server(transport),
        ) {
            Ok(x) => x,
            Err(e) => {
                warn!(id, error = %e, "failed to set up server channel");
                continue;
            }
        };
        connections.lock("accept").insert(id, conn);
        tokio::spawn(
            serve(channel, incoming_rx, calls.clone(), connections.clone())
                .instrument(info_span!("serve", id)),
        );
    }
    trace!("stopped accepting");
}

/// Turn streams accepted on one connection into [`ServerCall`]s
async fn serve(
    channel: Channel,
    mut incoming: mpsc::UnboundedReceiver<IncomingStream>,
    calls: mpsc::UnboundedSender<ServerCall>,
    connections: Arc<Mutex<FxHashMap<u64, ConnectionRef>>>,
) {
    let conn = match channel.0.server_connection() {
        Some(x) => x.clone(),
        None => return,
    };
    let id = conn.id();
    // Ends once the connection closes and drops its sender
    while let Some(stream) = incoming.recv().await {
        trace!(stream = stream.stream.0, path = &*stream.path, "incoming call");
        let call = ServerCall::new(channel.0.clone(), conn.clone(), stream);
        if calls.send(call).is_err() {
            // The server is gone; the rejected call resets its stream as it drops
            break;
        }
    }
    connections.lock("serve").remove(&id);
    debug!("connection finished");
}

/// Call received from a client
///
/// Respond with [`finish`](Self::finish). Dropping an unfinished call resets its stream, which
/// the client observes as `CANCELLED`.
pub struct ServerCall {
    channel: Arc<ChannelInner>,
    conn: ConnectionRef,
    stream: StreamId,
    method: Arc<str>,
    authority: Option<Arc<str>>,
    deadline: Option<Instant>,
    trace: Option<TraceContext>,
    cancel: CancellationToken,
    finished: bool,
}

impl ServerCall {
    fn new(channel: Arc<ChannelInner>, conn: ConnectionRef, stream: IncomingStream) -> Self {
        channel.channelz.record_call_started(crate::now());
        Self {
            channel,
            conn,
            stream: stream.stream,
            method: stream.path,
            authority: stream.authority,
            deadline: stream.deadline.map(Instant::from_std),
            trace: stream.trace,
            cancel: stream.cancel,
            finished: false,
        }
    }

    /// Method path requested by the client
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Authority requested by the client
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// When the client stops waiting for a response
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Trace membership sent by the client
    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    /// Complete the call with `status`
    ///
    /// Returns `false` if the call could no longer be completed, e.g. because the client
    /// cancelled it.
    pub fn finish(mut self, status: Status) -> bool {
        self.finished = true;
        if status.is_ok() {
            self.channel.channelz.record_call_succeeded();
        } else {
            self.channel.channelz.record_call_failed();
        }
        self.conn.send_trailers(self.stream, status)
    }

    /// Fail the call with `status`, cancelling calls derived from it
    pub fn cancel_with_status(self, status: Status) -> bool {
        self.cancel.cancel();
        self.finish(status)
    }

    /// Resolves when the client cancels the call or its connection is lost
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Whether the call was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for ServerCall {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.channel.channelz.record_call_failed();
        self.conn.cancel_stream(self.stream, ErrorCode::CANCEL);
    }
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("stream", &self.stream)
            .field("method", &self.method)
            .field("authority", &self.authority)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Errors binding a [`Server`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Another listener is bound to the address
    #[error("address {0} already in use")]
    AddrInUse(Address),
    /// The argument set is inconsistent
    #[error("invalid channel arguments: {0}")]
    InvalidArgs(#[from] ConfigError),
}
