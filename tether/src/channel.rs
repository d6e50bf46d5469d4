use std::{fmt, sync::Arc, time::Duration};

use proto::{
    CallSizeEstimate, ChannelArgs, ChannelNode, Code, ConfigError, ConnectivityState,
    KeepaliveThrottle, MemoryAllocator, PropagationMask, Side, Status,
};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    call::Call,
    completion::{CompletionError, CompletionQueue, Tag},
    connection::{ConnectionError, ConnectionRef},
    mutex::Mutex,
    registration::{CallRegistrationTable, RouteHandle},
    resolver::Resolver,
    server::ServerCall,
    subchannel::{Subchannel, SubchannelPool},
    transport::{Address, Connector},
};

/// Initial guess at a call's footprint, in bytes
const INITIAL_CALL_SIZE_ESTIMATE: usize = 1024;

/// Logical endpoint that calls are created on
///
/// A client channel resolves its target, opens connections through its [`ClientStack`] as
/// calls need them, and replaces them when they fail. A server channel is bound to one accepted
/// connection.
///
/// The channel's state lives until the last [`Call`] created from it is gone, even when the
/// `Channel` itself is dropped or [destroyed](Self::destroy) first.
pub struct Channel(pub(crate) Arc<ChannelInner>);

impl Channel {
    /// Create a channel to `target`
    ///
    /// Fails without side effects if `args` are inconsistent, the target is empty, or a server
    /// transport is already closed.
    pub fn create(target: &str, args: ChannelArgs, stack: Stack) -> Result<Self, ChannelError> {
        args.validate()?;
        if target.is_empty() {
            return Err(ChannelError::InvalidTarget(target.into()));
        }
        let (side, stack) = match stack {
            Stack::Client(client) => {
                let pool = client.pool.unwrap_or_else(SubchannelPool::global);
                let throttle = pool.throttle(target, &args);
                (
                    Side::Client,
                    StackInner::Client(ClientStackInner {
                        resolver: client.resolver,
                        connector: client.connector,
                        pool,
                        throttle,
                        subchannels: Mutex::new(FxHashMap::default()),
                    }),
                )
            }
            Stack::Server(transport) => {
                if !transport.0.is_usable() {
                    return Err(ChannelError::TransportClosed);
                }
                (Side::Server, StackInner::Server(transport.0))
            }
        };
        let allocator = MemoryAllocator::new(target);
        debug!(%side, allocator = allocator.name(), "channel to {target} created");
        Ok(Self(Arc::new(ChannelInner {
            side,
            target: target.into(),
            channelz: Arc::new(ChannelNode::new(target)),
            allocator,
            call_size: CallSizeEstimate::new(INITIAL_CALL_SIZE_ESTIMATE),
            registrations: CallRegistrationTable::default(),
            args,
            stack,
        })))
    }

    /// Create a client channel whose target is the only address it connects to
    pub fn client(
        target: &str,
        args: ChannelArgs,
        connector: impl Connector,
    ) -> Result<Self, ChannelError> {
        let stack = ClientStack::new(Resolver::fixed([target]), connector);
        Self::create(target, args, Stack::Client(stack))
    }

    /// Create a call to `method`
    ///
    /// The call is bound to this channel but does nothing until [`Call::start`]. Failures to
    /// reach the peer are reported as the call's final status, never here.
    ///
    /// With a `parent`, the properties selected by `mask` are inherited from it: the earlier of
    /// both deadlines, cancellation when the parent is cancelled, and membership in the parent's
    /// trace.
    pub fn create_call(
        &self,
        parent: Option<&ServerCall>,
        mask: PropagationMask,
        cq: &CompletionQueue,
        method: &str,
        host: Option<&str>,
        deadline: Option<Instant>,
    ) -> Call {
        Call::new(
            self.0.clone(),
            parent,
            mask,
            cq.clone(),
            method.into(),
            host.map(Into::into),
            deadline,
        )
    }

    /// Create a call on a route obtained from [`register_call`](Self::register_call)
    pub fn create_registered_call(
        &self,
        parent: Option<&ServerCall>,
        mask: PropagationMask,
        cq: &CompletionQueue,
        route: &RouteHandle,
        deadline: Option<Instant>,
    ) -> Call {
        Call::new(
            self.0.clone(),
            parent,
            mask,
            cq.clone(),
            route.method_arc().clone(),
            route.authority_arc().cloned(),
            deadline,
        )
    }

    /// Register `(method, host)` for repeated calls
    ///
    /// Registering the same pair again returns a handle to the same entry.
    pub fn register_call(&self, method: &str, host: Option<&str>) -> RouteHandle {
        self.0.registrations.register(method, host)
    }

    /// Number of distinct registered routes
    pub fn registered_calls(&self) -> usize {
        self.0.registrations.len()
    }

    /// Number of [`register_call`](Self::register_call) invocations, including repeats
    pub fn registration_attempts(&self) -> u64 {
        self.0.registrations.registration_attempts()
    }

    /// Current estimate of a call's memory footprint, in bytes
    pub fn call_size_estimate(&self) -> usize {
        self.0.call_size.get()
    }

    /// Fold an observed call footprint into the estimate
    pub fn update_call_size_estimate(&self, size: usize) {
        self.0.call_size.update(size);
    }

    /// Probe the peer's liveness
    ///
    /// If the channel has a live connection, a ping is sent and `tag` completes successfully
    /// once it is acknowledged. Otherwise `tag` completes at once, unsuccessfully. Must be called
    /// within a tokio runtime.
    pub fn ping(&self, cq: &CompletionQueue, tag: Tag) -> Result<(), CompletionError> {
        let completion = cq.begin(tag)?;
        let conn = match self.0.stack {
            StackInner::Server(ref conn) => Some(conn.clone()).filter(|x| x.is_usable()),
            StackInner::Client(ref client) => client.ready_connection(),
        };
        let conn = match conn {
            Some(x) => x,
            None => {
                trace!(channel = %self.0.target, "ping without connection");
                completion.complete(false, None);
                return Ok(());
            }
        };
        let acked = conn.ping();
        tokio::spawn(async move {
            let success = matches!(acked.await, Ok(Ok(())));
            completion.complete(success, None);
        });
        Ok(())
    }

    /// Telemetry node for this channel
    pub fn channelz_node(&self) -> Arc<ChannelNode> {
        self.0.channelz.clone()
    }

    /// Keepalive interval the next connection of this channel will use
    ///
    /// `None` if keepalive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.0.stack {
            StackInner::Client(ref client) => match client.throttle {
                Some(ref x) => Some(x.current_interval()),
                None => self.0.args.get_keepalive_time(),
            },
            StackInner::Server(ref conn) => conn.keepalive_interval(),
        }
    }

    /// Target the channel was created for
    pub fn target(&self) -> &str {
        &self.0.target
    }

    /// Arguments the channel was created with
    pub fn args(&self) -> &ChannelArgs {
        &self.0.args
    }

    /// Current connectivity
    pub fn connectivity(&self) -> ConnectivityState {
        self.0.channelz.connectivity()
    }

    /// Whether this is a client or server channel
    pub fn side(&self) -> Side {
        self.0.side
    }

    /// Release the application's handle
    ///
    /// Equivalent to dropping it. Calls already created keep the channel's state alive until
    /// they finish.
    pub fn destroy(self) {}
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.0.target)
            .field("side", &self.0.side)
            .finish_non_exhaustive()
    }
}

/// How a channel reaches its peer
#[derive(Debug)]
pub enum Stack {
    /// Establish connections on demand
    Client(ClientStack),
    /// Use one connection accepted by a server
    Server(ServerTransport),
}

/// Connection machinery of a client channel
#[derive(Debug)]
pub struct ClientStack {
    resolver: Resolver,
    connector: Arc<dyn Connector>,
    pool: Option<Arc<SubchannelPool>>,
}

impl ClientStack {
    /// Connect through `connector` to whatever `resolver` yields
    pub fn new(resolver: Resolver, connector: impl Connector) -> Self {
        Self {
            resolver,
            connector: Arc::new(connector),
            pool: None,
        }
    }

    /// Share subchannels and throttles through `pool` instead of [`SubchannelPool::global`]
    pub fn pool(mut self, pool: Arc<SubchannelPool>) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// Connection accepted by a server, for binding a server channel to
#[derive(Debug)]
pub struct ServerTransport(pub(crate) ConnectionRef);

pub(crate) struct ChannelInner {
    side: Side,
    target: String,
    args: ChannelArgs,
    pub(crate) call_size: CallSizeEstimate,
    pub(crate) channelz: Arc<ChannelNode>,
    pub(crate) allocator: MemoryAllocator,
    registrations: CallRegistrationTable,
    stack: StackInner,
}

enum StackInner {
    Client(ClientStackInner),
    Server(ConnectionRef),
}

struct ClientStackInner {
    resolver: Resolver,
    connector: Arc<dyn Connector>,
    pool: Arc<SubchannelPool>,
    throttle: Option<Arc<KeepaliveThrottle>>,
    /// Subchannels for currently resolved addresses, kept alive on behalf of this channel
    subchannels: Mutex<FxHashMap<Address, Arc<Subchannel>>>,
}

impl ChannelInner {
    /// Find a connection for a new call
    ///
    /// Addresses are tried in resolution order; the first that yields a connection wins.
    pub(crate) async fn pick(&self) -> Result<ConnectionRef, Status> {
        let client = match self.stack {
            StackInner::Client(ref x) => x,
            StackInner::Server(_) => {
                return Err(Status::new(
                    Code::Unimplemented,
                    "server channels do not originate calls",
                ))
            }
        };

        let addresses = client.resolver.addresses();
        let subchannels = {
            let mut cache = client.subchannels.lock("pick");
            cache.retain(|address, _| addresses.contains(address));
            addresses
                .iter()
                .map(|address| {
                    cache
                        .entry(address.clone())
                        .or_insert_with(|| {
                            client.pool.subchannel(
                                &client.connector,
                                &self.target,
                                address,
                                &self.args,
                            )
                        })
                        .clone()
                })
                .collect::<Vec<_>>()
        };
        if subchannels.is_empty() {
            self.set_connectivity(ConnectivityState::TransientFailure);
            return Err(Status::unavailable(format!(
                "no addresses resolved for {}",
                self.target
            )));
        }

        let mut last_error = None;
        for subchannel in subchannels {
            if let Some(conn) = subchannel.ready_connection() {
                self.set_connectivity(ConnectivityState::Ready);
                return Ok(conn);
            }
            self.set_connectivity(ConnectivityState::Connecting);
            match subchannel.connect(&self.channelz).await {
                Ok(conn) => {
                    self.set_connectivity(ConnectivityState::Ready);
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(
                        address = %subchannel.address(),
                        error = %e,
                        "connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        self.set_connectivity(ConnectivityState::TransientFailure);
        let reason = last_error.map_or_else(String::new, |e| e.to_string());
        Err(Status::unavailable(format!(
            "failed to connect to {}: {reason}",
            self.target
        )))
    }

    pub(crate) fn server_connection(&self) -> Option<&ConnectionRef> {
        match self.stack {
            StackInner::Server(ref x) => Some(x),
            StackInner::Client(_) => None,
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    fn set_connectivity(&self, state: ConnectivityState) {
        self.channelz.set_connectivity(crate::now(), state);
    }
}

impl ClientStackInner {
    fn ready_connection(&self) -> Option<ConnectionRef> {
        self.subchannels
            .lock("ready_connection")
            .values()
            .find_map(|x| x.ready_connection())
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        trace!(channel = %self.target, "channel released");
        self.set_connectivity(ConnectivityState::Shutdown);
    }
}

/// Errors constructing a [`Channel`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The target cannot be connected to
    #[error("invalid target {0:?}")]
    InvalidTarget(String),
    /// The argument set is inconsistent
    #[error("invalid channel arguments: {0}")]
    InvalidArgs(#[from] ConfigError),
    /// The server transport closed before the channel was created
    #[error("transport closed")]
    TransportClosed,
}

impl From<ConnectionError> for Status {
    fn from(x: ConnectionError) -> Self {
        Self::unavailable(x.to_string())
    }
}
