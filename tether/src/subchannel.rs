use std::{
    fmt,
    sync::{Arc, OnceLock, Weak},
};

use proto::{ChannelArgs, ChannelNode, KeepaliveThrottle};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    connection::{ConnectionError, ConnectionRef, Role},
    mutex::Mutex,
    transport::{Address, Connector},
};

/// Registry of state shared between channels
///
/// Channels created from one pool with equal targets and arguments share one
/// [`KeepaliveThrottle`] and, per resolved address, one subchannel. Subchannels are never shared
/// across targets, so every channel riding a connection reports to the throttle that connection
/// was built with. Entries are held weakly: they live exactly as long as some channel uses them.
///
/// Subchannels are keyed by address alone, not by connector, so channels reaching the same
/// address names through different networks must use different pools.
pub struct SubchannelPool {
    subchannels: Mutex<FxHashMap<SubchannelKey, Weak<Subchannel>>>,
    throttles: Mutex<FxHashMap<ThrottleKey, Weak<KeepaliveThrottle>>>,
}

impl SubchannelPool {
    /// Create an empty pool
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subchannels: Mutex::new(FxHashMap::default()),
            throttles: Mutex::new(FxHashMap::default()),
        })
    }

    /// The process-wide pool channels use unless told otherwise
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<SubchannelPool>> = OnceLock::new();
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Find or create the subchannel for `address` as resolved from `target`
    pub(crate) fn subchannel(
        &self,
        connector: &Arc<dyn Connector>,
        target: &str,
        address: &Address,
        args: &ChannelArgs,
    ) -> Arc<Subchannel> {
        let throttle = self.throttle(target, args);
        let key = SubchannelKey {
            target: target.into(),
            address: address.clone(),
            args: args.clone(),
        };
        let mut subchannels = self.subchannels.lock("subchannel");
        if let Some(existing) = subchannels.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        subchannels.retain(|_, x| x.strong_count() > 0);
        trace!(%address, "new subchannel");
        let subchannel = Arc::new(Subchannel {
            address: key.address.clone(),
            args: key.args.clone(),
            throttle,
            connector: connector.clone(),
            current: tokio::sync::Mutex::new(None),
        });
        subchannels.insert(key, Arc::downgrade(&subchannel));
        subchannel
    }

    /// Find or create the keepalive throttle for `target`
    ///
    /// `None` if `args` do not enable keepalive.
    pub(crate) fn throttle(
        &self,
        target: &str,
        args: &ChannelArgs,
    ) -> Option<Arc<KeepaliveThrottle>> {
        args.get_keepalive_time()?;
        let key = ThrottleKey {
            target: target.into(),
            args: args.clone(),
        };
        let mut throttles = self.throttles.lock("throttle");
        if let Some(existing) = throttles.get(&key).and_then(Weak::upgrade) {
            return Some(existing);
        }
        throttles.retain(|_, x| x.strong_count() > 0);
        let throttle = Arc::new(KeepaliveThrottle::from_args(args)?);
        throttles.insert(key, Arc::downgrade(&throttle));
        Some(throttle)
    }
}

impl fmt::Debug for SubchannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubchannelPool")
            .field("subchannels", &self.subchannels.lock("debug").len())
            .field("throttles", &self.throttles.lock("debug").len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubchannelKey {
    target: String,
    address: Address,
    args: ChannelArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ThrottleKey {
    target: String,
    args: ChannelArgs,
}

/// Connections to one address, established one at a time
#[derive(Debug)]
pub(crate) struct Subchannel {
    address: Address,
    args: ChannelArgs,
    /// Shared with every channel of the same target and arguments
    throttle: Option<Arc<KeepaliveThrottle>>,
    connector: Arc<dyn Connector>,
    current: tokio::sync::Mutex<Option<ConnectionRef>>,
}

impl Subchannel {
    /// Get a connection able to carry new streams, establishing one if necessary
    ///
    /// A new connection runs keepalive at the throttle's interval as of now, whatever it was
    /// when the channel was created.
    pub(crate) async fn connect(
        &self,
        channelz: &Arc<ChannelNode>,
    ) -> Result<ConnectionRef, ConnectionError> {
        let mut current = self.current.lock().await;
        if let Some(ref conn) = *current {
            if conn.is_usable() {
                return Ok(conn.clone());
            }
        }
        // Release the old connection so it can close once its streams finish
        *current = None;

        let io = self.connector.connect(&self.address).await?;
        let keepalive = match &self.throttle {
            Some(x) => Some(x.current_interval()),
            None => self.args.get_keepalive_time(),
        };
        let conn = ConnectionRef::new(
            io,
            &self.args,
            Role::Client {
                keepalive,
                throttle: self.throttle.clone(),
                channelz: channelz.clone(),
            },
        );
        debug!(address = %self.address, id = conn.id(), ?keepalive, "subchannel connected");
        let closed = conn.closed();
        let address = self.address.clone();
        let channelz = channelz.clone();
        tokio::spawn(async move {
            let reason = closed.await;
            debug!(%address, %reason, "subchannel connection lost");
            channelz.add_trace_event(
                crate::now(),
                format!("connection to {address} closed: {reason}"),
            );
        });
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// The current connection, if it can carry new streams
    pub(crate) fn ready_connection(&self) -> Option<ConnectionRef> {
        let current = self.current.try_lock().ok()?;
        current.as_ref().filter(|x| x.is_usable()).cloned()
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }
}
