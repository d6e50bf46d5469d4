//! Channels and calls over shared multiplexed connections, with adaptive keepalive
//!
//! A [`Channel`] is the long-lived handle an application holds for a logical RPC endpoint. It
//! resolves its target to addresses, opens connections to them on demand, and dispatches any
//! number of concurrent [`Call`]s over those connections. Results are delivered as tagged
//! events on a [`CompletionQueue`].
//!
//! Connections carry keepalive pings to detect dead peers. Receivers police how often they are
//! pinged: a peer that pings too eagerly accumulates strikes and is eventually sent away with a
//! `too_many_pings` GOAWAY. Senders react by doubling the keepalive interval of every
//! connection they open afterwards. The interval lives in a
//! [`KeepaliveThrottle`](proto::KeepaliveThrottle) shared by all channels created with the
//! same target and arguments from one [`SubchannelPool`], so sibling channels converge on a
//! compliant ping rate together.
//!
//! The protocol state machines live in the runtime-independent `tether-proto` crate. This
//! crate drives them on tokio. The transport itself is abstracted by [`Connector`];
//! [`MemoryNetwork`] provides an in-process implementation.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod call;
mod channel;
mod completion;
mod connection;
mod mem;
mod mutex;
mod registration;
mod resolver;
mod server;
mod subchannel;
mod transport;

pub use proto::{
    channelz, ArgValue, ChannelArgs, ChannelNode, Code, CompressionAlgorithm,
    CompressionOptions, ConfigError, ConnectivityState, ErrorCode, GoAway, GoAwayReason,
    PropagationMask, Status, StreamId, TraceContext,
};

pub use crate::call::{Call, CallError};
pub use crate::channel::{Channel, ChannelError, ClientStack, ServerTransport, Stack};
pub use crate::completion::{Completion, CompletionError, CompletionQueue, Event, Tag};
pub use crate::connection::ConnectionError;
pub use crate::mem::{Listener, MemoryNetwork};
pub use crate::registration::{RegisteredCall, RouteHandle};
pub use crate::resolver::{ManualResolver, Resolver};
pub use crate::server::{Server, ServerCall, ServerError};
pub use crate::subchannel::SubchannelPool;
pub use crate::transport::{Address, Connecting, Connector, Io};


/// Current time on tokio's clock, which may be paused in tests
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
