//! Low-level keepalive and ping governance for multiplexed RPC connections
//!
//! This crate contains the protocol state of tether without any I/O. Callers feed it frame
//! arrivals and the current time, and it tells them which pings to send, when to wake up next,
//! and when a peer has misbehaved badly enough to be sent away. The `tether` crate drives these
//! state machines on top of tokio.
//!
//! The pieces fall in two groups:
//!
//! - Receiver side: [`PingStrikeCounter`] counts pings that arrive faster than the configured
//!   policy allows and produces a [`GoAway`] carrying the `too_many_pings` reason once the peer
//!   exceeds its strike budget.
//! - Sender side: [`KeepaliveState`] schedules one connection's keepalive pings, and
//!   [`KeepaliveThrottle`] holds the interval shared by every connection a channel opens,
//!   doubling it whenever the peer complains.
//!
//! Channel bookkeeping that is independent of any runtime lives here as well: the
//! [`ChannelArgs`] argument set, the [`CallSizeEstimate`], the [`MemoryAllocator`] and the
//! [`ChannelNode`] telemetry node.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

use std::{fmt, ops, time::Duration};

mod config;
pub use crate::config::{
    ArgValue, ChannelArgs, CompressionAlgorithm, CompressionOptions, ConfigError,
};

pub mod channelz;
pub use crate::channelz::{ChannelNode, ConnectivityState};

mod frame;
pub use crate::frame::{Frame, TraceContext};

mod goaway;
pub use crate::goaway::{ErrorCode, GoAway, GoAwayReason};

mod keepalive;
pub use crate::keepalive::{KeepaliveAction, KeepaliveState};

mod memory;
pub use crate::memory::{CallSizeEstimate, MemoryAllocator, Reservation};

mod ping_strikes;
pub use crate::ping_strikes::{PingStrikeCounter, PingVerdict, StrikeState};

mod propagation;
pub use crate::propagation::PropagationMask;

mod status;
pub use crate::status::{Code, Status};

mod throttle;
pub use crate::throttle::{KeepaliveThrottle, ThrottleOutcome};

/// Machine-readable GOAWAY reason sent by a receiver whose ping strike budget ran out
pub const TOO_MANY_PINGS: &str = "too_many_pings";

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// Client-initiated streams are odd, as in HTTP/2. Stream 0 refers to the connection itself.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct StreamId(#[doc(hidden)] pub u32);

impl StreamId {
    /// The connection-level pseudo stream
    pub const ZERO: Self = Self(0);

    /// The first stream a client opens
    pub const FIRST_CLIENT: Self = Self(1);

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 1 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// The next stream id the same initiator may use, if any remain
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(2).filter(|x| *x < MAX_STREAM_ID).map(Self)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stream {}", self.initiator(), self.0)
    }
}

//
// Useful internal constants
//

/// Stream ids are 31-bit on the wire
const MAX_STREAM_ID: u32 = 1 << 31;
/// Minimum receive interval applied when the peer pings a connection with no calls on it and
/// the receiver does not permit keepalive without calls
const IDLE_PING_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
