use std::{fmt, sync::Arc, time::Duration};

use crate::{goaway::ErrorCode, status::Status, GoAway, StreamId};

/// Units of exchange between two connection endpoints
///
/// Encoding is left to the transport collaborator; this crate only reasons about which frames
/// exist and in what order they arrive.
#[derive(Clone, Eq, PartialEq)]
pub enum Frame {
    /// Opens a stream for a call
    Headers {
        /// Stream being opened
        stream: StreamId,
        /// Method path, e.g. `/pkg.Service/Method`
        path: Arc<str>,
        /// Authority override for the call, if any
        authority: Option<Arc<str>>,
        /// Time remaining until the caller's deadline
        timeout: Option<Duration>,
        /// Trace the call belongs to
        trace: Option<TraceContext>,
    },
    /// Terminates a stream with the call's final status
    Trailers {
        /// Stream being closed
        stream: StreamId,
        /// Outcome of the call
        status: Status,
    },
    /// Abruptly terminates a stream
    Reset {
        /// Stream being reset
        stream: StreamId,
        /// Reason for the reset
        code: ErrorCode,
    },
    /// Liveness probe, or the acknowledgement of one
    Ping {
        /// Whether this acknowledges a ping with the same payload
        ack: bool,
        /// Opaque data echoed by the acknowledgement
        payload: u64,
    },
    /// Graceful connection shutdown
    GoAway(GoAway),
}

impl Frame {
    /// Whether this frame carries stream activity, as opposed to connection management
    ///
    /// Stream activity resets ping accounting on both sides of a connection.
    pub fn is_stream_activity(&self) -> bool {
        matches!(
            *self,
            Self::Headers { .. } | Self::Trailers { .. } | Self::Reset { .. }
        )
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Headers {
                stream,
                path,
                timeout,
                ..
            } => write!(f, "HEADERS({}, {path}, timeout={timeout:?})", stream.0),
            Self::Trailers { stream, status } => {
                write!(f, "TRAILERS({}, {})", stream.0, status.code)
            }
            Self::Reset { stream, code } => write!(f, "RST_STREAM({}, {code:?})", stream.0),
            Self::Ping { ack, payload } => {
                let kind = if *ack { "PING_ACK" } else { "PING" };
                write!(f, "{kind}({payload:#x})")
            }
            Self::GoAway(x) => write!(f, "{x}"),
        }
    }
}

/// Trace membership carried with a call
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TraceContext {
    /// Identifies the whole trace
    pub trace_id: u128,
    /// Identifies this call's span within the trace
    pub span_id: u64,
    /// Span of the call that caused this one, if any
    pub parent_span_id: Option<u64>,
}

impl TraceContext {
    /// Begin a fresh trace
    pub fn root<R: rand::Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            trace_id: rng.gen(),
            span_id: rng.gen(),
            parent_span_id: None,
        }
    }

    /// A new span in the same trace, parented on this one
    pub fn child<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: rng.gen(),
            parent_span_id: Some(self.span_id),
        }
    }
}
