use std::fmt;

use bytes::Bytes;

use crate::{StreamId, TOO_MANY_PINGS};

/// Connection-level error code carried by GOAWAY and stream reset frames
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ErrorCode(u32);

impl ErrorCode {
    /// Create an error code from its raw value
    pub const fn from_u32(x: u32) -> Self {
        Self(x)
    }
}

impl From<ErrorCode> for u32 {
    fn from(x: ErrorCode) -> Self {
        x.0
    }
}

macro_rules! errors {
    {$($name:ident($val:literal) $desc:literal;)*} => {
        #[allow(unreachable_pub)]
        impl ErrorCode {
            $(#[doc = $desc] pub const $name: Self = Self($val);)*
        }

        impl fmt::Debug for ErrorCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "ErrorCode({:#x})", self.0),
                }
            }
        }

        impl fmt::Display for ErrorCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str($desc),)*
                    _ => write!(f, "unknown error {:#x}", self.0),
                }
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed gracefully in the absence of any error";
    PROTOCOL_ERROR(0x1) "the endpoint detected an unspecific protocol error";
    INTERNAL_ERROR(0x2) "the endpoint encountered an unexpected internal error";
    FLOW_CONTROL_ERROR(0x3) "the endpoint detected that its peer violated the flow-control protocol";
    SETTINGS_TIMEOUT(0x4) "the endpoint sent a SETTINGS frame but did not receive a response in a timely manner";
    STREAM_CLOSED(0x5) "the endpoint received a frame after a stream was half-closed";
    FRAME_SIZE_ERROR(0x6) "the endpoint received a frame with an invalid size";
    REFUSED_STREAM(0x7) "the endpoint refused the stream prior to performing any application processing";
    CANCEL(0x8) "the stream is no longer needed";
    COMPRESSION_ERROR(0x9) "the endpoint is unable to maintain the header compression context";
    CONNECT_ERROR(0xa) "the connection established in response to a CONNECT request was reset";
    ENHANCE_YOUR_CALM(0xb) "the endpoint detected that its peer is exhibiting a behavior that might be generating excessive load";
    INADEQUATE_SECURITY(0xc) "the underlying transport has properties that do not meet minimum security requirements";
}

/// Machine-readable reason attached to a GOAWAY
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GoAwayReason {
    /// The sender of the GOAWAY counted too many ping strikes
    TooManyPings,
    /// Any other reason, kept verbatim
    Other(Bytes),
}

impl GoAwayReason {
    /// Interpret the opaque reason bytes of a received GOAWAY
    pub fn parse(raw: &[u8]) -> Self {
        if raw == TOO_MANY_PINGS.as_bytes() {
            Self::TooManyPings
        } else {
            Self::Other(Bytes::copy_from_slice(raw))
        }
    }

    /// Bytes to put on the wire
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::TooManyPings => TOO_MANY_PINGS.as_bytes(),
            Self::Other(x) => &x[..],
        }
    }
}

impl fmt::Display for GoAwayReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Graceful shutdown signal for a whole connection
///
/// Streams up to and including `last_stream_id` may still complete; later streams were never
/// processed by the sender and may be retried elsewhere.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GoAway {
    /// Error code explaining the shutdown
    pub error_code: ErrorCode,
    /// Highest stream id the sender accepted
    pub last_stream_id: StreamId,
    /// Machine-readable reason
    pub reason: GoAwayReason,
    /// Free-form text for humans
    pub debug: String,
}

impl GoAway {
    /// GOAWAY sent by a receiver whose peer exceeded its ping strike budget
    pub fn too_many_pings(last_stream_id: StreamId, strikes: u32) -> Self {
        Self {
            error_code: ErrorCode::ENHANCE_YOUR_CALM,
            last_stream_id,
            reason: GoAwayReason::TooManyPings,
            debug: format!("{TOO_MANY_PINGS}: peer sent pings too frequently ({strikes} strikes)"),
        }
    }

    /// GOAWAY announcing an orderly shutdown
    pub fn graceful(last_stream_id: StreamId, debug: impl Into<String>) -> Self {
        Self {
            error_code: ErrorCode::NO_ERROR,
            last_stream_id,
            reason: GoAwayReason::Other(Bytes::new()),
            debug: debug.into(),
        }
    }

    /// Whether this GOAWAY asks the sender of pings to back off
    pub fn is_too_many_pings(&self) -> bool {
        self.error_code == ErrorCode::ENHANCE_YOUR_CALM && self.reason == GoAwayReason::TooManyPings
    }
}

impl fmt::Display for GoAway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GOAWAY {:?}", self.error_code)?;
        if !self.reason.as_bytes().is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        if !self.debug.is_empty() {
            write!(f, ": {}", self.debug)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_round_trips_through_wire_bytes() {
        assert_eq!(GoAwayReason::parse(b"too_many_pings"), GoAwayReason::TooManyPings);
        assert_eq!(
            GoAwayReason::parse(b"max_age"),
            GoAwayReason::Other(Bytes::from_static(b"max_age"))
        );
    }

    #[test]
    fn too_many_pings_requires_calm_code() {
        let goaway = GoAway::too_many_pings(StreamId(3), 2);
        assert!(goaway.is_too_many_pings());
        assert_eq!(
            goaway.to_string(),
            "GOAWAY ENHANCE_YOUR_CALM (too_many_pings): too_many_pings: peer sent pings too frequently (2 strikes)"
        );

        let mut other = goaway;
        other.error_code = ErrorCode::NO_ERROR;
        assert!(!other.is_too_many_pings());
        assert!(!GoAway::graceful(StreamId(1), "server shutting down").is_too_many_pings());
    }

    #[test]
    fn unknown_codes_format() {
        assert_eq!(format!("{:?}", ErrorCode::from_u32(0x42)), "ErrorCode(0x42)");
        assert_eq!(format!("{:?}", ErrorCode::REFUSED_STREAM), "REFUSED_STREAM");
    }
}
