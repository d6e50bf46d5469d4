use std::fmt;

use thiserror::Error;

/// Canonical outcome codes for a call
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Code {
    /// The call completed successfully
    Ok = 0,
    /// The call was cancelled, typically by the caller
    Cancelled = 1,
    /// Unknown error
    Unknown = 2,
    /// The client specified an invalid argument
    InvalidArgument = 3,
    /// The deadline expired before the call could complete
    DeadlineExceeded = 4,
    /// Some requested entity was not found
    NotFound = 5,
    /// The entity a client attempted to create already exists
    AlreadyExists = 6,
    /// The caller lacks permission for the operation
    PermissionDenied = 7,
    /// Some resource has been exhausted
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation
    FailedPrecondition = 9,
    /// The operation was aborted
    Aborted = 10,
    /// The operation was attempted past the valid range
    OutOfRange = 11,
    /// The operation is not implemented or supported
    Unimplemented = 12,
    /// An invariant expected by the underlying system was broken
    Internal = 13,
    /// The service is currently unavailable; retrying may succeed
    Unavailable = 14,
    /// Unrecoverable data loss or corruption
    DataLoss = 15,
    /// The request lacks valid authentication credentials
    Unauthenticated = 16,
}

impl Code {
    /// Upper-case name used in logs and test assertions
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Terminal status of a call
///
/// This is the only failure surface applications see: transport-level trouble such as a
/// `too_many_pings` GOAWAY reaches them as [`Code::Unavailable`].
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("{code}: {message}")]
pub struct Status {
    /// Outcome code
    pub code: Code,
    /// Human-readable detail
    pub message: String,
}

impl Status {
    /// Construct a status from its parts
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Successful completion
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// Shorthand for [`Code::Unavailable`]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// Shorthand for [`Code::DeadlineExceeded`]
    pub fn deadline_exceeded() -> Self {
        Self::new(Code::DeadlineExceeded, "deadline exceeded")
    }

    /// Shorthand for [`Code::Cancelled`]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// Whether this status reports success
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Status::unavailable("too_many_pings").to_string(),
            "UNAVAILABLE: too_many_pings"
        );
        assert_eq!(Code::DeadlineExceeded as u8, 4);
        assert!(Status::ok().is_ok());
        assert!(!Status::deadline_exceeded().is_ok());
    }
}
