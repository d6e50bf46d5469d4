use std::{fmt, num::TryFromIntError, time::Duration};

use thiserror::Error;
use tracing::debug;

/// Immutable argument set a channel or server is constructed with
///
/// Default values should be suitable for most applications. Keepalive is disabled by default;
/// enable it with [`keepalive_time`](Self::keepalive_time) when dead peers must be detected
/// while calls are idle on the wire.
///
/// The receiver options (`min_recv_ping_interval_without_data`, `max_ping_strikes`) govern how
/// this side judges pings sent by its peer. The sender options govern which pings this side
/// sends. Both sets live on the same value so one type can configure clients and servers.
///
/// `ChannelArgs` is `Hash + Eq`: two channels built from equal targets and equal arguments are
/// considered interchangeable, and share subchannels and keepalive throttling.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChannelArgs {
    pub(crate) min_recv_ping_interval_without_data: Duration,
    pub(crate) max_ping_strikes: u32,

    pub(crate) max_pings_without_data: u32,
    pub(crate) min_sent_ping_interval_without_data: Duration,
    pub(crate) keepalive_time: Option<Duration>,
    pub(crate) keepalive_timeout: Duration,
    pub(crate) keepalive_permit_without_calls: bool,
    pub(crate) keepalive_time_floor: Duration,
    pub(crate) keepalive_time_ceiling: Duration,
    pub(crate) bdp_probe: bool,

    pub(crate) drain_grace_period: Duration,
    pub(crate) compression: CompressionOptions,
}

impl ChannelArgs {
    /// Build an argument set from key/value pairs
    ///
    /// Keys follow the conventional HTTP/2 RPC channel argument names, e.g.
    /// `keepalive_time_ms` or `http2.max_ping_strikes`. Unknown keys are ignored.
    ///
    /// ```
    /// # use tether_proto::{ArgValue, ChannelArgs};
    /// # use std::time::Duration;
    /// let args = ChannelArgs::from_pairs([
    ///     ("keepalive_time_ms", ArgValue::Int(1_000)),
    ///     ("http2.max_pings_without_data", ArgValue::Int(0)),
    /// ])
    /// .unwrap();
    /// assert_eq!(args.get_keepalive_time(), Some(Duration::from_secs(1)));
    /// ```
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, ArgValue)>,
    {
        let mut args = Self::default();
        for (key, value) in pairs {
            args.apply(key, value)?;
        }
        args.validate()?;
        Ok(args)
    }

    fn apply(&mut self, key: &str, value: ArgValue) -> Result<(), ConfigError> {
        match key {
            "http2.min_ping_interval_without_data_ms" => {
                self.min_recv_ping_interval_without_data = value.millis(key)?;
            }
            "http2.max_ping_strikes" => {
                self.max_ping_strikes = value.count(key)?;
            }
            "http2.max_pings_without_data" => {
                self.max_pings_without_data = value.count(key)?;
            }
            "http2.min_time_between_pings_ms" => {
                self.min_sent_ping_interval_without_data = value.millis(key)?;
            }
            "keepalive_time_ms" => {
                self.keepalive_time = Some(value.millis(key)?);
            }
            "keepalive_timeout_ms" => {
                self.keepalive_timeout = value.millis(key)?;
            }
            "keepalive_permit_without_calls" => {
                self.keepalive_permit_without_calls = value.flag(key)?;
            }
            "http2.bdp_probe" => {
                self.bdp_probe = value.flag(key)?;
            }
            "http2.drain_grace_period_ms" => {
                self.drain_grace_period = value.millis(key)?;
            }
            "default_compression_algorithm" => {
                let algorithm = match value {
                    ArgValue::Str(ref name) => CompressionAlgorithm::from_name(name),
                    ArgValue::Int(x) => CompressionAlgorithm::from_index(x),
                };
                self.compression.default_algorithm =
                    algorithm.ok_or(ConfigError::InvalidType { key: key.into() })?;
            }
            _ => debug!(key, "ignoring unrecognized channel argument"),
        }
        Ok(())
    }

    /// Check that the argument set is internally consistent
    ///
    /// Called by channel construction; a failure means no channel is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_timeout.is_zero() {
            return Err(ConfigError::Inconsistent("keepalive timeout must be nonzero"));
        }
        if self.keepalive_time_floor > self.keepalive_time_ceiling {
            return Err(ConfigError::Inconsistent(
                "keepalive time floor exceeds its ceiling",
            ));
        }
        if self.keepalive_time == Some(Duration::ZERO) {
            return Err(ConfigError::Inconsistent("keepalive time must be nonzero"));
        }
        if !self.compression.is_enabled(self.compression.default_algorithm) {
            return Err(ConfigError::Inconsistent(
                "default compression algorithm is disabled",
            ));
        }
        Ok(())
    }

    /// Minimum spacing between pings received without intervening data before a strike is counted
    pub fn min_recv_ping_interval_without_data(&mut self, value: Duration) -> &mut Self {
        self.min_recv_ping_interval_without_data = value;
        self
    }

    /// Number of strikes tolerated before the peer is sent a `too_many_pings` GOAWAY
    ///
    /// The connection is shut down once the strike count *exceeds* this value, so with a value of
    /// 1 the second early ping, i.e. the third ping overall, ends the connection.
    pub fn max_ping_strikes(&mut self, value: u32) -> &mut Self {
        self.max_ping_strikes = value;
        self
    }

    /// Maximum number of pings this side sends without sending any data in between
    ///
    /// Zero means unlimited.
    pub fn max_pings_without_data(&mut self, value: u32) -> &mut Self {
        self.max_pings_without_data = value;
        self
    }

    /// Minimum spacing between two pings this side sends without sending data in between
    pub fn min_sent_ping_interval_without_data(&mut self, value: Duration) -> &mut Self {
        self.min_sent_ping_interval_without_data = value;
        self
    }

    /// Period after which a keepalive ping is sent on a connection with no inbound activity
    ///
    /// `None` to disable, which is the default. This is the *initial* interval: a channel doubles
    /// it each time a peer answers with a `too_many_pings` GOAWAY.
    pub fn keepalive_time(&mut self, value: Option<Duration>) -> &mut Self {
        self.keepalive_time = value;
        self
    }

    /// How long to wait for a keepalive ping to be acknowledged before closing the connection
    pub fn keepalive_timeout(&mut self, value: Duration) -> &mut Self {
        self.keepalive_timeout = value;
        self
    }

    /// Whether keepalive pings may be sent, or are tolerated from the peer, with no active calls
    pub fn keepalive_permit_without_calls(&mut self, value: bool) -> &mut Self {
        self.keepalive_permit_without_calls = value;
        self
    }

    /// Lower bound for the adaptive keepalive interval
    pub fn keepalive_time_floor(&mut self, value: Duration) -> &mut Self {
        self.keepalive_time_floor = value;
        self
    }

    /// Upper bound for the adaptive keepalive interval
    ///
    /// Once reached, further `too_many_pings` signals are absorbed without raising the interval.
    pub fn keepalive_time_ceiling(&mut self, value: Duration) -> &mut Self {
        self.keepalive_time_ceiling = value;
        self
    }

    /// Whether to probe bandwidth with a ping after receiving stream data
    pub fn bdp_probe(&mut self, value: bool) -> &mut Self {
        self.bdp_probe = value;
        self
    }

    /// How long a connection that sent a GOAWAY waits for in-flight streams before closing
    pub fn drain_grace_period(&mut self, value: Duration) -> &mut Self {
        self.drain_grace_period = value;
        self
    }

    /// Compression defaults for calls created on the channel
    pub fn compression(&mut self, value: CompressionOptions) -> &mut Self {
        self.compression = value;
        self
    }

    /// Get the configured initial keepalive interval
    ///
    /// While `get_` accessors are typically unidiomatic in Rust, we favor concision for setters,
    /// which will be used far more heavily.
    pub fn get_keepalive_time(&self) -> Option<Duration> {
        self.keepalive_time
    }

    /// Get the configured drain grace period
    pub fn get_drain_grace_period(&self) -> Duration {
        self.drain_grace_period
    }

    /// Get whether bandwidth probing is enabled
    pub fn get_bdp_probe(&self) -> bool {
        self.bdp_probe
    }

    /// Get the compression defaults
    pub fn get_compression(&self) -> CompressionOptions {
        self.compression
    }
}

impl Default for ChannelArgs {
    fn default() -> Self {
        const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);

        Self {
            min_recv_ping_interval_without_data: FIVE_MINUTES,
            max_ping_strikes: 2,

            max_pings_without_data: 2,
            min_sent_ping_interval_without_data: FIVE_MINUTES,
            keepalive_time: None,
            keepalive_timeout: Duration::from_secs(20),
            keepalive_permit_without_calls: false,
            keepalive_time_floor: Duration::from_millis(1),
            keepalive_time_ceiling: Duration::from_millis(i32::MAX as u64),
            bdp_probe: true,

            drain_grace_period: Duration::from_secs(20),
            compression: CompressionOptions::default(),
        }
    }
}

impl fmt::Debug for ChannelArgs {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ChannelArgs")
            .field(
                "min_recv_ping_interval_without_data",
                &self.min_recv_ping_interval_without_data,
            )
            .field("max_ping_strikes", &self.max_ping_strikes)
            .field("max_pings_without_data", &self.max_pings_without_data)
            .field(
                "min_sent_ping_interval_without_data",
                &self.min_sent_ping_interval_without_data,
            )
            .field("keepalive_time", &self.keepalive_time)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field(
                "keepalive_permit_without_calls",
                &self.keepalive_permit_without_calls,
            )
            .field("keepalive_time_floor", &self.keepalive_time_floor)
            .field("keepalive_time_ceiling", &self.keepalive_time_ceiling)
            .field("bdp_probe", &self.bdp_probe)
            .field("drain_grace_period", &self.drain_grace_period)
            .field("compression", &self.compression)
            .finish()
    }
}

/// Value half of a channel argument pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// Integer argument; durations are in milliseconds, flags are zero or nonzero
    Int(i64),
    /// String argument
    Str(String),
}

impl ArgValue {
    fn int(&self, key: &str) -> Result<i64, ConfigError> {
        match *self {
            Self::Int(x) => Ok(x),
            Self::Str(_) => Err(ConfigError::InvalidType { key: key.into() }),
        }
    }

    fn millis(&self, key: &str) -> Result<Duration, ConfigError> {
        let ms = u64::try_from(self.int(key)?)?;
        Ok(Duration::from_millis(ms))
    }

    fn count(&self, key: &str) -> Result<u32, ConfigError> {
        Ok(u32::try_from(self.int(key)?)?)
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        Ok(self.int(key)? != 0)
    }
}

impl From<i64> for ArgValue {
    fn from(x: i64) -> Self {
        Self::Int(x)
    }
}

impl From<&str> for ArgValue {
    fn from(x: &str) -> Self {
        Self::Str(x.into())
    }
}

/// Message compression algorithms a channel may negotiate
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// No compression
    #[default]
    Identity = 0,
    /// zlib deflate
    Deflate = 1,
    /// gzip
    Gzip = 2,
}

impl CompressionAlgorithm {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "identity" => Self::Identity,
            "deflate" => Self::Deflate,
            "gzip" => Self::Gzip,
            _ => return None,
        })
    }

    fn from_index(x: i64) -> Option<Self> {
        Some(match x {
            0 => Self::Identity,
            1 => Self::Deflate,
            2 => Self::Gzip,
            _ => return None,
        })
    }

    /// Name used on the wire
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Deflate => "deflate",
            Self::Gzip => "gzip",
        }
    }
}

/// Compression defaults a channel applies to the calls it creates
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CompressionOptions {
    /// Algorithm applied when a call does not choose one
    pub default_algorithm: CompressionAlgorithm,
    enabled: u8,
}

impl CompressionOptions {
    /// Whether `algorithm` may be used on this channel
    pub fn is_enabled(&self, algorithm: CompressionAlgorithm) -> bool {
        self.enabled & (1 << algorithm as u8) != 0
    }

    /// Allow or forbid `algorithm`; identity cannot be disabled
    pub fn set_enabled(&mut self, algorithm: CompressionAlgorithm, enabled: bool) -> &mut Self {
        if enabled {
            self.enabled |= 1 << algorithm as u8;
        } else if algorithm != CompressionAlgorithm::Identity {
            self.enabled &= !(1 << algorithm as u8);
        }
        self
    }
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            default_algorithm: CompressionAlgorithm::Identity,
            enabled: 0b111,
        }
    }
}

/// Errors in the configuration of a channel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
    /// Value has the wrong type for its key
    #[error("invalid value type for channel argument {key}")]
    InvalidType {
        /// The offending key
        key: String,
    },
    /// Arguments contradict each other
    #[error("inconsistent channel arguments: {0}")]
    Inconsistent(&'static str),
}

impl From<TryFromIntError> for ConfigError {
    fn from(_: TryFromIntError) -> Self {
        Self::OutOfBounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_override_defaults() {
        let args = ChannelArgs::from_pairs([
            ("http2.min_ping_interval_without_data_ms", ArgValue::Int(5_000)),
            ("http2.max_ping_strikes", ArgValue::Int(1)),
            ("keepalive_permit_without_calls", ArgValue::Int(1)),
            ("http2.bdp_probe", ArgValue::Int(0)),
            ("default_compression_algorithm", "gzip".into()),
            ("some.unknown.key", ArgValue::Int(7)),
        ])
        .unwrap();
        assert_eq!(
            args.min_recv_ping_interval_without_data,
            Duration::from_secs(5)
        );
        assert_eq!(args.max_ping_strikes, 1);
        assert!(args.keepalive_permit_without_calls);
        assert!(!args.get_bdp_probe());
        assert_eq!(
            args.get_compression().default_algorithm,
            CompressionAlgorithm::Gzip
        );
    }

    #[test]
    fn negative_values_are_out_of_bounds() {
        let err = ChannelArgs::from_pairs([("keepalive_time_ms", ArgValue::Int(-1))]).unwrap_err();
        assert_eq!(err, ConfigError::OutOfBounds);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let err =
            ChannelArgs::from_pairs([("http2.max_ping_strikes", "three".into())]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidType {
                key: "http2.max_ping_strikes".into()
            }
        );
    }

    #[test]
    fn inconsistent_bounds() {
        let mut args = ChannelArgs::default();
        args.keepalive_time_floor(Duration::from_secs(10))
            .keepalive_time_ceiling(Duration::from_secs(1));
        assert!(matches!(args.validate(), Err(ConfigError::Inconsistent(_))));

        let mut args = ChannelArgs::default();
        args.keepalive_time(Some(Duration::ZERO));
        assert!(args.validate().is_err());
    }

    #[test]
    fn disabled_default_compression() {
        let mut compression = CompressionOptions::default();
        compression.set_enabled(CompressionAlgorithm::Gzip, false);
        compression.default_algorithm = CompressionAlgorithm::Gzip;
        let mut args = ChannelArgs::default();
        args.compression(compression);
        assert!(args.validate().is_err());

        compression.set_enabled(CompressionAlgorithm::Identity, false);
        assert!(compression.is_enabled(CompressionAlgorithm::Identity));
    }

    #[test]
    fn equal_args_hash_equal() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut a = ChannelArgs::default();
        a.keepalive_time(Some(Duration::from_secs(1)));
        let b = a.clone();
        let hash = |x: &ChannelArgs| {
            let mut h = DefaultHasher::new();
            x.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
        assert_eq!(a, b);
    }
}
