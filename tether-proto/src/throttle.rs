use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tracing::{info, warn};

use crate::{ChannelArgs, GoAway};

/// Keepalive interval shared by every connection a set of channels opens
///
/// Connections read [`current_interval`](Self::current_interval) when they are established and
/// keep that value for life. When one of them is sent away with `too_many_pings`, it reports
/// the interval it was using and the throttle moves to twice that value, capped at the
/// ceiling. The interval never decreases.
///
/// Signals are keyed on the interval the reporting connection used: several connections that
/// ran with the same interval and are sent away together raise the throttle once, while a
/// connection built after a raise raises it again. Updates are a single atomic
/// compare-and-update, so concurrent reports never lose or duplicate a doubling.
#[derive(Debug)]
pub struct KeepaliveThrottle {
    interval_ms: AtomicU64,
    ceiling: Duration,
    absorbed: AtomicU64,
}

impl KeepaliveThrottle {
    /// Start at `initial`, clamped to `[floor, ceiling]`
    pub fn new(initial: Duration, floor: Duration, ceiling: Duration) -> Self {
        let initial = initial.clamp(floor, ceiling.max(floor));
        Self {
            interval_ms: AtomicU64::new(as_millis(initial)),
            ceiling,
            absorbed: AtomicU64::new(0),
        }
    }

    /// Build the throttle for channels created with `args`, if they enable keepalive
    pub fn from_args(args: &ChannelArgs) -> Option<Self> {
        let initial = args.keepalive_time?;
        Some(Self::new(
            initial,
            args.keepalive_time_floor,
            args.keepalive_time_ceiling,
        ))
    }

    /// Interval a connection established now should use
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    /// A connection that pinged every `used` received `goaway`
    pub fn on_goaway_received(&self, goaway: &GoAway, used: Duration) -> ThrottleOutcome {
        if !goaway.is_too_many_pings() {
            return ThrottleOutcome::Ignored;
        }

        let used_ms = as_millis(used);
        let ceiling_ms = as_millis(self.ceiling);
        if used_ms >= ceiling_ms {
            let absorbed = self.absorbed.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                ceiling = ?self.ceiling,
                absorbed,
                "peer still reports too_many_pings at the keepalive ceiling"
            );
            return ThrottleOutcome::Saturated;
        }

        let target = used_ms.saturating_mul(2).min(ceiling_ms);
        match self
            .interval_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (target > current).then_some(target)
            }) {
            Ok(previous) => {
                let (from, to) = (Duration::from_millis(previous), Duration::from_millis(target));
                info!(?from, ?to, "peer sent too_many_pings, raising keepalive interval");
                ThrottleOutcome::Raised { from, to }
            }
            Err(_) => ThrottleOutcome::AlreadyRaised,
        }
    }

    /// Number of signals received after the ceiling was reached
    pub fn absorbed_signals(&self) -> u64 {
        self.absorbed.load(Ordering::Relaxed)
    }
}

fn as_millis(x: Duration) -> u64 {
    u64::try_from(x.as_millis()).unwrap_or(u64::MAX)
}

/// Effect of a GOAWAY on a [`KeepaliveThrottle`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThrottleOutcome {
    /// The GOAWAY was for some other reason
    Ignored,
    /// The interval was raised
    Raised {
        /// Interval before the raise
        from: Duration,
        /// Interval after the raise
        to: Duration,
    },
    /// Another connection that used the same interval already raised it
    AlreadyRaised,
    /// The interval is at its ceiling; the signal was absorbed
    Saturated,
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use bytes::Bytes;

    use super::*;
    use crate::{ErrorCode, GoAwayReason, StreamId};

    const SEC: Duration = Duration::from_secs(1);

    fn throttle(initial: Duration) -> KeepaliveThrottle {
        KeepaliveThrottle::new(initial, Duration::from_millis(1), 60 * SEC)
    }

    fn too_many_pings() -> GoAway {
        GoAway::too_many_pings(StreamId(1), 2)
    }

    #[test]
    fn doubles_per_signal() {
        let throttle = throttle(SEC);
        for expected in [2, 4, 8] {
            let used = throttle.current_interval();
            assert_eq!(
                throttle.on_goaway_received(&too_many_pings(), used),
                ThrottleOutcome::Raised {
                    from: used,
                    to: expected * SEC
                }
            );
            assert_eq!(throttle.current_interval(), expected * SEC);
        }
    }

    #[test]
    fn other_reasons_are_ignored() {
        let throttle = throttle(SEC);
        let graceful = GoAway::graceful(StreamId(1), "shutting down");
        assert_eq!(
            throttle.on_goaway_received(&graceful, SEC),
            ThrottleOutcome::Ignored
        );
        let mut wrong_code = too_many_pings();
        wrong_code.error_code = ErrorCode::NO_ERROR;
        assert_eq!(
            throttle.on_goaway_received(&wrong_code, SEC),
            ThrottleOutcome::Ignored
        );
        let mut other_reason = too_many_pings();
        other_reason.reason = GoAwayReason::Other(Bytes::from_static(b"max_age"));
        assert_eq!(
            throttle.on_goaway_received(&other_reason, SEC),
            ThrottleOutcome::Ignored
        );
        assert_eq!(throttle.current_interval(), SEC);
    }

    #[test]
    fn never_exceeds_ceiling() {
        let throttle = KeepaliveThrottle::new(SEC, SEC, 5 * SEC);
        let mut saturated = 0;
        for _ in 0..10 {
            let used = throttle.current_interval();
            if throttle.on_goaway_received(&too_many_pings(), used) == ThrottleOutcome::Saturated {
                saturated += 1;
            }
            assert!(throttle.current_interval() <= 5 * SEC);
        }
        assert_eq!(throttle.current_interval(), 5 * SEC);
        // 1s -> 2s -> 4s -> 5s, then every further signal is absorbed
        assert_eq!(saturated, 7);
        assert_eq!(throttle.absorbed_signals(), 7);
    }

    #[test]
    fn stale_signal_does_not_lower_or_repeat() {
        let throttle = throttle(SEC);
        throttle.on_goaway_received(&too_many_pings(), SEC);
        throttle.on_goaway_received(&too_many_pings(), 2 * SEC);
        assert_eq!(throttle.current_interval(), 4 * SEC);
        // A connection still running with the original interval reports late
        assert_eq!(
            throttle.on_goaway_received(&too_many_pings(), SEC),
            ThrottleOutcome::AlreadyRaised
        );
        assert_eq!(throttle.current_interval(), 4 * SEC);
    }

    #[test]
    fn concurrent_signals_for_one_interval_double_once() {
        let throttle = Arc::new(throttle(SEC));
        let handles = (0..8)
            .map(|_| {
                let throttle = throttle.clone();
                thread::spawn(move || throttle.on_goaway_received(&too_many_pings(), SEC))
            })
            .collect::<Vec<_>>();
        let raised = handles
            .into_iter()
            .map(|x| x.join().unwrap())
            .filter(|x| matches!(x, ThrottleOutcome::Raised { .. }))
            .count();
        assert_eq!(raised, 1);
        assert_eq!(throttle.current_interval(), 2 * SEC);
    }

    #[test]
    fn keepalive_disabled_means_no_throttle() {
        assert!(KeepaliveThrottle::from_args(&ChannelArgs::default()).is_none());
        let mut args = ChannelArgs::default();
        args.keepalive_time(Some(SEC));
        let throttle = KeepaliveThrottle::from_args(&args).unwrap();
        assert_eq!(throttle.current_interval(), SEC);
    }
}
