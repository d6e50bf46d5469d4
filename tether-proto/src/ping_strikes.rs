use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::{ChannelArgs, GoAway, StreamId, IDLE_PING_INTERVAL};

/// Receiver-side judgement of how often the peer pings
///
/// One counter exists per connection and starts from scratch on every new connection, whatever
/// the peer did before. Frames must be reported in arrival order.
///
/// A ping arriving sooner than the minimum interval after the previous one is a strike; a ping
/// arriving later clears all strikes. Once the strike count exceeds the configured maximum the
/// counter produces a `too_many_pings` [`GoAway`] exactly once and enters
/// [`StrikeState::ShuttingDown`] for good.
#[derive(Debug)]
pub struct PingStrikeCounter {
    min_interval: Duration,
    max_strikes: u32,
    permit_without_calls: bool,
    last_ping: Option<Instant>,
    strikes: u32,
    state: StrikeState,
}

impl PingStrikeCounter {
    /// Create a counter using the receiver options of `args`
    pub fn new(args: &ChannelArgs) -> Self {
        Self {
            min_interval: args.min_recv_ping_interval_without_data,
            max_strikes: args.max_ping_strikes,
            permit_without_calls: args.keepalive_permit_without_calls,
            last_ping: None,
            strikes: 0,
            state: StrikeState::Idle,
        }
    }

    /// Judge a ping received at `now`
    ///
    /// `active_streams` tells whether any call is currently open on the connection, and
    /// `last_stream_id` is the newest stream this side accepted, for inclusion in a GOAWAY.
    pub fn on_ping_received(
        &mut self,
        now: Instant,
        active_streams: bool,
        last_stream_id: StreamId,
    ) -> PingVerdict {
        if self.state == StrikeState::ShuttingDown {
            trace!("ping received while shutting down");
            return PingVerdict::Draining;
        }

        let min_interval = if active_streams || self.permit_without_calls {
            self.min_interval
        } else {
            self.min_interval.max(IDLE_PING_INTERVAL)
        };

        let previous = self.last_ping.replace(now);
        let early = match previous {
            Some(previous) => now.saturating_duration_since(previous) < min_interval,
            None => false,
        };
        if !early {
            if self.strikes != 0 {
                trace!(forgiven = self.strikes, "compliant ping clears strikes");
            }
            self.strikes = 0;
            self.state = StrikeState::Idle;
            return PingVerdict::Accepted;
        }

        self.strikes += 1;
        debug!(
            strikes = self.strikes,
            max = self.max_strikes,
            ?min_interval,
            "ping strike"
        );
        if self.strikes <= self.max_strikes {
            self.state = StrikeState::CountingStrikes;
            return PingVerdict::Strike(self.strikes);
        }

        warn!(
            strikes = self.strikes,
            "peer exceeded its ping strike budget, sending too_many_pings"
        );
        self.state = StrikeState::ShuttingDown;
        PingVerdict::TooManyPings(GoAway::too_many_pings(last_stream_id, self.strikes))
    }

    /// Note that headers, trailers or a reset were sent or received
    ///
    /// Pings following data exchange are not judged against the previous ping.
    pub fn on_stream_activity(&mut self) {
        if self.state == StrikeState::ShuttingDown {
            return;
        }
        self.last_ping = None;
        self.strikes = 0;
        self.state = StrikeState::Idle;
    }

    /// Current number of strikes
    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Current state
    pub fn state(&self) -> StrikeState {
        self.state
    }
}

/// Progress of a [`PingStrikeCounter`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StrikeState {
    /// No outstanding strikes
    Idle,
    /// At least one strike, but no more than the maximum
    CountingStrikes,
    /// The peer was sent a `too_many_pings` GOAWAY; terminal
    ShuttingDown,
}

/// Outcome of judging one received ping
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PingVerdict {
    /// The ping respected the policy
    Accepted,
    /// The ping came too soon; carries the strike count so far
    Strike(u32),
    /// The strike budget ran out; send this GOAWAY and drain the connection
    TooManyPings(GoAway),
    /// The connection is already draining; acknowledge the ping and nothing else
    Draining,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(min_interval: Duration, max_strikes: u32) -> PingStrikeCounter {
        let mut args = ChannelArgs::default();
        args.min_recv_ping_interval_without_data(min_interval)
            .max_ping_strikes(max_strikes);
        PingStrikeCounter::new(&args)
    }

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn fast_pings_accumulate_strikes() {
        let mut counter = counter(5 * SEC, 10);
        let start = Instant::now();
        assert_eq!(
            counter.on_ping_received(start, true, StreamId(1)),
            PingVerdict::Accepted
        );
        for n in 1..=10 {
            let verdict = counter.on_ping_received(start + n * SEC, true, StreamId(1));
            assert_eq!(verdict, PingVerdict::Strike(n));
            assert_eq!(counter.strikes(), n);
            assert_eq!(counter.state(), StrikeState::CountingStrikes);
        }
    }

    #[test]
    fn third_fast_ping_exceeds_single_strike_budget() {
        let mut counter = counter(5 * SEC, 1);
        let start = Instant::now();
        assert_eq!(
            counter.on_ping_received(start, true, StreamId(1)),
            PingVerdict::Accepted
        );
        assert_eq!(
            counter.on_ping_received(start + SEC, true, StreamId(1)),
            PingVerdict::Strike(1)
        );
        match counter.on_ping_received(start + 2 * SEC, true, StreamId(3)) {
            PingVerdict::TooManyPings(goaway) => {
                assert!(goaway.is_too_many_pings());
                assert_eq!(goaway.last_stream_id, StreamId(3));
            }
            x => panic!("unexpected verdict {x:?}"),
        }
        assert_eq!(counter.state(), StrikeState::ShuttingDown);
        // Only one GOAWAY, however fast the peer keeps pinging
        assert_eq!(
            counter.on_ping_received(start + 2 * SEC, true, StreamId(3)),
            PingVerdict::Draining
        );
        counter.on_stream_activity();
        assert_eq!(counter.state(), StrikeState::ShuttingDown);
    }

    #[test]
    fn compliant_ping_resets_strikes() {
        let mut counter = counter(5 * SEC, 2);
        let start = Instant::now();
        counter.on_ping_received(start, true, StreamId(1));
        counter.on_ping_received(start + SEC, true, StreamId(1));
        counter.on_ping_received(start + 2 * SEC, true, StreamId(1));
        assert_eq!(counter.strikes(), 2);
        assert_eq!(
            counter.on_ping_received(start + 7 * SEC, true, StreamId(1)),
            PingVerdict::Accepted
        );
        assert_eq!(counter.strikes(), 0);
        assert_eq!(counter.state(), StrikeState::Idle);
    }

    #[test]
    fn stream_activity_forgives() {
        let mut counter = counter(5 * SEC, 1);
        let start = Instant::now();
        counter.on_ping_received(start, true, StreamId(1));
        counter.on_ping_received(start + SEC, true, StreamId(1));
        counter.on_stream_activity();
        assert_eq!(counter.strikes(), 0);
        // First ping after data is never early
        assert_eq!(
            counter.on_ping_received(start + SEC, true, StreamId(1)),
            PingVerdict::Accepted
        );
    }

    #[test]
    fn idle_connection_uses_long_interval() {
        let mut counter = counter(5 * SEC, 1);
        let start = Instant::now();
        counter.on_ping_received(start, false, StreamId::ZERO);
        assert_eq!(
            counter.on_ping_received(start + 60 * SEC, false, StreamId::ZERO),
            PingVerdict::Strike(1)
        );

        let mut args = ChannelArgs::default();
        args.min_recv_ping_interval_without_data(5 * SEC)
            .keepalive_permit_without_calls(true);
        let mut permissive = PingStrikeCounter::new(&args);
        permissive.on_ping_received(start, false, StreamId::ZERO);
        assert_eq!(
            permissive.on_ping_received(start + 60 * SEC, false, StreamId::ZERO),
            PingVerdict::Accepted
        );
    }
}
