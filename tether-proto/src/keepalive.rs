use std::time::{Duration, Instant};

use tracing::trace;

use crate::ChannelArgs;

/// Sender-side keepalive schedule for one connection
///
/// The interval is fixed for the lifetime of the connection; it is whatever the owning
/// channel's [`KeepaliveThrottle`](crate::KeepaliveThrottle) reported when the connection was
/// built. The sender ping policy applies on top of it: at most `max_pings_without_data` pings in
/// a row without sending data, spaced at least `min_sent_ping_interval_without_data` apart.
#[derive(Debug)]
pub struct KeepaliveState {
    interval: Option<Duration>,
    timeout: Duration,
    permit_without_calls: bool,
    max_pings_without_data: u32,
    min_sent_interval: Duration,

    pings_without_data: u32,
    last_ping_sent: Option<Instant>,
    /// When the next keepalive ping is due, if one is scheduled
    next_ping_at: Option<Instant>,
    outstanding: Option<Outstanding>,
}

#[derive(Debug, Copy, Clone)]
struct Outstanding {
    payload: u64,
    deadline: Instant,
}

impl KeepaliveState {
    /// Schedule keepalive at `interval` for a connection established at `now`
    ///
    /// `None` disables keepalive pings, while the sender policy still governs other pings.
    pub fn new(args: &ChannelArgs, interval: Option<Duration>, now: Instant) -> Self {
        Self {
            interval,
            timeout: args.keepalive_timeout,
            permit_without_calls: args.keepalive_permit_without_calls,
            max_pings_without_data: args.max_pings_without_data,
            min_sent_interval: args.min_sent_ping_interval_without_data,
            pings_without_data: 0,
            last_ping_sent: None,
            next_ping_at: interval.map(|x| now + x),
            outstanding: None,
        }
    }

    /// Keepalive interval this connection runs with
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// When [`handle_timeout`](Self::handle_timeout) should next be called
    pub fn poll_timeout(&self, active_streams: bool) -> Option<Instant> {
        let ping = self.ping_due_at(active_streams);
        let deadline = self.outstanding.map(|x| x.deadline);
        match (ping, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Process timer expiry
    ///
    /// On [`KeepaliveAction::SendPing`] the caller sends a ping and reports it through
    /// [`on_ping_sent`](Self::on_ping_sent).
    pub fn handle_timeout(
        &mut self,
        now: Instant,
        active_streams: bool,
    ) -> Option<KeepaliveAction> {
        if let Some(outstanding) = self.outstanding {
            if outstanding.deadline <= now {
                self.outstanding = None;
                return Some(KeepaliveAction::TimedOut);
            }
        }
        match self.ping_due_at(active_streams) {
            Some(due) if due <= now => {
                trace!("keepalive ping due");
                Some(KeepaliveAction::SendPing)
            }
            _ => None,
        }
    }

    /// A keepalive ping with `payload` was sent at `now`
    pub fn on_ping_sent(&mut self, payload: u64, now: Instant) {
        self.record_ping_sent(now);
        self.next_ping_at = None;
        self.outstanding = Some(Outstanding {
            payload,
            deadline: now + self.timeout,
        });
    }

    /// Some other ping, e.g. a bandwidth probe, was sent at `now`
    ///
    /// It counts against the sender ping policy but is not awaited.
    pub fn record_ping_sent(&mut self, now: Instant) {
        self.pings_without_data = self.pings_without_data.saturating_add(1);
        self.last_ping_sent = Some(now);
    }

    /// A ping acknowledgement arrived; returns whether it was for the outstanding keepalive
    pub fn on_ping_ack(&mut self, payload: u64, now: Instant) -> bool {
        match self.outstanding {
            Some(x) if x.payload == payload => {
                self.outstanding = None;
                self.next_ping_at = self.interval.map(|x| now + x);
                true
            }
            _ => false,
        }
    }

    /// Headers, trailers or a reset were sent
    pub fn on_data_sent(&mut self) {
        self.pings_without_data = 0;
    }

    /// Stream activity arrived from the peer, proving it alive
    pub fn on_data_received(&mut self, now: Instant) {
        if self.outstanding.is_none() {
            self.next_ping_at = self.interval.map(|x| now + x);
        }
    }

    /// A stream opened, possibly on a connection that was idle
    ///
    /// Keepalive does not run while idle unless permitted, so a deadline that lapsed meanwhile
    /// is restarted instead of firing at once.
    pub fn on_streams_active(&mut self, now: Instant) {
        if self.outstanding.is_some() {
            return;
        }
        if let Some(interval) = self.interval {
            match self.next_ping_at {
                Some(x) if x > now => {}
                _ => self.next_ping_at = Some(now + interval),
            }
        }
    }

    /// Whether the sender ping policy allows a ping at `now`
    pub fn may_send_ping(&self, now: Instant) -> bool {
        match self.earliest_ping() {
            Some(EarliestPing::Any) => true,
            Some(EarliestPing::At(x)) => x <= now,
            None => false,
        }
    }

    fn ping_due_at(&self, active_streams: bool) -> Option<Instant> {
        if !active_streams && !self.permit_without_calls {
            return None;
        }
        if self.outstanding.is_some() {
            return None;
        }
        let due = self.next_ping_at?;
        match self.earliest_ping() {
            Some(EarliestPing::Any) => Some(due),
            Some(EarliestPing::At(x)) => Some(due.max(x)),
            None => None,
        }
    }

    /// `None` if the policy forbids pings until data is sent
    fn earliest_ping(&self) -> Option<EarliestPing> {
        if self.max_pings_without_data != 0
            && self.pings_without_data >= self.max_pings_without_data
        {
            return None;
        }
        match self.last_ping_sent {
            Some(last) if self.pings_without_data > 0 => {
                Some(EarliestPing::At(last + self.min_sent_interval))
            }
            _ => Some(EarliestPing::Any),
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum EarliestPing {
    Any,
    At(Instant),
}

/// Work requested by [`KeepaliveState::handle_timeout`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KeepaliveAction {
    /// Send a keepalive ping now
    SendPing,
    /// The outstanding keepalive ping was not acknowledged in time; close the connection
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn unlimited() -> ChannelArgs {
        let mut args = ChannelArgs::default();
        args.max_pings_without_data(0)
            .min_sent_ping_interval_without_data(Duration::ZERO)
            .keepalive_timeout(20 * SEC);
        args
    }

    #[test]
    fn pings_every_interval_while_active() {
        let start = Instant::now();
        let mut state = KeepaliveState::new(&unlimited(), Some(SEC), start);
        assert_eq!(state.poll_timeout(true), Some(start + SEC));
        assert_eq!(state.handle_timeout(start + SEC / 2, true), None);
        assert_eq!(
            state.handle_timeout(start + SEC, true),
            Some(KeepaliveAction::SendPing)
        );
        state.on_ping_sent(42, start + SEC);
        assert_eq!(state.poll_timeout(true), Some(start + 21 * SEC));
        assert!(!state.on_ping_ack(41, start + SEC));
        assert!(state.on_ping_ack(42, start + SEC));
        assert_eq!(state.poll_timeout(true), Some(start + 2 * SEC));
    }

    #[test]
    fn idle_connection_does_not_ping() {
        let start = Instant::now();
        let mut state = KeepaliveState::new(&unlimited(), Some(SEC), start);
        assert_eq!(state.poll_timeout(false), None);
        assert_eq!(state.handle_timeout(start + 10 * SEC, false), None);
        // Lapsed deadline restarts when a call begins
        state.on_streams_active(start + 10 * SEC);
        assert_eq!(state.poll_timeout(true), Some(start + 11 * SEC));

        let mut args = unlimited();
        args.keepalive_permit_without_calls(true);
        let state = KeepaliveState::new(&args, Some(SEC), start);
        assert_eq!(state.poll_timeout(false), Some(start + SEC));
    }

    #[test]
    fn unacknowledged_ping_times_out() {
        let start = Instant::now();
        let mut state = KeepaliveState::new(&unlimited(), Some(SEC), start);
        state.on_ping_sent(1, start + SEC);
        assert_eq!(state.handle_timeout(start + 20 * SEC, true), None);
        assert_eq!(
            state.handle_timeout(start + 21 * SEC, true),
            Some(KeepaliveAction::TimedOut)
        );
    }

    #[test]
    fn policy_limits_pings_without_data() {
        let start = Instant::now();
        let mut args = ChannelArgs::default();
        args.max_pings_without_data(2)
            .min_sent_ping_interval_without_data(10 * SEC);
        let mut state = KeepaliveState::new(&args, Some(SEC), start);
        assert!(state.may_send_ping(start));
        state.on_ping_sent(1, start + SEC);
        assert!(state.on_ping_ack(1, start + SEC));
        // Due after one interval, but spaced by the minimum sent interval
        assert_eq!(state.poll_timeout(true), Some(start + 11 * SEC));
        assert!(!state.may_send_ping(start + 5 * SEC));
        state.on_ping_sent(2, start + 11 * SEC);
        assert!(state.on_ping_ack(2, start + 11 * SEC));
        // Budget exhausted until data is sent
        assert_eq!(state.poll_timeout(true), None);
        assert!(!state.may_send_ping(start + 100 * SEC));
        state.on_data_sent();
        assert!(state.may_send_ping(start + 12 * SEC));
        assert_eq!(state.poll_timeout(true), Some(start + 12 * SEC));
    }

    #[test]
    fn received_data_defers_ping() {
        let start = Instant::now();
        let mut state = KeepaliveState::new(&unlimited(), Some(SEC), start);
        state.on_data_received(start + SEC / 2);
        assert_eq!(state.poll_timeout(true), Some(start + SEC * 3 / 2));
    }

    #[test]
    fn disabled_keepalive_never_schedules() {
        let start = Instant::now();
        let mut state = KeepaliveState::new(&unlimited(), None, start);
        state.on_streams_active(start);
        assert_eq!(state.poll_timeout(true), None);
        assert!(state.may_send_ping(start));
    }
}
