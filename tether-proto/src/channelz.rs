//! Read-only telemetry for channels
//!
//! Every channel owns one [`ChannelNode`], shared with whatever introspection tooling the
//! application runs. Counters track call lifecycle transitions as they happen; the node never
//! reaches back into the channel.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

/// Trace events kept per node; older events are discarded
const MAX_TRACE_EVENTS: usize = 64;

/// Connectivity of a channel or subchannel
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum ConnectivityState {
    /// No connection and none being attempted
    #[default]
    Idle,
    /// A connection attempt is in progress
    Connecting,
    /// A connection is established and accepting calls
    Ready,
    /// The last connection attempt or connection failed
    TransientFailure,
    /// The channel has been destroyed
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Ready => "READY",
            Self::TransientFailure => "TRANSIENT_FAILURE",
            Self::Shutdown => "SHUTDOWN",
        })
    }
}

/// Telemetry node for one channel
#[derive(Debug)]
pub struct ChannelNode {
    target: String,
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    throttle_events: AtomicU64,
    state: Mutex<NodeState>,
}

#[derive(Debug, Default)]
struct NodeState {
    connectivity: ConnectivityState,
    last_call_started: Option<Instant>,
    trace: VecDeque<TraceEvent>,
}

impl ChannelNode {
    /// Create a node describing a channel to `target`
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            calls_started: AtomicU64::new(0),
            calls_succeeded: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            throttle_events: AtomicU64::new(0),
            state: Mutex::new(NodeState::default()),
        }
    }

    /// Record that a call was started at `now`
    pub fn record_call_started(&self, now: Instant) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().last_call_started = Some(now);
    }

    /// Record that a call finished with an OK status
    pub fn record_call_succeeded(&self) {
        self.calls_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a call finished with any other status
    pub fn record_call_failed(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that the keepalive interval was raised to `interval`
    pub fn record_keepalive_throttled(&self, now: Instant, interval: Duration) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
        self.add_trace_event(
            now,
            format!("keepalive interval raised to {interval:?} after too_many_pings"),
        );
    }

    /// Update the channel's connectivity, tracing the transition if it changed
    pub fn set_connectivity(&self, now: Instant, connectivity: ConnectivityState) {
        let mut state = self.state.lock().unwrap();
        if state.connectivity == connectivity {
            return;
        }
        let description = format!("{} -> {}", state.connectivity, connectivity);
        state.connectivity = connectivity;
        push_trace(&mut state.trace, now, description);
    }

    /// Current connectivity
    pub fn connectivity(&self) -> ConnectivityState {
        self.state.lock().unwrap().connectivity
    }

    /// Append a free-form event to the trace log
    pub fn add_trace_event(&self, now: Instant, description: impl Into<String>) {
        push_trace(&mut self.state.lock().unwrap().trace, now, description.into());
    }

    /// Target the channel was created for
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Consistent copy of the node's current values
    pub fn snapshot(&self) -> ChannelSnapshot {
        let state = self.state.lock().unwrap();
        ChannelSnapshot {
            target: self.target.clone(),
            connectivity: state.connectivity,
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            keepalive_throttle_events: self.throttle_events.load(Ordering::Relaxed),
            last_call_started: state.last_call_started,
            trace: state.trace.iter().cloned().collect(),
        }
    }
}

fn push_trace(trace: &mut VecDeque<TraceEvent>, at: Instant, description: String) {
    if trace.len() == MAX_TRACE_EVENTS {
        trace.pop_front();
    }
    trace.push_back(TraceEvent { at, description });
}

/// Point-in-time view of a [`ChannelNode`]
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ChannelSnapshot {
    /// Target the channel was created for
    pub target: String,
    /// Connectivity at the time of the snapshot
    pub connectivity: ConnectivityState,
    /// Calls created on the channel
    pub calls_started: u64,
    /// Calls that completed with an OK status
    pub calls_succeeded: u64,
    /// Calls that completed with any other status
    pub calls_failed: u64,
    /// Times a `too_many_pings` GOAWAY raised the channel's keepalive interval
    pub keepalive_throttle_events: u64,
    /// When the most recent call was started
    pub last_call_started: Option<Instant>,
    /// Most recent trace events, oldest first
    pub trace: Vec<TraceEvent>,
}

/// Entry in a channel's trace log
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TraceEvent {
    /// When the event happened
    pub at: Instant,
    /// What happened
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_calls() {
        let node = ChannelNode::new("mem:server");
        let now = Instant::now();
        node.record_call_started(now);
        node.record_call_started(now);
        node.record_call_succeeded();
        node.record_call_failed();
        let snapshot = node.snapshot();
        assert_eq!(snapshot.calls_started, 2);
        assert_eq!(snapshot.calls_succeeded, 1);
        assert_eq!(snapshot.calls_failed, 1);
        assert_eq!(snapshot.last_call_started, Some(now));
    }

    #[test]
    fn connectivity_transitions_are_traced_once() {
        let node = ChannelNode::new("mem:server");
        let now = Instant::now();
        node.set_connectivity(now, ConnectivityState::Connecting);
        node.set_connectivity(now, ConnectivityState::Connecting);
        node.set_connectivity(now, ConnectivityState::Ready);
        let snapshot = node.snapshot();
        assert_eq!(snapshot.connectivity, ConnectivityState::Ready);
        let descriptions = snapshot
            .trace
            .iter()
            .map(|x| x.description.as_str())
            .collect::<Vec<_>>();
        assert_eq!(descriptions, ["IDLE -> CONNECTING", "CONNECTING -> READY"]);
    }

    #[test]
    fn trace_is_bounded() {
        let node = ChannelNode::new("mem:server");
        let now = Instant::now();
        for i in 0..(MAX_TRACE_EVENTS + 10) {
            node.add_trace_event(now, format!("event {i}"));
        }
        let trace = node.snapshot().trace;
        assert_eq!(trace.len(), MAX_TRACE_EVENTS);
        assert_eq!(trace[0].description, "event 10");
    }
}
