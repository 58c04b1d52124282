//! Backpressure handshake between adjacent nodes.
//!
//! A streaming node emits one batch, then waits for a tick from downstream
//! before pulling the next page. When a request drains it ticks the nearest
//! tick-consuming node upstream, releasing backpressure one hop up.

use std::fmt;
use std::sync::{Arc, OnceLock};

/// Something that accepts tick signals.
pub trait TickSink: Send + Sync {
    fn tick(&self);
}

/// Graph topology as seen by one node.
pub trait Topology: Send + Sync {
    /// Nearest wired predecessor of `node_id` that consumes ticks, if any.
    fn tick_consumer_upstream(&self, node_id: &str) -> Option<Arc<dyn TickSink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Fetching,
    AwaitingDownstream,
    Draining,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Idle => write!(f, "idle"),
            FlowState::Fetching => write!(f, "fetching"),
            FlowState::AwaitingDownstream => write!(f, "awaiting downstream"),
            FlowState::Draining => write!(f, "draining"),
        }
    }
}

/// Per-node flow-control state.
pub struct TickState {
    downstream_ready: bool,
    state: FlowState,
    upstream: OnceLock<Option<Arc<dyn TickSink>>>,
}

impl Default for TickState {
    fn default() -> Self {
        Self {
            downstream_ready: true,
            state: FlowState::Idle,
            upstream: OnceLock::new(),
        }
    }
}

impl TickState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the tick-consuming upstream neighbour. Only the first call
    /// queries the topology; wiring does not change afterwards.
    pub fn resolve_upstream(&self, topology: &dyn Topology, node_id: &str) {
        self.upstream.get_or_init(|| {
            let upstream = topology.tick_consumer_upstream(node_id);
            tracing::debug!(
                "Node {}: tick-consuming upstream {}",
                node_id,
                if upstream.is_some() { "found" } else { "absent" }
            );
            upstream
        });
    }

    pub fn has_upstream(&self) -> bool {
        matches!(self.upstream.get(), Some(Some(_)))
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn downstream_ready(&self) -> bool {
        self.downstream_ready
    }

    /// A data message started a request.
    pub fn on_data(&mut self) {
        self.state = FlowState::Fetching;
        self.downstream_ready = true;
    }

    /// A fetch may be issued now.
    pub fn may_fetch(&self) -> bool {
        self.state == FlowState::Fetching && self.downstream_ready
    }

    /// A batch went downstream. No further page is pulled until a tick.
    pub fn on_batch_emitted(&mut self, is_final: bool) {
        self.downstream_ready = false;
        self.state = if is_final {
            FlowState::Draining
        } else {
            FlowState::AwaitingDownstream
        };
    }

    /// Downstream can take more. Returns whether a parked stream resumes.
    pub fn on_tick(&mut self) -> bool {
        self.downstream_ready = true;
        if self.state == FlowState::AwaitingDownstream {
            self.state = FlowState::Fetching;
            true
        } else {
            false
        }
    }

    /// The request failed; nothing resumes until the next data message.
    pub fn on_error(&mut self) {
        self.downstream_ready = false;
        self.state = FlowState::Draining;
    }

    /// The request's resources are released. Ticks the upstream neighbour,
    /// returning whether one was resolved.
    pub fn on_settled(&mut self) -> bool {
        self.state = FlowState::Idle;
        match self.upstream.get() {
            Some(Some(upstream)) => {
                upstream.tick();
                true
            }
            _ => false,
        }
    }

    /// A request was dropped without draining, e.g. superseded by new data.
    pub fn on_abandoned(&mut self) {
        self.state = FlowState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTopology, RecordingTick};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_streaming_cycle() {
        let mut state = TickState::new();
        assert_eq!(state.state(), FlowState::Idle);

        state.on_data();
        assert!(state.may_fetch());

        state.on_batch_emitted(false);
        assert_eq!(state.state(), FlowState::AwaitingDownstream);
        assert!(!state.downstream_ready());
        assert!(!state.may_fetch());

        assert!(state.on_tick());
        assert!(state.may_fetch());

        state.on_batch_emitted(true);
        assert_eq!(state.state(), FlowState::Draining);
        state.on_settled();
        assert_eq!(state.state(), FlowState::Idle);
    }

    #[test]
    fn test_tick_while_idle_only_marks_ready() {
        let mut state = TickState::new();
        state.on_data();
        state.on_batch_emitted(true);
        state.on_settled();

        assert!(!state.on_tick());
        assert!(state.downstream_ready());
        assert!(!state.may_fetch());
    }

    #[test]
    fn test_error_forces_not_ready() {
        let mut state = TickState::new();
        state.on_data();
        state.on_error();
        assert!(!state.downstream_ready());
        assert_eq!(state.state(), FlowState::Draining);
    }

    #[test]
    fn test_settled_ticks_upstream_once() {
        let tick = Arc::new(RecordingTick::default());
        let topology = FakeTopology::with_upstream(tick.clone());
        let mut state = TickState::new();
        state.resolve_upstream(&topology, "n1");

        state.on_data();
        state.on_batch_emitted(true);
        assert!(state.on_settled());
        assert_eq!(tick.count(), 1);
    }

    #[test]
    fn test_settled_without_upstream_sends_nothing() {
        let topology = FakeTopology::default();
        let mut state = TickState::new();
        state.resolve_upstream(&topology, "n1");
        assert!(!state.has_upstream());
        assert!(!state.on_settled());
    }

    #[test]
    fn test_upstream_resolved_once() {
        let topology = FakeTopology::with_upstream(Arc::new(RecordingTick::default()));
        let state = TickState::new();
        state.resolve_upstream(&topology, "n1");
        state.resolve_upstream(&topology, "n1");
        assert_eq!(topology.lookups.load(Ordering::SeqCst), 1);
        assert!(state.has_upstream());
    }
}
