//! Throttled health reporting.
//!
//! The node counts in-flight requests and remembers whether an error happened
//! since the last report. Reports are coalesced: at most one per period,
//! carrying the state at the time it fires.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::node::NodeOutput;
use crate::pool::PoolGauge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Fill {
    Grey,
    Red,
    Blue,
    Green,
    Yellow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Dot,
    Ring,
}

/// Status badge shown for the node. All fields empty means "no status".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<Fill>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    pub text: String,
}

impl NodeStatus {
    pub fn cleared() -> Self {
        Self {
            fill: None,
            shape: None,
            text: String::new(),
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.fill.is_none() && self.shape.is_none() && self.text.is_empty()
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.fill, self.shape) {
            (Some(fill), Some(shape)) => write!(f, "[{:?}/{:?}] {}", fill, shape, self.text),
            _ => write!(f, "{}", self.text),
        }
    }
}

/// Queue depth relative to pool capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTier {
    Errored,
    Empty,
    UnderCapacity,
    AtCapacity,
    OverCapacity,
}

impl HealthTier {
    pub fn classify(queue: i64, capacity: usize, has_error: bool) -> Self {
        let capacity = i64::try_from(capacity).unwrap_or(i64::MAX);
        if has_error {
            HealthTier::Errored
        } else if queue <= 0 {
            HealthTier::Empty
        } else if queue < capacity {
            HealthTier::UnderCapacity
        } else if queue == capacity {
            HealthTier::AtCapacity
        } else {
            HealthTier::OverCapacity
        }
    }

    pub fn fill(self) -> Fill {
        match self {
            HealthTier::Errored => Fill::Red,
            HealthTier::Empty => Fill::Blue,
            HealthTier::UnderCapacity | HealthTier::AtCapacity => Fill::Green,
            HealthTier::OverCapacity => Fill::Yellow,
        }
    }
}

/// Render the badge for a queue depth against the pool's live capacity.
pub fn render(queue: i64, capacity: usize, has_error: bool) -> NodeStatus {
    let tier = HealthTier::classify(queue, capacity, has_error);
    let over = HealthTier::classify(queue, capacity, false) == HealthTier::OverCapacity;
    NodeStatus {
        fill: Some(tier.fill()),
        shape: Some(if has_error || over { Shape::Ring } else { Shape::Dot }),
        text: format!("Queue: {}{}", queue, if has_error { " Error!" } else { "" }),
    }
}

#[derive(Default)]
struct TrackerState {
    queue: i64,
    has_error: bool,
    timer_armed: bool,
    closed: bool,
}

#[derive(Clone)]
pub struct StatusTracker {
    state: Arc<Mutex<TrackerState>>,
    output: Arc<dyn NodeOutput>,
    gauge: PoolGauge,
    period: Duration,
}

impl StatusTracker {
    pub fn new(output: Arc<dyn NodeOutput>, gauge: PoolGauge, period: Duration) -> Self {
        Self {
            state: Arc::default(),
            output,
            gauge,
            period,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self) -> i64 {
        self.lock().queue
    }

    /// Adjust the in-flight count and schedule a report if none is pending.
    pub fn update(&self, delta: i64, is_error: bool) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.queue += delta;
            state.has_error |= is_error;
            if state.timer_armed {
                return;
            }
            state.timer_armed = true;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let tracker = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(tracker.period).await;
                    tracker.flush();
                });
            }
            Err(_) => self.flush(),
        }
    }

    fn flush(&self) {
        let status = {
            let mut state = self.lock();
            state.timer_armed = false;
            if state.closed {
                return;
            }
            let status = render(state.queue, self.gauge.total_count(), state.has_error);
            state.has_error = false;
            status
        };
        self.output.status(status);
    }

    /// Clear the badge; later updates and pending reports are dropped.
    pub fn clear(&self) {
        self.lock().closed = true;
        self.output.status(NodeStatus::cleared());
    }
}
