//! Global timeout bookkeeping.
//!
//! Every blocking wait derives its deadline from one [`GlobalTimeout`]. The
//! budget grows by a fixed delta on each application restart, so repeated
//! restarts get more slack instead of a fresh clock.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct GlobalTimeout {
    started: Instant,
    budget: Duration,
    delta: Duration,
}

impl GlobalTimeout {
    pub fn new(budget: Duration, delta: Duration) -> Self {
        GlobalTimeout {
            started: Instant::now(),
            budget,
            delta,
        }
    }

    /// Extends the budget by one delta.
    pub fn increment(&mut self) {
        self.budget += self.delta;
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn delta(&self) -> Duration {
        self.delta
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.budget
    }

    pub fn timed_out(&self) -> bool {
        Instant::now() > self.deadline()
    }
}
