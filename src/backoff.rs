//! A reconnect backoff schedule: a fixed sequence of delays, stepping
//! forward on each fault and saturating at the last entry, reset on
//! success.

use std::time::Duration;

/// Default schedule used by `EngineConfig::default()` and the consumer
/// engine when none is configured.
pub const DEFAULT_SCHEDULE_SECS: &[u64] = &[1, 2, 4, 8, 16, 32, 60];

#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: Vec<Duration>,
    step: usize,
}

impl Backoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule, step: 0 }
    }

    pub fn default_schedule() -> Self {
        Self::new(DEFAULT_SCHEDULE_SECS.iter().map(|s| Duration::from_secs(*s)).collect())
    }

    /// The delay a caller would currently wait, without advancing.
    pub fn current(&self) -> Duration {
        self.schedule
            .get(self.step)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Back to the front of the schedule. Called on a successful poll.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Return the current delay and advance to the next step
    /// (saturating at the schedule's last entry). Split out from
    /// `interval` so callers holding a lock on the `Backoff` can release
    /// it before the actual sleep.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current();
        if self.step + 1 < self.schedule.len() {
            self.step += 1;
        }
        delay
    }

    /// Sleep for the current delay, then advance to the next step.
    pub async fn interval(&mut self) {
        let delay = self.advance();
        tokio::time::sleep(delay).await;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::default_schedule()
    }
}
