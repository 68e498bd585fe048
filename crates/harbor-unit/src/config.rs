//! Scheduler configuration

use std::time::Duration;

/// Default length of one scheduling slot
pub const DEFAULT_SLOT_DURATION: Duration = Duration::from_millis(10);

/// Lowest number of units released per slot
pub const DEFAULT_MIN_SLOT_PACE: i64 = 1000;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub slot_duration: Duration,
    pub min_slot_pace: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slot_duration: DEFAULT_SLOT_DURATION,
            min_slot_pace: DEFAULT_MIN_SLOT_PACE,
        }
    }
}

impl SchedulerConfig {
    pub fn with_slot_duration(mut self, duration: Duration) -> Self {
        self.slot_duration = duration;
        self
    }

    /// Set the minimum pace; values below 1 are raised to 1
    pub fn with_min_slot_pace(mut self, pace: i64) -> Self {
        self.min_slot_pace = pace.max(1);
        self
    }
}
