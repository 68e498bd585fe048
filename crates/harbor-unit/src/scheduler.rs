//! Slot loop and shared scheduler state

use crate::config::SchedulerConfig;
use crate::unit::Unit;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// State shared between the slot loop and all units
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) current_unit_id: AtomicU64,
    pub(crate) finished: AtomicU64,
    pub(crate) clearance_up_to: AtomicU64,
    pub(crate) slot_pace: AtomicI64,
    pub(crate) paused_units: AtomicI64,
    pub(crate) high_prio_units: AtomicI64,
    /// Bumped once per slot; units waiting for clearance watch it
    pub(crate) next_slot: watch::Sender<u64>,
}

impl Shared {
    pub(crate) fn is_cleared(&self, unit_id: u64) -> bool {
        unit_id <= self.clearance_up_to.load(Ordering::Acquire)
    }
}

/// Point-in-time view of the scheduler counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub current_unit_id: u64,
    pub finished: u64,
    pub clearance_up_to: u64,
    pub slot_pace: i64,
    pub paused_units: i64,
    pub high_prio_units: i64,
}

/// Paces units across all workers of a node.
///
/// Cloning is cheap; clones share the same counters and slot loop.
#[derive(Debug, Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    started: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Clearance for one slot, given the current pace and unit counters
fn slot_clearance(pace: i64, paused: i64, high_prio: i64) -> i64 {
    let base = pace + paused.max(0);
    base - high_prio.max(0).min(base / 5)
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let pace = config.min_slot_pace.max(1);
        let (next_slot, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                current_unit_id: AtomicU64::new(0),
                finished: AtomicU64::new(0),
                clearance_up_to: AtomicU64::new(pace as u64),
                slot_pace: AtomicI64::new(pace),
                paused_units: AtomicI64::new(0),
                high_prio_units: AtomicI64::new(0),
                next_slot,
            }),
            config,
            started: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the slot loop. Returns `None` if it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let shared = self.shared.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        Some(tokio::spawn(slot_loop(shared, config, cancel)))
    }

    /// Create the next unit
    pub fn new_unit(&self) -> Unit {
        let id = self.shared.current_unit_id.fetch_add(1, Ordering::AcqRel) + 1;
        Unit::new(id, self.shared.clone())
    }

    /// Stop pacing and release every waiting and future unit
    pub fn release(&self) {
        self.cancel.cancel();
        self.shared.clearance_up_to.store(u64::MAX, Ordering::Release);
        self.shared.next_slot.send_modify(|slot| *slot = slot.wrapping_add(1));
        debug!("Scheduler released");
    }

    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> SchedulerStats {
        let s = &self.shared;
        SchedulerStats {
            current_unit_id: s.current_unit_id.load(Ordering::Acquire),
            finished: s.finished.load(Ordering::Acquire),
            clearance_up_to: s.clearance_up_to.load(Ordering::Acquire),
            slot_pace: s.slot_pace.load(Ordering::Acquire),
            paused_units: s.paused_units.load(Ordering::Acquire),
            high_prio_units: s.high_prio_units.load(Ordering::Acquire),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

async fn slot_loop(shared: Arc<Shared>, config: SchedulerConfig, cancel: CancellationToken) {
    let min_pace = config.min_slot_pace.max(1);
    let mut ticker = tokio::time::interval(config.slot_duration);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    let mut last_finished = shared.finished.load(Ordering::Acquire);
    let mut last_clearance = min_pace;
    let mut increase_streak: i64 = 0;
    let mut decrease_streak: i64 = 0;

    debug!(slot_ms = config.slot_duration.as_millis() as u64, min_pace, "Scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let finished = shared.finished.load(Ordering::Acquire);
        let delta = finished.saturating_sub(last_finished) as i64;
        last_finished = finished;

        let mut pace = shared.slot_pace.load(Ordering::Acquire);
        if delta >= last_clearance {
            increase_streak += 1;
            decrease_streak = 0;
            pace += pace / 1000 * increase_streak;
        } else {
            decrease_streak += 1;
            increase_streak = 0;
            pace -= pace / 1000 * decrease_streak;
        }
        pace = pace.max(min_pace);
        shared.slot_pace.store(pace, Ordering::Release);

        let clearance = slot_clearance(
            pace,
            shared.paused_units.load(Ordering::Acquire),
            shared.high_prio_units.load(Ordering::Acquire),
        );
        last_clearance = clearance;

        if cancel.is_cancelled() {
            break;
        }
        shared
            .clearance_up_to
            .store(finished.saturating_add(clearance.max(0) as u64), Ordering::Release);
        shared.next_slot.send_modify(|slot| *slot = slot.wrapping_add(1));

        trace!(finished, delta, pace, clearance, "Scheduler slot");
    }

    shared.clearance_up_to.store(u64::MAX, Ordering::Release);
    shared.next_slot.send_modify(|slot| *slot = slot.wrapping_add(1));
    debug!("Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_slot_clearance() {
        assert_eq!(slot_clearance(1000, 0, 0), 1000);
        assert_eq!(slot_clearance(1000, 50, 0), 1050);
        assert_eq!(slot_clearance(1000, 0, 10), 990);
        // high priority units never take more than a fifth
        assert_eq!(slot_clearance(1000, 0, 5000), 800);
        assert_eq!(slot_clearance(1000, -3, -3), 1000);
    }

    #[tokio::test]
    async fn test_unit_ids_are_monotonic() {
        let scheduler = Scheduler::default();
        let a = scheduler.new_unit();
        let b = scheduler.new_unit();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(scheduler.stats().current_unit_id, 2);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let scheduler = Scheduler::default();
        let handle = scheduler.start();
        assert!(handle.is_some());
        assert!(scheduler.start().is_none());
        scheduler.release();
        handle.unwrap().await.unwrap();
        assert_eq!(scheduler.stats().clearance_up_to, u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_floors_at_minimum_when_idle() {
        let scheduler = Scheduler::default();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(105)).await;

        let stats = scheduler.stats();
        assert_eq!(stats.slot_pace, 1000);
        assert_eq!(stats.clearance_up_to, 1000);
        scheduler.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_grows_under_load() {
        let scheduler = Scheduler::default();
        scheduler.start();
        // Stay between slot boundaries so each slot sees one full batch
        tokio::time::sleep(Duration::from_millis(5)).await;

        for _ in 0..5 {
            for _ in 0..2000 {
                scheduler.new_unit().finish();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(scheduler.stats().slot_pace > 1000);
        scheduler.release();
    }
}
