//! Units of paced work

use crate::scheduler::Shared;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single piece of work tracked by the scheduler.
///
/// Each flag only ever moves from `false` to `true` once (paused and high
/// priority are cleared again by [`Unit::finish`]), which keeps the shared
/// counters from going negative. Dropping an unfinished unit finishes it.
pub struct Unit {
    id: u64,
    shared: Arc<Shared>,
    finished: AtomicBool,
    paused: AtomicBool,
    high_priority: AtomicBool,
}

impl Unit {
    pub(crate) fn new(id: u64, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            finished: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            high_priority: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the scheduler clears this unit to run
    pub async fn wait_for_slot(&self) {
        if self.is_high_priority() {
            return;
        }

        let mut next_slot = self.shared.next_slot.subscribe();
        loop {
            if self.shared.is_cleared(self.id) {
                return;
            }
            if next_slot.changed().await.is_err() {
                return;
            }
        }
    }

    /// Mark the unit as waiting on something other than the scheduler.
    ///
    /// Paused units widen the clearance so they do not count against the pace.
    pub fn pause(&self) {
        if self.is_finished() {
            return;
        }
        if self
            .paused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shared.paused_units.fetch_add(1, Ordering::AcqRel);
            // finish may have run in between and missed the flag
            if self.is_finished() && self.paused.swap(false, Ordering::AcqRel) {
                self.shared.paused_units.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Let this unit bypass slot waiting
    pub fn make_high_priority(&self) {
        if self.is_finished() {
            return;
        }
        if self
            .high_priority
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shared.high_prio_units.fetch_add(1, Ordering::AcqRel);
            if self.is_finished() && self.high_priority.swap(false, Ordering::AcqRel) {
                self.shared.high_prio_units.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority.load(Ordering::Acquire)
    }

    /// Finish the unit. Calling this more than once has no further effect.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.finished.fetch_add(1, Ordering::AcqRel);
        if self.paused.swap(false, Ordering::AcqRel) {
            self.shared.paused_units.fetch_sub(1, Ordering::AcqRel);
        }
        if self.high_priority.swap(false, Ordering::AcqRel) {
            self.shared.high_prio_units.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Drop for Unit {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .field("paused", &self.is_paused())
            .field("high_priority", &self.is_high_priority())
            .finish()
    }
}
