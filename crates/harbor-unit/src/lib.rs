//! Adaptive fair-share pacing of work units
//!
//! Every piece of paced work (an outbound container, a call step) takes a
//! [`Unit`] from the shared [`Scheduler`] and waits for its slot before doing
//! the work. Every 10 ms the scheduler opens a new slot and adjusts how many
//! units it lets through per slot, based on how many actually finished in the
//! last one. A busy line therefore only gets its share of each slot and cannot
//! starve the others.

pub mod config;
pub mod scheduler;
pub mod unit;

pub use config::SchedulerConfig;
pub use scheduler::{Scheduler, SchedulerStats};
pub use unit::Unit;
