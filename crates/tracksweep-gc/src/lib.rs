//! Run retention for tracksweep.
//!
//! The [`Collector`] performs one pass: list collectable runs, evaluate the
//! retention policy, then soft-delete, delete artifacts and purge each
//! expired run in that order. The [`GcScheduler`] repeats passes at a fixed
//! interval on a background task, never overlapping them.

pub mod collector;
pub mod scheduler;
pub mod wiring;

#[cfg(test)]
mod testing;

pub use collector::{Collector, GcPassResult, PassAborted};
pub use scheduler::{GcScheduler, SchedulerHandle, SchedulerState, SchedulerStatus};
