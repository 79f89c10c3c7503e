//! Poll lane
//!
//! The [`Scheduler`] owns the fixed-interval cycle: fetch, normalize, record, stage,
//! persist, commit, dispatch. Cycles never overlap.

pub mod runner;

pub use runner::{CycleError, CycleReport, CycleStatus, Scheduler, SchedulerConfig};
