//! Pulse accounting and report scheduling.
//!
//! The [`Accumulator`] owns the one mutable [`MeterState`] of the agent. The
//! sampling path writes to it on every pulse and the reporting path on every
//! successful push; nothing else touches it.

pub mod accumulator;
pub mod scheduler;
pub mod state;

// Re-export commonly used items
pub use accumulator::{Accumulator, Receipt};
pub use scheduler::BatchScheduler;
pub use state::{MeterState, PulseEvent, ReportJob};
