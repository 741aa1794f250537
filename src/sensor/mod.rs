//! Light sensor input and pulse detection.
//!
//! This module turns the raw, noisy reading of the photo sensor taped over the
//! meter's indicator LED into clean pulse events.

pub mod detector;
pub mod source;

// Re-export commonly used items
pub use detector::{Detection, PulseDetector, SignalLevel};
pub use source::{DefaultSignalSource, ReplaySource, SignalSource};
