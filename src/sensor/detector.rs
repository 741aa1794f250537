//! Hysteresis pulse detector with debounce and stall diagnostics.

use crate::config::{DetectorConfig, Polarity};
use crate::meter::PulseEvent;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Logical level of the LED after polarity is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalLevel {
    /// LED dark
    Low,
    /// LED lit
    High,
}

/// Outcome of feeding one sample to the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// A genuine blink started
    Pulse(PulseEvent),
    /// A threshold crossing arrived inside the debounce window and was dropped
    Rejected,
    /// The signal has not changed for longer than the stall duration
    Stalled { level: SignalLevel, stuck_for: Duration },
    /// Nothing to report
    Quiet,
}

/// Converts sampled intensities into pulse events.
///
/// The detector keeps a binary state. It moves to [`SignalLevel::High`] only
/// when the reading crosses the high threshold and back to
/// [`SignalLevel::Low`] only when it crosses the low threshold, so readings
/// wandering between the two thresholds never toggle it. Any crossing closer
/// than the debounce interval to the previously accepted one is discarded.
#[derive(Debug)]
pub struct PulseDetector {
    polarity: Polarity,
    high_threshold: u16,
    low_threshold: u16,
    debounce: Duration,
    stall: Duration,
    level: SignalLevel,
    last_transition: Option<Instant>,
    unchanged_since: Option<Instant>,
    stall_reported: bool,
    sequence: u64,
    rejected: u64,
}

impl PulseDetector {
    /// Create a detector starting in the dark state.
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            polarity: config.polarity,
            high_threshold: config.high_threshold,
            low_threshold: config.low_threshold,
            debounce: config.debounce(),
            stall: config.stall(),
            level: SignalLevel::Low,
            last_transition: None,
            unchanged_since: None,
            stall_reported: false,
            sequence: 0,
            rejected: 0,
        }
    }

    /// Continue pulse numbering after a restart.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Feed one sample taken at `at`.
    pub fn sample(&mut self, reading: u16, at: Instant) -> Detection {
        let unchanged_since = *self.unchanged_since.get_or_insert(at);

        if let Some(next) = self.crossing(reading) {
            if let Some(last) = self.last_transition {
                if at.saturating_duration_since(last) < self.debounce {
                    self.rejected += 1;
                    debug!(reading, ?next, "Crossing inside debounce window ignored");
                    return Detection::Rejected;
                }
            }

            self.level = next;
            self.last_transition = Some(at);
            self.unchanged_since = Some(at);
            self.stall_reported = false;

            if next == SignalLevel::High {
                self.sequence += 1;
                return Detection::Pulse(PulseEvent {
                    sequence: self.sequence,
                    at,
                });
            }
            return Detection::Quiet;
        }

        let stuck_for = at.saturating_duration_since(unchanged_since);
        if !self.stall_reported && stuck_for >= self.stall {
            self.stall_reported = true;
            return Detection::Stalled {
                level: self.level,
                stuck_for,
            };
        }

        Detection::Quiet
    }

    /// Current logical level.
    pub fn level(&self) -> SignalLevel {
        self.level
    }

    /// Number of pulses emitted so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of crossings dropped by the debounce filter.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn crossing(&self, reading: u16) -> Option<SignalLevel> {
        let (lit, dark) = match self.polarity {
            Polarity::ActiveHigh => (reading > self.high_threshold, reading < self.low_threshold),
            Polarity::ActiveLow => (reading < self.low_threshold, reading > self.high_threshold),
        };

        match self.level {
            SignalLevel::Low if lit => Some(SignalLevel::High),
            SignalLevel::High if dark => Some(SignalLevel::Low),
            _ => None,
        }
    }
}
