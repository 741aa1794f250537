//! Data structures for meter accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// A confirmed blink of the meter LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseEvent {
    /// Position of this pulse in detection order, starting at 1
    pub sequence: u64,
    /// When the leading edge was accepted
    pub at: Instant,
}

/// Durable measurement progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeterState {
    /// Every pulse ever confirmed on this device
    pub total_pulses: u64,
    /// Pulses not yet covered by a successful push
    pub pulses_since_last_report: u64,
    /// When the last push succeeded
    pub last_report_timestamp: Option<DateTime<Utc>>,
}

impl MeterState {
    /// Count one confirmed pulse.
    pub fn record_pulse(&mut self) {
        self.total_pulses = self.total_pulses.saturating_add(1);
        self.pulses_since_last_report = self.pulses_since_last_report.saturating_add(1);
    }

    /// Remove `count` reported pulses from the outstanding total.
    ///
    /// Pulses that arrived while the push was in flight stay outstanding.
    /// Returns the number actually subtracted.
    pub fn record_report(&mut self, count: u64, at: DateTime<Utc>) -> u64 {
        let applied = count.min(self.pulses_since_last_report);
        self.pulses_since_last_report -= applied;
        self.last_report_timestamp = Some(at);
        applied
    }

    /// `pulses_since_last_report` never exceeds `total_pulses`.
    pub fn is_consistent(&self) -> bool {
        self.pulses_since_last_report <= self.total_pulses
    }

    /// Pulses already covered by successful pushes.
    pub fn reported_pulses(&self) -> u64 {
        self.total_pulses - self.pulses_since_last_report.min(self.total_pulses)
    }
}

/// A push to perform, created when a report becomes due.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportJob {
    count: u64,
    wh_per_pulse: f64,
    endpoint: String,
}

impl ReportJob {
    /// Snapshot `count` outstanding pulses for delivery to `endpoint`.
    pub fn new(count: u64, wh_per_pulse: f64, endpoint: impl Into<String>) -> Self {
        Self {
            count,
            wh_per_pulse,
            endpoint: endpoint.into(),
        }
    }

    /// Outstanding pulses covered by this job.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Energy represented by the covered pulses, in watt-hours.
    pub fn energy_wh(&self) -> f64 {
        self.count as f64 * self.wh_per_pulse
    }

    /// Push URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The same job covering a different prefix of outstanding pulses.
    pub fn with_count(&self, count: u64) -> Self {
        Self {
            count,
            ..self.clone()
        }
    }

    /// Combine an undelivered job with a newer one.
    ///
    /// Both counts are snapshots of the same outstanding total, so the merged
    /// job covers the larger prefix rather than the sum.
    pub fn merge(self, newer: ReportJob) -> ReportJob {
        if newer.count >= self.count {
            newer
        } else {
            self
        }
    }
}
