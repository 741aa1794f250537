//! Decides when a report is due.

use crate::config::{EnergyConfig, SchedulerConfig};
use crate::meter::ReportJob;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Threshold-driven report trigger with an optional staleness bound.
///
/// A job is created each time the outstanding count enters a new multiple of
/// the threshold, so a burst of pulses crossing it in one check still yields a
/// single job. When `max_interval` is configured, a job is also created for a
/// non-zero count once that much time has passed since the last dispatch or
/// the last observed successful push, whichever is later.
#[derive(Debug)]
pub struct BatchScheduler {
    threshold: u64,
    max_interval: Option<Duration>,
    wh_per_pulse: f64,
    endpoint: String,
    dispatched_bucket: u64,
    last_outstanding: u64,
    stale_since: Instant,
}

impl BatchScheduler {
    pub fn new(
        config: &SchedulerConfig,
        energy: &EnergyConfig,
        endpoint: impl Into<String>,
        now: Instant,
    ) -> Self {
        Self {
            threshold: config.threshold.max(1),
            max_interval: config.max_interval(),
            wh_per_pulse: energy.wh_per_pulse(),
            endpoint: endpoint.into(),
            dispatched_bucket: 0,
            last_outstanding: 0,
            stale_since: now,
        }
    }

    /// Check the outstanding count and return a job if a report is due.
    pub fn observe(&mut self, outstanding: u64, now: Instant) -> Option<ReportJob> {
        let bucket = outstanding / self.threshold;

        // Only a successful push lowers the count
        if outstanding < self.last_outstanding {
            self.stale_since = now;
        }
        self.last_outstanding = outstanding;
        if bucket < self.dispatched_bucket {
            self.dispatched_bucket = bucket;
        }

        if bucket > self.dispatched_bucket {
            self.dispatched_bucket = bucket;
            debug!(outstanding, threshold = self.threshold, "Report threshold reached");
            return Some(self.dispatch(outstanding, now));
        }

        if let Some(max_interval) = self.max_interval {
            if outstanding > 0 && now.saturating_duration_since(self.stale_since) >= max_interval
            {
                debug!(outstanding, ?max_interval, "Report forced by staleness bound");
                return Some(self.dispatch(outstanding, now));
            }
        }

        None
    }

    /// Job for whatever is outstanding, regardless of the threshold.
    pub fn force(&mut self, outstanding: u64, now: Instant) -> Option<ReportJob> {
        (outstanding > 0).then(|| self.dispatch(outstanding, now))
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    fn dispatch(&mut self, outstanding: u64, now: Instant) -> ReportJob {
        self.stale_since = now;
        ReportJob::new(outstanding, self.wh_per_pulse, self.endpoint.clone())
    }
}
