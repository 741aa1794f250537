//! Delivery of report jobs to the Pushgateway.

use crate::error::DeliveryFailure;
use crate::meter::{Accumulator, ReportJob};
use crate::net::connectivity::ConnectivityHandle;
use crate::net::exposition::Exposition;
use crate::net::retry::RetryPolicy;
use crate::net::transport::PushTransport;
use crate::shutdown::Shutdown;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

/// What happened to a job handed to the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The aggregator accepted the push
    Delivered { count: u64 },
    /// Not connected; the job waits for the link
    Queued { count: u64 },
    /// Every attempt failed; the job waits for the next scheduled report
    Deferred { count: u64, attempts: u32 },
    /// The link dropped mid-attempt; the job waits for the link
    Abandoned { count: u64 },
    /// Nothing was outstanding by the time the job was sent
    Skipped,
}

enum Attempt {
    Accepted(u16),
    Failed(DeliveryFailure),
    LinkLost,
}

/// Pushes report jobs, retrying with backoff, and keeps at most one job pending.
pub struct MetricsReporter {
    accumulator: Arc<Accumulator>,
    transport: Arc<dyn PushTransport>,
    connectivity: ConnectivityHandle,
    exposition: Exposition,
    policy: RetryPolicy,
    request_timeout: Duration,
    pending: Option<ReportJob>,
}

impl MetricsReporter {
    pub fn new(
        accumulator: Arc<Accumulator>,
        transport: Arc<dyn PushTransport>,
        connectivity: ConnectivityHandle,
        exposition: Exposition,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            accumulator,
            transport,
            connectivity,
            exposition,
            policy,
            request_timeout,
            pending: None,
        }
    }

    /// The job waiting for delivery, if any.
    pub fn pending(&self) -> Option<&ReportJob> {
        self.pending.as_ref()
    }

    /// Deliver `job`, merged with any job still pending.
    pub async fn deliver(&mut self, job: ReportJob) -> DeliveryOutcome {
        let job = match self.pending.take() {
            Some(pending) => pending.merge(job),
            None => job,
        };
        self.send(job).await
    }

    /// Try the pending job again, if there is one.
    pub async fn retry_pending(&mut self) -> Option<DeliveryOutcome> {
        let job = self.pending.take()?;
        Some(self.send(job).await)
    }

    /// Consume jobs until shutdown, retrying the pending job on every reconnect.
    pub async fn run(mut self, mut jobs: mpsc::Receiver<ReportJob>, mut shutdown: Shutdown) {
        let mut link = self.connectivity.clone();

        loop {
            tokio::select! {
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    tokio::select! {
                        _ = self.deliver(job) => {}
                        _ = shutdown.wait() => break,
                    }
                }
                _ = link.connected() => {
                    if self.pending.is_none() {
                        continue;
                    }
                    debug!("Link restored, retrying pending report");
                    tokio::select! {
                        _ = self.retry_pending() => {}
                        _ = shutdown.wait() => break,
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    }

    async fn send(&mut self, job: ReportJob) -> DeliveryOutcome {
        // Cover every confirmed pulse, including those since the job was created
        let job = job.with_count(self.accumulator.outstanding());
        let count = job.count();
        if count == 0 {
            return DeliveryOutcome::Skipped;
        }

        if !self.connectivity.is_connected() {
            debug!(count, state = ?self.connectivity.state(), "Not connected, report queued");
            self.pending = Some(job);
            return DeliveryOutcome::Queued { count };
        }

        let body = match self.exposition.render(&job) {
            Ok(body) => body,
            Err(e) => {
                error!(count, "Failed to encode report, keeping it queued: {}", e);
                self.pending = Some(job);
                return DeliveryOutcome::Deferred { count, attempts: 0 };
            }
        };
        let max_attempts = self.policy.attempts();

        for attempt in 1..=max_attempts {
            debug!(attempt, count, url = job.endpoint(), "Delivering report");

            match self.attempt(&job, body.clone()).await {
                Attempt::Accepted(status) => {
                    let receipt = self.accumulator.on_report_success(count, Utc::now());
                    info!(
                        count,
                        energy_wh = job.energy_wh(),
                        status,
                        outstanding = receipt.state.pulses_since_last_report,
                        "Report delivered"
                    );
                    return DeliveryOutcome::Delivered { count };
                }
                Attempt::LinkLost => {
                    debug!(attempt, count, "Link lost during delivery, report queued");
                    self.pending = Some(job);
                    return DeliveryOutcome::Abandoned { count };
                }
                Attempt::Failed(failure) => {
                    warn!(attempt, count, "Delivery attempt failed: {}", failure);
                    if !self.policy.allows_retry_after(attempt) {
                        break;
                    }

                    let delay = self.policy.delay_for(attempt);
                    let mut link = self.connectivity.clone();
                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = link.lost() => {
                            debug!(count, "Link lost during backoff, report queued");
                            self.pending = Some(job);
                            return DeliveryOutcome::Abandoned { count };
                        }
                    }
                }
            }
        }

        error!(
            count,
            attempts = max_attempts,
            "Report not delivered, keeping it for the next scheduled push"
        );
        self.pending = Some(job);
        DeliveryOutcome::Deferred {
            count,
            attempts: max_attempts,
        }
    }

    async fn attempt(&mut self, job: &ReportJob, body: String) -> Attempt {
        let mut link = self.connectivity.clone();
        let request = time::timeout(self.request_timeout, self.transport.put(job.endpoint(), body));

        tokio::select! {
            result = request => match result {
                Ok(Ok(status)) if (200..300).contains(&status) => Attempt::Accepted(status),
                Ok(Ok(status)) => Attempt::Failed(DeliveryFailure::ServerRejected { status }),
                Ok(Err(failure)) => Attempt::Failed(failure),
                Err(_) => Attempt::Failed(DeliveryFailure::Timeout(
                    self.request_timeout.as_millis() as u64,
                )),
            },
            _ = link.lost() => Attempt::LinkLost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::{MeterState, PulseEvent};
    use crate::net::connectivity::ConnectivityState;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::watch;

    struct ScriptedTransport {
        statuses: Mutex<Vec<u16>>,
        bodies: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(statuses: Vec<u16>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses),
                bodies: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.bodies.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn put(&self, _url: &str, body: String) -> Result<u16, DeliveryFailure> {
            self.bodies.lock().unwrap().push(body);
            let mut statuses = self.statuses.lock().unwrap();
            Ok(if statuses.is_empty() { 200 } else { statuses.remove(0) })
        }
    }

    fn accumulator_with(pulses: u64) -> Arc<Accumulator> {
        let accumulator = Accumulator::new(MeterState::default(), Box::new(MemoryStore::new()));
        for sequence in 1..=pulses {
            accumulator.on_pulse(&PulseEvent {
                sequence,
                at: time::Instant::now(),
            });
        }
        Arc::new(accumulator)
    }

    fn reporter(
        accumulator: Arc<Accumulator>,
        transport: Arc<ScriptedTransport>,
        state: ConnectivityState,
    ) -> (MetricsReporter, watch::Sender<ConnectivityState>) {
        reporter_with(
            accumulator,
            transport,
            state,
            Exposition::new("powermeter_energy_wh", Vec::new()),
        )
    }

    fn reporter_with(
        accumulator: Arc<Accumulator>,
        transport: Arc<ScriptedTransport>,
        state: ConnectivityState,
        exposition: Exposition,
    ) -> (MetricsReporter, watch::Sender<ConnectivityState>) {
        let (tx, rx) = watch::channel(state);
        let reporter = MetricsReporter::new(
            accumulator,
            transport,
            ConnectivityHandle::new(rx),
            exposition,
            RetryPolicy {
                max_attempts: Some(3),
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                multiplier: 2.0,
            },
            Duration::from_secs(5),
        );
        (reporter, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_push_then_success() {
        let accumulator = accumulator_with(25);
        let transport = ScriptedTransport::new(vec![503]);
        let (mut reporter, _tx) =
            reporter(accumulator.clone(), transport.clone(), ConnectivityState::Connected);

        let outcome = reporter.deliver(ReportJob::new(25, 1.0, "http://gw")).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { count: 25 });
        assert_eq!(transport.calls(), 2);
        assert_eq!(accumulator.outstanding(), 0);
        assert!(reporter.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_during_backoff_abandons() {
        let accumulator = accumulator_with(25);
        let transport = ScriptedTransport::new(vec![500, 500, 500]);
        let (mut reporter, tx) =
            reporter(accumulator.clone(), transport.clone(), ConnectivityState::Connected);

        let drop_link = tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(ConnectivityState::Disconnected);
            tx
        });

        let outcome = reporter.deliver(ReportJob::new(25, 1.0, "http://gw")).await;
        assert_eq!(outcome, DeliveryOutcome::Abandoned { count: 25 });
        assert_eq!(transport.calls(), 1);
        assert_eq!(accumulator.outstanding(), 25);
        assert_eq!(reporter.pending().map(ReportJob::count), Some(25));
        drop(drop_link.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_outstanding_is_skipped() {
        let accumulator = accumulator_with(0);
        let transport = ScriptedTransport::new(Vec::new());
        let (mut reporter, _tx) =
            reporter(accumulator, transport.clone(), ConnectivityState::Connected);

        let outcome = reporter.deliver(ReportJob::new(25, 1.0, "http://gw")).await;
        assert_eq!(outcome, DeliveryOutcome::Skipped);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unencodable_report_stays_queued() {
        let accumulator = accumulator_with(25);
        let transport = ScriptedTransport::new(Vec::new());
        let (mut reporter, _tx) = reporter_with(
            accumulator.clone(),
            transport.clone(),
            ConnectivityState::Connected,
            Exposition::new("energy-wh", Vec::new()),
        );

        let outcome = reporter.deliver(ReportJob::new(25, 1.0, "http://gw")).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Deferred {
                count: 25,
                attempts: 0
            }
        );
        assert_eq!(transport.calls(), 0);
        assert_eq!(accumulator.outstanding(), 25);
        assert_eq!(reporter.pending().map(ReportJob::count), Some(25));
    }
}
