//! Pipeline wiring: sampling tick, accumulation, scheduling and delivery.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::meter::{Accumulator, BatchScheduler, MeterState, PulseEvent, Receipt, ReportJob};
use crate::net::{
    ConnectivityHandle, ConnectivityManager, Exposition, MetricsReporter, PushTransport,
    RetryPolicy, WirelessLink,
};
use crate::sensor::{Detection, PulseDetector, SignalSource};
use crate::shutdown::Shutdown;
use crate::store::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Jobs waiting between the scheduler and the reporter task.
const JOB_QUEUE_DEPTH: usize = 4;

/// How often a failed persist is retried while the state is ahead of storage.
const FLUSH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The complete agent: one meter, one link, one aggregator.
pub struct PowerMeterAgent {
    config: AgentConfig,
    source: Box<dyn SignalSource>,
    link: Box<dyn WirelessLink>,
    transport: Arc<dyn PushTransport>,
    accumulator: Arc<Accumulator>,
}

impl PowerMeterAgent {
    /// Validate `config` and recover the persisted state from `store`.
    pub fn new(
        config: AgentConfig,
        source: Box<dyn SignalSource>,
        link: Box<dyn WirelessLink>,
        transport: Arc<dyn PushTransport>,
        store: Box<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let accumulator = Arc::new(Accumulator::recover(store)?);

        Ok(Self {
            config,
            source,
            link,
            transport,
            accumulator,
        })
    }

    /// Shared view of the running count.
    pub fn accumulator(&self) -> Arc<Accumulator> {
        self.accumulator.clone()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Sample until shutdown, then persist and return the final state.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<MeterState> {
        let Self {
            config,
            mut source,
            link,
            transport,
            accumulator,
        } = self;

        let (manager, connectivity) = ConnectivityManager::new(link, config.wifi.clone());
        let reporter = MetricsReporter::new(
            accumulator.clone(),
            transport,
            connectivity.clone(),
            Exposition::from_config(&config.push)?,
            RetryPolicy::from_config(&config.retry),
            config.push.request_timeout(),
        );

        let (jobs, queue) = mpsc::channel(JOB_QUEUE_DEPTH);
        let link_task = tokio::spawn(manager.run(shutdown.clone()));
        let reporter_task = tokio::spawn(reporter.run(queue, shutdown.clone()));

        let state = accumulator.snapshot();
        let mut detector = PulseDetector::new(&config.detector).with_sequence(state.total_pulses);
        let mut scheduler = BatchScheduler::new(
            &config.scheduler,
            &config.energy,
            config.push.url(),
            Instant::now(),
        );

        info!(
            url = %config.push.url(),
            threshold = scheduler.threshold(),
            total = state.total_pulses,
            outstanding = state.pulses_since_last_report,
            "Power meter agent started"
        );

        let mut ticker = time::interval(config.detector.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut read_failures: u64 = 0;
        let mut last_flush_attempt = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            let now = Instant::now();

            let reading = match source.read_signal() {
                Ok(reading) => {
                    if read_failures > 0 {
                        info!(failures = read_failures, "Sensor readings recovered");
                        read_failures = 0;
                    }
                    reading
                }
                Err(e) => {
                    if read_failures == 0 {
                        warn!("Sensor read failed, skipping ticks: {}", e);
                    }
                    read_failures += 1;
                    continue;
                }
            };

            match detector.sample(reading, now) {
                Detection::Pulse(event) => {
                    count_pulse(&accumulator, &event);
                }
                Detection::Stalled { level, stuck_for } => {
                    warn!(
                        ?level,
                        "Meter signal unchanged for {:?}, check sensor alignment", stuck_for
                    );
                }
                Detection::Rejected | Detection::Quiet => {}
            }

            if accumulator.is_dirty()
                && now.saturating_duration_since(last_flush_attempt) >= FLUSH_RETRY_INTERVAL
            {
                last_flush_attempt = now;
                if accumulator.flush().is_ok() {
                    info!("Meter state persisted again after earlier failures");
                }
            }

            if let Some(job) = scheduler.observe(accumulator.outstanding(), now) {
                dispatch(&jobs, job, &connectivity);
            }
        }

        drop(jobs);
        if let Err(e) = link_task.await {
            error!("Connectivity task failed: {}", e);
        }
        if let Err(e) = reporter_task.await {
            error!("Reporter task failed: {}", e);
        }

        accumulator.flush()?;
        let state = accumulator.snapshot();
        info!(
            total = state.total_pulses,
            outstanding = state.pulses_since_last_report,
            rejected = detector.rejected(),
            "Power meter agent stopped"
        );
        Ok(state)
    }
}

/// Count a pulse, moving the blocking checkpoint off the async worker.
///
/// The tick is late by one checkpoint at most; the detector has already
/// timestamped the edge and missed ticks are skipped.
fn count_pulse(accumulator: &Accumulator, event: &PulseEvent) -> Receipt {
    match Handle::current().runtime_flavor() {
        RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| accumulator.on_pulse(event))
        }
        _ => accumulator.on_pulse(event),
    }
}

fn dispatch(jobs: &mpsc::Sender<ReportJob>, job: ReportJob, connectivity: &ConnectivityHandle) {
    match jobs.try_send(job) {
        Ok(()) => {}
        // The reporter refreshes every job to the outstanding count, so a
        // dropped job is covered by the ones already queued
        Err(TrySendError::Full(job)) => {
            debug!(
                count = job.count(),
                state = ?connectivity.state(),
                "Report queue full, job folded into queued reports"
            );
        }
        Err(TrySendError::Closed(job)) => {
            debug!(count = job.count(), "Reporter stopped, job dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryFailure;
    use crate::net::StaticLink;
    use crate::sensor::ReplaySource;
    use crate::shutdown;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingTransport {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushTransport for CountingTransport {
        async fn put(&self, url: &str, _body: String) -> std::result::Result<u16, DeliveryFailure> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(202)
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = AgentConfig::default().with_threshold(0);
        let result = PowerMeterAgent::new(
            config,
            Box::new(ReplaySource::new(Vec::new(), 0)),
            Box::new(StaticLink::up()),
            Arc::new(CountingTransport::default()),
            Box::new(MemoryStore::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_and_reports_replayed_blinks() {
        let config = AgentConfig::default().with_threshold(10);
        // 100ms lit, 100ms dark at the 5ms default tick
        let source = ReplaySource::blinks(12, 20, 20);
        let store = MemoryStore::new();
        let transport = Arc::new(CountingTransport::default());

        let agent = PowerMeterAgent::new(
            config,
            Box::new(source),
            Box::new(StaticLink::up()),
            transport.clone(),
            Box::new(store.clone()),
        )
        .unwrap();

        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(agent.run(shutdown));
        time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();

        let state = task.await.unwrap().unwrap();
        assert_eq!(state.total_pulses, 12);
        assert_eq!(state.pulses_since_last_report, 2);
        assert_eq!(transport.urls.lock().unwrap().len(), 1);
        assert_eq!(store.saved(), Some(state));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_counts_on_multi_thread_runtime() {
        let store = MemoryStore::new();
        let agent = PowerMeterAgent::new(
            AgentConfig::default(),
            Box::new(ReplaySource::blinks(3, 20, 20)),
            Box::new(StaticLink::up()),
            Arc::new(CountingTransport::default()),
            Box::new(store.clone()),
        )
        .unwrap();
        let accumulator = agent.accumulator();

        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(agent.run(shutdown));
        let deadline = Instant::now() + Duration::from_secs(10);
        while accumulator.snapshot().total_pulses < 3 && Instant::now() < deadline {
            time::sleep(Duration::from_millis(20)).await;
        }
        trigger.trigger();

        let state = task.await.unwrap().unwrap();
        assert_eq!(state.total_pulses, 3);
        assert_eq!(store.writes(), 3);
    }
}
