//! # powermeter - Optical Power Meter Pulse Counter
//!
//! Counts the blinks of a utility meter's indicator LED and reports the
//! energy they represent to a Prometheus Pushgateway over an intermittent
//! wireless link. Designed to run unattended on a Raspberry Pi with a
//! photodiode or phototransistor wired to a GPIO pin.
//!
//! ## Features
//!
//! - **Pulse detection**: hysteresis thresholds, debounce and stall diagnostics
//! - **Power-loss safe counting**: every pulse is checkpointed before it is acknowledged
//! - **Threshold batching**: one push per N pulses, with an optional staleness bound
//! - **Reliable delivery**: retries with capped exponential backoff, never dropping counts
//! - **Library + Binary**: use as a crate or as the `powermeter` daemon
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use powermeter::{
//!     shutdown, AgentConfig, DefaultSignalSource, FileStore, HostLink, HttpTransport,
//!     PowerMeterAgent,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::default();
//!     let agent = PowerMeterAgent::new(
//!         config.clone(),
//!         Box::new(DefaultSignalSource::new(&config.detector)?),
//!         Box::new(HostLink::new(&config.wifi.interface)),
//!         Arc::new(HttpTransport::new(&config.push)?),
//!         Box::new(FileStore::open(&config.storage.data_dir)?),
//!     )?;
//!
//!     let (trigger, shutdown) = shutdown::channel();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         trigger.trigger();
//!     });
//!
//!     let state = agent.run(shutdown).await?;
//!     println!("{} pulses counted", state.total_pulses);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod meter;
pub mod net;
pub mod sensor;
pub mod shutdown;
pub mod store;

// Re-export public API
pub use agent::PowerMeterAgent;
pub use config::{AgentConfig, DetectorConfig, Polarity, PushConfig, SchedulerConfig, WifiConfig};
pub use error::{AgentError, DeliveryFailure, Result};
pub use meter::{Accumulator, BatchScheduler, MeterState, PulseEvent, Receipt, ReportJob};
pub use net::{
    ConnectivityHandle, ConnectivityManager, ConnectivityState, DeliveryOutcome, Exposition,
    HostLink, HttpTransport, LoggingTransport, MetricsReporter, PushTransport, RetryPolicy,
    StaticLink, WirelessLink, CONTENT_TYPE,
};
pub use sensor::{
    DefaultSignalSource, Detection, PulseDetector, ReplaySource, SignalLevel, SignalSource,
};
pub use store::{FileStore, MemoryStore, PersistedRecord, StateStore};

/// Pulses per report unless configured otherwise
pub const DEFAULT_THRESHOLD: u64 = 25;

/// Pushgateway port unless configured otherwise
pub const DEFAULT_PUSH_PORT: u16 = 2491;
