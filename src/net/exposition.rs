//! Prometheus text exposition encoding.

use crate::config::PushConfig;
use crate::error::Result;
use crate::meter::ReportJob;
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

const HELP: &str = "Energy consumed since the previous successful push, in watt-hours.";

/// Renders report jobs as a single gauge sample.
///
/// Grouping labels are attached as constant labels, so the encoder emits them
/// sorted by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exposition {
    metric_name: String,
    labels: Vec<(String, String)>,
}

impl Exposition {
    pub fn new(metric_name: impl Into<String>, labels: Vec<(String, String)>) -> Self {
        Self {
            metric_name: metric_name.into(),
            labels,
        }
    }

    /// Metric name from the config, labels from the grouping path.
    ///
    /// Fails if the name or a label is not valid in the exposition format.
    pub fn from_config(config: &PushConfig) -> Result<Self> {
        let exposition = Self::new(&config.metric_name, config.grouping_labels()?);
        exposition.gauge()?;
        Ok(exposition)
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Request body for `job`.
    pub fn render(&self, job: &ReportJob) -> Result<String> {
        let registry = Registry::new();
        let gauge = self.gauge()?;
        registry.register(Box::new(gauge.clone()))?;
        gauge.set(job.energy_wh());

        let mut buffer = Vec::with_capacity(192);
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn gauge(&self) -> prometheus::Result<Gauge> {
        let opts = self
            .labels
            .iter()
            .fold(Opts::new(&self.metric_name, HELP), |opts, (name, value)| {
                opts.const_label(name, value)
            });
        Gauge::with_opts(opts)
    }
}
