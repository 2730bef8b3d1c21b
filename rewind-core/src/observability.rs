/*!
Logging setup and optional Prometheus metrics.

Library code only emits `tracing` events. Applications that want them on
stdout call [`init_observability`] once at startup. With the `metrics`
feature the persistence gateway also records write and load counters into a
process-wide registry that [`gather_metrics`] renders in the Prometheus text
format.
*/

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, StateError};

const DEFAULT_DIRECTIVE: &str = "rewind_core=info";

#[cfg(feature = "metrics")]
static METRICS: Lazy<Option<RewindMetrics>> = Lazy::new(|| match RewindMetrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        tracing::error!(error = %e, "failed to initialize metrics");
        None
    }
});

/// Counters and histograms for the persistence path.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct RewindMetrics {
    pub writes_total: Counter,
    pub write_errors_total: Counter,
    pub write_latency_seconds: Histogram,
    pub loads_total: Counter,
    pub migrations_total: Counter,
    pub state_size_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| StateError::validation(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| StateError::validation(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram> {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help))
        .map_err(|e| StateError::validation(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| StateError::validation(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl RewindMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            writes_total: counter(&registry, "rewind_writes_total", "State writes attempted")?,
            write_errors_total: counter(
                &registry,
                "rewind_write_errors_total",
                "State writes that gave up",
            )?,
            write_latency_seconds: histogram(
                &registry,
                "rewind_write_latency_seconds",
                "Duration of state writes in seconds, retries included",
            )?,
            loads_total: counter(&registry, "rewind_loads_total", "Persisted state loads")?,
            migrations_total: counter(
                &registry,
                "rewind_migrations_total",
                "Loads that ran the upgrade function",
            )?,
            state_size_bytes: histogram(
                &registry,
                "rewind_state_size_bytes",
                "Size of serialized state in bytes",
            )?,
            registry,
        })
    }

    /// The process-wide metrics, if they could be registered.
    pub fn global() -> Option<&'static RewindMetrics> {
        METRICS.as_ref()
    }

    pub fn record_state_size(&self, size_bytes: usize) {
        self.state_size_bytes.observe(size_bytes as f64);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| StateError::validation(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            StateError::validation(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Times one write and records its outcome.
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    pub fn start_write() -> Self {
        if let Some(metrics) = RewindMetrics::global() {
            metrics.writes_total.inc();
        }
        Self {
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        if let Some(metrics) = RewindMetrics::global() {
            metrics
                .write_latency_seconds
                .observe(self.start.elapsed().as_secs_f64());
        }
    }

    pub fn finish_with_error(self) {
        if let Some(metrics) = RewindMetrics::global() {
            metrics
                .write_latency_seconds
                .observe(self.start.elapsed().as_secs_f64());
            metrics.write_errors_total.inc();
        }
    }
}

/// Prometheus text export of the global metrics.
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    RewindMetrics::global()
        .ok_or_else(|| StateError::validation("Metrics are not initialized"))?
        .gather_metrics()
}

/// Install a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` with `rewind_core=info` added. `json`
/// selects structured JSON lines instead of the human-readable format.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    let _ = RewindMetrics::global();

    let directive = DEFAULT_DIRECTIVE
        .parse()
        .map_err(|e| StateError::validation(format!("Invalid log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());
        set_global_default(subscriber)
    };

    result.map_err(|e| {
        StateError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("rewind observability initialized");
    Ok(())
}

/// Human-readable logs with the default filter.
pub fn init_default_observability() -> Result<()> {
    init_observability(false)
}
