//! Prometheus metrics instrumentation for horizon.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `horizon_runs_total` - Runs reaching a terminal status
//! - `horizon_stage_failures_total` - Stages that aborted their run
//!
//! ## Histograms
//! - `horizon_plugin_duration_seconds` - Plugin invocation duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for horizon metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for runs reaching a terminal status.
///
/// Labels:
/// - `template`: The stage template id
/// - `status`: succeeded, degraded or failed
pub static RUNS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("horizon_runs_total", "Total number of finished runs");
    CounterVec::new(opts, &["template", "status"])
        .expect("horizon_runs_total metric creation failed")
});

/// Counter for stages that aborted their run.
///
/// Labels:
/// - `template`: The stage template id
/// - `stage`: The failing stage
pub static STAGE_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "horizon_stage_failures_total",
        "Total number of stages that aborted a run",
    );
    CounterVec::new(opts, &["template", "stage"])
        .expect("horizon_stage_failures_total metric creation failed")
});

/// Histogram for plugin invocation duration in seconds.
///
/// Labels:
/// - `plugin`: The plugin id
/// - `stage`: The stage being executed
/// - `outcome`: completed, timeout, failed or cancelled
pub static PLUGIN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.0005, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "horizon_plugin_duration_seconds",
        "Plugin invocation duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["plugin", "stage", "outcome"])
        .expect("horizon_plugin_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent: duplicate registrations are ignored.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(STAGE_FAILURES_TOTAL.clone()),
        Box::new(PLUGIN_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_run_finished(template: &str, status: &str) {
    RUNS_TOTAL.with_label_values(&[template, status]).inc();
}

pub fn record_stage_failed(template: &str, stage: &str) {
    STAGE_FAILURES_TOTAL
        .with_label_values(&[template, stage])
        .inc();
}

pub fn observe_plugin_duration(plugin: &str, stage: &str, outcome: &str, duration_secs: f64) {
    PLUGIN_DURATION_SECONDS
        .with_label_values(&[plugin, stage, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
