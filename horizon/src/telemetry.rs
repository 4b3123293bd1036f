//! Tracing and telemetry instrumentation for horizon.
//!
//! Span constructors for the run, stage and plugin levels plus `record_*`
//! helpers that log a structured event and, with the `metrics` feature,
//! update the matching Prometheus series. Everything here works with the
//! feature disabled.
//!
//! # Example
//!
//! ```ignore
//! use horizon::telemetry::{instrument_stage, record_plugin_start, record_plugin_end};
//!
//! let handle = record_plugin_start("loader");
//! // ... plugin execution
//! record_plugin_end(handle, "ingest", "completed");
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};

/// Span covering a whole run.
#[must_use]
pub fn run_span(run_id: impl AsRef<str>, template_id: impl AsRef<str>) -> Span {
    info_span!(
        "horizon.run",
        run_id = %run_id.as_ref(),
        template = %template_id.as_ref(),
    )
}

/// Span covering one stage of a run.
#[must_use]
pub fn stage_span(run_id: impl AsRef<str>, stage: impl AsRef<str>) -> Span {
    info_span!(
        "horizon.stage",
        run_id = %run_id.as_ref(),
        stage = %stage.as_ref(),
    )
}

/// Span covering a single plugin invocation.
#[must_use]
pub fn plugin_span(plugin_id: impl AsRef<str>, stage: impl AsRef<str>) -> Span {
    info_span!(
        "horizon.plugin",
        plugin_id = %plugin_id.as_ref(),
        stage = %stage.as_ref(),
    )
}

/// Instrument a future with a stage span.
pub fn instrument_stage<F>(
    run_id: impl AsRef<str>,
    stage: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(stage_span(run_id, stage))
}

/// Instrument a future with a plugin span.
pub fn instrument_plugin<F>(
    plugin_id: impl AsRef<str>,
    stage: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(plugin_span(plugin_id, stage))
}

/// Record a run reaching a terminal status.
pub fn record_run_finished(
    run_id: impl AsRef<str>,
    template_id: impl AsRef<str>,
    status: impl AsRef<str>,
    elapsed: Duration,
) {
    tracing::info!(
        run_id = %run_id.as_ref(),
        template = %template_id.as_ref(),
        status = %status.as_ref(),
        elapsed_ms = elapsed.as_millis() as u64,
        "run finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finished(template_id.as_ref(), status.as_ref());
}

/// Record a stage aborting its run.
pub fn record_stage_failed(
    template_id: impl AsRef<str>,
    stage: impl AsRef<str>,
    error: impl AsRef<str>,
) {
    tracing::warn!(
        template = %template_id.as_ref(),
        stage = %stage.as_ref(),
        error = %error.as_ref(),
        "stage failed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_stage_failed(template_id.as_ref(), stage.as_ref());
}

/// Observe the duration of a plugin invocation.
pub fn observe_plugin_duration(
    plugin_id: impl AsRef<str>,
    stage: impl AsRef<str>,
    outcome: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::debug!(
        plugin_id = %plugin_id.as_ref(),
        stage = %stage.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs = duration_secs,
        "plugin duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_plugin_duration(
        plugin_id.as_ref(),
        stage.as_ref(),
        outcome.as_ref(),
        duration_secs,
    );
}

/// Start timing a plugin invocation. Pass the handle to
/// [`record_plugin_end`].
pub fn record_plugin_start(plugin_id: impl AsRef<str>) -> PluginTimingHandle {
    PluginTimingHandle {
        plugin_id: plugin_id.as_ref().to_string(),
        start: Instant::now(),
    }
}

/// Finish timing a plugin invocation and return the elapsed time.
pub fn record_plugin_end(
    handle: PluginTimingHandle,
    stage: impl AsRef<str>,
    outcome: impl AsRef<str>,
) -> Duration {
    let elapsed = handle.start.elapsed();
    observe_plugin_duration(&handle.plugin_id, stage, outcome, elapsed.as_secs_f64());
    elapsed
}

/// Handle for tracking plugin invocation duration.
#[derive(Debug)]
pub struct PluginTimingHandle {
    plugin_id: String,
    start: Instant,
}

impl PluginTimingHandle {
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
