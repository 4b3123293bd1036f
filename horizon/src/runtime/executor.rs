use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::plugin::{is_empty_payload, PluginDefinition};
use crate::planner::ExecutionPlan;
use crate::record::{PluginEvent, PluginRunRecord, StageEvent};
use crate::stage::Stage;
use crate::telemetry::{instrument_plugin, record_plugin_end, record_plugin_start};

/// Where an executor is in its run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Dispatching(Stage),
    Done,
    Failed(Stage),
}

/// Counters for one executor's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorTelemetry {
    pub invocations: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub cancellations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    invocations: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
}

/// Runs the plugins of one plan, a stage at a time.
///
/// An executor belongs to exactly one run. Plugin records of a stage that
/// aborted are kept until [`StageExecutor::take_aborted_records`] drains
/// them; whatever is left is released when the executor is dropped.
pub struct StageExecutor {
    plan: Arc<ExecutionPlan>,
    default_timeout: Duration,
    parallel: bool,
    state: Mutex<ExecutorState>,
    aborted: Mutex<Vec<PluginRunRecord>>,
    counters: Counters,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("plan_id", &self.plan.id())
            .field("run_id", &self.plan.run_id())
            .field("parallel", &self.parallel)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl StageExecutor {
    pub fn new(plan: Arc<ExecutionPlan>, default_timeout: Duration) -> Self {
        Self {
            plan,
            default_timeout,
            parallel: false,
            state: Mutex::new(ExecutorState::Idle),
            aborted: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Fan out each stage's plugins concurrently.
    ///
    /// Plugins still wait for their dependencies within the stage, so a
    /// stage runs as a series of concurrent waves.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    pub fn state(&self) -> ExecutorState {
        self.state.lock().clone()
    }

    pub fn telemetry(&self) -> ExecutorTelemetry {
        ExecutorTelemetry {
            invocations: self.counters.invocations.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
        }
    }

    /// Mark the run as finished.
    pub fn complete(&self) {
        *self.state.lock() = ExecutorState::Done;
    }

    /// Drain the records of the stage that aborted the run.
    pub fn take_aborted_records(&self) -> Vec<PluginRunRecord> {
        std::mem::take(&mut *self.aborted.lock())
    }

    /// Run every plan plugin supporting `stage` against `payload`.
    ///
    /// Each plugin runs under its own timeout (or the executor default) and
    /// the run's cancellation signal. The first error aborts the stage.
    /// Records come back in the order of [`ExecutionPlan::plugins_for`].
    ///
    /// # Errors
    ///
    /// [`ExecutionError::NoPluginForStage`] if no plan plugin supports the
    /// stage; otherwise the timeout, failure or cancellation that aborted it.
    pub async fn execute_by_stage(
        &self,
        payload: &Value,
        stage: &Stage,
    ) -> Result<Vec<PluginRunRecord>, ExecutionError> {
        let plugins = self.plan.plugins_for(stage);
        if plugins.is_empty() {
            *self.state.lock() = ExecutorState::Failed(stage.clone());
            return Err(ExecutionError::NoPluginForStage(stage.clone()));
        }

        *self.state.lock() = ExecutorState::Dispatching(stage.clone());
        debug!(
            run_id = %self.plan.run_id(),
            stage = %stage,
            plugins = plugins.len(),
            parallel = self.parallel,
            "dispatching stage"
        );

        let result = if self.parallel {
            self.run_waves(&plugins, payload, stage).await
        } else {
            self.run_sequential(&plugins, payload, stage).await
        };

        *self.state.lock() = match &result {
            Ok(_) => ExecutorState::Idle,
            Err(_) => ExecutorState::Failed(stage.clone()),
        };
        result
    }

    async fn run_sequential(
        &self,
        plugins: &[Arc<PluginDefinition>],
        payload: &Value,
        stage: &Stage,
    ) -> Result<Vec<PluginRunRecord>, ExecutionError> {
        let mut records = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            match self.invoke(plugin, payload, stage).await {
                Ok(record) => records.push(record),
                Err(err) => {
                    let mut aborted = self.aborted.lock();
                    let failed = std::mem::take(&mut *aborted);
                    aborted.extend(records);
                    aborted.extend(failed);
                    return Err(err);
                }
            }
        }
        Ok(records)
    }

    /// Run the stage wave by wave.
    ///
    /// On the first error the wave stops: siblings that already finished
    /// keep their records, and siblings still in flight are dropped and
    /// recorded as cancelled. Later waves never start.
    async fn run_waves(
        &self,
        plugins: &[Arc<PluginDefinition>],
        payload: &Value,
        stage: &Stage,
    ) -> Result<Vec<PluginRunRecord>, ExecutionError> {
        let waves = dependency_waves(plugins);
        let mut records: Vec<Option<PluginRunRecord>> = vec![None; plugins.len()];

        for wave in waves {
            let wave_started = Utc::now();
            let mut pending: FuturesUnordered<_> = wave
                .iter()
                .map(|&idx| async move { (idx, self.invoke(&plugins[idx], payload, stage).await) })
                .collect();
            let mut settled: HashSet<usize> = HashSet::with_capacity(wave.len());
            let mut first_error = None;

            while let Some((idx, result)) = pending.next().await {
                settled.insert(idx);
                match result {
                    Ok(record) => records[idx] = Some(record),
                    Err(err) => {
                        first_error = Some(err);
                        break;
                    }
                }
            }

            let Some(err) = first_error else {
                continue;
            };

            // Collect siblings that are ready without waiting on the rest.
            while let Some(Some((idx, result))) = pending.next().now_or_never() {
                settled.insert(idx);
                if let Ok(record) = result {
                    records[idx] = Some(record);
                }
            }
            drop(pending);

            let dropped: Vec<PluginRunRecord> = wave
                .iter()
                .filter(|idx| !settled.contains(idx))
                .map(|&idx| self.dropped_record(&plugins[idx], stage, wave_started))
                .collect();

            let mut aborted = self.aborted.lock();
            let failed = std::mem::take(&mut *aborted);
            aborted.extend(records.into_iter().flatten());
            aborted.extend(failed);
            aborted.extend(dropped);
            return Err(err);
        }

        Ok(records.into_iter().flatten().collect())
    }

    /// Record for a plugin whose invocation was dropped mid-flight because
    /// a sibling aborted the stage.
    fn dropped_record(
        &self,
        plugin: &PluginDefinition,
        stage: &Stage,
        started_at: DateTime<Utc>,
    ) -> PluginRunRecord {
        self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
        let finished_at = Utc::now();
        debug!(
            run_id = %self.plan.run_id(),
            plugin_id = %plugin.id,
            stage = %stage,
            "sibling plugin dropped after stage abort"
        );
        PluginRunRecord {
            plugin_id: plugin.id.clone(),
            stage: stage.clone(),
            route: self.plan.route().to_vec(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            output: Value::Null,
            warnings: Vec::new(),
            events: vec![PluginEvent::Started, PluginEvent::Cancelled],
        }
    }

    async fn invoke(
        &self,
        plugin: &Arc<PluginDefinition>,
        input: &Value,
        stage: &Stage,
    ) -> Result<PluginRunRecord, ExecutionError> {
        let context = self.plan.context();
        let cancel = &context.cancel;
        let timeout = plugin.timeout.unwrap_or(self.default_timeout);
        let started_at = Utc::now();
        let handle = record_plugin_start(plugin.id.as_str());
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);

        let mut record = PluginRunRecord {
            plugin_id: plugin.id.clone(),
            stage: stage.clone(),
            route: self.plan.route().to_vec(),
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            output: Value::Null,
            warnings: Vec::new(),
            events: vec![PluginEvent::Started],
        };

        let outcome = if cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            let call = plugin.handler().execute(input, context, &plugin.config);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                res = instrument_plugin(plugin.id.as_str(), stage.as_str(), tokio::time::timeout(timeout, call)) => match res {
                    Err(_) => Outcome::TimedOut,
                    Ok(Err(err)) => Outcome::Failed(format!("{err:#}")),
                    Ok(Ok(output)) => Outcome::Completed(output),
                },
            }
        };

        let (event, label) = outcome.event();
        let elapsed = record_plugin_end(handle, stage.as_str(), label);
        record.finished_at = Utc::now();
        record.duration_ms = elapsed.as_millis() as u64;

        let err = match outcome {
            Outcome::Completed(output) => {
                if !output.warnings.is_empty() {
                    record.events.push(PluginEvent::Warning);
                }
                record.events.push(event);
                record.output = output.payload;
                record.warnings = output.warnings;
                return Ok(record);
            }
            Outcome::TimedOut => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                ExecutionError::PluginTimeout {
                    plugin: plugin.id.clone(),
                    stage: stage.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            }
            Outcome::Failed(message) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                ExecutionError::PluginFailed {
                    plugin: plugin.id.clone(),
                    stage: stage.clone(),
                    message,
                }
            }
            Outcome::Cancelled => {
                self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
                ExecutionError::Cancelled {
                    stage: stage.clone(),
                }
            }
        };

        warn!(
            run_id = %context.run_id,
            plugin_id = %plugin.id,
            stage = %stage,
            error = %err,
            "plugin aborted stage"
        );
        record.events.push(event);
        self.aborted.lock().push(record);
        Err(err)
    }

    /// Fold a stage's plugin records into its timeline entry.
    ///
    /// A single plugin's output is used as-is; several outputs are merged
    /// into an object keyed by plugin id. Warnings are prefixed with the
    /// plugin that raised them.
    pub fn aggregate(stage: &Stage, records: &[PluginRunRecord]) -> StageEvent {
        let output = match records {
            [only] => only.output.clone(),
            _ => Value::Object(
                records
                    .iter()
                    .map(|r| (r.plugin_id.to_string(), r.output.clone()))
                    .collect::<Map<String, Value>>(),
            ),
        };

        let duration_ms = match (
            records.iter().map(|r| r.started_at).min(),
            records.iter().map(|r| r.finished_at).max(),
        ) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        };

        StageEvent {
            stage: stage.clone(),
            plugin_ids: records.iter().map(|r| r.plugin_id.clone()).collect(),
            signal: records.iter().any(|r| !is_empty_payload(&r.output)),
            output,
            duration_ms,
            warnings: records
                .iter()
                .flat_map(|r| r.warnings.iter().map(move |w| format!("{}: {w}", r.plugin_id)))
                .collect(),
        }
    }
}

impl Drop for StageExecutor {
    fn drop(&mut self) {
        let leftover = self.aborted.get_mut().len();
        self.aborted.get_mut().clear();
        let stats = self.telemetry();
        debug!(
            run_id = %self.plan.run_id(),
            invocations = stats.invocations,
            timeouts = stats.timeouts,
            failures = stats.failures,
            leftover_records = leftover,
            "stage executor released"
        );
    }
}

enum Outcome {
    Completed(crate::plugin::PluginOutput),
    TimedOut,
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn event(&self) -> (PluginEvent, &'static str) {
        match self {
            Outcome::Completed(_) => (PluginEvent::Completed, "completed"),
            Outcome::TimedOut => (PluginEvent::Timeout, "timeout"),
            Outcome::Failed(_) => (PluginEvent::Failed, "failed"),
            Outcome::Cancelled => (PluginEvent::Cancelled, "cancelled"),
        }
    }
}

/// Group a stage's plugins into waves where every plugin's in-stage
/// dependencies sit in an earlier wave. Input order is kept inside a wave.
fn dependency_waves(plugins: &[Arc<PluginDefinition>]) -> Vec<Vec<usize>> {
    let position: HashMap<_, usize> = plugins
        .iter()
        .enumerate()
        .map(|(idx, p)| (&p.id, idx))
        .collect();

    // Plugins arrive topologically sorted, so a dependency's level is known
    // before its dependents are visited.
    let mut level = vec![0usize; plugins.len()];
    for (idx, plugin) in plugins.iter().enumerate() {
        level[idx] = plugin
            .dependencies
            .iter()
            .filter_map(|dep| position.get(dep))
            .filter(|&&dep_idx| dep_idx < idx)
            .map(|&dep_idx| level[dep_idx] + 1)
            .max()
            .unwrap_or(0);
    }

    let depth = level.iter().copied().max().map_or(0, |max| max + 1);
    let mut waves = vec![Vec::new(); depth];
    for (idx, lvl) in level.into_iter().enumerate() {
        waves[lvl].push(idx);
    }
    waves
}
