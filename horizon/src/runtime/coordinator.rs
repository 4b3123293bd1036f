use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use crate::error::EngineError;
use crate::events::{RunEvent, RunEventPayload, RunEventPublisher};
use crate::ids::{PlanId, RunId, SessionId};
use crate::planner::ExecutionPlan;
use crate::record::{PluginRunRecord, RunRecord, RunStatus, Snapshot, StageEvent};
use crate::request::{RunOutput, RunReport};
use crate::runtime::executor::{ExecutorTelemetry, StageExecutor};
use crate::stage::Stage;
use crate::store::RunStore;
use crate::telemetry::{instrument_stage, record_run_finished, record_stage_failed, run_span};

/// Outcome of a run that reached the end of its route.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub run_id: RunId,
    pub plan_id: PlanId,
    /// `Succeeded` or `Degraded`.
    pub state: RunStatus,
    pub record: RunRecord,
    pub timeline: Vec<StageEvent>,
    pub snapshots: Vec<Snapshot>,
    pub stage_count: usize,
    pub diagnostics: Vec<String>,
    pub elapsed: Duration,
    pub telemetry: ExecutorTelemetry,
}

impl RunSummary {
    pub fn into_output(self) -> RunOutput {
        RunOutput {
            run_id: self.run_id,
            status: self.state,
            report: RunReport {
                elapsed_ms: self.elapsed.as_millis() as u64,
                stage_count: self.stage_count,
                plugin_count: self.record.plugin_count,
                plan_id: self.plan_id,
            },
            timeline: self.timeline,
            diagnostics: self.diagnostics,
            error: None,
        }
    }
}

/// A run that stopped early. Carries the stages completed before the
/// failure.
#[derive(Clone, Debug, Error)]
#[error("run {run_id} failed: {error}")]
pub struct RunFailure {
    pub run_id: RunId,
    pub plan_id: PlanId,
    pub error: EngineError,
    /// Stage that aborted the run, if the failure happened inside one.
    pub stage: Option<Stage>,
    pub timeline: Vec<StageEvent>,
    pub diagnostics: Vec<String>,
    pub plugin_count: usize,
    pub elapsed: Duration,
}

impl RunFailure {
    pub fn into_output(self) -> RunOutput {
        RunOutput {
            run_id: self.run_id,
            status: RunStatus::Failed,
            report: RunReport {
                elapsed_ms: self.elapsed.as_millis() as u64,
                stage_count: self.timeline.len(),
                plugin_count: self.plugin_count,
                plan_id: self.plan_id,
            },
            timeline: self.timeline,
            diagnostics: self.diagnostics,
            error: Some(self.error.to_string()),
        }
    }
}

/// Drives one plan through its stage route.
///
/// The coordinator owns the run: it writes every state transition to the
/// store, feeds each stage's output into the next stage and stops at the
/// first failing stage.
pub struct RunCoordinator {
    plan: Arc<ExecutionPlan>,
    executor: StageExecutor,
    store: Arc<dyn RunStore>,
    events: Option<Arc<dyn RunEventPublisher>>,
    session_id: Option<SessionId>,
    deadline: Option<Duration>,
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("plan_id", &self.plan.id())
            .field("run_id", &self.plan.run_id())
            .field("store", &std::any::type_name_of_val(&*self.store))
            .field("events", &self.events.is_some())
            .field("session_id", &self.session_id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

struct Progress {
    record: RunRecord,
    timeline: Vec<StageEvent>,
    diagnostics: Vec<String>,
    snapshots: Vec<Snapshot>,
    started: Instant,
}

impl RunCoordinator {
    pub fn new(executor: StageExecutor, store: Arc<dyn RunStore>) -> Self {
        Self {
            plan: Arc::clone(executor.plan()),
            executor,
            store,
            events: None,
            session_id: None,
            deadline: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn RunEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Fire the run's cancellation signal once `deadline` has elapsed.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    pub fn run_id(&self) -> RunId {
        self.plan.run_id()
    }

    /// Execute the plan against `payload`.
    ///
    /// # Errors
    ///
    /// Returns a [`RunFailure`] holding the partial timeline when a stage
    /// aborts or a store write fails. The failed record is persisted on a
    /// best-effort basis before returning.
    pub async fn run(&self, payload: Value) -> Result<RunSummary, RunFailure> {
        let context = self.plan.context();
        let span = run_span(context.run_id.to_string(), &context.template_id);
        let _deadline = self.deadline.map(|after| self.arm_deadline(after));
        self.run_inner(payload).instrument(span).await
    }

    async fn run_inner(&self, payload: Value) -> Result<RunSummary, RunFailure> {
        let context = self.plan.context();
        let run_id = context.run_id;
        let mut progress = Progress {
            record: RunRecord::queued(&self.plan),
            timeline: Vec::new(),
            diagnostics: Vec::new(),
            snapshots: Vec::new(),
            started: Instant::now(),
        };
        progress.record.session_id = self.session_id;

        if let Err(err) = self.persist(&mut progress).await {
            return Err(self.fail(progress, err, None).await);
        }
        self.publish(RunEventPayload::Queued {
            plan_id: self.plan.id(),
            template_id: context.template_id.clone(),
            stages: self.plan.route().len(),
            plugins: self.plan.plugins().len(),
        })
        .await;

        progress.record.status = RunStatus::Running;
        if let Err(err) = self.persist(&mut progress).await {
            return Err(self.fail(progress, err, None).await);
        }
        info!(
            run_id = %run_id,
            stages = self.plan.route().len(),
            plugins = self.plan.plugins().len(),
            "run started"
        );

        let mut input = payload;
        for stage in self.plan.route() {
            self.publish(RunEventPayload::StageStarted {
                stage: stage.clone(),
                plugins: self
                    .plan
                    .plugins_for(stage)
                    .iter()
                    .map(|p| p.id.clone())
                    .collect(),
            })
            .await;

            let outcome = instrument_stage(
                run_id.to_string(),
                stage.as_str(),
                self.executor.execute_by_stage(&input, stage),
            )
            .await;

            let records = match outcome {
                Ok(records) => records,
                Err(err) => {
                    let aborted = self.executor.take_aborted_records();
                    if !aborted.is_empty() {
                        if let Err(store_err) = self.store.append_plugin_records(run_id, aborted).await {
                            warn!(run_id = %run_id, error = %store_err, "failed to persist aborted plugin records");
                        }
                    }
                    return Err(self.fail(progress, err.into(), Some(stage)).await);
                }
            };

            let event = StageExecutor::aggregate(stage, &records);
            if let Err(err) = self.record_stage(&mut progress, records, &event).await {
                return Err(self.fail(progress, err, Some(stage)).await);
            }

            self.publish(RunEventPayload::StageCompleted {
                stage: stage.clone(),
                duration_ms: event.duration_ms,
                warnings: event.warnings.len(),
                signal: event.signal,
            })
            .await;

            input = event.output.clone();
            progress.timeline.push(event);
        }

        let status = RunStatus::classify(&progress.timeline);
        progress.record.status = status;
        progress.record.risk_score = RunRecord::score(status, &progress.timeline);
        progress.record.warnings = progress
            .timeline
            .iter()
            .flat_map(|e| e.warnings.iter().cloned())
            .collect();
        progress.record.snapshot = input;

        if let Err(err) = self.persist(&mut progress).await {
            return Err(self.fail(progress, err, None).await);
        }
        self.executor.complete();

        let elapsed = progress.started.elapsed();
        self.publish(RunEventPayload::Finished {
            status,
            elapsed_ms: elapsed.as_millis() as u64,
        })
        .await;
        record_run_finished(run_id.to_string(), &context.template_id, status.as_str(), elapsed);

        Ok(RunSummary {
            run_id,
            plan_id: self.plan.id(),
            state: status,
            stage_count: progress.timeline.len(),
            record: progress.record,
            timeline: progress.timeline,
            snapshots: progress.snapshots,
            diagnostics: progress.diagnostics,
            elapsed,
            telemetry: self.executor.telemetry(),
        })
    }

    async fn record_stage(
        &self,
        progress: &mut Progress,
        records: Vec<PluginRunRecord>,
        event: &StageEvent,
    ) -> Result<(), EngineError> {
        let context = self.plan.context();
        let run_id = context.run_id;
        let line = event.diagnostic();
        let output_count = records.len();

        self.store.append_plugin_records(run_id, records).await?;
        self.store.append_stage_event(run_id, event.clone()).await?;
        self.store.append_log(run_id, line.clone()).await?;
        progress.diagnostics.push(line);

        for (name, value) in [
            ("stage.output_count", output_count as f64),
            ("stage.duration_ms", event.duration_ms as f64),
        ] {
            let snapshot = Snapshot {
                run_id,
                session_id: self.session_id,
                workspace_id: context.workspace_id.clone(),
                template_id: context.template_id.clone(),
                stage: Some(event.stage.clone()),
                name: name.to_string(),
                value,
                recorded_at: Utc::now(),
            };
            self.store.append_snapshot(snapshot.clone()).await?;
            progress.snapshots.push(snapshot);
        }
        Ok(())
    }

    async fn persist(&self, progress: &mut Progress) -> Result<(), EngineError> {
        progress.record.updated_at = Utc::now();
        progress.record = self.store.save_run(progress.record.clone()).await?;
        Ok(())
    }

    async fn fail(
        &self,
        mut progress: Progress,
        error: EngineError,
        stage: Option<&Stage>,
    ) -> RunFailure {
        let context = self.plan.context();
        let run_id = context.run_id;
        let stage_label = stage.map_or_else(|| "none".to_string(), Stage::to_string);
        let line = format!("failed stage={stage_label}|error={error}");
        progress.diagnostics.push(line.clone());
        record_stage_failed(&context.template_id, &stage_label, error.to_string());

        if let Some(stage) = stage {
            self.publish(RunEventPayload::StageFailed {
                stage: stage.clone(),
                error: error.to_string(),
            })
            .await;
        }

        progress.record.status = RunStatus::Failed;
        progress.record.risk_score = RunRecord::score(RunStatus::Failed, &progress.timeline);
        progress.record.error = Some(error.to_string());
        if let Err(store_err) = self.persist(&mut progress).await {
            warn!(run_id = %run_id, error = %store_err, "failed to persist failed run record");
        } else if let Err(store_err) = self.store.append_log(run_id, line).await {
            warn!(run_id = %run_id, error = %store_err, "failed to append failure log");
        }

        let elapsed = progress.started.elapsed();
        self.publish(RunEventPayload::Finished {
            status: RunStatus::Failed,
            elapsed_ms: elapsed.as_millis() as u64,
        })
        .await;
        record_run_finished(run_id.to_string(), &context.template_id, RunStatus::Failed.as_str(), elapsed);

        RunFailure {
            run_id,
            plan_id: self.plan.id(),
            error,
            stage: stage.cloned(),
            timeline: progress.timeline,
            diagnostics: progress.diagnostics,
            plugin_count: self.plan.plugins().len(),
            elapsed,
        }
    }

    async fn publish(&self, payload: RunEventPayload) {
        let Some(events) = &self.events else {
            return;
        };
        let context = self.plan.context();
        let event = RunEvent::new(context.run_id, context.correlation_id, payload);
        if let Err(err) = events.publish(event).await {
            warn!(run_id = %context.run_id, error = %err, "failed to publish run event");
        }
    }

    fn arm_deadline(&self, after: Duration) -> DeadlineGuard {
        let cancel = self.plan.context().cancel.clone();
        let run_id = self.plan.run_id();
        DeadlineGuard(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!(run_id = %run_id, deadline_ms = after.as_millis() as u64, "run deadline elapsed; cancelling");
            cancel.cancel();
        }))
    }
}

/// Aborts the deadline timer when the run finishes first.
struct DeadlineGuard(JoinHandle<()>);

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionContext, RunMode};
    use crate::error::{ExecutionError, StoreError};
    use crate::events::{InProcEventBus, RunEventStream};
    use crate::ids::{PluginId, TenantId, WorkspaceId};
    use crate::planner::{build_execution_plan, Blueprint, PlanOptions};
    use crate::plugin::{Plugin, PluginDefinition, PluginOutput};
    use crate::store::InMemoryRunStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct AddOne;

    #[async_trait]
    impl Plugin for AddOne {
        async fn execute(
            &self,
            input: &Value,
            _context: &ExecutionContext,
            _config: &Value,
        ) -> anyhow::Result<PluginOutput> {
            Ok(PluginOutput::new(json!(input.as_i64().unwrap_or(0) + 1)))
        }
    }

    struct Fails;

    #[async_trait]
    impl Plugin for Fails {
        async fn execute(
            &self,
            _input: &Value,
            _context: &ExecutionContext,
            _config: &Value,
        ) -> anyhow::Result<PluginOutput> {
            anyhow::bail!("model diverged")
        }
    }

    struct Hangs;

    #[async_trait]
    impl Plugin for Hangs {
        async fn execute(
            &self,
            _input: &Value,
            context: &ExecutionContext,
            _config: &Value,
        ) -> anyhow::Result<PluginOutput> {
            context.cancel.cancelled().await;
            Ok(PluginOutput::empty())
        }
    }

    const ROUTE: [&str; 3] = ["ingest", "synthesize", "simulate"];

    fn coordinator(
        handlers: [Arc<dyn Plugin>; 3],
        store: Arc<dyn RunStore>,
    ) -> RunCoordinator {
        let defs: Vec<Arc<PluginDefinition>> = ROUTE
            .iter()
            .zip(handlers)
            .map(|(stage, handler)| {
                Arc::new(
                    PluginDefinition::new(PluginId::new(format!("{stage}-plugin")).unwrap(), handler)
                        .with_stage(Stage::new(*stage).unwrap()),
                )
            })
            .collect();
        let blueprint = Blueprint {
            template_id: "test".into(),
            tenant_id: TenantId::new("tenant").unwrap(),
            workspace_id: WorkspaceId::new("ws").unwrap(),
            actor: "operator".into(),
            phases: ROUTE.iter().map(|s| Stage::new(*s).unwrap()).collect(),
            plugin_ids: Vec::new(),
            mode: RunMode::Live,
            trace_tags: BTreeMap::new(),
        };
        let plan = Arc::new(build_execution_plan(&blueprint, &defs, &PlanOptions::default()).unwrap());
        RunCoordinator::new(StageExecutor::new(plan, Duration::from_secs(5)), store)
    }

    #[tokio::test]
    async fn outputs_chain_through_stages() {
        let store = Arc::new(InMemoryRunStore::default());
        let coordinator = coordinator(
            [Arc::new(AddOne), Arc::new(AddOne), Arc::new(AddOne)],
            store.clone(),
        );

        let summary = coordinator.run(json!(0)).await.unwrap();
        assert_eq!(summary.state, RunStatus::Succeeded);
        assert_eq!(summary.timeline.len(), 3);
        assert_eq!(summary.timeline[2].output, json!(3));
        assert_eq!(summary.diagnostics.len(), 3);
        assert_eq!(summary.snapshots.len(), 6);
        assert_eq!(summary.telemetry.invocations, 3);

        let stored = store.get_run(summary.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.snapshot, json!(3));
        assert_eq!(store.stage_events(summary.run_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failing_stage_keeps_partial_timeline() {
        let store = Arc::new(InMemoryRunStore::default());
        let bus = Arc::new(InProcEventBus::new(64));
        let mut rx = bus.subscribe_runs();
        let coordinator = coordinator(
            [Arc::new(AddOne), Arc::new(AddOne), Arc::new(Fails)],
            store.clone(),
        )
        .with_events(bus.clone());

        let failure = coordinator.run(json!(0)).await.unwrap_err();
        assert!(matches!(
            failure.error,
            EngineError::Execution(ExecutionError::PluginFailed { .. })
        ));
        assert_eq!(failure.timeline.len(), 2);
        assert_eq!(failure.stage, Some(Stage::new("simulate").unwrap()));
        assert!(failure
            .diagnostics
            .last()
            .unwrap()
            .starts_with("failed stage=simulate|error="));

        let stored = store.get_run(failure.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.risk_score, 1.0);
        assert!(stored.error.unwrap().contains("model diverged"));

        let mut saw_failed_stage = false;
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.payload, RunEventPayload::StageFailed { .. }) {
                saw_failed_stage = true;
            }
            last = Some(event.payload);
        }
        assert!(saw_failed_stage);
        assert!(matches!(
            last,
            Some(RunEventPayload::Finished { status: RunStatus::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn deadline_cancels_the_run() {
        let store = Arc::new(InMemoryRunStore::default());
        let coordinator = coordinator(
            [Arc::new(AddOne), Arc::new(Hangs), Arc::new(AddOne)],
            store,
        )
        .with_deadline(Some(Duration::from_millis(30)));

        let failure = tokio::time::timeout(Duration::from_secs(2), coordinator.run(json!(0)))
            .await
            .expect("deadline should end the run")
            .unwrap_err();
        assert!(matches!(
            failure.error,
            EngineError::Execution(ExecutionError::Cancelled { .. })
        ));
        assert_eq!(failure.timeline.len(), 1);
    }

    struct RejectingStore;

    #[async_trait]
    impl RunStore for RejectingStore {
        async fn save_run(&self, _record: RunRecord) -> Result<RunRecord, StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }
        async fn get_run(&self, _run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
            Ok(None)
        }
        async fn list_runs(&self, _query: &crate::store::RunQuery) -> Result<Vec<RunRecord>, StoreError> {
            Ok(Vec::new())
        }
        async fn append_stage_event(&self, _run_id: RunId, _event: StageEvent) -> Result<(), StoreError> {
            Ok(())
        }
        async fn stage_events(&self, _run_id: RunId) -> Result<Vec<StageEvent>, StoreError> {
            Ok(Vec::new())
        }
        async fn append_plugin_records(&self, _run_id: RunId, _records: Vec<PluginRunRecord>) -> Result<(), StoreError> {
            Ok(())
        }
        async fn append_log(&self, _run_id: RunId, _line: String) -> Result<(), StoreError> {
            Ok(())
        }
        async fn append_snapshot(&self, _snapshot: Snapshot) -> Result<(), StoreError> {
            Ok(())
        }
        async fn query_timeline(&self, _filter: &crate::store::TimelineFilter) -> Result<Vec<Snapshot>, StoreError> {
            Ok(Vec::new())
        }
        async fn summarize(&self, _run_id: RunId) -> Result<Vec<crate::record::EventBucket>, StoreError> {
            Ok(Vec::new())
        }
        async fn list_logs(&self, _run_id: RunId, _limit: usize) -> Result<Vec<crate::record::LogEntry>, StoreError> {
            Ok(Vec::new())
        }
        async fn list_artifacts(&self, _run_id: RunId) -> Result<Vec<crate::record::RunArtifact>, StoreError> {
            Ok(Vec::new())
        }
        async fn clear(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_failure_fails_the_run() {
        let coordinator = coordinator(
            [Arc::new(AddOne), Arc::new(AddOne), Arc::new(AddOne)],
            Arc::new(RejectingStore),
        );

        let failure = coordinator.run(json!(0)).await.unwrap_err();
        assert!(matches!(failure.error, EngineError::Store(StoreError::Backend(_))));
        assert!(failure.timeline.is_empty());
        assert_eq!(failure.into_output().status, RunStatus::Failed);
    }
}
