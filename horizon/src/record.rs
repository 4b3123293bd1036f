//! Records produced by a run and persisted by a [`RunStore`](crate::store::RunStore).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunMode;
use crate::correlation::CorrelationId;
use crate::ids::{PlanId, PluginId, RunId, SessionId, TenantId, WorkspaceId};
use crate::planner::ExecutionPlan;
use crate::stage::Stage;

/// Lifecycle state of a run.
///
/// Runs walk `Queued -> Running -> {Succeeded | Degraded | Failed}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Degraded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Degraded => "degraded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Degraded | RunStatus::Failed
        )
    }

    /// Status of a run whose every stage completed.
    ///
    /// Any stage without signal or with warnings degrades the run.
    pub fn classify(timeline: &[StageEvent]) -> RunStatus {
        if timeline.iter().any(StageEvent::is_degraded) {
            RunStatus::Degraded
        } else {
            RunStatus::Succeeded
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event recorded against a single plugin invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginEvent {
    Started,
    Completed,
    Warning,
    Timeout,
    Failed,
    Cancelled,
}

impl PluginEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginEvent::Started => "started",
            PluginEvent::Completed => "completed",
            PluginEvent::Warning => "warning",
            PluginEvent::Timeout => "timeout",
            PluginEvent::Failed => "failed",
            PluginEvent::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one plugin invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRunRecord {
    pub plugin_id: PluginId,
    pub stage: Stage,
    pub route: Vec<Stage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub output: Value,
    pub warnings: Vec<String>,
    pub events: Vec<PluginEvent>,
}

/// Aggregated outcome of one stage. A run's timeline is the ordered list of
/// these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    pub stage: Stage,
    pub plugin_ids: Vec<PluginId>,
    pub output: Value,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
    /// True when the merged output is non-empty.
    pub signal: bool,
}

impl StageEvent {
    pub fn is_degraded(&self) -> bool {
        !self.signal || !self.warnings.is_empty()
    }

    /// Diagnostic line in the `stage=..|plugins=..|outputs=..|duration=..ms`
    /// format.
    pub fn diagnostic(&self) -> String {
        let plugins: Vec<&str> = self.plugin_ids.iter().map(PluginId::as_str).collect();
        format!(
            "stage={}|plugins={}|outputs={}|duration={}ms",
            self.stage,
            plugins.join(","),
            self.plugin_ids.len(),
            self.duration_ms
        )
    }
}

/// Persisted state of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    pub plan_id: PlanId,
    pub correlation_id: CorrelationId,
    pub tenant_id: TenantId,
    pub workspace_id: WorkspaceId,
    pub template_id: String,
    pub requested_by: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phases: Vec<Stage>,
    pub warnings: Vec<String>,
    pub plugin_count: usize,
    pub risk_score: f64,
    /// Most recent stage output.
    pub snapshot: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl RunRecord {
    /// A fresh `queued` record for `plan`.
    pub fn queued(plan: &ExecutionPlan) -> Self {
        let context = plan.context();
        let now = Utc::now();
        Self {
            run_id: context.run_id,
            plan_id: plan.id(),
            correlation_id: context.correlation_id,
            tenant_id: context.tenant_id.clone(),
            workspace_id: context.workspace_id.clone(),
            template_id: context.template_id.clone(),
            requested_by: context.actor.clone(),
            mode: context.mode,
            status: RunStatus::Queued,
            started_at: now,
            updated_at: now,
            phases: plan.route().to_vec(),
            warnings: Vec::new(),
            plugin_count: plan.plugins().len(),
            risk_score: 0.0,
            snapshot: Value::Null,
            error: None,
            session_id: None,
        }
    }

    /// Fraction of stages that came back degraded; failed runs score 1.0.
    pub fn score(status: RunStatus, timeline: &[StageEvent]) -> f64 {
        if status == RunStatus::Failed {
            return 1.0;
        }
        if timeline.is_empty() {
            return 0.0;
        }
        let degraded = timeline.iter().filter(|e| e.is_degraded()).count();
        degraded as f64 / timeline.len() as f64
    }
}

/// Point-in-time metric emitted during a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub workspace_id: WorkspaceId,
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub name: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// One line of a run's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub run_id: RunId,
    pub sequence: u64,
    pub line: String,
    pub recorded_at: DateTime<Utc>,
}

/// Non-empty plugin output kept for later retrieval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifact {
    pub run_id: RunId,
    pub plugin_id: PluginId,
    pub stage: Stage,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
}

/// Plugin lifecycle events of one stage, counted by kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBucket {
    pub stage: Option<Stage>,
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
}

impl EventBucket {
    pub fn count(&self, event: PluginEvent) -> usize {
        self.counts.get(event.as_str()).copied().unwrap_or(0)
    }
}
