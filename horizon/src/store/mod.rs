use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::ids::{RunId, TenantId, WorkspaceId};
use crate::record::{
    EventBucket, LogEntry, PluginRunRecord, RunArtifact, RunRecord, RunStatus, Snapshot,
    StageEvent,
};

/// In-memory reference implementation.
pub mod memory;

pub use memory::InMemoryRunStore;

/// Trait for run store backends.
///
/// Implementors persist run records, their timelines and the snapshots
/// emitted while they execute. Every method must be safe to call from
/// concurrent runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run record.
    ///
    /// `updated_at` is strictly increasing per run id: if the incoming value
    /// is not newer than the stored one the store bumps it. Returns the
    /// record as stored.
    async fn save_run(&self, record: RunRecord) -> Result<RunRecord, StoreError>;

    /// Fetch a run record.
    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError>;

    /// List runs matching `query`, most recently updated first.
    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>, StoreError>;

    /// Append a stage event to a run's timeline.
    async fn append_stage_event(&self, run_id: RunId, event: StageEvent)
        -> Result<(), StoreError>;

    /// A run's timeline in append order.
    async fn stage_events(&self, run_id: RunId) -> Result<Vec<StageEvent>, StoreError>;

    /// Append the per-plugin records of one stage.
    async fn append_plugin_records(
        &self,
        run_id: RunId,
        records: Vec<PluginRunRecord>,
    ) -> Result<(), StoreError>;

    /// Append a log line to a run.
    async fn append_log(&self, run_id: RunId, line: String) -> Result<(), StoreError>;

    /// Record a snapshot. Snapshots are append-only.
    async fn append_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Snapshots matching `filter`, oldest first.
    async fn query_timeline(&self, filter: &TimelineFilter) -> Result<Vec<Snapshot>, StoreError>;

    /// Plugin lifecycle events of a run, counted per stage.
    async fn summarize(&self, run_id: RunId) -> Result<Vec<EventBucket>, StoreError>;

    /// The last `limit` log lines of a run, oldest first.
    async fn list_logs(&self, run_id: RunId, limit: usize) -> Result<Vec<LogEntry>, StoreError>;

    /// Non-empty plugin outputs of a run.
    async fn list_artifacts(&self, run_id: RunId) -> Result<Vec<RunArtifact>, StoreError>;

    /// Move buffered snapshots into durable storage.
    ///
    /// Returns the number of snapshots moved. Backends that write through
    /// keep the default.
    async fn flush(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Drop all state.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Filter for [`RunStore::list_runs`]. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQuery {
    pub tenant_id: Option<TenantId>,
    pub workspace_id: Option<WorkspaceId>,
    pub status: Option<RunStatus>,
    pub min_risk_score: Option<f64>,
    pub limit: Option<usize>,
}

impl RunQuery {
    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn workspace(mut self, workspace_id: WorkspaceId) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn min_risk_score(mut self, score: f64) -> Self {
        self.min_risk_score = Some(score);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &RunRecord) -> bool {
        self.tenant_id.as_ref().map_or(true, |t| &record.tenant_id == t)
            && self
                .workspace_id
                .as_ref()
                .map_or(true, |w| &record.workspace_id == w)
            && self.status.map_or(true, |s| record.status == s)
            && self
                .min_risk_score
                .map_or(true, |min| record.risk_score >= min)
    }
}

/// Filter for [`RunStore::query_timeline`]. `from` and `to` are inclusive.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineFilter {
    pub workspace_id: Option<WorkspaceId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub template_id: Option<String>,
}

impl TimelineFilter {
    pub fn workspace(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id: Some(workspace_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.workspace_id
            .as_ref()
            .map_or(true, |w| &snapshot.workspace_id == w)
            && self.from.map_or(true, |from| snapshot.recorded_at >= from)
            && self.to.map_or(true, |to| snapshot.recorded_at <= to)
            && self
                .template_id
                .as_ref()
                .map_or(true, |t| &snapshot.template_id == t)
    }
}
