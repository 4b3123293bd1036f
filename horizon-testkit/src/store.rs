use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use horizon::store::{RunQuery, RunStore, TimelineFilter};
use horizon::{
    EventBucket, InMemoryRunStore, LogEntry, PluginRunRecord, RunArtifact, RunId, RunRecord,
    Snapshot, StageEvent, StoreError,
};

/// Store double wrapping [`InMemoryRunStore`] that can be switched into
/// failure and counts the writes it sees.
///
/// Clones share state, so a test can keep one handle while the engine
/// owns another.
#[derive(Clone, Debug)]
pub struct FailingStore {
    inner: Arc<InMemoryRunStore>,
    state: Arc<FailState>,
}

#[derive(Debug, Default)]
struct FailState {
    /// Saves allowed before `save_run` starts failing; `usize::MAX` never fails.
    save_budget: AtomicUsize,
    fail_appends: AtomicBool,
    saves: AtomicUsize,
    stage_events: AtomicUsize,
    plugin_records: AtomicUsize,
    logs: AtomicUsize,
    snapshots: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::wrap(Arc::new(InMemoryRunStore::default()))
    }

    pub fn wrap(inner: Arc<InMemoryRunStore>) -> Self {
        let state = FailState {
            save_budget: AtomicUsize::new(usize::MAX),
            ..FailState::default()
        };
        Self {
            inner,
            state: Arc::new(state),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryRunStore> {
        &self.inner
    }

    /// Let `n` more saves through, then fail every later one.
    pub fn fail_saves_after(&self, n: usize) {
        self.state.save_budget.store(n, Ordering::SeqCst);
    }

    /// Toggle failure of every append (stage events, plugin records, logs
    /// and snapshots).
    pub fn set_fail_appends(&self, fail: bool) {
        self.state.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Stop failing anything.
    pub fn heal(&self) {
        self.state.save_budget.store(usize::MAX, Ordering::SeqCst);
        self.state.fail_appends.store(false, Ordering::SeqCst);
    }

    /// Attempted `save_run` calls, including rejected ones.
    pub fn save_count(&self) -> usize {
        self.state.saves.load(Ordering::SeqCst)
    }

    pub fn stage_event_count(&self) -> usize {
        self.state.stage_events.load(Ordering::SeqCst)
    }

    pub fn plugin_record_count(&self) -> usize {
        self.state.plugin_records.load(Ordering::SeqCst)
    }

    pub fn log_count(&self) -> usize {
        self.state.logs.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.snapshots.load(Ordering::SeqCst)
    }

    /// Total writes attempted of any kind.
    pub fn write_count(&self) -> usize {
        self.save_count()
            + self.stage_event_count()
            + self.plugin_record_count()
            + self.log_count()
            + self.snapshot_count()
    }

    fn take_save_budget(&self) -> bool {
        self.state
            .save_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn check_append(&self, counter: &AtomicUsize, what: &str) -> Result<(), StoreError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("injected {what} failure")));
        }
        Ok(())
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for FailingStore {
    async fn save_run(&self, record: RunRecord) -> Result<RunRecord, StoreError> {
        self.state.saves.fetch_add(1, Ordering::SeqCst);
        if !self.take_save_budget() {
            tracing::debug!(run_id = %record.run_id, "rejecting save");
            return Err(StoreError::Backend("injected save failure".into()));
        }
        self.inner.save_run(record).await
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.list_runs(query).await
    }

    async fn append_stage_event(
        &self,
        run_id: RunId,
        event: StageEvent,
    ) -> Result<(), StoreError> {
        self.check_append(&self.state.stage_events, "stage event")?;
        self.inner.append_stage_event(run_id, event).await
    }

    async fn stage_events(&self, run_id: RunId) -> Result<Vec<StageEvent>, StoreError> {
        self.inner.stage_events(run_id).await
    }

    async fn append_plugin_records(
        &self,
        run_id: RunId,
        records: Vec<PluginRunRecord>,
    ) -> Result<(), StoreError> {
        self.check_append(&self.state.plugin_records, "plugin record")?;
        self.inner.append_plugin_records(run_id, records).await
    }

    async fn append_log(&self, run_id: RunId, line: String) -> Result<(), StoreError> {
        self.check_append(&self.state.logs, "log")?;
        self.inner.append_log(run_id, line).await
    }

    async fn append_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        self.check_append(&self.state.snapshots, "snapshot")?;
        self.inner.append_snapshot(snapshot).await
    }

    async fn query_timeline(&self, filter: &TimelineFilter) -> Result<Vec<Snapshot>, StoreError> {
        self.inner.query_timeline(filter).await
    }

    async fn summarize(&self, run_id: RunId) -> Result<Vec<EventBucket>, StoreError> {
        self.inner.summarize(run_id).await
    }

    async fn list_logs(&self, run_id: RunId, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.inner.list_logs(run_id, limit).await
    }

    async fn list_artifacts(&self, run_id: RunId) -> Result<Vec<RunArtifact>, StoreError> {
        self.inner.list_artifacts(run_id).await
    }

    async fn flush(&self) -> Result<usize, StoreError> {
        self.inner.flush().await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear().await
    }
}
