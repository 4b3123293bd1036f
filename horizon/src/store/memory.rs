use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::{EngineConfig, MAX_SNAPSHOTS, MIN_SNAPSHOTS};
use crate::error::StoreError;
use crate::ids::{RunId, WorkspaceId};
use crate::plugin::is_empty_payload;
use crate::record::{
    EventBucket, LogEntry, PluginRunRecord, RunArtifact, RunRecord, Snapshot, StageEvent,
};

use super::{RunQuery, RunStore, TimelineFilter};

#[derive(Debug)]
struct RunEntry {
    record: RunRecord,
    stages: Vec<StageEvent>,
    plugins: Vec<PluginRunRecord>,
    logs: Vec<LogEntry>,
}

/// Process-local [`RunStore`].
///
/// Each run lives behind its own lock, so concurrent runs only contend on
/// the run index while inserting. Snapshots are first collected in a
/// bounded buffer and moved into a per-workspace timeline, capped at
/// `max_snapshots` entries with the oldest evicted, when the buffer fills
/// up or [`RunStore::flush`] is called.
#[derive(Debug)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunEntry>>>>,
    buffer: Mutex<Vec<Snapshot>>,
    timeline: RwLock<HashMap<WorkspaceId, VecDeque<Snapshot>>>,
    max_snapshots: usize,
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new(EngineConfig::default().max_snapshots)
    }
}

impl InMemoryRunStore {
    pub fn new(max_snapshots: usize) -> Self {
        let max_snapshots = max_snapshots.clamp(MIN_SNAPSHOTS, MAX_SNAPSHOTS);
        Self {
            runs: RwLock::new(HashMap::new()),
            buffer: Mutex::new(Vec::with_capacity(max_snapshots)),
            timeline: RwLock::new(HashMap::new()),
            max_snapshots,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_snapshots)
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }

    /// Snapshots waiting for the next flush.
    pub fn pending_snapshots(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    fn entry(&self, run_id: RunId) -> Result<Arc<Mutex<RunEntry>>, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    /// Move buffered snapshots into the timeline.
    ///
    /// Lock order is timeline, then buffer, here and in `query_timeline`, so
    /// a reader never observes a snapshot that left the buffer but has not
    /// reached the timeline yet.
    fn drain_buffer(&self) -> usize {
        let mut timeline = self.timeline.write();
        let drained: Vec<Snapshot> = std::mem::take(&mut *self.buffer.lock());
        let count = drained.len();
        if count == 0 {
            return 0;
        }

        for snapshot in drained {
            let retained = timeline.entry(snapshot.workspace_id.clone()).or_default();
            retained.push_back(snapshot);
            while retained.len() > self.max_snapshots {
                retained.pop_front();
            }
        }
        debug!(flushed = count, "snapshot buffer flushed");
        count
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, mut record: RunRecord) -> Result<RunRecord, StoreError> {
        let existing = self.runs.read().get(&record.run_id).cloned();
        if let Some(entry) = existing {
            let mut entry = entry.lock();
            if record.updated_at <= entry.record.updated_at {
                record.updated_at = entry.record.updated_at + ChronoDuration::microseconds(1);
            }
            entry.record = record.clone();
            return Ok(record);
        }

        let mut runs = self.runs.write();
        // Another task may have inserted between the read and write locks.
        if let Some(entry) = runs.get(&record.run_id) {
            let mut entry = entry.lock();
            if record.updated_at <= entry.record.updated_at {
                record.updated_at = entry.record.updated_at + ChronoDuration::microseconds(1);
            }
            entry.record = record.clone();
            return Ok(record);
        }
        runs.insert(
            record.run_id,
            Arc::new(Mutex::new(RunEntry {
                record: record.clone(),
                stages: Vec::new(),
                plugins: Vec::new(),
                logs: Vec::new(),
            })),
        );
        Ok(record)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let entry = self.runs.read().get(&run_id).cloned();
        Ok(entry.map(|e| e.lock().record.clone()))
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>, StoreError> {
        let entries: Vec<Arc<Mutex<RunEntry>>> = self.runs.read().values().cloned().collect();
        let mut records: Vec<RunRecord> = entries
            .iter()
            .map(|e| e.lock().record.clone())
            .filter(|r| query.matches(r))
            .collect();

        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn append_stage_event(
        &self,
        run_id: RunId,
        event: StageEvent,
    ) -> Result<(), StoreError> {
        self.entry(run_id)?.lock().stages.push(event);
        Ok(())
    }

    async fn stage_events(&self, run_id: RunId) -> Result<Vec<StageEvent>, StoreError> {
        Ok(self.entry(run_id)?.lock().stages.clone())
    }

    async fn append_plugin_records(
        &self,
        run_id: RunId,
        records: Vec<PluginRunRecord>,
    ) -> Result<(), StoreError> {
        self.entry(run_id)?.lock().plugins.extend(records);
        Ok(())
    }

    async fn append_log(&self, run_id: RunId, line: String) -> Result<(), StoreError> {
        let entry = self.entry(run_id)?;
        let mut entry = entry.lock();
        let sequence = entry.logs.len() as u64;
        entry.logs.push(LogEntry {
            run_id,
            sequence,
            line,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.push(snapshot);
            buffer.len() >= self.max_snapshots
        };
        if full {
            self.drain_buffer();
        }
        Ok(())
    }

    async fn query_timeline(&self, filter: &TimelineFilter) -> Result<Vec<Snapshot>, StoreError> {
        let mut snapshots: Vec<Snapshot> = {
            let timeline = self.timeline.read();
            let buffer = self.buffer.lock();
            timeline
                .values()
                .flatten()
                .chain(buffer.iter())
                .filter(|s| filter.matches(s))
                .cloned()
                .collect()
        };
        snapshots.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(snapshots)
    }

    async fn summarize(&self, run_id: RunId) -> Result<Vec<EventBucket>, StoreError> {
        let entry = self.entry(run_id)?;
        let entry = entry.lock();

        let mut buckets: Vec<EventBucket> = Vec::new();
        for record in &entry.plugins {
            let index = match buckets
                .iter()
                .position(|b| b.stage.as_ref() == Some(&record.stage))
            {
                Some(index) => index,
                None => {
                    buckets.push(EventBucket {
                        stage: Some(record.stage.clone()),
                        counts: BTreeMap::new(),
                        total: 0,
                    });
                    buckets.len() - 1
                }
            };
            let bucket = &mut buckets[index];
            for event in &record.events {
                *bucket.counts.entry(event.as_str().to_string()).or_insert(0) += 1;
                bucket.total += 1;
            }
        }
        Ok(buckets)
    }

    async fn list_logs(&self, run_id: RunId, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let entry = self.entry(run_id)?;
        let entry = entry.lock();
        let skip = entry.logs.len().saturating_sub(limit);
        Ok(entry.logs[skip..].to_vec())
    }

    async fn list_artifacts(&self, run_id: RunId) -> Result<Vec<RunArtifact>, StoreError> {
        let entry = self.entry(run_id)?;
        let entry = entry.lock();
        Ok(entry
            .plugins
            .iter()
            .filter(|r| !is_empty_payload(&r.output))
            .map(|r| RunArtifact {
                run_id,
                plugin_id: r.plugin_id.clone(),
                stage: r.stage.clone(),
                payload: r.output.clone(),
                produced_at: r.finished_at,
            })
            .collect())
    }

    async fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.drain_buffer())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.runs.write().clear();
        self.buffer.lock().clear();
        self.timeline.write().clear();
        debug!("run store cleared");
        Ok(())
    }
}
