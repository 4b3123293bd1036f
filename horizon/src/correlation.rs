use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt::Display, sync::Arc};
use tracing::debug;
use uuid::Uuid;

use crate::ids::RunId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation cache mapping run ids to the correlation id they were
/// planned under.
///
/// Lets callers that only hold a run id join engine logs with upstream
/// request traces. Entries live only while a run is in flight; the lock is
/// never held across an await, so removal is safe from a `Drop` guard.
#[derive(Clone, Default, Debug)]
pub struct CorrelationCache {
    inner: Arc<Mutex<HashMap<RunId, CorrelationId>>>,
}

impl CorrelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a mapping from run_id to correlation_id.
    ///
    /// Overwrites any existing mapping for this run.
    pub fn remember(&self, run_id: RunId, correlation_id: CorrelationId) {
        if let Some(previous) = self.inner.lock().insert(run_id, correlation_id) {
            debug!(run_id = %run_id, %previous, "correlation id replaced");
        }
    }

    /// Fetch the correlation_id for a run, if it exists.
    pub fn fetch(&self, run_id: RunId) -> Option<CorrelationId> {
        self.inner.lock().get(&run_id).copied()
    }

    /// Drop the mapping for a run, returning it if present.
    pub fn forget(&self, run_id: RunId) -> Option<CorrelationId> {
        self.inner.lock().remove(&run_id)
    }

    /// Number of tracked runs.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_overwrites_existing_mapping() {
        let cache = CorrelationCache::new();
        let run_id = RunId::new();
        let second = CorrelationId::new();

        cache.remember(run_id, CorrelationId::new());
        cache.remember(run_id, second);
        assert_eq!(cache.fetch(run_id), Some(second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn forget_removes_mapping() {
        let cache = CorrelationCache::new();
        let run_id = RunId::new();
        let correlation = CorrelationId::new();
        cache.remember(run_id, correlation);

        assert_eq!(cache.forget(run_id), Some(correlation));
        assert!(cache.fetch(run_id).is_none());
        assert!(cache.forget(run_id).is_none());
        assert!(cache.is_empty());
    }
}
