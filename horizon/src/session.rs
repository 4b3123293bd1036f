//! Long-lived sessions grouping the runs of one tenant/workspace/actor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::RunMode;
use crate::error::{ConfigError, EngineError};
use crate::ids::{RunId, SessionId, TenantId, WorkspaceId};
use crate::record::RunRecord;
use crate::request::{ModeOptions, RunOutput, RunRequest};
use crate::runtime::Engine;

/// Who a session belongs to. Two identities with the same fields share a
/// session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub tenant_id: TenantId,
    pub workspace_id: WorkspaceId,
    pub actor: String,
}

impl SessionIdentity {
    pub fn new(tenant_id: TenantId, workspace_id: WorkspaceId, actor: impl Into<String>) -> Self {
        Self {
            tenant_id,
            workspace_id,
            actor: actor.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.tenant_id, self.workspace_id, self.actor)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: SessionId,
    pub identity: SessionIdentity,
    pub template_id: String,
    pub active_runs: usize,
    /// Runs started in this session, oldest first.
    pub history: Vec<RunId>,
    pub opened_at: DateTime<Utc>,
}

/// Per-run knobs for [`SessionMonitor::run`]; identity comes from the
/// session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRunOptions {
    pub phases: Vec<String>,
    pub plugin_ids: Vec<String>,
    pub mode: RunMode,
    pub mode_options: ModeOptions,
    pub max_plugins: Option<usize>,
    pub trace_tags: BTreeMap<String, String>,
}

/// Tracks sessions and runs their requests through an [`Engine`].
#[derive(Debug)]
pub struct SessionMonitor {
    engine: Arc<Engine>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionMonitor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Open the session for `identity`, or return it if already open.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidRequest`] if `template_id` is not the engine's
    /// template.
    pub fn open_session(
        &self,
        identity: SessionIdentity,
        template_id: &str,
    ) -> Result<SessionState, EngineError> {
        let template = self.engine.template();
        if template.id() != template_id {
            return Err(ConfigError::InvalidRequest(format!(
                "unknown template '{template_id}'"
            ))
            .into());
        }

        let mut sessions = self.sessions.lock();
        let state = sessions.entry(identity.key()).or_insert_with(|| {
            let state = SessionState {
                session_id: SessionId::new(),
                identity: identity.clone(),
                template_id: template_id.to_string(),
                active_runs: 0,
                history: Vec::new(),
                opened_at: Utc::now(),
            };
            info!(session_id = %state.session_id, key = %identity.key(), "session opened");
            state
        });
        Ok(state.clone())
    }

    pub fn session(&self, identity: &SessionIdentity) -> Option<SessionState> {
        self.sessions.lock().get(&identity.key()).cloned()
    }

    /// Execute a run inside the session of `identity`.
    ///
    /// `active_runs` is held up for the duration of the run, including when
    /// it fails or the future is dropped.
    pub async fn run(
        &self,
        identity: &SessionIdentity,
        options: SessionRunOptions,
        payload: Value,
    ) -> Result<RunOutput, EngineError> {
        let key = identity.key();
        let session_id = self
            .sessions
            .lock()
            .get(&key)
            .map(|s| s.session_id)
            .ok_or_else(|| EngineError::SessionNotFound(key.clone()))?;

        let request = RunRequest {
            tenant_id: identity.tenant_id.to_string(),
            workspace_id: identity.workspace_id.to_string(),
            requested_by: identity.actor.clone(),
            phases: options.phases,
            plugin_ids: options.plugin_ids,
            mode: options.mode,
            mode_options: options.mode_options,
            payload,
            max_plugins: options.max_plugins,
            trace_tags: options.trace_tags,
        };

        let _guard = ActiveRunGuard::enter(&self.sessions, key.clone());
        let output = self.engine.execute_request(&request, Some(session_id)).await?;

        if let Some(state) = self.sessions.lock().get_mut(&key) {
            state.history.push(output.run_id);
        }
        debug!(session_id = %session_id, run_id = %output.run_id, status = %output.status, "session run finished");
        Ok(output)
    }

    /// All open sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionState> {
        let mut sessions: Vec<SessionState> = self.sessions.lock().values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.opened_at
                .cmp(&b.opened_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// Stored records of the session's runs, oldest first.
    pub async fn timeline(&self, identity: &SessionIdentity) -> Result<Vec<RunRecord>, EngineError> {
        let history = self
            .session(identity)
            .ok_or_else(|| EngineError::SessionNotFound(identity.key()))?
            .history;

        let mut records = Vec::with_capacity(history.len());
        for run_id in history {
            if let Some(record) = self.engine.get_run(run_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Close the session and return its final state. Runs still in flight
    /// finish normally but are no longer added to any history.
    pub fn close_session(&self, identity: &SessionIdentity) -> Result<SessionState, EngineError> {
        let state = self
            .sessions
            .lock()
            .remove(&identity.key())
            .ok_or_else(|| EngineError::SessionNotFound(identity.key()))?;
        info!(session_id = %state.session_id, runs = state.history.len(), "session closed");
        Ok(state)
    }
}

/// Holds a session's `active_runs` count up while a run executes.
struct ActiveRunGuard<'a> {
    sessions: &'a Mutex<HashMap<String, SessionState>>,
    key: String,
}

impl<'a> ActiveRunGuard<'a> {
    fn enter(sessions: &'a Mutex<HashMap<String, SessionState>>, key: String) -> Self {
        if let Some(state) = sessions.lock().get_mut(&key) {
            state.active_runs += 1;
        }
        Self { sessions, key }
    }
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.sessions.lock().get_mut(&self.key) {
            state.active_runs = state.active_runs.saturating_sub(1);
        }
    }
}
