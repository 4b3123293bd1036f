//! Wire types for submitting runs and reading their outcome.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunMode;
use crate::error::ConfigError;
use crate::ids::{PlanId, PluginId, RunId, TenantId, WorkspaceId};
use crate::planner::{Blueprint, PlanOptions};
use crate::record::{RunStatus, StageEvent};
use crate::stage::{Stage, StageTemplate};

/// A request to execute one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub tenant_id: String,
    pub workspace_id: String,
    pub requested_by: String,
    /// Stages to run in order; empty runs the whole template route.
    #[serde(default)]
    pub phases: Vec<String>,
    /// Restrict the run to these plugins; empty runs every matching plugin.
    #[serde(default)]
    pub plugin_ids: Vec<String>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub mode_options: ModeOptions,
    /// Initial payload handed to the first stage.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_plugins: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace_tags: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeOptions {
    /// Run a stage's plugins concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Run-wide deadline in milliseconds; 0 disables it.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl ModeOptions {
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl RunRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        workspace_id: impl Into<String>,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workspace_id: workspace_id.into(),
            requested_by: requested_by.into(),
            ..Self::default()
        }
    }

    pub fn with_phases<I, S>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases = phases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_plugins<I, S>(mut self, plugin_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugin_ids = plugin_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.mode_options.parallel = parallel;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.mode_options.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_plugins(mut self, max_plugins: usize) -> Self {
        self.max_plugins = Some(max_plugins);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trace_tags.insert(key.into(), value.into());
        self
    }

    /// Validate the request against `template`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidIdentifier`] for malformed ids,
    /// [`ConfigError::UnknownStage`] / [`ConfigError::DuplicateStage`] for a
    /// bad phase list and [`ConfigError::InvalidRequest`] for an empty actor.
    pub fn blueprint(&self, template: &StageTemplate) -> Result<Blueprint, ConfigError> {
        if self.requested_by.trim().is_empty() {
            return Err(ConfigError::InvalidRequest(
                "requestedBy must not be empty".to_string(),
            ));
        }

        let phases = self
            .phases
            .iter()
            .map(Stage::new)
            .collect::<Result<Vec<_>, _>>()?;
        let plugin_ids = self
            .plugin_ids
            .iter()
            .map(PluginId::new)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Blueprint {
            template_id: template.id().to_string(),
            tenant_id: TenantId::new(self.tenant_id.as_str())?,
            workspace_id: WorkspaceId::new(self.workspace_id.as_str())?,
            actor: self.requested_by.clone(),
            phases: template.resolve_phases(&phases)?,
            plugin_ids,
            mode: self.mode,
            trace_tags: self.trace_tags.clone(),
        })
    }

    pub fn plan_options(&self, default_max_plugins: Option<usize>) -> PlanOptions {
        PlanOptions {
            include_phases: Vec::new(),
            max_plugins: self.max_plugins.or(default_max_plugins),
        }
    }
}

/// Structured outcome of a run, returned whether it succeeded or not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub run_id: RunId,
    pub status: RunStatus,
    pub timeline: Vec<StageEvent>,
    pub diagnostics: Vec<String>,
    pub report: RunReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutput {
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub elapsed_ms: u64,
    pub stage_count: usize,
    pub plugin_count: usize,
    pub plan_id: PlanId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> StageTemplate {
        StageTemplate::new("pipeline", ["ingest", "synthesize", "simulate", "actuate"]).unwrap()
    }

    #[test]
    fn deserializes_camel_case_request() {
        let raw = json!({
            "tenantId": "acme",
            "workspaceId": "ops",
            "requestedBy": "alice",
            "phases": ["ingest", "simulate"],
            "pluginIds": ["loader"],
            "mode": "dry-run",
            "modeOptions": { "parallel": true, "timeoutMs": 1500 }
        });
        let request: RunRequest = serde_json::from_value(raw).unwrap();

        assert_eq!(request.mode, RunMode::DryRun);
        assert!(request.mode_options.parallel);
        assert_eq!(request.mode_options.deadline(), Some(Duration::from_millis(1500)));
        assert_eq!(request.payload, Value::Null);
    }

    #[test]
    fn blueprint_defaults_to_full_route() {
        let request = RunRequest::new("acme", "ops", "alice");
        let blueprint = request.blueprint(&template()).unwrap();
        assert_eq!(blueprint.phases.len(), 4);
        assert_eq!(blueprint.template_id, "pipeline");
        assert_eq!(request.mode_options.deadline(), None);
    }

    #[test]
    fn blueprint_rejects_bad_input() {
        let unknown = RunRequest::new("acme", "ops", "alice").with_phases(["approve"]);
        assert!(matches!(
            unknown.blueprint(&template()),
            Err(ConfigError::UnknownStage { .. })
        ));

        let no_actor = RunRequest::new("acme", "ops", " ");
        assert!(matches!(
            no_actor.blueprint(&template()),
            Err(ConfigError::InvalidRequest(_))
        ));

        let bad_tenant = RunRequest::new("", "ops", "alice");
        assert!(matches!(
            bad_tenant.blueprint(&template()),
            Err(ConfigError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn output_serializes_camel_case() {
        let output = RunOutput {
            run_id: RunId::new(),
            status: RunStatus::Succeeded,
            timeline: Vec::new(),
            diagnostics: vec!["stage=ingest|plugins=a|outputs=1|duration=0ms".into()],
            report: RunReport {
                elapsed_ms: 3,
                stage_count: 1,
                plugin_count: 1,
                plan_id: PlanId::new(),
            },
            error: None,
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["status"], "succeeded");
        assert_eq!(value["report"]["stageCount"], 1);
        assert!(value.get("runId").is_some());
        assert!(value.get("error").is_none());
    }
}
