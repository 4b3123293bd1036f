//! Plugin contract and definitions.
//!
//! A plugin is a unit of work bound to one or more stages of a template.
//! Implementors provide [`Plugin::execute`]; everything the engine needs to
//! schedule the plugin (stages, dependencies, timeout) lives on the
//! immutable [`PluginDefinition`] wrapping it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::ids::PluginId;
use crate::stage::Stage;

/// Trait implemented by pipeline plugins.
///
/// `input` is the payload produced by the previous stage (or the run's
/// initial payload for the first stage). Long-running plugins should watch
/// `context.cancel` and return early once it fires.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn execute(
        &self,
        input: &Value,
        context: &ExecutionContext,
        config: &Value,
    ) -> anyhow::Result<PluginOutput>;
}

/// Value produced by one plugin invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginOutput {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl PluginOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            warnings: Vec::new(),
        }
    }

    /// An output that carries no signal.
    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// True when the payload carries no signal: `null`, an empty string,
    /// an empty array or an empty object.
    pub fn is_empty(&self) -> bool {
        is_empty_payload(&self.payload)
    }
}

pub(crate) fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Immutable registration record for a plugin.
#[derive(Clone)]
pub struct PluginDefinition {
    pub id: PluginId,
    pub name: String,
    pub domain: String,
    pub stages: Vec<Stage>,
    pub dependencies: Vec<PluginId>,
    /// Per-plugin timeout; `None` uses the engine default.
    pub timeout: Option<Duration>,
    pub priority: u8,
    pub config: Value,
    handler: Arc<dyn Plugin>,
    sequence: Option<usize>,
}

impl fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("stages", &self.stages)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl PluginDefinition {
    /// Create a definition with the id doubling as its name.
    pub fn new(id: PluginId, handler: Arc<dyn Plugin>) -> Self {
        Self {
            name: id.as_str().to_string(),
            id,
            domain: "default".to_string(),
            stages: Vec::new(),
            dependencies: Vec::new(),
            timeout: None,
            priority: 0,
            config: Value::Null,
            handler,
            sequence: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Add a supported stage.
    pub fn with_stage(mut self, stage: Stage) -> Self {
        if !self.stages.contains(&stage) {
            self.stages.push(stage);
        }
        self
    }

    /// Add a plugin that must complete before this one.
    pub fn depends_on(mut self, dependency: PluginId) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn supports(&self, stage: &Stage) -> bool {
        self.stages.contains(stage)
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Plugin> {
        &self.handler
    }

    /// Position in the registry, assigned on registration.
    pub fn sequence(&self) -> Option<usize> {
        self.sequence
    }

    pub(crate) fn with_sequence(mut self, sequence: usize) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Serializable view of the definition, without the handler.
    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            domain: self.domain.clone(),
            stages: self.stages.clone(),
            dependencies: self.dependencies.clone(),
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            priority: self.priority,
        }
    }
}

/// Serializable description of a registered plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: PluginId,
    pub name: String,
    pub domain: String,
    pub stages: Vec<Stage>,
    pub dependencies: Vec<PluginId>,
    pub timeout_ms: Option<u64>,
    pub priority: u8,
}
