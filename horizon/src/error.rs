//! Error types for the pipeline engine.
//!
//! Errors are split by when they can happen: [`ConfigError`] at
//! registration and planning time, [`ExecutionError`] while a run is in
//! flight, and [`StoreError`] for persistence. [`EngineError`] wraps all
//! three for the top-level facade.

use thiserror::Error;

use crate::ids::{PluginId, RunId};
use crate::stage::Stage;

/// Registration and planning failures. Always fatal, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An identifier failed validation.
    #[error("invalid {kind}: {value:?}")]
    InvalidIdentifier {
        /// What kind of identifier was rejected.
        kind: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A plugin with this id is already registered.
    #[error("plugin already registered: {0}")]
    DuplicatePlugin(PluginId),

    /// A stage is not part of the template's route.
    #[error("stage '{stage}' is not part of template '{template}'")]
    UnknownStage {
        /// The unknown stage.
        stage: Stage,
        /// Template the stage was checked against.
        template: String,
    },

    /// A stage was listed more than once.
    #[error("stage listed more than once: {0}")]
    DuplicateStage(Stage),

    /// A template or request resolved to no stages at all.
    #[error("stage route is empty")]
    EmptyRoute,

    /// A plugin declared no stages.
    #[error("plugin '{0}' declares no stages")]
    NoStages(PluginId),

    /// A plugin depends on an id that is not registered.
    #[error("plugin '{plugin}' depends on unregistered plugin '{dependency}'")]
    UnknownDependency {
        /// The dependent plugin.
        plugin: PluginId,
        /// The missing dependency.
        dependency: PluginId,
    },

    /// The dependency graph contains a cycle through these plugins.
    #[error("dependency cycle between plugins: {}", join_ids(.0))]
    DependencyCycle(Vec<PluginId>),

    /// A plugin is scheduled in an earlier phase than one of its dependencies.
    #[error("plugin '{plugin}' runs before its dependency '{dependency}'")]
    DependencyOrder {
        /// The dependent plugin.
        plugin: PluginId,
        /// The dependency placed in a later phase.
        dependency: PluginId,
    },

    /// A plugin kept in a plan depends on a plugin that serves the plan's
    /// route but was filtered or truncated out of it.
    #[error("plugin '{plugin}' needs '{dependency}', which the plan left out")]
    MissingDependency {
        /// The dependent plugin.
        plugin: PluginId,
        /// The dependency missing from the plan.
        dependency: PluginId,
    },

    /// A run request was malformed.
    #[error("invalid run request: {0}")]
    InvalidRequest(String),
}

/// Failures that abort a run in flight.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// No plugin in the plan supports the stage.
    #[error("no plugin registered for stage '{0}'")]
    NoPluginForStage(Stage),

    /// A plugin exceeded its own timeout.
    #[error("plugin '{plugin}' timed out after {timeout_ms} ms in stage '{stage}'")]
    PluginTimeout {
        /// The slow plugin.
        plugin: PluginId,
        /// Stage being executed.
        stage: Stage,
        /// The plugin's declared timeout.
        timeout_ms: u64,
    },

    /// A plugin returned an error.
    #[error("plugin '{plugin}' failed in stage '{stage}': {message}")]
    PluginFailed {
        /// The failing plugin.
        plugin: PluginId,
        /// Stage being executed.
        stage: Stage,
        /// Error reported by the plugin.
        message: String,
    },

    /// The run's cancellation signal fired.
    #[error("run cancelled during stage '{stage}'")]
    Cancelled {
        /// Stage that was interrupted.
        stage: Stage,
    },
}

/// Persistence failures surfaced by a [`RunStore`](crate::store::RunStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record exists for the run id.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// The backing store rejected the operation.
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Umbrella error returned by the engine facade and session monitor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Registration or planning failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run failed while executing.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Persisting or querying run state failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No open session matches the identity.
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

fn join_ids(ids: &[PluginId]) -> String {
    ids.iter()
        .map(PluginId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
