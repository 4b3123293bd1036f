//! Horizon - staged plugin-pipeline execution.
//!
//! A crate for running pluggable processing units along a fixed route of
//! stages, recording what every unit produced and keeping the results
//! queryable after the fact.
//!
//! # Core Concepts
//!
//! - **Plugin**: The unit of work. Plugins implement the [`Plugin`] trait and
//!   are registered as a [`PluginDefinition`] declaring the stages they serve
//!   and the plugins they depend on.
//!
//! - **Registry**: The [`PluginRegistry`] validates definitions against a
//!   [`StageTemplate`] and orders them by phase, then by dependency.
//!
//! - **Plan**: [`build_execution_plan`] freezes an ordered plugin chain and
//!   a fresh [`ExecutionContext`] into an immutable [`ExecutionPlan`].
//!
//! - **Runtime**: The [`StageExecutor`] runs one stage under per-plugin
//!   timeouts and the run's cancellation signal; the [`RunCoordinator`]
//!   walks the route, chaining each stage's output into the next. The
//!   [`Engine`] ties it together behind a single facade.
//!
//! - **Store**: The [`RunStore`] trait abstracts persistence of run records,
//!   timelines, logs and snapshots. [`InMemoryRunStore`] is the reference
//!   backend.
//!
//! - **Sessions**: The [`SessionMonitor`] groups runs under long-lived
//!   per-actor sessions.
//!
//! - **Events**: Lifecycle events flow through [`RunEventPublisher`];
//!   [`InProcEventBus`] broadcasts them in-process.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use horizon::*;
//!
//! let engine = EngineBuilder::new(EngineConfig::from_env())
//!     .with_template(StageTemplate::recovery())
//!     .build()?;
//! engine.register(
//!     PluginDefinition::new(PluginId::new("sensor")?, Arc::new(Sensor))
//!         .with_stage(Stage::new("sense")?),
//! )?;
//!
//! let output = engine
//!     .execute(RunRequest::new("acme", "ops", "alice").with_phases(["sense"]))
//!     .await?;
//! ```

/// Engine configuration and tunables.
///
/// [`EngineConfig`] carries the snapshot buffer size, flush interval,
/// default plugin timeout and event bus capacity, with environment loading
/// and clamping.
pub mod config;

/// Run context shared with plugins.
///
/// Defines [`ExecutionContext`], [`RunMode`] and the [`CancelSignal`] each
/// run is governed by.
pub mod context;

/// Correlation tracking for runs.
///
/// The `correlation` module provides [`CorrelationCache`] for mapping
/// in-flight runs to the correlation id they were planned under.
pub mod correlation;

/// Error types for configuration, execution and storage failures.
pub mod error;

/// Event publishing and subscription system.
///
/// - [`RunEventPublisher`] and [`RunEventStream`] for pub/sub patterns
/// - [`RunEvent`] and [`RunEventPayload`] for event data
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// Validated identifier newtypes.
pub mod ids;

/// Execution planning.
pub mod planner;

/// Plugin contract and registration records.
pub mod plugin;

/// Run, stage, plugin and snapshot records.
pub mod record;

/// Plugin registration and phase/dependency ordering.
pub mod registry;

/// External request and response types.
pub mod request;

/// Runtime orchestration.
///
/// - [`Engine`] - main facade
/// - [`EngineBuilder`] - builder for engines
/// - [`RunCoordinator`] - drives one run across its stages
/// - [`StageExecutor`] - runs the plugins of one stage
pub mod runtime;

/// Session tracking.
pub mod session;

/// Stage names and templates.
pub mod stage;

/// Run storage.
///
/// The `store` module defines the [`RunStore`] trait, its query types and
/// the [`InMemoryRunStore`] backend.
pub mod store;

/// Tracing spans and telemetry helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

pub use config::*;
pub use context::*;
pub use correlation::*;
pub use error::*;
pub use events::*;
pub use ids::*;
pub use planner::*;
pub use plugin::*;
pub use record::*;
pub use registry::*;
pub use request::*;
pub use runtime::*;
pub use session::*;
pub use stage::*;
pub use store::{InMemoryRunStore, RunQuery, RunStore, TimelineFilter};
