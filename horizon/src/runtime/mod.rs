/// Builder for constructing engine instances.
pub mod builder;
/// Drives a plan through its stage route and persists the outcome.
pub mod coordinator;
/// Engine facade: registration, execution, queries and background tasks.
pub mod engine;
/// Per-stage plugin execution under timeouts and cancellation.
pub mod executor;

pub use builder::EngineBuilder;
pub use coordinator::{RunCoordinator, RunFailure, RunSummary};
pub use engine::Engine;
pub use executor::{ExecutorState, ExecutorTelemetry, StageExecutor};
