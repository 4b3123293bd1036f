use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::correlation::CorrelationId;
use crate::ids::{PlanId, PluginId, RunId};
use crate::record::RunStatus;
use crate::stage::Stage;

/// Metadata envelope attached to every run event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: CorrelationId,
    pub idempotency_key: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        run_id: RunId,
        correlation_id: CorrelationId,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id,
            idempotency_key: idempotency_key.into(),
            run_id,
            timestamp: Utc::now(),
        }
    }
}

/// Run lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

impl RunEvent {
    /// Build an event whose idempotency key is derived from the run id and
    /// the payload, so replays of the same transition share a key.
    pub fn new(run_id: RunId, correlation_id: CorrelationId, payload: RunEventPayload) -> Self {
        let key = format!("{}:{}", run_id, payload.key());
        Self {
            meta: EventMeta::new(run_id, correlation_id, key),
            payload,
        }
    }
}

/// Event payload emitted for run lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventPayload {
    /// Run record was persisted as queued.
    Queued {
        plan_id: PlanId,
        template_id: String,
        stages: usize,
        plugins: usize,
    },
    /// A stage began dispatching its plugins.
    StageStarted { stage: Stage, plugins: Vec<PluginId> },
    /// A stage finished and produced a timeline entry.
    StageCompleted {
        stage: Stage,
        duration_ms: u64,
        warnings: usize,
        signal: bool,
    },
    /// A stage aborted the run.
    StageFailed { stage: Stage, error: String },
    /// Run reached a terminal status.
    Finished { status: RunStatus, elapsed_ms: u64 },
}

impl RunEventPayload {
    fn key(&self) -> String {
        match self {
            RunEventPayload::Queued { .. } => "queued".to_string(),
            RunEventPayload::StageStarted { stage, .. } => format!("stage-started:{stage}"),
            RunEventPayload::StageCompleted { stage, .. } => format!("stage-completed:{stage}"),
            RunEventPayload::StageFailed { stage, .. } => format!("stage-failed:{stage}"),
            RunEventPayload::Finished { status, .. } => format!("finished:{status}"),
        }
    }
}

/// Publishes run events to whoever is listening.
#[async_trait]
pub trait RunEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()>;
}

/// Trait for subscribing to run lifecycle events.
pub trait RunEventStream: Send + Sync {
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Events are broadcast to all active subscribers; if a subscriber lags
/// behind, it will receive `RecvError::Lagged` but won't block the
/// publisher. Events published with no subscriber attached are dropped.
///
/// # Example
///
/// ```ignore
/// use horizon::{InProcEventBus, RunEventStream};
///
/// let bus = InProcEventBus::new(256);
/// let mut rx = bus.subscribe_runs();
/// ```
pub struct InProcEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering up to `capacity` events per
    /// subscriber. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish a run event to all subscribers. Never blocks.
    pub fn publish_run(&self, event: RunEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl RunEventPublisher for InProcEventBus {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        self.publish_run(event)
    }
}

impl RunEventStream for InProcEventBus {
    fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}
