use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{CancelSignal, ExecutionContext};
use crate::correlation::{CorrelationCache, CorrelationId};
use crate::error::{ConfigError, EngineError};
use crate::events::{InProcEventBus, RunEvent, RunEventPublisher, RunEventStream};
use crate::ids::{RunId, SessionId};
use crate::planner::{build_execution_plan, ExecutionPlan};
use crate::plugin::{PluginDefinition, PluginSummary};
use crate::record::{EventBucket, LogEntry, RunArtifact, RunRecord, Snapshot, StageEvent};
use crate::registry::PluginRegistry;
use crate::request::{RunOutput, RunRequest};
use crate::stage::StageTemplate;
use crate::store::{RunQuery, RunStore, TimelineFilter};

use super::coordinator::RunCoordinator;
use super::executor::StageExecutor;

/// Entry point tying the registry, planner, executor and store together.
///
/// Cheap to share behind an `Arc`; every method takes `&self` and runs may
/// execute concurrently. Plugins can be registered at any time; a run
/// plans against the registry as it was when the run was submitted.
pub struct Engine {
    config: EngineConfig,
    registry: RwLock<PluginRegistry>,
    store: Arc<dyn RunStore>,
    events: Arc<dyn RunEventPublisher>,
    bus: Option<Arc<InProcEventBus>>,
    correlations: CorrelationCache,
    active: Mutex<HashMap<RunId, CancelSignal>>,
    shutdown: CancelSignal,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("template", &self.registry.read().template().id())
            .field("plugins", &self.registry.read().len())
            .field("active_runs", &self.active.lock().len())
            .field("flusher_running", &self.flusher.lock().is_some())
            .finish()
    }
}

impl Engine {
    pub(crate) fn new(
        config: EngineConfig,
        registry: PluginRegistry,
        store: Arc<dyn RunStore>,
        events: Arc<dyn RunEventPublisher>,
        bus: Option<Arc<InProcEventBus>>,
        correlations: CorrelationCache,
    ) -> Self {
        Self {
            config,
            registry: RwLock::new(registry),
            store,
            events,
            bus,
            correlations,
            active: Mutex::new(HashMap::new()),
            shutdown: CancelSignal::new(),
            flusher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn template(&self) -> StageTemplate {
        self.registry.read().template().clone()
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Subscribe to run events when the engine owns its event bus.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<RunEvent>> {
        self.bus.as_ref().map(|bus| bus.subscribe_runs())
    }

    pub fn register(&self, plugin: PluginDefinition) -> Result<(), ConfigError> {
        self.registry.write().register(plugin)
    }

    pub fn register_all(
        &self,
        plugins: impl IntoIterator<Item = PluginDefinition>,
    ) -> Result<(), ConfigError> {
        self.registry.write().register_all(plugins)
    }

    /// Registered plugins in registration order.
    pub fn plugins(&self) -> Vec<PluginSummary> {
        self.registry
            .read()
            .plugins()
            .iter()
            .map(|p| p.summary())
            .collect()
    }

    /// Validate `request` and build its execution plan without running it.
    pub fn plan(&self, request: &RunRequest) -> Result<ExecutionPlan, ConfigError> {
        let registry = self.registry.read();
        let blueprint = request.blueprint(registry.template())?;
        let ordered = registry.ordered_by_phase(&blueprint.phases)?;
        drop(registry);

        build_execution_plan(
            &blueprint,
            &ordered,
            &request.plan_options(self.config.default_max_plugins),
        )
    }

    /// Execute a run to completion.
    ///
    /// A run that fails while executing still returns `Ok` with a `failed`
    /// status and the partial timeline. Invalid requests and store failures
    /// return `Err`.
    pub async fn execute(&self, request: RunRequest) -> Result<RunOutput, EngineError> {
        self.execute_request(&request, None).await
    }

    pub(crate) async fn execute_request(
        &self,
        request: &RunRequest,
        session_id: Option<SessionId>,
    ) -> Result<RunOutput, EngineError> {
        let plan = Arc::new(self.plan(request)?);
        let context = plan.context();
        let run_id = context.run_id;

        let _active = ActiveRun::track(self, run_id, context);

        let executor = StageExecutor::new(Arc::clone(&plan), self.config.default_plugin_timeout())
            .with_parallel(request.mode_options.parallel);
        let mut coordinator = RunCoordinator::new(executor, Arc::clone(&self.store))
            .with_events(Arc::clone(&self.events))
            .with_deadline(request.mode_options.deadline());
        if let Some(session_id) = session_id {
            coordinator = coordinator.with_session(session_id);
        }

        let outcome = coordinator.run(request.payload.clone()).await;

        match outcome {
            Ok(summary) => Ok(summary.into_output()),
            Err(failure) => match failure.error {
                EngineError::Execution(_) => Ok(failure.into_output()),
                error => Err(error),
            },
        }
    }

    /// Fire the cancellation signal of an in-flight run.
    ///
    /// Returns `false` if the run is not active on this engine.
    pub fn cancel_run(&self, run_id: RunId) -> bool {
        match self.active.lock().get(&run_id) {
            Some(cancel) => {
                info!(run_id = %run_id, "cancelling run");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.active.lock().keys().copied().collect()
    }

    /// Correlation id a run was planned under.
    pub async fn correlation_of(&self, run_id: RunId) -> Result<Option<CorrelationId>, EngineError> {
        if let Some(correlation_id) = self.correlations.fetch(run_id) {
            return Ok(Some(correlation_id));
        }
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .map(|record| record.correlation_id))
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, EngineError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>, EngineError> {
        Ok(self.store.list_runs(query).await?)
    }

    pub async fn stage_events(&self, run_id: RunId) -> Result<Vec<StageEvent>, EngineError> {
        Ok(self.store.stage_events(run_id).await?)
    }

    pub async fn list_logs(&self, run_id: RunId, limit: usize) -> Result<Vec<LogEntry>, EngineError> {
        Ok(self.store.list_logs(run_id, limit).await?)
    }

    pub async fn list_artifacts(&self, run_id: RunId) -> Result<Vec<RunArtifact>, EngineError> {
        Ok(self.store.list_artifacts(run_id).await?)
    }

    pub async fn summarize(&self, run_id: RunId) -> Result<Vec<EventBucket>, EngineError> {
        Ok(self.store.summarize(run_id).await?)
    }

    pub async fn query_timeline(&self, filter: &TimelineFilter) -> Result<Vec<Snapshot>, EngineError> {
        Ok(self.store.query_timeline(filter).await?)
    }

    /// Spawn the background snapshot flusher. Calling it again while the
    /// flusher runs is a no-op.
    pub fn start(&self) {
        let mut slot = self.flusher.lock();
        if slot.is_some() {
            return;
        }

        let store = Arc::clone(&self.store);
        let interval = self.config.flush_interval();
        let shutdown = self.shutdown.clone();

        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("snapshot flusher shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match store.flush().await {
                            Ok(0) => {}
                            Ok(flushed) => debug!(flushed, "flusher moved snapshots"),
                            Err(err) => warn!("snapshot flush error: {err}"),
                        }
                    }
                }
            }
        }));
        info!(interval_ms = interval.as_millis() as u64, "snapshot flusher started");
    }

    /// Stop the flusher and flush whatever is still buffered.
    ///
    /// Store contents are left alone; call `store().clear()` to drop them.
    /// An engine cannot be restarted after shutdown.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.shutdown.cancel();
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("snapshot flusher join error: {err}");
            }
        }
        let flushed = self.store.flush().await?;
        info!(flushed, "engine shut down");
        Ok(())
    }
}

/// Keeps a run's cancel signal reachable through [`Engine::cancel_run`]
/// and its correlation id cached while the run executes. Both are released
/// on drop, including when the caller abandons the run future.
struct ActiveRun<'a> {
    engine: &'a Engine,
    run_id: RunId,
}

impl<'a> ActiveRun<'a> {
    fn track(engine: &'a Engine, run_id: RunId, context: &ExecutionContext) -> Self {
        engine.active.lock().insert(run_id, context.cancel.clone());
        engine.correlations.remember(run_id, context.correlation_id);
        Self { engine, run_id }
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.engine.active.lock().remove(&self.run_id);
        self.engine.correlations.forget(self.run_id);
    }
}
