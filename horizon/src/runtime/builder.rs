use std::any::type_name_of_val;
use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::correlation::CorrelationCache;
use crate::events::{InProcEventBus, RunEventPublisher};
use crate::registry::PluginRegistry;
use crate::stage::StageTemplate;
use crate::store::{InMemoryRunStore, RunStore};

use super::engine::Engine;

/// Builder for constructing an [`Engine`] with explicit dependencies.
///
/// Either a template or a pre-populated registry is required; everything
/// else has a default. Without `with_store` the engine gets an
/// [`InMemoryRunStore`] sized from the config, and without `with_events` it
/// gets an [`InProcEventBus`] that [`Engine::subscribe`] exposes.
///
/// # Example
///
/// ```ignore
/// use horizon::*;
///
/// let engine = EngineBuilder::new(EngineConfig::from_env())
///     .with_template(StageTemplate::recovery())
///     .with_store(store)
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    template: Option<StageTemplate>,
    registry: Option<PluginRegistry>,
    store: Option<Arc<dyn RunStore>>,
    events: Option<Arc<dyn RunEventPublisher>>,
    correlations: Option<CorrelationCache>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EngineBuilder");
        debug.field("config", &self.config);
        debug.field("template_set", &self.template.is_some());
        debug.field("registry_set", &self.registry.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("correlations_set", &self.correlations.is_some());

        if let Some(store) = &self.store {
            debug.field("store_type", &type_name_of_val(&**store));
        }
        if let Some(events) = &self.events {
            debug.field("events_type", &type_name_of_val(&**events));
        }

        debug.finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl EngineBuilder {
    /// Create a new builder. The config is normalized on `build`.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            template: None,
            registry: None,
            store: None,
            events: None,
            correlations: None,
        }
    }

    /// Set the stage template; the engine starts with an empty registry.
    pub fn with_template(mut self, template: StageTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Set a pre-populated plugin registry.
    pub fn with_registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the run store.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: Arc<dyn RunEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the correlation cache.
    pub fn with_correlations(mut self, correlations: CorrelationCache) -> Self {
        self.correlations = Some(correlations);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if neither a template nor a registry was provided,
    /// or if both were and they disagree.
    pub fn build(self) -> anyhow::Result<Engine> {
        let config = self.config.normalized();

        let registry = match (self.template, self.registry) {
            (None, None) => anyhow::bail!("template or registry dependency missing"),
            (Some(template), None) => PluginRegistry::new(template),
            (None, Some(registry)) => registry,
            (Some(template), Some(registry)) => {
                if registry.template() != &template {
                    anyhow::bail!(
                        "registry template '{}' does not match template '{}'",
                        registry.template().id(),
                        template.id()
                    );
                }
                registry
            }
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryRunStore::from_config(&config)));

        let (events, bus) = match self.events {
            Some(events) => (events, None),
            None => {
                let bus = Arc::new(InProcEventBus::new(config.event_capacity));
                (bus.clone() as Arc<dyn RunEventPublisher>, Some(bus))
            }
        };

        let correlations = self.correlations.unwrap_or_default();

        Ok(Engine::new(config, registry, store, events, bus, correlations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_template_or_registry() {
        let err = EngineBuilder::default().build().unwrap_err();
        assert!(err.to_string().contains("template or registry"));
    }

    #[test]
    fn build_rejects_mismatched_registry() {
        let registry = PluginRegistry::new(StageTemplate::recovery());
        let other = StageTemplate::new("other", ["ingest"]).unwrap();

        let err = EngineBuilder::default()
            .with_template(other)
            .with_registry(registry)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn build_normalizes_config_and_defaults_events() {
        let engine = EngineBuilder::new(EngineConfig {
            max_snapshots: 0,
            ..EngineConfig::default()
        })
        .with_template(StageTemplate::recovery())
        .build()
        .unwrap();

        assert_eq!(engine.config().max_snapshots, crate::config::MIN_SNAPSHOTS);
        assert!(engine.subscribe().is_some());
    }

    #[test]
    fn debug_reports_configured_dependencies() {
        let builder = EngineBuilder::default()
            .with_template(StageTemplate::recovery())
            .with_store(Arc::new(InMemoryRunStore::default()));
        let debug = format!("{builder:?}");
        assert!(debug.contains("store_set: true"));
        assert!(debug.contains("store_type"));
        assert!(debug.contains("events_set: false"));
    }
}
