//! Plugin registry and phase/dependency ordering.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::ConfigError;
use crate::ids::PluginId;
use crate::plugin::PluginDefinition;
use crate::stage::{Stage, StageTemplate};

/// Registry of plugin definitions for one stage template.
///
/// Definitions are immutable once registered and are handed out as
/// `Arc<PluginDefinition>`, so plans built from the registry stay valid even
/// if more plugins are registered later. Registration order is remembered
/// and used as the tie-break wherever ordering is otherwise unconstrained.
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    template: StageTemplate,
    plugins: Vec<Arc<PluginDefinition>>,
    index: HashMap<PluginId, usize>,
}

impl PluginRegistry {
    pub fn new(template: StageTemplate) -> Self {
        Self {
            template,
            plugins: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn template(&self) -> &StageTemplate {
        &self.template
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn contains(&self, id: &PluginId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &PluginId) -> Option<Arc<PluginDefinition>> {
        self.index.get(id).map(|&i| Arc::clone(&self.plugins[i]))
    }

    /// All plugins in registration order.
    pub fn plugins(&self) -> &[Arc<PluginDefinition>] {
        &self.plugins
    }

    /// Plugins supporting `stage`, in registration order.
    pub fn plugins_for_stage(&self, stage: &Stage) -> Vec<Arc<PluginDefinition>> {
        self.plugins
            .iter()
            .filter(|p| p.supports(stage))
            .cloned()
            .collect()
    }

    /// Register a single plugin.
    ///
    /// Dependencies must already be registered. On error the registry is
    /// left unchanged.
    pub fn register(&mut self, plugin: PluginDefinition) -> Result<(), ConfigError> {
        self.validate_shape(&plugin)?;

        for dep in &plugin.dependencies {
            if dep == &plugin.id {
                return Err(ConfigError::DependencyCycle(vec![plugin.id.clone()]));
            }
            if !self.contains(dep) {
                return Err(ConfigError::UnknownDependency {
                    plugin: plugin.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        self.push(plugin);
        Ok(())
    }

    /// Register a batch of plugins atomically.
    ///
    /// Dependencies may point at plugins registered earlier or at other
    /// members of the batch, in any order. Either the whole batch is
    /// registered or, on the first error, none of it.
    pub fn register_all(
        &mut self,
        plugins: impl IntoIterator<Item = PluginDefinition>,
    ) -> Result<(), ConfigError> {
        let batch: Vec<PluginDefinition> = plugins.into_iter().collect();

        let mut batch_ids = HashSet::new();
        for plugin in &batch {
            self.validate_shape(plugin)?;
            if !batch_ids.insert(plugin.id.clone()) {
                return Err(ConfigError::DuplicatePlugin(plugin.id.clone()));
            }
        }

        for plugin in &batch {
            for dep in &plugin.dependencies {
                if !self.contains(dep) && !batch_ids.contains(dep) {
                    return Err(ConfigError::UnknownDependency {
                        plugin: plugin.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let candidates: Vec<&PluginDefinition> = self
            .plugins
            .iter()
            .map(Arc::as_ref)
            .chain(batch.iter())
            .collect();
        let all: Vec<usize> = (0..candidates.len()).collect();
        topological_order(&candidates, &all)?;

        for plugin in batch {
            self.push(plugin);
        }
        Ok(())
    }

    /// Order the plugins serving `phases`.
    ///
    /// Each plugin is placed in the bucket of the earliest requested phase
    /// it supports. Buckets follow the order of `phases`; inside a bucket a
    /// plugin always follows its dependencies, with registration order
    /// breaking ties. Dependencies outside the requested phases do not
    /// constrain the order.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::UnknownStage`] if a phase is not in the template.
    /// - [`ConfigError::DependencyOrder`] if a dependency falls in a later
    ///   bucket than its dependent.
    /// - [`ConfigError::DependencyCycle`] if a bucket's dependencies form a
    ///   cycle.
    pub fn ordered_by_phase(
        &self,
        phases: &[Stage],
    ) -> Result<Vec<Arc<PluginDefinition>>, ConfigError> {
        for phase in phases {
            if !self.template.contains(phase) {
                return Err(ConfigError::UnknownStage {
                    stage: phase.clone(),
                    template: self.template.id().to_string(),
                });
            }
        }

        let mut bucket_of: HashMap<&PluginId, usize> = HashMap::new();
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); phases.len()];
        for (idx, plugin) in self.plugins.iter().enumerate() {
            if let Some(bucket) = phases.iter().position(|phase| plugin.supports(phase)) {
                bucket_of.insert(&plugin.id, bucket);
                buckets[bucket].push(idx);
            }
        }

        for (bucket, members) in buckets.iter().enumerate() {
            for &idx in members {
                let plugin = &self.plugins[idx];
                for dep in &plugin.dependencies {
                    if matches!(bucket_of.get(dep), Some(&dep_bucket) if dep_bucket > bucket) {
                        return Err(ConfigError::DependencyOrder {
                            plugin: plugin.id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }

        let defs: Vec<&PluginDefinition> = self.plugins.iter().map(Arc::as_ref).collect();
        let mut ordered = Vec::with_capacity(bucket_of.len());
        for members in &buckets {
            for idx in topological_order(&defs, members)? {
                ordered.push(Arc::clone(&self.plugins[idx]));
            }
        }

        debug!(
            phases = phases.len(),
            plugins = ordered.len(),
            "ordered plugins by phase"
        );
        Ok(ordered)
    }

    fn validate_shape(&self, plugin: &PluginDefinition) -> Result<(), ConfigError> {
        if self.contains(&plugin.id) {
            return Err(ConfigError::DuplicatePlugin(plugin.id.clone()));
        }
        if plugin.stages.is_empty() {
            return Err(ConfigError::NoStages(plugin.id.clone()));
        }
        for stage in &plugin.stages {
            if !self.template.contains(stage) {
                return Err(ConfigError::UnknownStage {
                    stage: stage.clone(),
                    template: self.template.id().to_string(),
                });
            }
        }
        Ok(())
    }

    fn push(&mut self, plugin: PluginDefinition) {
        debug!(plugin_id = %plugin.id, stages = plugin.stages.len(), "plugin registered");
        let sequence = self.plugins.len();
        self.index.insert(plugin.id.clone(), sequence);
        self.plugins.push(Arc::new(plugin.with_sequence(sequence)));
    }
}

/// Kahn's algorithm over the subset `members` of `defs`.
///
/// Only edges between members count. Ready nodes are drained lowest index
/// first, so the result follows the order of `defs` wherever dependencies
/// allow it.
pub(crate) fn topological_order(
    defs: &[&PluginDefinition],
    members: &[usize],
) -> Result<Vec<usize>, ConfigError> {
    let position: HashMap<&PluginId, usize> =
        members.iter().map(|&idx| (&defs[idx].id, idx)).collect();

    let mut in_degree: HashMap<usize, usize> = members.iter().map(|&idx| (idx, 0)).collect();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for &idx in members {
        for dep in &defs[idx].dependencies {
            if let Some(&dep_idx) = position.get(dep) {
                *in_degree.entry(idx).or_insert(0) += 1;
                dependents.entry(dep_idx).or_default().push(idx);
            }
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&idx, _)| idx)
        .collect();

    let mut sorted = Vec::with_capacity(members.len());
    while let Some(idx) = ready.pop_first() {
        sorted.push(idx);
        if let Some(children) = dependents.get(&idx) {
            for child in children {
                if let Some(deg) = in_degree.get_mut(child) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }

    if sorted.len() < members.len() {
        let emitted: HashSet<usize> = sorted.into_iter().collect();
        let mut stuck: Vec<usize> = members
            .iter()
            .copied()
            .filter(|idx| !emitted.contains(idx))
            .collect();
        stuck.sort_unstable();
        return Err(ConfigError::DependencyCycle(
            stuck.into_iter().map(|idx| defs[idx].id.clone()).collect(),
        ));
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::plugin::{Plugin, PluginOutput};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        async fn execute(
            &self,
            input: &Value,
            _context: &ExecutionContext,
            _config: &Value,
        ) -> anyhow::Result<PluginOutput> {
            Ok(PluginOutput::new(input.clone()))
        }
    }

    fn template() -> StageTemplate {
        StageTemplate::new("test", ["ingest", "synthesize", "simulate", "actuate"]).unwrap()
    }

    fn stage(name: &str) -> Stage {
        Stage::new(name).unwrap()
    }

    fn id(name: &str) -> PluginId {
        PluginId::new(name).unwrap()
    }

    fn plugin(name: &str, stage_name: &str, deps: &[&str]) -> PluginDefinition {
        deps.iter().fold(
            PluginDefinition::new(id(name), Arc::new(Echo)).with_stage(stage(stage_name)),
            |def, dep| def.depends_on(id(dep)),
        )
    }

    fn ids(plugins: &[Arc<PluginDefinition>]) -> Vec<&str> {
        plugins.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn duplicate_registration_leaves_registry_unchanged() {
        let mut registry = PluginRegistry::new(template());
        registry.register(plugin("a", "ingest", &[])).unwrap();

        let err = registry
            .register(plugin("a", "simulate", &[]))
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicatePlugin(id("a")));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id("a")).unwrap().supports(&stage("ingest")));
    }

    #[test]
    fn rejects_unknown_stage_and_dependency() {
        let mut registry = PluginRegistry::new(template());

        let err = registry.register(plugin("a", "approve", &[])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStage { .. }));

        let err = registry.register(plugin("b", "ingest", &["ghost"])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));

        let err = registry.register(plugin("c", "ingest", &["c"])).unwrap_err();
        assert_eq!(err, ConfigError::DependencyCycle(vec![id("c")]));
        assert!(registry.is_empty());
    }

    #[test]
    fn orders_by_phase_then_dependency() {
        let mut registry = PluginRegistry::new(template());
        registry
            .register_all([
                plugin("sim-b", "simulate", &["sim-a"]),
                plugin("ingest-a", "ingest", &[]),
                plugin("sim-a", "simulate", &["ingest-a"]),
                plugin("synth", "synthesize", &["ingest-a"]),
            ])
            .unwrap();

        let ordered = registry
            .ordered_by_phase(&[stage("ingest"), stage("synthesize"), stage("simulate")])
            .unwrap();
        assert_eq!(ids(&ordered), ["ingest-a", "synth", "sim-a", "sim-b"]);
    }

    #[test]
    fn ties_follow_registration_order() {
        let mut registry = PluginRegistry::new(template());
        for name in ["c", "a", "b"] {
            registry.register(plugin(name, "ingest", &[])).unwrap();
        }
        let ordered = registry.ordered_by_phase(&[stage("ingest")]).unwrap();
        assert_eq!(ids(&ordered), ["c", "a", "b"]);
    }

    #[test]
    fn every_plugin_follows_its_dependencies() {
        let mut registry = PluginRegistry::new(template());
        registry
            .register_all([
                plugin("d", "ingest", &["b", "c"]),
                plugin("c", "ingest", &["a"]),
                plugin("b", "ingest", &["a"]),
                plugin("a", "ingest", &[]),
                plugin("e", "synthesize", &["d"]),
            ])
            .unwrap();

        let ordered = registry
            .ordered_by_phase(&[stage("ingest"), stage("synthesize")])
            .unwrap();
        let position: HashMap<&str, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.as_str(), i))
            .collect();
        for p in &ordered {
            for dep in &p.dependencies {
                assert!(position[dep.as_str()] < position[p.id.as_str()]);
            }
        }
        assert_eq!(ids(&ordered), ["a", "c", "b", "d", "e"]);
    }

    #[test]
    fn batch_cycle_is_rejected_atomically() {
        let mut registry = PluginRegistry::new(template());
        registry.register(plugin("root", "ingest", &[])).unwrap();

        let err = registry
            .register_all([
                plugin("x", "ingest", &["root", "y"]),
                plugin("y", "ingest", &["x"]),
            ])
            .unwrap_err();
        assert_eq!(err, ConfigError::DependencyCycle(vec![id("x"), id("y")]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dependency_in_later_phase_is_rejected() {
        let mut registry = PluginRegistry::new(template());
        registry
            .register_all([
                plugin("early", "ingest", &["late"]),
                plugin("late", "simulate", &[]),
            ])
            .unwrap();

        let err = registry
            .ordered_by_phase(&[stage("ingest"), stage("simulate")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::DependencyOrder { .. }));

        // Outside the selection the dependency does not constrain anything.
        let ordered = registry.ordered_by_phase(&[stage("ingest")]).unwrap();
        assert_eq!(ids(&ordered), ["early"]);
    }

    #[test]
    fn multi_stage_plugin_lands_in_earliest_requested_phase() {
        let mut registry = PluginRegistry::new(template());
        registry
            .register(
                plugin("both", "simulate", &[]).with_stage(stage("synthesize")),
            )
            .unwrap();

        let ordered = registry
            .ordered_by_phase(&[stage("simulate"), stage("synthesize")])
            .unwrap();
        assert_eq!(ids(&ordered), ["both"]);
        assert_eq!(registry.plugins_for_stage(&stage("synthesize")).len(), 1);
    }

    #[test]
    fn registration_assigns_sequence() {
        let mut registry = PluginRegistry::new(template());
        registry.register(plugin("first", "ingest", &[])).unwrap();
        registry
            .register_all([
                plugin("third", "ingest", &["second"]),
                plugin("second", "simulate", &[]),
            ])
            .unwrap();

        let sequences: Vec<Option<usize>> =
            registry.plugins().iter().map(|p| p.sequence()).collect();
        assert_eq!(sequences, [Some(0), Some(1), Some(2)]);
        assert_eq!(registry.get(&id("second")).unwrap().sequence(), Some(2));
    }
}
