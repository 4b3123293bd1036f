//! Turns a blueprint and an ordered plugin list into an immutable
//! [`ExecutionPlan`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::context::{CancelSignal, ExecutionContext, RunMode};
use crate::correlation::CorrelationId;
use crate::error::ConfigError;
use crate::ids::{PlanId, PluginId, RunId, TenantId, WorkspaceId};
use crate::plugin::PluginDefinition;
use crate::registry::topological_order;
use crate::stage::Stage;

/// Validated description of what a run should do.
#[derive(Clone, Debug, PartialEq)]
pub struct Blueprint {
    pub template_id: String,
    pub tenant_id: TenantId,
    pub workspace_id: WorkspaceId,
    pub actor: String,
    /// Stages to run, in execution order.
    pub phases: Vec<Stage>,
    /// Restrict the run to these plugins; empty means all.
    pub plugin_ids: Vec<PluginId>,
    pub mode: RunMode,
    pub trace_tags: BTreeMap<String, String>,
}

/// Planner knobs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Narrow the blueprint's phases; empty keeps them all.
    pub include_phases: Vec<Stage>,
    /// Keep at most this many plugins, first in order wins.
    pub max_plugins: Option<usize>,
}

/// Ordered plugin chain for a single run.
///
/// Never mutated once built. Running again requires a new plan, which
/// brings fresh run, plan and correlation ids.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    id: PlanId,
    route: Vec<Stage>,
    plugins: Vec<Arc<PluginDefinition>>,
    context: ExecutionContext,
}

impl ExecutionPlan {
    pub fn id(&self) -> PlanId {
        self.id
    }

    pub fn run_id(&self) -> RunId {
        self.context.run_id
    }

    pub fn route(&self) -> &[Stage] {
        &self.route
    }

    pub fn plugins(&self) -> &[Arc<PluginDefinition>] {
        &self.plugins
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Plan plugins supporting `stage`.
    ///
    /// Registration order, except that a plugin always follows its
    /// dependencies within the stage. A plugin serving several stages of
    /// the route is returned for each of them.
    pub fn plugins_for(&self, stage: &Stage) -> Vec<Arc<PluginDefinition>> {
        let mut members: Vec<(usize, &Arc<PluginDefinition>)> = self
            .plugins
            .iter()
            .enumerate()
            .filter(|(_, p)| p.supports(stage))
            .collect();
        members.sort_by_key(|&(position, p)| (p.sequence().unwrap_or(usize::MAX), position));

        let defs: Vec<&PluginDefinition> = members.iter().map(|&(_, p)| Arc::as_ref(p)).collect();
        let all: Vec<usize> = (0..defs.len()).collect();
        // The plan is dependency-sorted already, so this cannot fail.
        let order = topological_order(&defs, &all).unwrap_or(all);
        order
            .into_iter()
            .map(|idx| Arc::clone(members[idx].1))
            .collect()
    }
}

/// Build an execution plan.
///
/// `ordered` must already be in phase/dependency order (see
/// [`PluginRegistry::ordered_by_phase`](crate::registry::PluginRegistry::ordered_by_phase));
/// the plan preserves it. Plugins that serve none of the route's stages or
/// fall outside the blueprint's plugin filter are dropped before
/// `max_plugins` is applied.
///
/// # Errors
///
/// - [`ConfigError::EmptyRoute`] if no phase survives `include_phases`.
/// - [`ConfigError::MissingDependency`] if a kept plugin depends on a
///   plugin that serves the route but was filtered or truncated out.
///   Dependencies serving none of the route's stages are not required.
pub fn build_execution_plan(
    blueprint: &Blueprint,
    ordered: &[Arc<PluginDefinition>],
    options: &PlanOptions,
) -> Result<ExecutionPlan, ConfigError> {
    let route: Vec<Stage> = blueprint
        .phases
        .iter()
        .filter(|phase| {
            options.include_phases.is_empty() || options.include_phases.contains(phase)
        })
        .cloned()
        .collect();

    if route.is_empty() {
        return Err(ConfigError::EmptyRoute);
    }

    let limit = options.max_plugins.unwrap_or(usize::MAX);
    let on_route: Vec<&Arc<PluginDefinition>> = ordered
        .iter()
        .filter(|p| route.iter().any(|stage| p.supports(stage)))
        .collect();
    let plugins: Vec<Arc<PluginDefinition>> = on_route
        .iter()
        .filter(|p| blueprint.plugin_ids.is_empty() || blueprint.plugin_ids.contains(&p.id))
        .take(limit)
        .map(|&p| Arc::clone(p))
        .collect();

    let kept: HashSet<&PluginId> = plugins.iter().map(|p| &p.id).collect();
    let routed: HashSet<&PluginId> = on_route.iter().map(|p| &p.id).collect();
    for plugin in &plugins {
        if let Some(dep) = plugin
            .dependencies
            .iter()
            .find(|dep| routed.contains(dep) && !kept.contains(dep))
        {
            return Err(ConfigError::MissingDependency {
                plugin: plugin.id.clone(),
                dependency: dep.clone(),
            });
        }
    }

    let context = ExecutionContext {
        tenant_id: blueprint.tenant_id.clone(),
        workspace_id: blueprint.workspace_id.clone(),
        run_id: RunId::new(),
        plan_id: PlanId::new(),
        actor: blueprint.actor.clone(),
        correlation_id: CorrelationId::new(),
        template_id: blueprint.template_id.clone(),
        mode: blueprint.mode,
        trace_tags: blueprint.trace_tags.clone(),
        cancel: CancelSignal::new(),
    };

    debug!(
        plan_id = %context.plan_id,
        run_id = %context.run_id,
        stages = route.len(),
        plugins = plugins.len(),
        "execution plan built"
    );

    Ok(ExecutionPlan {
        id: context.plan_id,
        route,
        plugins,
        context,
    })
}
