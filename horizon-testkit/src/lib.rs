//! Test doubles for horizon: ready-made plugins, a fixture template and a
//! store wrapper that can be told to fail.

mod plugins;
mod store;

pub use plugins::*;
pub use store::*;

use std::sync::Arc;

use horizon::{Plugin, PluginDefinition, PluginId, Stage, StageTemplate};

/// Stage names of [`pipeline_template`], in route order.
pub const PIPELINE_STAGES: [&str; 4] = ["ingest", "synthesize", "simulate", "actuate"];

/// Four-stage template used across the test suites.
pub fn pipeline_template() -> StageTemplate {
    StageTemplate::new("pipeline", PIPELINE_STAGES).expect("fixture template is valid")
}

/// Build a definition serving `stages`.
pub fn definition(id: &str, stages: &[&str], handler: Arc<dyn Plugin>) -> PluginDefinition {
    stages.iter().fold(
        PluginDefinition::new(PluginId::new(id).expect("fixture plugin id is valid"), handler),
        |def, stage| def.with_stage(Stage::new(*stage).expect("fixture stage is valid")),
    )
}

/// One [`EchoPlugin`] per pipeline stage, each depending on the previous
/// stage's plugin. Ids are `<stage>-echo`.
pub fn echo_pipeline() -> Vec<PluginDefinition> {
    let mut previous: Option<PluginId> = None;
    PIPELINE_STAGES
        .iter()
        .map(|stage| {
            let mut def = definition(&format!("{stage}-echo"), &[*stage], Arc::new(EchoPlugin::new()));
            if let Some(dep) = previous.replace(def.id.clone()) {
                def = def.depends_on(dep);
            }
            def
        })
        .collect()
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
