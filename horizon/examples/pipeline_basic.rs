//! Basic pipeline example with the in-memory store.
//!
//! Registers a small four-stage pipeline, runs it through a session, then
//! shows a failing run and the query interface.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use horizon::*;
use horizon_testkit::{pipeline_template, FailingPlugin};
use serde_json::{json, Value};

/// Reads raw readings out of the payload.
struct Sensor;

#[async_trait]
impl Plugin for Sensor {
    async fn execute(
        &self,
        input: &Value,
        context: &ExecutionContext,
        _config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        let readings = input.get("readings").cloned().unwrap_or_else(|| json!([]));
        println!("   [sensor] run={} readings={readings}", context.run_id);
        Ok(PluginOutput::new(json!({ "readings": readings })))
    }
}

/// Averages readings and flags anything above the configured threshold.
struct Scorer;

#[async_trait]
impl Plugin for Scorer {
    async fn execute(
        &self,
        input: &Value,
        _context: &ExecutionContext,
        config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        let threshold = config.get("threshold").and_then(Value::as_f64).unwrap_or(1.0);
        let readings: Vec<f64> = input["readings"]
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        if readings.is_empty() {
            return Ok(PluginOutput::empty().with_warning("no readings"));
        }

        let score = readings.iter().sum::<f64>() / readings.len() as f64;
        let mut output = PluginOutput::new(json!({ "score": score }));
        if score > threshold {
            output = output.with_warning(format!("score {score:.2} above {threshold}"));
        }
        Ok(output)
    }
}

/// Passes the previous stage through, tagged with the run mode.
struct Forward;

#[async_trait]
impl Plugin for Forward {
    async fn execute(
        &self,
        input: &Value,
        context: &ExecutionContext,
        _config: &Value,
    ) -> anyhow::Result<PluginOutput> {
        Ok(PluginOutput::new(json!({ "mode": context.mode.as_str(), "input": input })))
    }
}

fn plugin(id: &str, stage: &str, handler: Arc<dyn Plugin>) -> anyhow::Result<PluginDefinition> {
    Ok(PluginDefinition::new(PluginId::new(id)?, handler).with_stage(Stage::new(stage)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Horizon Pipeline Basic Example ===\n");

    let engine = Arc::new(
        EngineBuilder::new(EngineConfig::from_env())
            .with_template(pipeline_template())
            .build()?,
    );
    engine.start();
    let mut events = engine.subscribe().expect("engine owns its bus");

    println!("1. Registering plugins...");
    engine.register_all([
        plugin("sensor", "ingest", Arc::new(Sensor))?,
        plugin("scorer", "synthesize", Arc::new(Scorer))?
            .depends_on(PluginId::new("sensor")?)
            .with_config(json!({ "threshold": 0.8 }))
            .with_timeout(Duration::from_secs(2)),
        plugin("simulator", "simulate", Arc::new(Forward))?,
        plugin("actuator", "actuate", Arc::new(Forward))?,
    ])?;
    for summary in engine.plugins() {
        println!("   {} stages={:?} deps={:?}", summary.id, summary.stages, summary.dependencies);
    }

    println!("\n2. Running inside a session...");
    let monitor = SessionMonitor::new(Arc::clone(&engine));
    let alice = SessionIdentity::new(TenantId::new("acme")?, WorkspaceId::new("ops")?, "alice");
    monitor.open_session(alice.clone(), "pipeline")?;

    for readings in [json!([0.2, 0.4]), json!([0.9, 1.1])] {
        let output = monitor
            .run(
                &alice,
                SessionRunOptions::default(),
                json!({ "readings": readings }),
            )
            .await?;
        println!("   run {} -> {}", output.run_id, output.status);
        for line in &output.diagnostics {
            println!("      {line}");
        }
    }

    println!("\n3. Dry run over a partial route...");
    let output = engine
        .execute(
            RunRequest::new("acme", "ops", "alice")
                .with_phases(["ingest", "synthesize"])
                .with_mode(RunMode::DryRun)
                .with_payload(json!({ "readings": [0.1] })),
        )
        .await?;
    println!("   run {} -> {} ({} stages)", output.run_id, output.status, output.report.stage_count);

    println!("\n4. A failing simulate stage...");
    let faulty = EngineBuilder::default()
        .with_template(pipeline_template())
        .build()?;
    faulty.register_all([
        plugin("sensor", "ingest", Arc::new(Sensor))?,
        plugin("simulator", "simulate", Arc::new(FailingPlugin::new("model diverged")))?,
    ])?;
    let output = faulty
        .execute(
            RunRequest::new("acme", "ops", "bob")
                .with_phases(["ingest", "simulate"])
                .with_payload(json!({ "readings": [0.3] })),
        )
        .await?;
    println!(
        "   run {} -> {} error={}",
        output.run_id,
        output.status,
        output.error.as_deref().unwrap_or("-")
    );

    println!("\n5. Querying...");
    let runs = engine
        .list_runs(&RunQuery::default().workspace(WorkspaceId::new("ops")?))
        .await?;
    for record in &runs {
        println!(
            "   {} status={} risk={:.2} warnings={}",
            record.run_id,
            record.status,
            record.risk_score,
            record.warnings.len()
        );
    }
    let session_runs = monitor.timeline(&alice).await?;
    println!("   session runs: {}", session_runs.len());

    let mut received = 0;
    while events.try_recv().is_ok() {
        received += 1;
    }
    println!("   events received: {received}");

    engine.shutdown().await?;
    let snapshots = engine
        .query_timeline(&TimelineFilter::workspace(WorkspaceId::new("ops")?))
        .await?;
    println!("   snapshots retained: {}", snapshots.len());

    println!("\n=== Example completed ===");
    Ok(())
}
