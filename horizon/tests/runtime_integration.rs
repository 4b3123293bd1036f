//! Runtime integration tests for horizon pipeline execution.
//!
//! Covers full and partial routes, stage failure, timeouts, deadlines,
//! degraded outcomes, store failures, event emission and concurrent runs.

use std::sync::Arc;
use std::time::Duration;

use horizon::*;
use horizon_testkit::{
    definition, echo_pipeline, init_tracing, pipeline_template, CancelAwarePlugin, EchoPlugin,
    FailingPlugin, FailingStore, SilentPlugin, SlowPlugin, WarningPlugin,
};
use serde_json::json;
use tokio::time::timeout;

fn engine() -> Engine {
    EngineBuilder::default()
        .with_template(pipeline_template())
        .build()
        .expect("engine builds")
}

fn engine_with_store(store: &FailingStore) -> Engine {
    EngineBuilder::default()
        .with_template(pipeline_template())
        .with_store(Arc::new(store.clone()))
        .build()
        .expect("engine builds")
}

fn request() -> RunRequest {
    RunRequest::new("acme", "ops", "alice").with_payload(json!({"signal": 0.7}))
}

fn stages(output: &RunOutput) -> Vec<&str> {
    output.timeline.iter().map(|e| e.stage.as_str()).collect()
}

fn id(value: &str) -> PluginId {
    PluginId::new(value).unwrap()
}

#[tokio::test]
async fn full_route_succeeds() {
    init_tracing();
    let engine = engine();
    engine.register_all(echo_pipeline()).unwrap();

    let output = engine.execute(request()).await.unwrap();

    assert_eq!(output.status, RunStatus::Succeeded);
    assert_eq!(stages(&output), ["ingest", "synthesize", "simulate", "actuate"]);
    assert_eq!(output.diagnostics.len(), 4);
    assert!(output.diagnostics[0].starts_with("stage=ingest|plugins=ingest-echo|outputs=1|"));
    assert_eq!(output.report.stage_count, 4);
    assert_eq!(output.report.plugin_count, 4);
    assert!(output.error.is_none());

    // Every stage echoes, so the payload survives the whole route.
    let record = engine.get_run(output.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.snapshot, json!({"signal": 0.7}));
    assert_eq!(record.risk_score, 0.0);
    assert_eq!(engine.stage_events(output.run_id).await.unwrap(), output.timeline);
}

#[tokio::test]
async fn partial_route_never_plans_excluded_stage() {
    let engine = engine();
    engine.register_all(echo_pipeline()).unwrap();
    let request = request().with_phases(["ingest", "synthesize", "simulate"]);

    let plan = engine.plan(&request).unwrap();
    assert!(plan.route().iter().all(|s| s.as_str() != "actuate"));
    assert!(plan
        .plugins()
        .iter()
        .all(|p| p.id.as_str() != "actuate-echo"));

    let output = engine.execute(request).await.unwrap();
    assert_eq!(output.status, RunStatus::Succeeded);
    assert_eq!(stages(&output), ["ingest", "synthesize", "simulate"]);
    assert_eq!(output.report.plugin_count, 3);
}

#[tokio::test]
async fn failing_stage_keeps_completed_timeline() {
    let engine = engine();
    let failing = FailingPlugin::new("model diverged");
    engine
        .register_all([
            definition("loader", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("writer", &["synthesize"], Arc::new(EchoPlugin::new())),
            definition("model", &["simulate"], Arc::new(failing.clone())),
            definition("actor", &["actuate"], Arc::new(EchoPlugin::new())),
        ])
        .unwrap();

    let output = engine.execute(request()).await.unwrap();

    assert!(output.is_failed());
    assert_eq!(stages(&output), ["ingest", "synthesize"]);
    assert!(output.error.as_deref().unwrap().contains("model diverged"));
    assert!(output
        .diagnostics
        .last()
        .unwrap()
        .starts_with("failed stage=simulate|error="));
    failing.log().assert_call_count_eq(1);

    let record = engine.get_run(output.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.risk_score, 1.0);
    assert_eq!(engine.stage_events(output.run_id).await.unwrap().len(), 2);

    let buckets = engine.summarize(output.run_id).await.unwrap();
    let simulate = buckets
        .iter()
        .find(|b| b.stage.as_ref().map(Stage::as_str) == Some("simulate"))
        .expect("failed stage is summarized");
    assert_eq!(simulate.count(PluginEvent::Failed), 1);
}

#[tokio::test]
async fn concurrent_runs_persist_independently() {
    let engine = Arc::new(engine());
    engine.register_all(echo_pipeline()).unwrap();

    let a = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute(RunRequest::new("acme", "ops", "alice").with_payload(json!("a")))
                .await
        })
    };
    let b = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute(RunRequest::new("globex", "lab", "bob").with_payload(json!("b")))
                .await
        })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_ne!(a.run_id, b.run_id);

    for (output, tenant, payload) in [(&a, "acme", json!("a")), (&b, "globex", json!("b"))] {
        let record = engine.get_run(output.run_id).await.unwrap().unwrap();
        assert_eq!(record.tenant_id.as_str(), tenant);
        assert_eq!(record.snapshot, payload);
        assert_eq!(engine.stage_events(output.run_id).await.unwrap().len(), 4);

        let listed = engine
            .list_runs(&RunQuery::default().tenant(TenantId::new(tenant).unwrap()))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_id, output.run_id);
    }
}

#[tokio::test]
async fn dependencies_run_before_dependents() {
    let engine = engine();
    engine
        .register(definition("enrich", &["ingest"], Arc::new(EchoPlugin::new())).depends_on(id("fetch")))
        .unwrap_err();
    engine
        .register_all([
            definition("enrich", &["ingest"], Arc::new(EchoPlugin::new())).depends_on(id("fetch")),
            definition("fetch", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("score", &["ingest"], Arc::new(EchoPlugin::new()))
                .depends_on(id("enrich"))
                .depends_on(id("fetch")),
        ])
        .unwrap();

    let plan = engine.plan(&request().with_phases(["ingest"])).unwrap();
    let order: Vec<&str> = plan.plugins().iter().map(|p| p.id.as_str()).collect();
    assert_eq!(order, ["fetch", "enrich", "score"]);

    let output = engine.execute(request().with_phases(["ingest"])).await.unwrap();
    assert_eq!(
        output.timeline[0].plugin_ids,
        vec![id("fetch"), id("enrich"), id("score")]
    );
}

#[tokio::test]
async fn plugin_filter_cannot_skip_a_dependency() {
    let engine = engine();
    let child = EchoPlugin::new();
    engine
        .register_all([
            definition("base", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("child", &["ingest"], Arc::new(child.clone())).depends_on(id("base")),
        ])
        .unwrap();

    let err = engine
        .execute(request().with_phases(["ingest"]).with_plugins(["child"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Config(ConfigError::MissingDependency { ref plugin, ref dependency })
            if plugin.as_str() == "child" && dependency.as_str() == "base"
    ));
    child.log().assert_call_count_eq(0);
    assert!(engine.list_runs(&RunQuery::default()).await.unwrap().is_empty());

    let output = engine
        .execute(request().with_phases(["ingest"]).with_plugins(["child", "base"]))
        .await
        .unwrap();
    assert_eq!(output.status, RunStatus::Succeeded);
    assert_eq!(output.timeline[0].plugin_ids, vec![id("base"), id("child")]);
}

#[tokio::test]
async fn duplicate_registration_leaves_registry_unchanged() {
    let engine = engine();
    engine.register_all(echo_pipeline()).unwrap();
    let before = engine.plugins();

    let err = engine
        .register(definition("ingest-echo", &["ingest"], Arc::new(SilentPlugin)))
        .unwrap_err();
    assert_eq!(err, ConfigError::DuplicatePlugin(id("ingest-echo")));

    let err = engine
        .register_all([
            definition("extra", &["ingest"], Arc::new(SilentPlugin)),
            definition("simulate-echo", &["simulate"], Arc::new(SilentPlugin)),
        ])
        .unwrap_err();
    assert_eq!(err, ConfigError::DuplicatePlugin(id("simulate-echo")));

    assert_eq!(engine.plugins(), before);
}

#[tokio::test]
async fn stage_without_plugins_touches_no_store() {
    let store = FailingStore::new();
    let engine = engine_with_store(&store);
    engine
        .register(definition("loader", &["ingest"], Arc::new(EchoPlugin::new())))
        .unwrap();

    let plan = Arc::new(
        engine
            .plan(&request().with_phases(["ingest", "simulate"]))
            .unwrap(),
    );
    let executor = StageExecutor::new(Arc::clone(&plan), Duration::from_secs(1));
    let stage = Stage::new("simulate").unwrap();

    let err = executor
        .execute_by_stage(&json!({"x": 1}), &stage)
        .await
        .unwrap_err();

    assert_eq!(err, ExecutionError::NoPluginForStage(stage.clone()));
    assert_eq!(executor.state(), ExecutorState::Failed(stage));
    assert_eq!(store.write_count(), 0);
    assert_eq!(store.inner().run_count(), 0);
}

#[tokio::test]
async fn missing_stage_plugin_fails_the_run() {
    let engine = engine();
    engine
        .register(definition("loader", &["ingest"], Arc::new(EchoPlugin::new())))
        .unwrap();

    let output = engine
        .execute(request().with_phases(["ingest", "simulate"]))
        .await
        .unwrap();

    assert!(output.is_failed());
    assert_eq!(stages(&output), ["ingest"]);
    assert_eq!(
        output.error.as_deref(),
        Some("no plugin registered for stage 'simulate'")
    );
}

#[tokio::test]
async fn list_runs_is_idempotent() {
    let engine = engine();
    engine.register_all(echo_pipeline()).unwrap();
    for _ in 0..3 {
        engine.execute(request()).await.unwrap();
    }

    let query = RunQuery::default().workspace(WorkspaceId::new("ops").unwrap());
    let first = engine.list_runs(&query).await.unwrap();
    let second = engine.list_runs(&query).await.unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert!(first
        .windows(2)
        .all(|pair| pair[0].updated_at >= pair[1].updated_at));

    let limited = engine.list_runs(&query.clone().limit(2)).await.unwrap();
    assert_eq!(limited, first[..2]);
}

#[tokio::test]
async fn plugin_timeout_fails_its_stage() {
    let engine = engine();
    engine
        .register_all([
            definition("loader", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("model", &["synthesize"], Arc::new(SlowPlugin::new(Duration::from_secs(5))))
                .with_timeout(Duration::from_millis(20)),
        ])
        .unwrap();

    let output = timeout(
        Duration::from_secs(2),
        engine.execute(request().with_phases(["ingest", "synthesize"])),
    )
    .await
    .expect("timeout is enforced")
    .unwrap();

    assert!(output.is_failed());
    assert_eq!(stages(&output), ["ingest"]);
    assert!(output.error.as_deref().unwrap().contains("timed out after 20 ms"));
}

#[tokio::test]
async fn run_deadline_cancels_in_flight_stage() {
    let engine = engine();
    let waiter = CancelAwarePlugin::new();
    engine
        .register_all([
            definition("loader", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("waiter", &["synthesize"], Arc::new(waiter.clone())),
        ])
        .unwrap();

    let output = timeout(
        Duration::from_secs(2),
        engine.execute(
            request()
                .with_phases(["ingest", "synthesize"])
                .with_timeout_ms(50),
        ),
    )
    .await
    .expect("deadline fires")
    .unwrap();

    assert!(waiter.started());
    assert!(output.is_failed());
    assert_eq!(stages(&output), ["ingest"]);
    assert_eq!(
        output.error.as_deref(),
        Some("run cancelled during stage 'synthesize'")
    );
    assert!(engine.active_runs().is_empty());
}

#[tokio::test]
async fn warnings_and_empty_outputs_degrade_the_run() {
    let engine = engine();
    engine
        .register_all([
            definition("loader", &["ingest"], Arc::new(WarningPlugin::new("sensor offline"))),
            definition("writer", &["synthesize"], Arc::new(EchoPlugin::new())),
        ])
        .unwrap();

    let output = engine
        .execute(request().with_phases(["ingest", "synthesize"]))
        .await
        .unwrap();
    assert_eq!(output.status, RunStatus::Degraded);
    assert_eq!(output.timeline[0].warnings, vec!["loader: sensor offline"]);
    assert!(!output.timeline[1].is_degraded());

    let record = engine.get_run(output.run_id).await.unwrap().unwrap();
    assert_eq!(record.risk_score, 0.5);
    assert_eq!(record.warnings, vec!["loader: sensor offline"]);

    engine
        .register(definition("quiet", &["simulate"], Arc::new(SilentPlugin)))
        .unwrap();
    let output = engine
        .execute(request().with_phases(["simulate"]))
        .await
        .unwrap();
    assert_eq!(output.status, RunStatus::Degraded);
    assert!(!output.timeline[0].signal);
    assert!(engine.list_artifacts(output.run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn parallel_stage_merges_outputs_by_plugin() {
    let engine = engine();
    engine
        .register_all([
            definition("left", &["ingest"], Arc::new(SlowPlugin::new(Duration::from_millis(20)))),
            definition("right", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("join", &["ingest"], Arc::new(EchoPlugin::new()))
                .depends_on(id("left"))
                .depends_on(id("right")),
        ])
        .unwrap();

    let output = engine
        .execute(request().with_phases(["ingest"]).parallel(true))
        .await
        .unwrap();

    assert_eq!(output.status, RunStatus::Succeeded);
    let merged = &output.timeline[0].output;
    for plugin in ["left", "right", "join"] {
        assert_eq!(merged[plugin], json!({"signal": 0.7}));
    }
    assert_eq!(engine.list_artifacts(output.run_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn multi_stage_plugin_keeps_registration_order() {
    let engine = engine();
    let shared = EchoPlugin::new();
    engine
        .register(definition("ingest-only", &["ingest"], Arc::new(EchoPlugin::new())))
        .unwrap();
    engine
        .register(definition("sim-first", &["simulate"], Arc::new(EchoPlugin::new())))
        .unwrap();
    engine
        .register(definition("multi-later", &["ingest", "simulate"], Arc::new(shared.clone())))
        .unwrap();

    for parallel in [false, true] {
        let output = engine
            .execute(request().with_phases(["ingest", "simulate"]).parallel(parallel))
            .await
            .unwrap();

        assert_eq!(output.status, RunStatus::Succeeded);
        assert_eq!(
            output.timeline[0].plugin_ids,
            vec![id("ingest-only"), id("multi-later")]
        );
        assert_eq!(
            output.timeline[1].plugin_ids,
            vec![id("sim-first"), id("multi-later")]
        );
    }
    // Once per stage it serves, per run.
    shared.log().assert_call_count_eq(4);
}

#[tokio::test]
async fn parallel_failure_keeps_sibling_records() {
    let engine = engine();
    engine
        .register_all([
            definition("fast-ok", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("slow", &["ingest"], Arc::new(SlowPlugin::new(Duration::from_millis(300)))),
            definition("boom", &["ingest"], Arc::new(FailingPlugin::new("boom"))),
        ])
        .unwrap();

    let sequential = engine
        .execute(request().with_phases(["ingest"]))
        .await
        .unwrap();
    assert!(sequential.is_failed());
    let buckets = engine.summarize(sequential.run_id).await.unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].count(PluginEvent::Started), 3);
    assert_eq!(buckets[0].count(PluginEvent::Completed), 2);
    assert_eq!(buckets[0].count(PluginEvent::Failed), 1);
    assert_eq!(engine.list_artifacts(sequential.run_id).await.unwrap().len(), 2);

    // The slow sibling is still running when boom fails, so it is dropped
    // and recorded as cancelled instead of vanishing from the audit trail.
    let parallel = engine
        .execute(request().with_phases(["ingest"]).parallel(true))
        .await
        .unwrap();
    assert!(parallel.is_failed());
    let buckets = engine.summarize(parallel.run_id).await.unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].count(PluginEvent::Started), 3);
    assert_eq!(buckets[0].count(PluginEvent::Completed), 1);
    assert_eq!(buckets[0].count(PluginEvent::Failed), 1);
    assert_eq!(buckets[0].count(PluginEvent::Cancelled), 1);
    let artifacts = engine.list_artifacts(parallel.run_id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].plugin_id, id("fast-ok"));
}

#[tokio::test]
async fn stage_output_feeds_next_stage() {
    let engine = engine();
    let second = EchoPlugin::new();
    engine
        .register_all([
            definition("a", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("b", &["ingest"], Arc::new(EchoPlugin::new())),
            definition("next", &["synthesize"], Arc::new(second.clone())),
        ])
        .unwrap();

    engine
        .execute(request().with_phases(["ingest", "synthesize"]))
        .await
        .unwrap();

    let calls = second.log().calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].input,
        json!({"a": {"signal": 0.7}, "b": {"signal": 0.7}})
    );
}

#[tokio::test]
async fn rejected_save_is_an_error() {
    let store = FailingStore::new();
    let engine = engine_with_store(&store);
    engine.register_all(echo_pipeline()).unwrap();

    store.fail_saves_after(0);
    let err = engine.execute(request()).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::Backend(_))));

    // Queued and running saves go through; the final one is rejected.
    store.fail_saves_after(2);
    let err = engine.execute(request()).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(store.stage_event_count(), 4);

    store.heal();
    let output = engine.execute(request()).await.unwrap();
    assert_eq!(output.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn run_emits_lifecycle_events() {
    let engine = engine();
    engine.register_all(echo_pipeline()).unwrap();
    let mut rx = engine.subscribe().expect("engine owns its bus");

    let output = engine.execute(request()).await.unwrap();
    let correlation_id = engine.correlation_of(output.run_id).await.unwrap().unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.meta.run_id, output.run_id);
        assert_eq!(event.meta.correlation_id, correlation_id);
        kinds.push(match event.payload {
            RunEventPayload::Queued { .. } => "queued",
            RunEventPayload::StageStarted { .. } => "started",
            RunEventPayload::StageCompleted { .. } => "completed",
            RunEventPayload::StageFailed { .. } => "failed",
            RunEventPayload::Finished { status, .. } => {
                assert_eq!(status, RunStatus::Succeeded);
                "finished"
            }
            _ => "other",
        });
    }

    let mut expected = vec!["queued"];
    for _ in 0..4 {
        expected.extend(["started", "completed"]);
    }
    expected.push("finished");
    assert_eq!(kinds, expected);
}

#[tokio::test]
async fn logs_and_timeline_are_queryable() {
    let engine = engine();
    engine.register_all(echo_pipeline()).unwrap();

    let output = engine.execute(request()).await.unwrap();

    let logs = engine.list_logs(output.run_id, 2).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs[0].line.starts_with("stage=simulate|"));
    assert!(logs[1].line.starts_with("stage=actuate|"));

    let snapshots = engine
        .query_timeline(&TimelineFilter::workspace(WorkspaceId::new("ops").unwrap()))
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 8);
    assert!(snapshots.iter().all(|s| s.run_id == output.run_id));

    let other = engine
        .query_timeline(&TimelineFilter::workspace(WorkspaceId::new("lab").unwrap()))
        .await
        .unwrap();
    assert!(other.is_empty());

    engine.store().clear().await.unwrap();
    assert!(engine.get_run(output.run_id).await.unwrap().is_none());
}
