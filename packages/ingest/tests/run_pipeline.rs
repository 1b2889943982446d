//! End-to-end orchestrator runs against the mock query source.

use chrono::{Duration, TimeZone, Utc};
use ingest::pipeline::Extractor;
use ingest::testing::{MockCall, MockQuerySource, MockResponse};
use ingest::{
    EntityConfig, EntityStatus, ExtractSettings, LoadMode, MemorySink, MemoryWatermarks,
    RunContext, Watermark, WatermarkCommit, WatermarkStore, WatermarkUpdate, WatermarkValue,
};
use navu_client::Row;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn rows(values: Vec<serde_json::Value>) -> Vec<Row> {
    values
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
}

fn ts(d: u32) -> WatermarkValue {
    WatermarkValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap())
}

fn seeded(entity: &str, value: WatermarkValue) -> MemoryWatermarks {
    MemoryWatermarks::new().with_watermark(Watermark {
        source_system: "NAVUSOFT".into(),
        entity_name: entity.into(),
        incremental_field: "updated_at".into(),
        last_value: value,
        updated_at: Utc.with_ymd_and_hms(2024, 1, 10, 1, 0, 0).unwrap(),
    })
}

fn orders() -> EntityConfig {
    EntityConfig::new("orders")
        .with_columns(["id", "updated_at"])
        .with_incremental_field("updated_at")
}

fn order_rows() -> Vec<Row> {
    rows(vec![
        json!({"id": 1, "updated_at": "2024-01-09T00:00:00Z"}),
        json!({"id": 2, "updated_at": "2024-01-11T00:00:00Z"}),
        json!({"id": 3, "updated_at": null}),
    ])
}

fn extractor(
    source: MockQuerySource,
    watermarks: MemoryWatermarks,
    sink: MemorySink,
    dir: &Path,
    settings: ExtractSettings,
    run: RunContext,
) -> Extractor<MockQuerySource, MemoryWatermarks, MemorySink> {
    Extractor::new(source, watermarks, sink, dir, settings, run)
}

fn overlap_run(force: bool) -> RunContext {
    RunContext::new(force, Some(Duration::days(2)))
}

#[tokio::test]
async fn test_first_run_is_full_and_records_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new().with_rows("orders", order_rows());
    let ex = extractor(
        source,
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex.run(&[orders()]).await.unwrap();
    let outcome = summary.outcome("orders").unwrap();

    assert_eq!(outcome.mode, Some(LoadMode::Full));
    assert_eq!(outcome.watermark_used, None);
    assert_eq!(outcome.rows_fetched, 3);
    assert_eq!(outcome.rows_staged, 3);
    assert_eq!(outcome.watermark, WatermarkUpdate::Advanced(ts(11)));
    assert!(matches!(outcome.status, EntityStatus::Loaded(_)));

    // No filter on a full load
    assert_eq!(ex.source().filters_for("orders"), vec![None::<String>]);

    let loaded = ex.sink().rows_for("orders");
    assert_eq!(loaded.len(), 3);
    assert!(loaded.iter().all(|r| r.load_mode == LoadMode::Full));

    let stored = ex.watermarks().get("NAVUSOFT", "orders").await.unwrap().unwrap();
    assert_eq!(stored.last_value, ts(11));

    let staged = std::fs::read_to_string(dir.path().join("orders.json")).unwrap();
    assert!(staged.lines().all(|l| l.contains("\"_load_mode\":\"FULL\"")));
    assert!(dir.path().join("manifest.json").exists());
}

#[tokio::test]
async fn test_incremental_run_uses_soft_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new().with_rows("orders", order_rows());
    let ex = extractor(
        source,
        seeded("orders", ts(10)),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex.run(&[orders()]).await.unwrap();
    let outcome = summary.outcome("orders").unwrap();

    assert_eq!(outcome.mode, Some(LoadMode::IncrementalSoft));
    assert_eq!(outcome.watermark_used, Some(ts(8)));
    assert_eq!(
        ex.source().filters_for("orders"),
        vec![Some("updated_at >= '2024-01-08T00:00:00Z'".to_string())]
    );
    assert!(ex
        .sink()
        .rows_for("orders")
        .iter()
        .all(|r| r.load_mode == LoadMode::IncrementalSoft));
    assert_eq!(outcome.watermark, WatermarkUpdate::Advanced(ts(11)));
    assert!(outcome
        .to_string()
        .contains("mode=INCREMENTAL_SOFT watermark_used=2024-01-08T00:00:00Z fetched=3 staged=3 watermark_updated=yes"));
}

#[tokio::test]
async fn test_rows_older_than_stored_watermark_do_not_regress_it() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new().with_rows(
        "orders",
        rows(vec![json!({"id": 1, "updated_at": "2024-01-09T00:00:00Z"})]),
    );
    let ex = extractor(
        source,
        seeded("orders", ts(10)),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex.run(&[orders()]).await.unwrap();
    assert_eq!(
        summary.outcome("orders").unwrap().watermark,
        WatermarkUpdate::Unchanged(ts(9))
    );

    let stored = ex.watermarks().get("NAVUSOFT", "orders").await.unwrap().unwrap();
    assert_eq!(stored.last_value, ts(10));
    assert_eq!(stored.updated_at, Utc.with_ymd_and_hms(2024, 1, 10, 1, 0, 0).unwrap());
}

#[tokio::test]
async fn test_zero_rows_skips_entity_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new()
        .with_rows("orders", vec![])
        .with_rows("sites", rows(vec![json!({"id": 7})]));
    let ex = extractor(
        source,
        seeded("orders", ts(10)),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex
        .run(&[orders(), EntityConfig::new("sites")])
        .await
        .unwrap();

    let skipped = summary.outcome("orders").unwrap();
    assert_eq!(skipped.status, EntityStatus::Skipped);
    assert_eq!(skipped.watermark, WatermarkUpdate::NotAttempted);
    assert!(skipped.artifact.is_none());
    assert!(!dir.path().join("orders.json").exists());

    let stored = ex.watermarks().get("NAVUSOFT", "orders").await.unwrap().unwrap();
    assert_eq!(stored.last_value, ts(10));

    assert!(matches!(
        summary.outcome("sites").unwrap().status,
        EntityStatus::Loaded(_)
    ));
    assert_eq!(ex.sink().load_order(), vec!["sites"]);
    assert!(summary.is_success());
}

#[tokio::test]
async fn test_http_error_fails_entity_but_not_run() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new()
        .with_rows("orders", order_rows())
        .with_status("sites", 401)
        .with_rows("routes", rows(vec![json!({"id": 1})]));
    let ex = extractor(
        source,
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let sites = EntityConfig::new("sites").with_incremental_field("updated_at");
    let summary = ex
        .run(&[orders(), sites, EntityConfig::new("routes")])
        .await
        .unwrap();

    assert_eq!(summary.failed_entities(), vec!["sites"]);
    assert!(summary.to_string().contains("1 failed: sites"));
    assert!(matches!(
        summary.outcome("sites").unwrap().status,
        EntityStatus::Failed(_)
    ));

    // 4xx is not retried
    assert_eq!(ex.source().fetch_attempts("sites"), 1);
    assert!(ex.watermarks().get("NAVUSOFT", "sites").await.unwrap().is_none());
    assert_eq!(ex.sink().load_order(), vec!["orders", "routes"]);
}

#[tokio::test]
async fn test_read_timeouts_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new()
        .with_responses(
            "orders",
            vec![
                MockResponse::Timeout,
                MockResponse::Timeout,
                MockResponse::Rows(order_rows()),
            ],
        )
        .with_responses("sites", vec![MockResponse::Timeout]);
    let ex = extractor(
        source,
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default().with_retries(3),
        overlap_run(false),
    );

    let summary = ex
        .run(&[orders(), EntityConfig::new("sites")])
        .await
        .unwrap();

    assert_eq!(ex.source().fetch_attempts("orders"), 3);
    assert_eq!(summary.outcome("orders").unwrap().rows_fetched, 3);

    assert_eq!(ex.source().fetch_attempts("sites"), 3);
    match &summary.outcome("sites").unwrap().status {
        EntityStatus::Failed(reason) => assert!(reason.contains("after 3 attempt")),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_full_reload_ignores_watermark_and_replaces_rows() {
    let watermarks = Arc::new(seeded("orders", ts(10)));
    let sink = Arc::new(MemorySink::new());

    // First run appends three rows and advances to the 11th
    let dir = tempfile::tempdir().unwrap();
    let first = Extractor::new(
        MockQuerySource::new().with_rows("orders", order_rows()),
        watermarks.clone(),
        sink.clone(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false).with_started_at(Utc.with_ymd_and_hms(2024, 1, 12, 0, 0, 0).unwrap()),
    );
    first.run(&[orders()]).await.unwrap();
    assert_eq!(sink.rows_for("orders").len(), 3);

    // Forced reload returns a single older row
    let reload_dir = tempfile::tempdir().unwrap();
    let second = Extractor::new(
        MockQuerySource::new().with_rows(
            "orders",
            rows(vec![json!({"id": 1, "updated_at": "2024-01-09T00:00:00Z"})]),
        ),
        watermarks.clone(),
        sink.clone(),
        reload_dir.path(),
        ExtractSettings::default(),
        overlap_run(true),
    );

    let summary = second.run(&[orders()]).await.unwrap();
    let outcome = summary.outcome("orders").unwrap();
    assert_eq!(outcome.mode, Some(LoadMode::Full));
    assert_eq!(outcome.watermark_used, None);
    assert_eq!(second.source().filters_for("orders"), vec![None::<String>]);
    assert_eq!(sink.rows_for("orders").len(), 1);

    // A lower observed max never regresses the stored watermark
    let stored = watermarks.get("NAVUSOFT", "orders").await.unwrap().unwrap();
    assert_eq!(stored.last_value, ts(11));
}

#[tokio::test]
async fn test_after_load_commit_waits_for_sink() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new()
        .with_rows("orders", order_rows())
        .with_rows(
            "workorders",
            rows(vec![json!({"id": 41, "workordernumber": 41}), json!({"id": 42, "workordernumber": 42})]),
        );
    let ex = extractor(
        source,
        MemoryWatermarks::new(),
        MemorySink::new().failing_for("orders"),
        dir.path(),
        ExtractSettings::default().with_commit(WatermarkCommit::AfterLoad),
        overlap_run(false),
    );

    let workorders = EntityConfig::new("workorders").with_incremental_field("workordernumber");
    let summary = ex.run(&[orders(), workorders]).await.unwrap();

    let failed = summary.outcome("orders").unwrap();
    assert!(matches!(failed.status, EntityStatus::LoadFailed(_)));
    assert_eq!(failed.watermark, WatermarkUpdate::Deferred(ts(11)));
    assert!(ex.watermarks().get("NAVUSOFT", "orders").await.unwrap().is_none());

    let loaded = summary.outcome("workorders").unwrap();
    assert_eq!(loaded.watermark, WatermarkUpdate::Advanced(WatermarkValue::Integer(42)));
    let stored = ex.watermarks().get("NAVUSOFT", "workorders").await.unwrap().unwrap();
    assert_eq!(stored.last_value, WatermarkValue::Integer(42));

    assert_eq!(summary.failed_entities(), vec!["orders"]);
}

#[tokio::test]
async fn test_after_staging_commit_survives_load_failure() {
    let dir = tempfile::tempdir().unwrap();
    let ex = extractor(
        MockQuerySource::new().with_rows("orders", order_rows()),
        MemoryWatermarks::new(),
        MemorySink::new().failing_for("orders"),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex.run(&[orders()]).await.unwrap();

    assert!(matches!(
        summary.outcome("orders").unwrap().status,
        EntityStatus::LoadFailed(_)
    ));
    let stored = ex.watermarks().get("NAVUSOFT", "orders").await.unwrap().unwrap();
    assert_eq!(stored.last_value, ts(11));
}

#[tokio::test]
async fn test_all_null_incremental_values_leave_watermark_alone() {
    let dir = tempfile::tempdir().unwrap();
    let ex = extractor(
        MockQuerySource::new().with_rows(
            "orders",
            rows(vec![json!({"id": 1, "updated_at": null}), json!({"id": 2})]),
        ),
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex.run(&[orders()]).await.unwrap();
    let outcome = summary.outcome("orders").unwrap();

    assert_eq!(outcome.watermark, WatermarkUpdate::NoValues);
    assert!(matches!(outcome.status, EntityStatus::Loaded(_)));
    assert!(ex.watermarks().is_empty());
}

#[tokio::test]
async fn test_remote_columns_and_metadata_failures() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new()
        .with_entity("v_query_workorder", ["workordernumber", "site_id"])
        .with_entity("v_query_empty", Vec::<String>::new())
        .with_rows("v_query_workorder", rows(vec![json!({"workordernumber": 1})]));
    let ex = extractor(
        source,
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let entities = [
        EntityConfig::new("v_query_missing").with_columns(Vec::<String>::new()),
        EntityConfig::new("v_query_empty").remote_columns(),
        EntityConfig::new("v_query_workorder").remote_columns(),
    ];
    let summary = ex.run(&entities).await.unwrap();

    assert_eq!(
        summary.failed_entities(),
        vec!["v_query_missing", "v_query_empty"]
    );
    match &summary.outcome("v_query_missing").unwrap().status {
        EntityStatus::Failed(reason) => assert!(reason.contains("not found")),
        other => panic!("expected failure, got {:?}", other),
    }

    let fetch = ex
        .source()
        .calls()
        .into_iter()
        .find(|c| matches!(c, MockCall::Fetch { .. }))
        .unwrap();
    assert_eq!(
        fetch,
        MockCall::Fetch {
            entity: "v_query_workorder".into(),
            columns: vec!["workordernumber".into(), "site_id".into()],
            filter: None,
            attempt: 1,
        }
    );
}

#[tokio::test]
async fn test_concurrent_run_keeps_entity_order() {
    let dir = tempfile::tempdir().unwrap();
    let names = ["a", "b", "c", "d", "e"];
    let source = names.iter().fold(MockQuerySource::new(), |source, name| {
        source.with_rows(*name, rows(vec![json!({"id": 1})]))
    });
    let ex = extractor(
        source,
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default().with_concurrency(3),
        overlap_run(false),
    );

    let entities: Vec<_> = names.iter().map(|n| EntityConfig::new(*n)).collect();
    let summary = ex.run(&entities).await.unwrap();

    let order: Vec<_> = summary.outcomes.iter().map(|o| o.entity.as_str()).collect();
    assert_eq!(order, names);
    assert_eq!(ex.sink().load_order(), names);

    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(summary.manifest.as_ref().unwrap()).unwrap(),
    )
    .unwrap();
    let listed: Vec<_> = manifest["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["entity"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(listed, names);
}

fn notes() -> EntityConfig {
    EntityConfig::new("notes")
        .with_columns(["id", "code"])
        .with_incremental_field("code")
}

#[tokio::test]
async fn test_unusable_stored_watermark_fails_only_its_entity() {
    let dir = tempfile::tempdir().unwrap();
    let watermarks = MemoryWatermarks::new().with_watermark(Watermark {
        source_system: "NAVUSOFT".into(),
        entity_name: "notes".into(),
        incremental_field: "code".into(),
        last_value: WatermarkValue::Text("zz\nline".into()),
        updated_at: Utc.with_ymd_and_hms(2024, 1, 10, 1, 0, 0).unwrap(),
    });
    let source = MockQuerySource::new()
        .with_rows("notes", rows(vec![json!({"id": 1, "code": "aa"})]))
        .with_rows("sites", rows(vec![json!({"id": 7})]));
    let ex = extractor(
        source,
        watermarks,
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex
        .run(&[notes(), EntityConfig::new("sites")])
        .await
        .unwrap();

    match &summary.outcome("notes").unwrap().status {
        EntityStatus::Failed(reason) => assert!(reason.contains("cannot plan 'notes'")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(ex.source().fetch_attempts("notes"), 0);
    assert_eq!(summary.failed_entities(), vec!["notes"]);
    assert_eq!(ex.sink().load_order(), vec!["sites"]);
}

#[tokio::test]
async fn test_control_characters_are_never_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let ex = extractor(
        MockQuerySource::new().with_rows("notes", rows(vec![json!({"id": 1, "code": "zz\nline"})])),
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex.run(&[notes()]).await.unwrap();
    let outcome = summary.outcome("notes").unwrap();

    assert_eq!(outcome.watermark, WatermarkUpdate::NoValues);
    assert_eq!(outcome.values_ignored, 1);
    assert!(matches!(outcome.status, EntityStatus::Loaded(_)));
    assert!(ex.watermarks().is_empty());
}

#[tokio::test]
async fn test_stray_text_value_does_not_decide_watermark_kind() {
    let dir = tempfile::tempdir().unwrap();
    let ex = extractor(
        MockQuerySource::new().with_rows(
            "orders",
            rows(vec![
                json!({"id": 1, "updated_at": "N/A"}),
                json!({"id": 2, "updated_at": "2024-01-09T00:00:00Z"}),
                json!({"id": 3, "updated_at": "2024-01-11T00:00:00Z"}),
            ]),
        ),
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let summary = ex.run(&[orders()]).await.unwrap();
    let outcome = summary.outcome("orders").unwrap();

    assert_eq!(outcome.watermark, WatermarkUpdate::Advanced(ts(11)));
    assert_eq!(outcome.values_ignored, 1);
    assert!(outcome.to_string().ends_with("watermark_updated=yes ignored_values=1"));

    let stored = ex.watermarks().get("NAVUSOFT", "orders").await.unwrap().unwrap();
    assert_eq!(stored.last_value, ts(11));
}

#[tokio::test]
async fn test_colliding_artifact_names_fail_the_later_entity() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockQuerySource::new()
        .with_rows("a b", rows(vec![json!({"id": 10})]))
        .with_rows("a_b", rows(vec![json!({"id": 20})]));
    let ex = extractor(
        source,
        MemoryWatermarks::new(),
        MemorySink::new(),
        dir.path(),
        ExtractSettings::default(),
        overlap_run(false),
    );

    let entities = [
        EntityConfig::new("a b").with_incremental_field("id"),
        EntityConfig::new("a_b").with_incremental_field("id"),
    ];
    let summary = ex.run(&entities).await.unwrap();

    let first = summary.outcome("a b").unwrap();
    match &first.status {
        EntityStatus::Loaded(report) => {
            assert_eq!(report.loaded, 1);
            assert_eq!(report.rejected, 0);
        }
        other => panic!("expected load, got {:?}", other),
    }
    assert_eq!(ex.sink().rows_for("a b").len(), 1);
    assert_eq!(
        ex.watermarks().get("NAVUSOFT", "a b").await.unwrap().unwrap().last_value,
        WatermarkValue::Integer(10)
    );

    let second = summary.outcome("a_b").unwrap();
    assert!(matches!(second.status, EntityStatus::Failed(_)));
    assert!(second.artifact.is_none());
    assert!(ex.watermarks().get("NAVUSOFT", "a_b").await.unwrap().is_none());
    assert!(ex.sink().rows_for("a_b").is_empty());
}
