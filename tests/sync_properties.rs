// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end properties of a sync run against the in-memory store.
//!
//! Every test drives [`SyncOrchestrator`] (or the fetch loop directly) with a
//! scripted source, so the assertions cover the real checkpoint, windowing,
//! retry and write path without network access.
//!
//! Run with: `cargo test --test sync_properties`

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{fast_config, series, stream, ts, Fault, ScriptedAdapter, SOURCE};
use telemetry_sync::{
    Credential, FailureStage, InMemoryStore, MetadataCatalog, Record, RetryPolicy, SourceAdapter, StoreWriter, StreamDescriptor,
    StreamStatus, SyncConfig, SyncError, SyncOrchestrator, TimeSeriesStore, WindowedFetchLoop,
};

fn micros(n: i64) -> chrono::Duration {
    chrono::Duration::microseconds(n)
}

/// One stream "s": a reading every 10 s over [0, 1000), last one at 990.
fn hundred_readings() -> ScriptedAdapter {
    ScriptedAdapter::new().with_stream(stream("s", 0, 990), series(0, 1000, 10))
}

fn orchestrator(store: &Arc<InMemoryStore>) -> SyncOrchestrator {
    SyncOrchestrator::new(fast_config(), store.clone())
}

// =============================================================================
// Windowing and checkpoints
// =============================================================================

#[tokio::test]
async fn test_first_run_downloads_everything_in_contiguous_windows() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = Arc::new(hundred_readings());

    let summaries = orchestrator(&store).sync_all(adapter.clone()).await.unwrap();

    assert_eq!(summaries.len(), 1);
    let s = &summaries[0];
    assert_eq!(s.status, StreamStatus::Complete);
    assert_eq!(s.source, SOURCE);
    assert_eq!(s.windows_total, 4);
    assert_eq!(s.windows_succeeded, 4);
    assert_eq!(s.rows_written, 100);
    assert_eq!(s.last_written, Some(ts(990)));
    assert_eq!(store.len("s"), 100);

    let windows = adapter.windows_for("s");
    assert_eq!(windows.len(), 4);
    assert_eq!(windows[0].from, ts(0));
    for pair in windows.windows(2) {
        assert_eq!(pair[0].to, pair[1].from, "windows must not leave gaps");
    }
    // The vendor's newest reading falls inside the last window
    assert_eq!(windows[3].to, ts(990) + micros(1));
}

#[tokio::test]
async fn test_caught_up_stream_is_a_noop() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = Arc::new(hundred_readings());
    let orchestrator = orchestrator(&store);

    orchestrator.sync_all(adapter.clone()).await.unwrap();
    let calls = adapter.fetch_calls();
    let writes = store.write_calls();

    let again = orchestrator.sync_all(adapter.clone()).await.unwrap();

    assert_eq!(again[0].status, StreamStatus::Complete);
    assert_eq!(again[0].windows_total, 0);
    assert_eq!(again[0].rows_written, 0);
    assert_eq!(adapter.fetch_calls(), calls, "no fetch when nothing is new");
    assert_eq!(store.write_calls(), writes);
    assert_eq!(store.len("s"), 100);
}

#[tokio::test]
async fn test_next_run_starts_just_after_checkpoint() {
    let store = Arc::new(InMemoryStore::new());

    // Vendor only has data up to 590 on the first run
    let early = ScriptedAdapter::new().with_stream(stream("s", 0, 590), series(0, 600, 10));
    let first = orchestrator(&store).sync_all(Arc::new(early)).await.unwrap();
    assert_eq!(first[0].rows_written, 60);

    let later = Arc::new(hundred_readings());
    let second = orchestrator(&store).sync_all(later.clone()).await.unwrap();

    assert_eq!(second[0].start, ts(590) + micros(1));
    assert_eq!(second[0].rows_written, 40);
    assert_eq!(later.windows_for("s")[0].from, ts(590) + micros(1));
    assert_eq!(store.len("s"), 100);
}

#[tokio::test]
async fn test_checkpoint_never_moves_backwards() {
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = orchestrator(&store);

    let mut last_seen = None;
    for last in [290, 590, 590, 990] {
        let adapter = ScriptedAdapter::new().with_stream(stream("s", 0, last), series(0, last + 10, 10));
        orchestrator.sync_all(Arc::new(adapter)).await.unwrap();

        let checkpoint = store.query_last_timestamp("s").await.unwrap();
        assert!(checkpoint >= last_seen);
        last_seen = checkpoint;
    }
    assert_eq!(last_seen, Some(ts(990)));
}

#[tokio::test]
async fn test_empty_stream_falls_back_to_lookback() {
    let store = Arc::new(InMemoryStore::new());
    let config = SyncConfig { default_lookback_secs: 900, ..fast_config() };
    let adapter = Arc::new(ScriptedAdapter::new().with_stream(StreamDescriptor::new("fresh"), Vec::new()));

    let summaries = SyncOrchestrator::new(config, store.clone())
        .sync_all(adapter.clone())
        .await
        .unwrap();

    let s = &summaries[0];
    assert_eq!(s.windows_total, 3);
    assert_eq!(s.stop - s.start, chrono::Duration::seconds(900));
    assert_eq!(s.rows_written, 0);
    assert_eq!(s.status, StreamStatus::Complete);
    assert!(store.is_empty());
}

// =============================================================================
// Idempotence and dedup
// =============================================================================

#[tokio::test]
async fn test_rewriting_an_overlapping_range_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let writer = Arc::new(StoreWriter::new(store.clone(), Duration::from_secs(5), RetryPolicy::fixed(1, Duration::ZERO)));
    let fetch_loop = WindowedFetchLoop::new(writer, &fast_config());
    let adapter = hundred_readings();
    let credential = Credential::Bearer("token".into());
    let descriptor = stream("s", 0, 990);

    let first = fetch_loop.run(&adapter, &credential, &descriptor, ts(0), ts(1000)).await;
    let before = store.snapshot("s");
    let second = fetch_loop.run(&adapter, &credential, &descriptor, ts(500), ts(1000)).await;

    assert_eq!(first.rows_written, 100);
    assert_eq!(second.rows_written, 50);
    assert_eq!(store.snapshot("s"), before);
    assert_eq!(store.len("s"), 100);
}

#[tokio::test]
async fn test_duplicate_timestamps_collapse_to_latest() {
    let store = Arc::new(InMemoryStore::new());
    let mut records = series(0, 1000, 10);
    records.push(Record::new(ts(10)).with_field("temperature", 99.0));
    let adapter = Arc::new(ScriptedAdapter::new().with_stream(stream("s", 0, 990), records));

    let summaries = orchestrator(&store).sync_all(adapter).await.unwrap();

    assert_eq!(summaries[0].rows_written, 100);
    assert_eq!(store.len("s"), 100);
    let row = store
        .snapshot("s")
        .into_iter()
        .find(|r| r.timestamp == ts(10))
        .unwrap();
    assert_eq!(row.get("temperature"), Some(99.0));
}

// =============================================================================
// Window failures
// =============================================================================

#[tokio::test]
async fn test_second_window_failing_makes_run_partial() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = Arc::new(hundred_readings().with_fault("s", ts(300), Fault::Unavailable));

    let summaries = orchestrator(&store).sync_all(adapter.clone()).await.unwrap();
    let s = &summaries[0];

    assert_eq!(s.status, StreamStatus::Partial);
    assert_eq!(s.windows_attempted, 4);
    assert_eq!(s.windows_succeeded, 3);
    assert_eq!(s.windows_failed, 1);
    assert_eq!(s.failures.len(), 1);
    assert_eq!(s.failures[0].window.from, ts(300));
    assert_eq!(s.failures[0].stage, FailureStage::Fetch);
    assert!(s.failures[0].error.contains("503"));

    // Windows after the failed one were still fetched and written
    assert_eq!(store.len("s"), 70);
    assert!(store.read_range("s", ts(600), ts(1000)).await.unwrap().len() == 40);

    // 503 is retryable: two attempts for the failing window
    let attempts = adapter.windows_for("s").iter().filter(|w| w.from == ts(300)).count();
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_skipped_window_stays_behind_checkpoint() {
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = orchestrator(&store);
    let flaky = Arc::new(hundred_readings().with_fault("s", ts(300), Fault::Unavailable));
    orchestrator.sync_all(flaky).await.unwrap();

    // A healthy rerun resumes after the newest stored reading
    let healthy = Arc::new(hundred_readings());
    let again = orchestrator.sync_all(healthy).await.unwrap();

    assert_eq!(again[0].windows_total, 0);
    assert!(store.read_range("s", ts(300), ts(600)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_failure_recovers_within_retry_budget() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = Arc::new(hundred_readings().with_fault("s", ts(300), Fault::Transient(1)));

    let summaries = orchestrator(&store).sync_all(adapter.clone()).await.unwrap();

    assert_eq!(summaries[0].status, StreamStatus::Complete);
    assert_eq!(summaries[0].rows_written, 100);
    assert_eq!(adapter.fetch_calls(), 5);
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = Arc::new(hundred_readings().with_fault("s", ts(0), Fault::Unauthorized));

    let summaries = orchestrator(&store).sync_all(adapter.clone()).await.unwrap();

    assert_eq!(summaries[0].status, StreamStatus::Partial);
    let attempts = adapter.windows_for("s").iter().filter(|w| w.from == ts(0)).count();
    assert_eq!(attempts, 1);
    assert_eq!(adapter.fetch_calls(), 4);
}

#[tokio::test]
async fn test_every_window_failing_is_failed() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = [0, 300, 600, 900]
        .into_iter()
        .fold(hundred_readings(), |a, from| a.with_fault("s", ts(from), Fault::Unauthorized));

    let summaries = orchestrator(&store).sync_all(Arc::new(adapter)).await.unwrap();

    assert_eq!(summaries[0].status, StreamStatus::Failed);
    assert_eq!(summaries[0].windows_failed, 4);
    assert_eq!(summaries[0].rows_written, 0);
    assert!(store.is_empty());
}

// =============================================================================
// Stream isolation
// =============================================================================

#[tokio::test]
async fn test_failing_stream_does_not_affect_siblings() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = [0, 300, 600, 900].into_iter().fold(
        ScriptedAdapter::new()
            .with_stream(stream("a", 0, 990), series(0, 1000, 10))
            .with_stream(stream("b", 0, 990), series(0, 1000, 10)),
        |a, from| a.with_fault("b", ts(from), Fault::Unavailable),
    );

    let summaries = orchestrator(&store).sync_all(Arc::new(adapter)).await.unwrap();

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].stream_id, "a");
    assert_eq!(summaries[0].status, StreamStatus::Complete);
    assert_eq!(summaries[1].stream_id, "b");
    assert_eq!(summaries[1].status, StreamStatus::Failed);
    assert_eq!(store.len("a"), 100);
    assert_eq!(store.len("b"), 0);
}

#[tokio::test]
async fn test_panicking_stream_reports_failed() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = ScriptedAdapter::new()
        .with_stream(stream("steady", 0, 990), series(0, 1000, 10))
        .with_stream(stream("boom", 0, 990), series(0, 1000, 10))
        .with_fault("boom", ts(0), Fault::Panic);

    let orchestrator = orchestrator(&store);
    let summaries = orchestrator.sync_all(Arc::new(adapter)).await.unwrap();

    assert_eq!(summaries[0].status, StreamStatus::Complete);
    assert_eq!(orchestrator.streams_in_flight(), 0, "panicked worker still counted");
    assert_eq!(summaries[1].stream_id, "boom");
    assert_eq!(summaries[1].status, StreamStatus::Failed);
    assert!(summaries[1].error.is_some());
    assert_eq!(store.len("steady"), 100);
}

#[tokio::test]
async fn test_many_streams_with_bounded_concurrency() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = (0..10).fold(ScriptedAdapter::new(), |a, i| {
        a.with_stream(stream(&format!("s{i}"), 0, 990), series(0, 1000, 10))
    });
    let config = SyncConfig { max_concurrent_streams: 2, ..fast_config() };

    let summaries = SyncOrchestrator::new(config, store.clone())
        .sync_all(Arc::new(adapter))
        .await
        .unwrap();

    let ids: Vec<_> = summaries.iter().map(|s| s.stream_id.clone()).collect();
    let expected: Vec<_> = (0..10).map(|i| format!("s{i}")).collect();
    assert_eq!(ids, expected, "summaries follow listing order");
    assert!(summaries.iter().all(|s| s.is_complete()));
    assert_eq!(store.streams().len(), 10);
}

// =============================================================================
// Source-level errors
// =============================================================================

#[tokio::test]
async fn test_auth_failure_aborts_source() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = Arc::new(hundred_readings().failing_auth("bad password"));

    let result = orchestrator(&store).sync_all(adapter.clone()).await;

    match result {
        Err(SyncError::Auth { source_name, .. }) => assert_eq!(source_name, SOURCE),
        other => panic!("expected auth error, got {other:?}"),
    }
    assert_eq!(adapter.fetch_calls(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_listing_failure_aborts_source() {
    let store = Arc::new(InMemoryStore::new());
    let adapter = Arc::new(hundred_readings().failing_listing(500));

    let result = orchestrator(&store).sync_all(adapter.clone()).await;

    assert!(matches!(result, Err(SyncError::ListStreams { .. })));
    assert_eq!(adapter.fetch_calls(), 0);
}

#[tokio::test]
async fn test_sync_sources_reports_each_source() {
    let store = Arc::new(InMemoryStore::new());
    let good: Arc<dyn SourceAdapter> = Arc::new(hundred_readings().named("good"));
    let bad: Arc<dyn SourceAdapter> = Arc::new(hundred_readings().named("bad").failing_auth("locked out"));

    let reports = orchestrator(&store).sync_sources(vec![good, bad]).await;

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].source, "good");
    assert!(reports[0].is_success());
    assert_eq!(reports[0].rows_written(), 100);
    assert_eq!(reports[1].source, "bad");
    assert!(reports[1].result.is_err());
    assert_eq!(reports[1].rows_written(), 0);
}

// =============================================================================
// Cancellation, drift, catalog
// =============================================================================

#[tokio::test]
async fn test_cancellation_stops_at_window_boundary_and_resumes() {
    let store = Arc::new(InMemoryStore::new());
    let token = CancellationToken::new();
    let adapter = Arc::new(hundred_readings().cancel_after(1, token.clone()));

    let cancelled = orchestrator(&store)
        .with_cancellation(token)
        .sync_all(adapter)
        .await
        .unwrap();

    let s = &cancelled[0];
    assert!(s.cancelled);
    assert_eq!(s.windows_attempted, 1);
    assert_eq!(s.status, StreamStatus::Partial);
    // The window in flight when cancel fired was still committed
    assert_eq!(store.len("s"), 30);

    let resumed = orchestrator(&store).sync_all(Arc::new(hundred_readings())).await.unwrap();
    assert_eq!(resumed[0].start, ts(290) + micros(1));
    assert_eq!(resumed[0].status, StreamStatus::Complete);
    assert_eq!(store.len("s"), 100);
}

#[tokio::test]
async fn test_renamed_fields_warn_but_still_write() {
    let store = Arc::new(InMemoryStore::new());
    store
        .write_upsert("s", &[Record::new(ts(-100)).with_field("temp_c", 20.0)])
        .await
        .unwrap();

    let summaries = orchestrator(&store).sync_all(Arc::new(hundred_readings())).await.unwrap();
    let s = &summaries[0];

    assert_eq!(s.drift_warnings.len(), 1);
    assert!(s.drift_warnings[0].known.contains("temp_c"));
    assert!(s.drift_warnings[0].observed.contains("temperature"));
    assert_eq!(s.rows_written, 100);
    assert_eq!(s.status, StreamStatus::Complete);
}

#[tokio::test]
async fn test_stream_metadata_lands_in_catalog() {
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = orchestrator(&store).with_catalog(store.clone());

    orchestrator.sync_all(Arc::new(hundred_readings())).await.unwrap();

    let doc = store.get(SOURCE, "s").await.unwrap();
    assert_eq!(doc, Some(json!({ "name": "s", "room": "lab" })));
}
