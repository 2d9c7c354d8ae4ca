use convo_ledger::sheets::{Fault, MemoryStore, RowStore, MAX_CELL_CHARS};
use convo_ledger::sink::local::read_overflow;
use convo_ledger::sink::OverflowEntry;
use convo_ledger::EventKind;
use chrono::{TimeZone, Utc};
use convo_ledger::{LedgerConfig, RetryPolicy};
use convo_ledger_cli::commands::{inspect, record, recover};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const SCRIPT: &str = "user: hi\nagent: hello, how can I help?\n\nnote: caller on hold\nuser: bye\n";

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

#[tokio::test]
async fn test_record_then_inspect() {
    let dir = tempdir().unwrap();
    let config = LedgerConfig {
        log_path: dir.path().join("log.txt"),
        call_id: Some("cli".to_string()),
        local_flush_interval_ms: 10,
        ..LedgerConfig::default()
    };

    // 1. Record with the in-memory store
    let outcome = record::run(&config, true, SCRIPT.as_bytes()).await.unwrap();
    assert!(outcome.report.is_complete());
    // start + 4 script lines + end
    assert_eq!(outcome.events, 6);
    assert_eq!(outcome.dry_run_rows, Some(6));

    // 2. Inspect what landed on disk
    let summary = inspect::run(&config.log_path, &config.overflow_path(), 3).unwrap();
    assert_eq!(summary.log_lines, 6);
    assert_eq!(summary.overflow_entries, 0);
}

#[tokio::test]
async fn test_recover_exports_remote_overflow() {
    let dir = tempdir().unwrap();
    let config = LedgerConfig {
        log_path: dir.path().join("log.txt"),
        call_id: Some("lost".to_string()),
        local_flush_interval_ms: 10,
        shutdown_deadline_ms: 500,
        ..LedgerConfig::default()
    };

    // 1. A session whose remote store is down leaves an overflow record
    let down = Arc::new(MemoryStore::new());
    down.fail_always(Fault::Transient);
    let store: Arc<dyn RowStore> = down.clone();
    let mut fast = config.clone();
    fast.retry.base_delay_ms = 1;
    fast.retry.max_delay_ms = 2;
    fast.retry.max_retries = 1;
    let pipeline = convo_ledger::Pipeline::start(&fast, Some(store)).unwrap();
    let rec = pipeline.recorder();
    rec.on_session_start().unwrap();
    rec.on_utterance(convo_ledger::Speaker::User, "is anyone there").unwrap();
    pipeline.shutdown(convo_ledger::ShutdownReason::Interrupt).await;
    assert_eq!(read_overflow(config.overflow_path()).unwrap().len(), 2);

    // 2. Recover into a healthy store
    let healthy = Arc::new(MemoryStore::new());
    let target: Arc<dyn RowStore> = healthy.clone();
    let summary = recover::run(&config.overflow_path(), target, "Call_lost", 10, fast_retry())
        .await
        .unwrap();

    assert_eq!(summary.exported, 2);
    assert_eq!(summary.remaining, 0);
    let rows = healthy.rows("Call_lost");
    assert_eq!(rows[1][1], "user_utterance");
    assert_eq!(rows[1][2], "is anyone there");
}

fn entry(sequence: u64, sink: &str) -> OverflowEntry {
    OverflowEntry {
        sequence,
        timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
        kind: EventKind::AgentUtterance,
        text: format!("line {sequence}"),
        sink: sink.to_string(),
        reason: "test".to_string(),
        rejected: false,
    }
}

#[tokio::test]
async fn test_recover_stops_on_outage() {
    let entries = recover::pending_entries(vec![
        entry(2, "remote"),
        entry(1, "remote"),
        entry(2, "remote"),
        entry(3, "local"),
    ]);
    assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);

    let store = Arc::new(MemoryStore::new());
    store.fail_always(Fault::Authorization);
    let summary = recover::export(&entries, store.clone(), "Call_x", 10, fast_retry())
        .await
        .unwrap();

    assert_eq!(summary.exported, 0);
    assert_eq!(summary.remaining, 2);
    assert_eq!(store.append_calls(), 1);
}

#[tokio::test]
async fn test_recover_skips_refused_and_oversized_entries() {
    let mut refused = entry(1, "remote");
    refused.rejected = true;
    let mut oversized = entry(2, "remote");
    oversized.text = "x".repeat(MAX_CELL_CHARS + 1);
    let entries = recover::pending_entries(vec![refused, oversized, entry(3, "remote")]);

    let store = Arc::new(MemoryStore::new());
    let summary = recover::export(&entries, store.clone(), "Call_x", 10, fast_retry())
        .await
        .unwrap();

    assert_eq!(summary.exported, 1);
    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.remaining, 0);
    assert_eq!(store.append_calls(), 1);
    let rows = store.rows("Call_x");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][2], "line 3");
}
