// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Batched Remote Export
//!
//! Uploads events after `remote_cursor` as rows, at most `batch_size` per
//! call, each call under the retry policy.
//!
//! # Batch outcomes
//! - accepted: cursor moves past the batch
//! - transient failure, retries spent: the cycle stops, `PartiallyFailed`
//! - malformed: batch logged and overflowed, cursor moves on, next batch runs
//! - authorization: the cycle stops, events stay pending
//!
//! Rows always reach the store in sequence order: a batch is never sent
//! ahead of an unconfirmed earlier one.
//!
//! # Shutdown
//! `flush_final` runs one more cycle bounded by the deadline. Anything still
//! unconfirmed is written to the overflow record exactly once.

use crate::buffer::EventBuffer;
use crate::error::{LedgerError, Result};
use crate::event::ConversationEvent;
use crate::metadata::{CallMetadata, ROOM_ID};
use crate::retry::RetryPolicy;
use crate::sheets::{to_row, worksheet_title, Row, RowStore};
use crate::sink::{record_pending, Backstop, FlushResult, OverflowRecord, Progress, Sink, SinkState};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

const REMOTE_SINK: &str = "remote";

pub struct RemoteSink {
    store: Arc<dyn RowStore>,
    worksheet: String,
    worksheet_ready: bool,
    batch_size: usize,
    retry: RetryPolicy,
    cursor: u64,
    state: SinkState,
    last_error: Option<String>,
    overflow: Option<OverflowRecord>,
    /// When set, a `room_id` present before the first export names the worksheet.
    metadata: Option<CallMetadata>,
    /// Published cursor, rejected count and overflowed sequences.
    progress: Progress,
    /// Rows confirmed by the store over the sink's lifetime.
    exported: usize,
}

impl RemoteSink {
    pub fn new(store: Arc<dyn RowStore>, worksheet: impl Into<String>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            worksheet: worksheet.into(),
            worksheet_ready: false,
            batch_size: batch_size.max(1),
            retry,
            cursor: 0,
            state: SinkState::Idle,
            last_error: None,
            overflow: None,
            metadata: None,
            progress: Progress::default(),
            exported: 0,
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowRecord) -> Self {
        self.overflow = Some(overflow);
        self
    }

    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn worksheet(&self) -> &str {
        &self.worksheet
    }

    /// Rename the target worksheet. Ignored once rows have been sent.
    pub fn set_worksheet(&mut self, title: impl Into<String>) -> bool {
        if self.worksheet_ready {
            return false;
        }
        self.worksheet = title.into();
        true
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn exported(&self) -> usize {
        self.exported
    }

    /// Events skipped as malformed over the sink's lifetime.
    pub fn rejected(&self) -> usize {
        self.progress.rejected()
    }

    fn set_cursor(&mut self, cursor: u64) {
        self.cursor = cursor;
        self.progress.advance(cursor);
    }

    fn fail_cycle(&mut self, err: &LedgerError, first_seq: u64, last_seq: u64, attempts: u32) {
        self.state = SinkState::PartiallyFailed;
        self.last_error = Some(err.to_string());
        metrics::counter!("ledger_sink_flush_failures_total", 1, "sink" => REMOTE_SINK, "kind" => err.kind());
        tracing::error!(
            sink = REMOTE_SINK,
            first_seq,
            last_seq,
            attempts,
            error_kind = err.kind(),
            worksheet = %self.worksheet,
            "Remote batch not confirmed, events stay pending: {}", err
        );
    }

    /// Hand events to the overflow record unless they are already there.
    fn overflow_events(&mut self, events: &[Arc<ConversationEvent>], reason: &str, rejected: bool) -> usize {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return 0;
        };
        let first_seq = first.sequence();
        let last_seq = last.sequence();

        let Some(overflow) = &self.overflow else {
            tracing::error!(
                sink = REMOTE_SINK,
                first_seq,
                last_seq,
                "No overflow record configured, events exist only in the local log"
            );
            return 0;
        };
        match self.progress.overflow_once(overflow, events, REMOTE_SINK, reason, rejected) {
            Ok(0) => 0,
            Ok(n) => {
                tracing::warn!(sink = REMOTE_SINK, first_seq, last_seq, reason, "Events written to overflow record");
                n
            }
            Err(e) => {
                tracing::error!(sink = REMOTE_SINK, first_seq, last_seq, "Overflow write failed: {}", e);
                0
            }
        }
    }

    /// Skip events the store will never accept, without losing them.
    fn reject(&mut self, events: &[Arc<ConversationEvent>], err: &LedgerError) {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return;
        };
        tracing::error!(
            sink = REMOTE_SINK,
            first_seq = first.sequence(),
            last_seq = last.sequence(),
            error_kind = err.kind(),
            "Remote store rejected events, skipping them: {}", err
        );
        metrics::counter!("ledger_sink_flush_failures_total", 1, "sink" => REMOTE_SINK, "kind" => err.kind());
        self.progress.add_rejected(events.len());
        self.overflow_events(events, &err.to_string(), true);
    }

    async fn ensure_worksheet(&mut self) -> Result<()> {
        if self.worksheet_ready {
            return Ok(());
        }
        if let Some(room) = self.metadata.as_ref().and_then(|m| m.get(ROOM_ID)) {
            self.worksheet = worksheet_title(&room);
        }
        let store = self.store.clone();
        let title = self.worksheet.clone();
        let (result, _) = self
            .retry
            .run(|_| {
                let store = store.clone();
                let title = title.clone();
                async move { store.ensure_worksheet(&title).await }
            })
            .await;
        result?;
        self.worksheet_ready = true;
        Ok(())
    }

    /// One export cycle. Returns rows confirmed by this cycle.
    ///
    /// The cursor and counters are updated as each batch is confirmed, so a
    /// caller that drops this future mid-cycle still sees exact progress.
    async fn export(&mut self, buffer: &EventBuffer) -> usize {
        let pending = buffer.drain_since(self.cursor);
        if pending.is_empty() {
            self.state = SinkState::Committed;
            return 0;
        }
        self.state = SinkState::Flushing;

        if let Err(e) = self.ensure_worksheet().await {
            self.fail_cycle(&e, pending[0].sequence(), pending[pending.len() - 1].sequence(), 0);
            return 0;
        }

        let mut written = 0;
        for chunk in pending.chunks(self.batch_size) {
            let first_seq = chunk[0].sequence();
            let last_seq = chunk[chunk.len() - 1].sequence();

            let mut rows: Vec<Row> = Vec::with_capacity(chunk.len());
            let mut accepted: Vec<Arc<ConversationEvent>> = Vec::with_capacity(chunk.len());
            for event in chunk {
                match to_row(event) {
                    Ok(row) => {
                        rows.push(row);
                        accepted.push(event.clone());
                    }
                    Err(e) => self.reject(std::slice::from_ref(event), &e),
                }
            }

            if rows.is_empty() {
                self.set_cursor(last_seq);
                continue;
            }

            let store = self.store.clone();
            let title = self.worksheet.clone();
            let rows = Arc::new(rows);
            let (result, attempts) = self
                .retry
                .run(|_| {
                    let store = store.clone();
                    let title = title.clone();
                    let rows = rows.clone();
                    async move { store.append_rows(&title, &rows).await }
                })
                .await;

            match result {
                Ok(()) => {
                    self.set_cursor(last_seq);
                    self.exported += rows.len();
                    written += rows.len();
                    metrics::counter!("ledger_sink_events_written_total", rows.len() as u64, "sink" => REMOTE_SINK);
                    tracing::debug!(sink = REMOTE_SINK, first_seq, last_seq, attempts, "Batch confirmed");
                }
                Err(e @ LedgerError::MalformedData { .. }) => {
                    self.reject(&accepted, &e);
                    self.set_cursor(last_seq);
                }
                Err(e) => {
                    self.fail_cycle(&e, first_seq, last_seq, attempts);
                    record_pending(REMOTE_SINK, buffer, self.cursor);
                    return written;
                }
            }
        }

        self.state = SinkState::Committed;
        self.last_error = None;
        record_pending(REMOTE_SINK, buffer, self.cursor);
        written
    }
}

#[async_trait]
impl Sink for RemoteSink {
    fn name(&self) -> &'static str {
        REMOTE_SINK
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }

    fn state(&self) -> SinkState {
        self.state
    }

    fn backstop(&self) -> Backstop {
        Backstop {
            sink: REMOTE_SINK,
            progress: self.progress.clone(),
            overflow: self.overflow.clone(),
        }
    }

    /// Never fails: partial failure is reported through [`Sink::state`] and
    /// [`RemoteSink::last_error`], and the pending suffix is kept.
    async fn flush(&mut self, buffer: &EventBuffer) -> Result<usize> {
        Ok(self.export(buffer).await)
    }

    async fn flush_final(&mut self, buffer: &EventBuffer, deadline: Instant) -> FlushResult {
        let exported_before = self.exported;

        let timed_out = tokio::time::timeout_at(deadline, self.export(buffer)).await.is_err();
        if timed_out {
            self.state = SinkState::PartiallyFailed;
            self.last_error = Some("shutdown deadline elapsed".to_string());
            tracing::warn!(sink = REMOTE_SINK, cursor = self.cursor, "Final flush hit its deadline");
        }

        let mut result = FlushResult::new(REMOTE_SINK, self.cursor);
        result.written = self.exported - exported_before;
        result.rejected = self.rejected();
        if result.rejected > 0 {
            result.error = Some(format!("{} events rejected by the store", result.rejected));
        }

        let pending = buffer.drain_since(self.cursor);
        result.unexported = pending.len();
        if !pending.is_empty() {
            let reason = self.last_error.clone().unwrap_or_else(|| "unconfirmed at shutdown".to_string());
            result.overflowed = self.overflow_events(&pending, &reason, false);
            result.error = Some(reason);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDraft;
    use crate::sheets::{Fault, MemoryStore};
    use crate::sink::local::read_overflow;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn fill(buffer: &EventBuffer, n: usize) {
        for i in 0..n {
            buffer.append(EventDraft::note(format!("e{}", i + 1))).unwrap();
        }
    }

    #[tokio::test]
    async fn test_batches_respect_size_and_order() {
        let store = Arc::new(MemoryStore::new());
        let buffer = EventBuffer::new();
        fill(&buffer, 7);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 3, fast_retry(0));

        assert_eq!(sink.flush(&buffer).await.unwrap(), 7);
        assert_eq!(store.append_calls(), 3);
        assert_eq!(sink.cursor(), 7);
        assert_eq!(sink.state(), SinkState::Committed);

        let texts: Vec<String> = store.rows("Call_t").into_iter().map(|r| r[2].clone()).collect();
        assert_eq!(texts, (1..=7).map(|i| format!("e{i}")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_flush_without_new_events_sends_nothing() {
        let store = Arc::new(MemoryStore::new());
        let buffer = EventBuffer::new();
        fill(&buffer, 2);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 10, fast_retry(0));

        sink.flush(&buffer).await.unwrap();
        assert_eq!(sink.flush(&buffer).await.unwrap(), 0);
        assert_eq!(store.append_calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_transient_failure_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        store.fail_always(Fault::Transient);
        let buffer = EventBuffer::new();
        fill(&buffer, 5);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 2, fast_retry(3));

        assert_eq!(sink.flush(&buffer).await.unwrap(), 0);
        assert_eq!(store.append_calls(), 4);
        assert_eq!(sink.state(), SinkState::PartiallyFailed);
        assert_eq!(sink.cursor(), 0);

        // The next cycle is not blocked and picks up where it left off.
        store.heal();
        assert_eq!(sink.flush(&buffer).await.unwrap(), 5);
        assert_eq!(sink.state(), SinkState::Committed);
        assert_eq!(store.rows("Call_t").len(), 5);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_confirmed_prefix() {
        let store = Arc::new(MemoryStore::new());
        store.script_outcomes([None, Some(Fault::Transient)]);
        let buffer = EventBuffer::new();
        fill(&buffer, 6);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 2, fast_retry(0));

        // Batch 1-2 lands, 3-4 fails, 5-6 must not be sent ahead of it.
        assert_eq!(sink.flush(&buffer).await.unwrap(), 2);
        assert_eq!(sink.cursor(), 2);
        assert_eq!(sink.state(), SinkState::PartiallyFailed);
        assert_eq!(store.append_calls(), 2);
        assert_eq!(store.rows("Call_t").len(), 2);

        assert_eq!(sink.flush(&buffer).await.unwrap(), 4);
        let texts: Vec<String> = store.rows("Call_t").into_iter().map(|r| r[2].clone()).collect();
        assert_eq!(texts, (1..=6).map(|i| format!("e{i}")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_authorization_stops_cycle_only() {
        let store = Arc::new(MemoryStore::new());
        store.script([Fault::Authorization]);
        let buffer = EventBuffer::new();
        fill(&buffer, 3);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 10, fast_retry(5));

        assert_eq!(sink.flush(&buffer).await.unwrap(), 0);
        assert_eq!(store.append_calls(), 1);
        assert_eq!(sink.state(), SinkState::PartiallyFailed);
        assert!(sink.last_error().unwrap().contains("Authorization"));

        assert_eq!(sink.flush(&buffer).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_skipped_and_overflowed() {
        let dir = tempdir().unwrap();
        let overflow_path = dir.path().join("o.jsonl");
        let store = Arc::new(MemoryStore::new());
        store.script([Fault::Malformed]);
        let buffer = EventBuffer::new();
        fill(&buffer, 4);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 2, fast_retry(2))
            .with_overflow(OverflowRecord::new(&overflow_path));

        assert_eq!(sink.flush(&buffer).await.unwrap(), 2);
        assert_eq!(sink.cursor(), 4);
        assert_eq!(sink.rejected(), 2);

        let overflow = read_overflow(&overflow_path).unwrap();
        assert_eq!(overflow.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        let texts: Vec<String> = store.rows("Call_t").into_iter().map(|r| r[2].clone()).collect();
        assert_eq!(texts, vec!["e3", "e4"]);
    }

    #[tokio::test]
    async fn test_rejected_events_keep_final_flush_incomplete() {
        let dir = tempdir().unwrap();
        let overflow_path = dir.path().join("o.jsonl");
        let store = Arc::new(MemoryStore::new());
        store.script([Fault::Malformed]);
        let buffer = EventBuffer::new();
        fill(&buffer, 2);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 10, fast_retry(0))
            .with_overflow(OverflowRecord::new(&overflow_path));

        let result = sink.flush_final(&buffer, Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(result.cursor, 2);
        assert_eq!(result.unexported, 0);
        assert_eq!(result.rejected, 2);
        assert!(!result.is_complete());
        assert!(result.error.is_some());
        assert!(store.rows("Call_t").is_empty());

        let overflow = read_overflow(&overflow_path).unwrap();
        assert_eq!(overflow.len(), 2);
        assert!(overflow.iter().all(|e| e.rejected));
    }

    #[tokio::test]
    async fn test_backstop_shares_progress_with_sink() {
        let dir = tempdir().unwrap();
        let overflow_path = dir.path().join("o.jsonl");
        let store = Arc::new(MemoryStore::new());
        let buffer = EventBuffer::new();
        fill(&buffer, 2);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 10, fast_retry(0))
            .with_overflow(OverflowRecord::new(&overflow_path));
        let backstop = sink.backstop();

        sink.flush(&buffer).await.unwrap();
        fill(&buffer, 2);
        assert_eq!(backstop.progress.cursor(), 2);

        // 1. The backstop saves what the sink has not confirmed
        let saved = backstop.overflow_pending(&buffer, "sink busy");
        assert_eq!(saved.cursor, 2);
        assert_eq!(saved.unexported, 2);
        assert_eq!(saved.overflowed, 2);

        // 2. The sink's own final flush does not write them again
        store.fail_always(Fault::Transient);
        let result = sink.flush_final(&buffer, Instant::now() + Duration::from_millis(200)).await;
        assert_eq!(result.unexported, 2);
        assert_eq!(result.overflowed, 0);
        assert_eq!(read_overflow(&overflow_path).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_event_is_skipped_alone() {
        let dir = tempdir().unwrap();
        let overflow_path = dir.path().join("o.jsonl");
        let store = Arc::new(MemoryStore::new());
        let buffer = EventBuffer::new();
        buffer.append(EventDraft::note("ok")).unwrap();
        buffer.append(EventDraft::note("x".repeat(crate::sheets::MAX_CELL_CHARS + 1))).unwrap();
        buffer.append(EventDraft::note("fine")).unwrap();
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 10, fast_retry(0))
            .with_overflow(OverflowRecord::new(&overflow_path));

        assert_eq!(sink.flush(&buffer).await.unwrap(), 2);
        assert_eq!(sink.cursor(), 3);
        assert_eq!(read_overflow(&overflow_path).unwrap()[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_flush_final_deadline_overflows_once() {
        let dir = tempdir().unwrap();
        let overflow_path = dir.path().join("o.jsonl");
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(200)));
        let buffer = EventBuffer::new();
        fill(&buffer, 3);
        let mut sink = RemoteSink::new(store.clone(), "Call_t", 10, fast_retry(0))
            .with_overflow(OverflowRecord::new(&overflow_path));

        let result = sink.flush_final(&buffer, Instant::now() + Duration::from_millis(20)).await;
        assert_eq!(result.written, 0);
        assert_eq!(result.unexported, 3);
        assert_eq!(result.overflowed, 3);
        assert_eq!(sink.state(), SinkState::PartiallyFailed);

        let again = sink.flush_final(&buffer, Instant::now() + Duration::from_millis(20)).await;
        assert_eq!(again.overflowed, 0);
        assert_eq!(read_overflow(&overflow_path).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_set_worksheet_only_before_first_export() {
        let store = Arc::new(MemoryStore::new());
        let buffer = EventBuffer::new();
        fill(&buffer, 1);
        let mut sink = RemoteSink::new(store.clone(), "Call_default", 10, fast_retry(0));

        assert!(sink.set_worksheet("Call_room"));
        sink.flush(&buffer).await.unwrap();
        assert!(!sink.set_worksheet("Call_late"));
        assert_eq!(store.worksheets(), vec!["Call_room".to_string()]);
    }

    #[tokio::test]
    async fn test_room_id_names_worksheet() {
        let store = Arc::new(MemoryStore::new());
        let buffer = EventBuffer::new();
        fill(&buffer, 2);
        let meta = CallMetadata::new();
        let mut sink = RemoteSink::new(store.clone(), "Call_20260301_093005", 10, fast_retry(0))
            .with_metadata(meta.clone());

        meta.set(ROOM_ID, "lobby");
        sink.flush(&buffer).await.unwrap();
        assert_eq!(sink.worksheet(), "Call_lobby");
        assert_eq!(store.rows("Call_lobby").len(), 2);
    }
}
