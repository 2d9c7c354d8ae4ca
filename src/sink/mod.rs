// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Export sinks.
//!
//! A sink reads the [`EventBuffer`] from its own cursor and durably commits
//! what it finds. Sinks never mutate the buffer and never share cursors.
//!
//! # Contract
//! - `flush(buffer)` commits everything after the cursor it can, returns the
//!   number of events written by this call
//! - `flush_final(buffer, deadline)` is the shutdown variant; it must return
//!   by `deadline` and report what is still unexported
//! - the cursor only advances past events that are durably written

pub mod local;
pub mod remote;

pub use local::{LocalSink, LogLine, OverflowEntry, OverflowRecord};
pub use remote::RemoteSink;

use crate::buffer::EventBuffer;
use crate::error::Result;
use crate::event::ConversationEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Shared handle the shutdown path and the background flushers both use.
pub type SharedSink = Arc<tokio::sync::Mutex<dyn Sink>>;

/// Where a sink is in its flush cycle.
///
/// `Committed` and `PartiallyFailed` are resting states; the next flush
/// starts from either. `PartiallyFailed` keeps the unconfirmed suffix
/// pending and is never terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    Flushing,
    Committed,
    PartiallyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResult {
    pub sink: &'static str,
    /// Events committed by this call.
    pub written: usize,
    /// Cursor after the call.
    pub cursor: u64,
    /// Events after the cursor that were not committed to this sink.
    pub unexported: usize,
    /// Of those, how many were handed to the overflow record by this call.
    pub overflowed: usize,
    /// Events the sink skipped over the session because the target refused
    /// them. They sit behind the cursor but were never committed.
    pub rejected: usize,
    pub error: Option<String>,
}

impl FlushResult {
    pub fn new(sink: &'static str, cursor: u64) -> Self {
        Self {
            sink,
            written: 0,
            cursor,
            unexported: 0,
            overflowed: 0,
            rejected: 0,
            error: None,
        }
    }

    /// Every event reached the sink's target.
    pub fn is_complete(&self) -> bool {
        self.unexported == 0 && self.rejected == 0
    }
}

/// Progress a sink publishes for readers that cannot take its lock.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    cursor: Arc<AtomicU64>,
    rejected: Arc<AtomicUsize>,
    /// Sequences after the cursor already in the overflow record.
    overflowed: Arc<Mutex<BTreeSet<u64>>>,
}

impl Progress {
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self, cursor: u64) {
        self.cursor.store(cursor, Ordering::Release);
        let mut overflowed = self.overflowed.lock();
        *overflowed = overflowed.split_off(&(cursor + 1));
    }

    pub(crate) fn add_rejected(&self, n: usize) {
        self.rejected.fetch_add(n, Ordering::AcqRel);
    }

    /// Append the events not yet in the overflow record. Returns how many
    /// were written.
    pub(crate) fn overflow_once(
        &self,
        record: &OverflowRecord,
        events: &[Arc<ConversationEvent>],
        sink: &str,
        reason: &str,
        rejected: bool,
    ) -> Result<usize> {
        let mut overflowed = self.overflowed.lock();
        let entries: Vec<OverflowEntry> = events
            .iter()
            .filter(|e| !overflowed.contains(&e.sequence()))
            .map(|e| OverflowEntry::from_event(e, sink, reason).with_rejected(rejected))
            .collect();
        record.append(&entries)?;
        overflowed.extend(entries.iter().map(|e| e.sequence));
        Ok(entries.len())
    }
}

/// What the shutdown path needs to save a sink it cannot lock in time.
#[derive(Debug, Clone)]
pub struct Backstop {
    pub sink: &'static str,
    pub progress: Progress,
    pub overflow: Option<OverflowRecord>,
}

impl Backstop {
    /// Overflow everything after the published cursor and report it.
    pub fn overflow_pending(&self, buffer: &EventBuffer, reason: &str) -> FlushResult {
        let cursor = self.progress.cursor();
        let pending = buffer.drain_since(cursor);

        let mut result = FlushResult::new(self.sink, cursor);
        result.unexported = pending.len();
        result.rejected = self.progress.rejected();
        result.error = Some(reason.to_string());
        if pending.is_empty() {
            return result;
        }

        let first_seq = pending[0].sequence();
        let last_seq = pending[pending.len() - 1].sequence();
        match &self.overflow {
            Some(record) => match self.progress.overflow_once(record, &pending, self.sink, reason, false) {
                Ok(n) => {
                    result.overflowed = n;
                    tracing::warn!(sink = self.sink, first_seq, last_seq, reason, "Events written to overflow record");
                }
                Err(e) => tracing::error!(sink = self.sink, first_seq, last_seq, "Overflow write failed: {}", e),
            },
            None => tracing::error!(
                sink = self.sink,
                first_seq,
                last_seq,
                "No overflow record configured, events exist only in the local log"
            ),
        }
        result
    }
}

#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &'static str;

    /// Sequence of the last event this sink durably committed.
    fn cursor(&self) -> u64;

    fn state(&self) -> SinkState;

    /// Handle the shutdown path uses when this sink stays locked.
    fn backstop(&self) -> Backstop;

    async fn flush(&mut self, buffer: &EventBuffer) -> Result<usize>;

    async fn flush_final(&mut self, buffer: &EventBuffer, deadline: Instant) -> FlushResult;
}

pub(crate) fn record_pending(sink: &'static str, buffer: &EventBuffer, cursor: u64) {
    let pending = buffer.last_sequence().saturating_sub(cursor);
    metrics::gauge!("ledger_sink_pending", pending as f64, "sink" => sink);
}
