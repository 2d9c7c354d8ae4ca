// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Append-Only Local Log
//!
//! The first durability layer. Every flush opens the log in append mode,
//! writes all pending lines in one call, fsyncs, and drops the handle before
//! returning. The file is never truncated or rewritten.
//!
//! # Line Format
//! ```text
//! 2026-03-01 09:30:05.120\tuser_utterance\thi there
//! ```
//! Backslash, tab, CR and LF inside the text are escaped so one event is
//! always exactly one line.
//!
//! # Overflow Record
//! A JSON Lines file next to the log. Events that could not be confirmed to
//! another sink before shutdown land here for manual recovery.

use crate::buffer::EventBuffer;
use crate::error::{LedgerError, Result};
use crate::event::{ConversationEvent, EventKind, TIMESTAMP_FORMAT};
use crate::sink::{record_pending, Backstop, FlushResult, Progress, Sink, SinkState};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const LOCAL_SINK: &str = "local";
const FINAL_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Open, write, fsync, close. The handle never outlives this call.
fn append_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// One parsed line of the local log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub text: String,
}

impl LogLine {
    /// Render an event without the trailing newline.
    pub fn render(event: &ConversationEvent) -> String {
        format!("{}\t{}\t{}", event.timestamp_text(), event.kind(), escape(event.text()))
    }

    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, '\t');
        let ts = parts.next()?;
        let kind = EventKind::parse(parts.next()?)?;
        let text = unescape(parts.next()?);
        let timestamp = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()?.and_utc();
        Some(Self { timestamp, kind, text })
    }
}

/// Read every well-formed line of a local log. A torn final line is skipped.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogLine>> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut lines = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match LogLine::parse(&line) {
            Some(parsed) => lines.push(parsed),
            None => tracing::warn!(line = idx + 1, "Skipping unparsable log line"),
        }
    }
    Ok(lines)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub text: String,
    /// Sink that failed to confirm the event.
    pub sink: String,
    pub reason: String,
    /// The target refused the event itself; resending it will fail again.
    #[serde(default)]
    pub rejected: bool,
}

impl OverflowEntry {
    pub fn from_event(event: &ConversationEvent, sink: &str, reason: &str) -> Self {
        Self {
            sequence: event.sequence(),
            timestamp: event.timestamp(),
            kind: event.kind(),
            text: event.text().to_string(),
            sink: sink.to_string(),
            reason: reason.to_string(),
            rejected: false,
        }
    }

    pub fn with_rejected(mut self, rejected: bool) -> Self {
        self.rejected = rejected;
        self
    }

    /// The same three fields the remote sink would have exported.
    pub fn fields(&self) -> [String; 3] {
        [
            self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            self.kind.as_str().to_string(),
            self.text.clone(),
        ]
    }
}

/// Cloneable handle to the overflow file. Writes are serialized and fsync'd.
#[derive(Debug, Clone)]
pub struct OverflowRecord {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl OverflowRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entries: &[OverflowEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut out = String::new();
        for entry in entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }

        let _guard = self.lock.lock();
        append_synced(&self.path, out.as_bytes())?;
        metrics::counter!("ledger_overflow_events_total", entries.len() as u64, "sink" => entries[0].sink.clone());
        Ok(())
    }
}

/// Parse an overflow file. A missing file means nothing overflowed.
pub fn read_overflow(path: impl AsRef<Path>) -> Result<Vec<OverflowEntry>> {
    let file = match std::fs::File::open(path.as_ref()) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(error = %e, "Skipping unparsable overflow entry"),
        }
    }
    Ok(entries)
}

pub struct LocalSink {
    path: PathBuf,
    cursor: u64,
    state: SinkState,
    overflow: OverflowRecord,
    progress: Progress,
}

impl LocalSink {
    pub fn new(path: impl Into<PathBuf>, overflow: OverflowRecord) -> Self {
        Self {
            path: path.into(),
            cursor: 0,
            state: SinkState::Idle,
            overflow,
            progress: Progress::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle other sinks use as their backstop.
    pub fn overflow(&self) -> OverflowRecord {
        self.overflow.clone()
    }

    fn write_pending(&mut self, buffer: &EventBuffer) -> Result<usize> {
        let pending = buffer.drain_since(self.cursor);
        let Some(last) = pending.last() else {
            return Ok(0);
        };
        let first_seq = pending[0].sequence();
        let last_seq = last.sequence();

        let mut out = String::new();
        for event in &pending {
            out.push_str(&LogLine::render(event));
            out.push('\n');
        }

        self.state = SinkState::Flushing;
        match append_synced(&self.path, out.as_bytes()) {
            Ok(()) => {
                self.cursor = last_seq;
                self.progress.advance(last_seq);
                self.state = SinkState::Committed;
                metrics::counter!("ledger_sink_events_written_total", pending.len() as u64, "sink" => LOCAL_SINK);
                record_pending(LOCAL_SINK, buffer, self.cursor);
                tracing::trace!(sink = LOCAL_SINK, first_seq, last_seq, "Flushed");
                Ok(pending.len())
            }
            Err(e) => {
                self.state = SinkState::PartiallyFailed;
                let err = LedgerError::from(e);
                metrics::counter!("ledger_sink_flush_failures_total", 1, "sink" => LOCAL_SINK, "kind" => err.kind());
                tracing::error!(
                    sink = LOCAL_SINK,
                    first_seq,
                    last_seq,
                    error_kind = err.kind(),
                    path = %self.path.display(),
                    "Local flush failed: {}", err
                );
                Err(err)
            }
        }
    }

    fn overflow_pending(&mut self, buffer: &EventBuffer, reason: &str) -> Result<usize> {
        let pending = buffer.drain_since(self.cursor);
        self.progress
            .overflow_once(&self.overflow, &pending, LOCAL_SINK, reason, false)
    }
}

#[async_trait]
impl Sink for LocalSink {
    fn name(&self) -> &'static str {
        LOCAL_SINK
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }

    fn state(&self) -> SinkState {
        self.state
    }

    fn backstop(&self) -> Backstop {
        Backstop {
            sink: LOCAL_SINK,
            progress: self.progress.clone(),
            overflow: Some(self.overflow.clone()),
        }
    }

    async fn flush(&mut self, buffer: &EventBuffer) -> Result<usize> {
        self.write_pending(buffer)
    }

    async fn flush_final(&mut self, buffer: &EventBuffer, deadline: Instant) -> FlushResult {
        let mut written = 0;
        let mut last_error;
        loop {
            match self.write_pending(buffer) {
                Ok(n) => {
                    written += n;
                    last_error = None;
                    break;
                }
                Err(e) => last_error = Some(e.to_string()),
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(FINAL_RETRY_PAUSE.min(deadline - now)).await;
        }

        let mut result = FlushResult::new(LOCAL_SINK, self.cursor);
        result.written = written;
        result.unexported = buffer.last_sequence().saturating_sub(self.cursor) as usize;
        result.error = last_error;

        if result.unexported > 0 {
            match self.overflow_pending(buffer, "local log unavailable at shutdown") {
                Ok(n) => result.overflowed = n,
                Err(e) => {
                    tracing::error!(
                        sink = LOCAL_SINK,
                        unexported = result.unexported,
                        "Overflow record also failed: {}", e
                    );
                }
            }
        }
        result
    }
}
