// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! `record`: play a dialogue script through a live pipeline.
//!
//! Script lines are `user: ...`, `agent: ...` or `note: ...`; blank lines are
//! ignored. SessionStart and SessionEnd are emitted around the script.

use convo_ledger::metadata::METADATA_SUFFIX;
use convo_ledger::{LedgerConfig, MemoryStore, Pipeline, RowStore, SessionRecorder, ShutdownReport, Speaker};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    Utterance(Speaker, String),
    Note(String),
}

/// `None` for blank or unrecognised lines.
pub fn parse_line(line: &str) -> Option<ScriptLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (tag, text) = line.split_once(':')?;
    let text = text.trim().to_string();
    match tag.trim().to_ascii_lowercase().as_str() {
        "user" => Some(ScriptLine::Utterance(Speaker::User, text)),
        "agent" => Some(ScriptLine::Utterance(Speaker::Agent, text)),
        "note" => Some(ScriptLine::Note(text)),
        _ => None,
    }
}

pub struct RecordOutcome {
    pub report: ShutdownReport,
    pub events: u64,
    /// Rows held by the in-memory store on a dry run.
    pub dry_run_rows: Option<usize>,
}

async fn play<R>(rec: SessionRecorder, input: R) -> convo_ledger::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    rec.on_session_start()?;
    let mut lines = input.lines();
    let mut played = 0;
    let mut line_no = 0;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_line(&line) {
            Some(ScriptLine::Utterance(speaker, text)) => {
                rec.on_utterance(speaker, text)?;
                played += 1;
            }
            Some(ScriptLine::Note(text)) => {
                if rec.on_note(text)?.is_some() {
                    played += 1;
                }
            }
            None if line.trim().is_empty() => {}
            None => tracing::warn!(line = line_no, "Skipping unrecognised script line"),
        }
    }
    rec.on_session_end()?;
    Ok(played)
}

pub async fn run<R>(config: &LedgerConfig, dry_run: bool, input: R) -> anyhow::Result<RecordOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let memory = dry_run.then(|| Arc::new(MemoryStore::new()));
    let store = memory.clone().map(|m| m as Arc<dyn RowStore>);

    let pipeline = Pipeline::start(config, store)?;
    let buffer = pipeline.buffer().clone();
    let _guard = pipeline.guard();
    let rec = pipeline.recorder();

    let (report, output) = pipeline.run(play(rec, input)).await;
    match output {
        Some(Ok(played)) => tracing::info!(played, "Script finished"),
        Some(Err(e)) => tracing::error!("Script aborted: {}", e),
        None => tracing::warn!(reason = %report.reason, "Session interrupted"),
    }

    let dry_run_rows = memory.map(|m| {
        m.worksheets()
            .iter()
            .filter(|w| !w.ends_with(METADATA_SUFFIX))
            .map(|w| m.rows(w).len())
            .sum()
    });
    Ok(RecordOutcome {
        report,
        events: buffer.last_sequence(),
        dry_run_rows,
    })
}
