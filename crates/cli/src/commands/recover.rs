// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! `recover`: re-export events the remote sink left in the overflow record.
//!
//! Only entries written by the remote sink are sent; duplicates by sequence
//! are collapsed. Entries the store already refused, and text too long for a
//! cell, are counted as rejected without a request. The overflow file itself
//! is left untouched.

use anyhow::Context;
use convo_ledger::sheets::{check_cell, Row, RowStore};
use convo_ledger::sink::local::read_overflow;
use convo_ledger::sink::OverflowEntry;
use convo_ledger::{LedgerError, RetryPolicy};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoverSummary {
    pub exported: usize,
    pub rejected: usize,
    /// Entries left unsent after a transient or authorization failure.
    pub remaining: usize,
}

/// Remote entries, one per sequence, in sequence order.
pub fn pending_entries(entries: Vec<OverflowEntry>) -> Vec<OverflowEntry> {
    let mut by_seq = BTreeMap::new();
    for entry in entries.into_iter().filter(|e| e.sink == "remote") {
        by_seq.entry(entry.sequence).or_insert(entry);
    }
    by_seq.into_values().collect()
}

pub async fn export(
    entries: &[OverflowEntry],
    store: Arc<dyn RowStore>,
    worksheet: &str,
    batch_size: usize,
    retry: RetryPolicy,
) -> anyhow::Result<RecoverSummary> {
    let mut summary = RecoverSummary::default();
    let mut sendable = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.rejected {
            summary.rejected += 1;
            tracing::warn!(seq = entry.sequence, reason = %entry.reason, "Skipping entry the store refused before");
        } else if let Err(e) = check_cell(entry.sequence, &entry.text) {
            summary.rejected += 1;
            tracing::warn!(seq = entry.sequence, "Skipping entry: {}", e);
        } else {
            sendable.push(entry);
        }
    }
    if sendable.is_empty() {
        return Ok(summary);
    }

    let (ensured, _) = retry
        .run(|_| {
            let store = store.clone();
            async move { store.ensure_worksheet(worksheet).await }
        })
        .await;
    ensured.with_context(|| format!("cannot open worksheet {worksheet}"))?;

    let chunks: Vec<&[&OverflowEntry]> = sendable.chunks(batch_size.max(1)).collect();
    for (idx, chunk) in chunks.iter().enumerate() {
        let rows: Arc<Vec<Row>> = Arc::new(chunk.iter().map(|e| e.fields().to_vec()).collect());
        let first_seq = chunk[0].sequence;
        let last_seq = chunk[chunk.len() - 1].sequence;

        let (result, attempts) = retry
            .run(|_| {
                let store = store.clone();
                let rows = rows.clone();
                async move { store.append_rows(worksheet, &rows).await }
            })
            .await;

        match result {
            Ok(()) => {
                summary.exported += chunk.len();
                tracing::info!(first_seq, last_seq, attempts, "Recovered batch");
            }
            Err(e @ LedgerError::MalformedData { .. }) => {
                summary.rejected += chunk.len();
                tracing::error!(first_seq, last_seq, "Store rejected batch, skipping: {}", e);
            }
            Err(e) => {
                summary.remaining = chunks[idx..].iter().map(|c| c.len()).sum();
                tracing::error!(first_seq, last_seq, error_kind = e.kind(), "Recovery stopped: {}", e);
                break;
            }
        }
    }
    Ok(summary)
}

pub async fn run(
    overflow_path: &Path,
    store: Arc<dyn RowStore>,
    worksheet: &str,
    batch_size: usize,
    retry: RetryPolicy,
) -> anyhow::Result<RecoverSummary> {
    let entries = pending_entries(read_overflow(overflow_path)?);
    println!("{} overflow entries to re-export to {}", entries.len(), worksheet);
    let summary = export(&entries, store, worksheet, batch_size, retry).await?;
    println!(
        "exported {}, rejected {}, remaining {}",
        summary.exported, summary.rejected, summary.remaining
    );
    Ok(summary)
}
