// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Spreadsheet-backed row store.
//!
//! The remote sink only needs two operations: make sure a worksheet exists
//! and append rows to it. Updates and deletes are never issued.

pub mod http;
pub mod memory;

pub use http::SheetsClient;
pub use memory::{Fault, MemoryStore};

use crate::error::{LedgerError, Result};
use crate::event::ConversationEvent;
use async_trait::async_trait;

/// Largest cell the Sheets API accepts.
pub const MAX_CELL_CHARS: usize = 50_000;

/// `[timestamp, kind, text]`
pub type Row = Vec<String>;

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Create the worksheet if missing. An existing worksheet is success.
    async fn ensure_worksheet(&self, title: &str) -> Result<()>;

    /// Append rows, in order, as one call.
    async fn append_rows(&self, worksheet: &str, rows: &[Row]) -> Result<()>;
}

/// Convert an event to its row, rejecting cells the store cannot hold.
pub fn to_row(event: &ConversationEvent) -> Result<Row> {
    check_cell(event.sequence(), event.text())?;
    Ok(event.fields().to_vec())
}

/// `MalformedData` when `text` cannot fit in one cell.
pub fn check_cell(sequence: u64, text: &str) -> Result<()> {
    let chars = text.chars().count();
    if chars > MAX_CELL_CHARS {
        return Err(LedgerError::MalformedData {
            sequence: Some(sequence),
            reason: format!("text is {chars} characters, cell limit is {MAX_CELL_CHARS}"),
        });
    }
    Ok(())
}

/// Worksheet title for a call, `Call_<id>`.
pub fn worksheet_title(call_id: &str) -> String {
    format!("Call_{call_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EventBuffer;
    use crate::event::EventDraft;

    #[test]
    fn test_to_row_rejects_oversized_text() {
        let buffer = EventBuffer::new();
        buffer.append(EventDraft::note("fine")).unwrap();
        buffer.append(EventDraft::note("x".repeat(MAX_CELL_CHARS + 1))).unwrap();
        let events = buffer.drain_since(0);

        let row = to_row(&events[0]).unwrap();
        assert_eq!(row[1], "system_note");
        assert_eq!(row[2], "fine");

        let err = to_row(&events[1]).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedData { sequence: Some(2), .. }));
    }

    #[test]
    fn test_worksheet_title() {
        assert_eq!(worksheet_title("room-42"), "Call_room-42");
    }
}
