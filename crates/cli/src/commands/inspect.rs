// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};

use convo_ledger::event::TIMESTAMP_FORMAT;
use convo_ledger::sink::local::{read_log, read_overflow};
use std::path::Path;

const TEXT_PREVIEW: usize = 60;

fn preview(text: &str) -> String {
    if text.chars().count() <= TEXT_PREVIEW {
        return text.to_string();
    }
    let cut: String = text.chars().take(TEXT_PREVIEW - 3).collect();
    format!("{cut}...")
}

pub struct InspectSummary {
    pub log_lines: usize,
    pub overflow_entries: usize,
}

pub fn run(log_path: &Path, overflow_path: &Path, last: usize) -> anyhow::Result<InspectSummary> {
    println!("\nSession Ledger Report");
    println!("---------------------");

    let mut files = Table::new();
    files
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["File", "Status", "Details"]);

    // 1. Local log
    let lines = if log_path.exists() {
        let lines = read_log(log_path)?;
        files.add_row(vec![
            "Log".to_string(),
            "FOUND".to_string(),
            format!("{} events, {}", lines.len(), log_path.display()),
        ]);
        lines
    } else {
        files.add_row(vec!["Log".to_string(), "MISSING".to_string(), log_path.display().to_string()]);
        Vec::new()
    };

    // 2. Overflow record
    let overflow = read_overflow(overflow_path)?;
    let status = if overflow.is_empty() { "EMPTY" } else { "PENDING" };
    files.add_row(vec![
        "Overflow".to_string(),
        status.to_string(),
        format!("{} entries, {}", overflow.len(), overflow_path.display()),
    ]);
    println!("{files}");

    // 3. Tail of the log
    if !lines.is_empty() && last > 0 {
        let mut tail = Table::new();
        tail.load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["#", "Timestamp", "Kind", "Text"]);

        let skip = lines.len().saturating_sub(last);
        for (idx, line) in lines.iter().enumerate().skip(skip) {
            tail.add_row(vec![
                (idx + 1).to_string(),
                line.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                line.kind.to_string(),
                preview(&line.text),
            ]);
        }
        println!("\nLast {} events", lines.len() - skip);
        println!("{tail}");
    }

    Ok(InspectSummary {
        log_lines: lines.len(),
        overflow_entries: overflow.len(),
    })
}
