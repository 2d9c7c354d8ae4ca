// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-call metadata (room id, voice, start and end time).
//!
//! Kept beside the event stream, not in it. At shutdown the snapshot is
//! written to a JSON record next to the log and, when remote export is on,
//! to its own worksheet as `[key, value]` rows.

use crate::error::Result;
use crate::sheets::Row;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub const ROOM_ID: &str = "room_id";
pub const START_TIME: &str = "start_time";
pub const END_TIME: &str = "end_time";

/// Appended to the events worksheet title to name the metadata worksheet.
pub const METADATA_SUFFIX: &str = "_metadata";

#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
    }

    /// Set only if the key is absent.
    pub fn set_default(&self, key: &str, value: impl Into<String>) {
        self.entries
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.lock().clone()
    }

    pub fn rows(&self) -> Vec<Row> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| vec![k.clone(), v.clone()])
            .collect()
    }

    /// Replace the record at `path` with the current snapshot, fsync'd.
    pub fn write_record(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        let mut file = File::create(path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    }
}

pub fn read_record(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Worksheet holding the metadata of the call recorded in `events_worksheet`.
pub fn metadata_worksheet(events_worksheet: &str) -> String {
    format!("{events_worksheet}{METADATA_SUFFIX}")
}
