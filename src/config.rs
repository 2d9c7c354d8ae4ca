// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Pipeline configuration.
//!
//! Defaults, then an optional JSON file, then `LEDGER_*` environment
//! variables. Callers (the CLI) apply their own overrides last and call
//! [`LedgerConfig::validate`].

use crate::error::{LedgerError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rows per `values:append` call the Sheets API accepts comfortably.
pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub log_path: PathBuf,
    /// Defaults to `log_path` with the `overflow.jsonl` extension.
    pub overflow_path: Option<PathBuf>,
    pub spreadsheet_id: Option<String>,
    pub sheets_token: Option<String>,
    pub sheets_endpoint: String,
    pub call_id: Option<String>,
    pub batch_size: usize,
    pub retry: RetryConfig,
    pub remote_flush_interval_ms: u64,
    pub local_flush_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub transcriptions_only: bool,
    pub max_buffer_events: Option<usize>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./log.txt"),
            overflow_path: None,
            spreadsheet_id: None,
            sheets_token: None,
            sheets_endpoint: "https://sheets.googleapis.com/v4".to_string(),
            call_id: None,
            batch_size: 100,
            retry: RetryConfig::default(),
            remote_flush_interval_ms: 10_000,
            local_flush_interval_ms: 250,
            request_timeout_ms: 10_000,
            shutdown_deadline_ms: 10_000,
            transcriptions_only: false,
            max_buffer_events: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load the file if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Apply `LEDGER_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LEDGER_LOG_PATH") {
            self.log_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LEDGER_OVERFLOW_PATH") {
            self.overflow_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("LEDGER_SPREADSHEET_ID") {
            self.spreadsheet_id = Some(v);
        }
        if let Some(v) = lookup("LEDGER_SHEETS_TOKEN") {
            self.sheets_token = Some(v);
        }
        if let Some(v) = lookup("LEDGER_SHEETS_ENDPOINT") {
            self.sheets_endpoint = v;
        }
        if let Some(v) = lookup("LEDGER_CALL_ID") {
            self.call_id = Some(v);
        }
        if let Some(v) = lookup("LEDGER_BATCH_SIZE") {
            self.batch_size = parse_num("LEDGER_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("LEDGER_MAX_RETRIES") {
            self.retry.max_retries = parse_num("LEDGER_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("LEDGER_REMOTE_FLUSH_INTERVAL_MS") {
            self.remote_flush_interval_ms = parse_num("LEDGER_REMOTE_FLUSH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("LEDGER_SHUTDOWN_DEADLINE_MS") {
            self.shutdown_deadline_ms = parse_num("LEDGER_SHUTDOWN_DEADLINE_MS", &v)?;
        }
        if let Some(v) = lookup("LEDGER_TRANSCRIPTIONS_ONLY") {
            self.transcriptions_only = matches!(v.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(LedgerError::Config(format!(
                "batch_size must be in 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(LedgerError::Config("retry.base_delay_ms exceeds retry.max_delay_ms".into()));
        }
        if self.shutdown_deadline_ms == 0 {
            return Err(LedgerError::Config("shutdown_deadline_ms must be positive".into()));
        }
        if self.local_flush_interval_ms == 0 || self.remote_flush_interval_ms == 0 {
            return Err(LedgerError::Config("flush intervals must be positive".into()));
        }
        if self.max_buffer_events == Some(0) {
            return Err(LedgerError::Config("max_buffer_events must be positive".into()));
        }
        Ok(())
    }

    pub fn overflow_path(&self) -> PathBuf {
        self.overflow_path
            .clone()
            .unwrap_or_else(|| self.log_path.with_extension("overflow.jsonl"))
    }

    /// Call metadata written at shutdown, next to the log.
    pub fn metadata_path(&self) -> PathBuf {
        self.log_path.with_extension("metadata.json")
    }

    /// `(spreadsheet_id, token)`. Remote export needs both.
    pub fn sheets_credentials(&self) -> Option<(&str, &str)> {
        match (&self.spreadsheet_id, &self.sheets_token) {
            (Some(id), Some(token)) => Some((id.as_str(), token.as_str())),
            _ => None,
        }
    }

    pub fn remote_flush_interval(&self) -> Duration {
        Duration::from_millis(self.remote_flush_interval_ms)
    }

    pub fn local_flush_interval(&self) -> Duration {
        Duration::from_millis(self.local_flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LedgerError::Config(format!("{key}: not a number: {value:?}")))
}
