// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-process row store with scripted failures.
//!
//! Backs `--dry-run` and the sink tests.

use crate::error::{LedgerError, Result};
use crate::sheets::{Row, RowStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Authorization,
    Malformed,
}

impl Fault {
    fn to_error(self) -> LedgerError {
        match self {
            Fault::Transient => LedgerError::TransientIo("simulated 503".into()),
            Fault::Authorization => LedgerError::Authorization("simulated 403".into()),
            Fault::Malformed => LedgerError::MalformedData {
                sequence: None,
                reason: "simulated 400".into(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    worksheets: BTreeMap<String, Vec<Row>>,
    /// `None` answers one call successfully.
    scripted: VecDeque<Option<Fault>>,
    permanent: Option<Fault>,
    append_calls: u32,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every append sleeps this long before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Fail the next append calls with these faults, in order.
    pub fn script(&self, faults: impl IntoIterator<Item = Fault>) {
        self.script_outcomes(faults.into_iter().map(Some));
    }

    /// Script the next append calls; `None` succeeds.
    pub fn script_outcomes(&self, outcomes: impl IntoIterator<Item = Option<Fault>>) {
        self.inner.lock().scripted.extend(outcomes);
    }

    pub fn fail_always(&self, fault: Fault) {
        self.inner.lock().permanent = Some(fault);
    }

    pub fn heal(&self) {
        let mut inner = self.inner.lock();
        inner.permanent = None;
        inner.scripted.clear();
    }

    pub fn rows(&self, worksheet: &str) -> Vec<Row> {
        self.inner
            .lock()
            .worksheets
            .get(worksheet)
            .cloned()
            .unwrap_or_default()
    }

    pub fn worksheets(&self) -> Vec<String> {
        self.inner.lock().worksheets.keys().cloned().collect()
    }

    pub fn append_calls(&self) -> u32 {
        self.inner.lock().append_calls
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn ensure_worksheet(&self, title: &str) -> Result<()> {
        self.inner
            .lock()
            .worksheets
            .entry(title.to_string())
            .or_default();
        Ok(())
    }

    async fn append_rows(&self, worksheet: &str, rows: &[Row]) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        inner.append_calls += 1;
        let outcome = match inner.scripted.pop_front() {
            Some(scripted) => scripted,
            None => inner.permanent,
        };
        if let Some(fault) = outcome {
            return Err(fault.to_error());
        }
        match inner.worksheets.get_mut(worksheet) {
            Some(sheet) => {
                sheet.extend(rows.iter().cloned());
                Ok(())
            }
            None => Err(LedgerError::Authorization(format!("worksheet {worksheet} not found"))),
        }
    }
}
