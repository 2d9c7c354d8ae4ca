// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Session Pipeline
//!
//! Wires one session end to end: buffer, local log, remote export and the
//! shutdown coordinator.
//!
//! # Flow
//! 1. `Pipeline::start()` - builds the sinks and spawns the two flushers
//! 2. `SessionRecorder::on_*()` - the session driver appends events; every
//!    append wakes the local flusher
//! 3. the remote flusher exports on a fixed interval
//! 4. `Pipeline::shutdown()` / `Pipeline::run()` - stops the flushers,
//!    runs the final flush through the coordinator, then saves the call
//!    metadata
//!
//! Must be started from inside a Tokio runtime.

use crate::buffer::{EventBuffer, SharedBuffer};
use crate::config::LedgerConfig;
use crate::error::Result;
use crate::event::{EventDraft, Speaker, TIMESTAMP_FORMAT};
use crate::metadata::{metadata_worksheet, CallMetadata, END_TIME, START_TIME};
use crate::retry::RetryPolicy;
use crate::sheets::{worksheet_title, Row, RowStore, SheetsClient};
use crate::shutdown::{FinalFlushGuard, ShutdownCoordinator, ShutdownReason, ShutdownReport};
use crate::sink::{LocalSink, OverflowRecord, RemoteSink, SharedSink, Sink};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Driver-facing handle. Cheap to clone; every method maps to one append.
#[derive(Clone)]
pub struct SessionRecorder {
    buffer: SharedBuffer,
    wake: Arc<Notify>,
    metadata: CallMetadata,
    transcriptions_only: bool,
}

impl SessionRecorder {
    fn record(&self, draft: EventDraft) -> Result<u64> {
        let seq = self.buffer.append(draft)?;
        self.wake.notify_one();
        Ok(seq)
    }

    pub fn on_session_start(&self) -> Result<u64> {
        let draft = EventDraft::session_start();
        self.metadata
            .set_default(START_TIME, draft.timestamp.format(TIMESTAMP_FORMAT).to_string());
        self.record(draft)
    }

    pub fn on_utterance(&self, speaker: Speaker, text: impl Into<String>) -> Result<u64> {
        self.record(EventDraft::utterance(speaker, text))
    }

    pub fn on_session_end(&self) -> Result<u64> {
        let draft = EventDraft::session_end();
        self.metadata
            .set(END_TIME, draft.timestamp.format(TIMESTAMP_FORMAT).to_string());
        self.record(draft)
    }

    /// Returns `None` when the pipeline records transcriptions only.
    pub fn on_note(&self, text: impl Into<String>) -> Result<Option<u64>> {
        if self.transcriptions_only {
            return Ok(None);
        }
        self.record(EventDraft::note(text)).map(Some)
    }

    pub fn set_call_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.set(key, value);
    }

    pub fn metadata(&self) -> &CallMetadata {
        &self.metadata
    }
}

pub struct Pipeline {
    buffer: SharedBuffer,
    recorder: SessionRecorder,
    coordinator: ShutdownCoordinator,
    local: Arc<Mutex<LocalSink>>,
    remote: Option<Arc<Mutex<RemoteSink>>>,
    store: Option<Arc<dyn RowStore>>,
    retry: RetryPolicy,
    metadata_path: PathBuf,
    deadline: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Build the session pipeline.
    ///
    /// `store` overrides the remote target. Without one, a [`SheetsClient`]
    /// is built when the config names a spreadsheet and token; otherwise
    /// only the local log is written.
    pub fn start(config: &LedgerConfig, store: Option<Arc<dyn RowStore>>) -> Result<Self> {
        config.validate()?;
        let store = match store {
            Some(store) => Some(store),
            None => remote_store(config)?,
        };
        let retry = RetryPolicy::from(&config.retry);

        let buffer = match config.max_buffer_events {
            Some(limit) => EventBuffer::with_capacity_limit(limit),
            None => EventBuffer::new(),
        }
        .shared();
        let metadata = CallMetadata::new();
        let coordinator = ShutdownCoordinator::new(buffer.clone(), config.shutdown_deadline());
        let token = coordinator.token();
        let wake = Arc::new(Notify::new());

        let overflow = OverflowRecord::new(config.overflow_path());
        let local_sink = LocalSink::new(&config.log_path, overflow.clone());
        let local_backstop = local_sink.backstop();
        let local = Arc::new(Mutex::new(local_sink));
        let local_shared: SharedSink = local.clone();
        coordinator.register(local_backstop, local_shared);

        let mut tasks = vec![tokio::spawn(local_flusher(
            local.clone(),
            buffer.clone(),
            wake.clone(),
            config.local_flush_interval(),
            token.clone(),
        ))];

        let remote = store.clone().map(|store| {
            let worksheet = match &config.call_id {
                Some(id) => worksheet_title(id),
                None => worksheet_title(&Utc::now().format("%Y%m%d_%H%M%S").to_string()),
            };
            let mut sink = RemoteSink::new(store, worksheet, config.batch_size, retry)
                .with_overflow(overflow.clone());
            if config.call_id.is_none() {
                sink = sink.with_metadata(metadata.clone());
            }
            let backstop = sink.backstop();
            let remote = Arc::new(Mutex::new(sink));
            let remote_shared: SharedSink = remote.clone();
            coordinator.register(backstop, remote_shared);
            remote
        });
        if let Some(remote) = &remote {
            tasks.push(tokio::spawn(remote_flusher(
                remote.clone(),
                buffer.clone(),
                config.remote_flush_interval(),
                token,
            )));
        } else {
            tracing::info!("Remote export disabled, recording to the local log only");
        }

        tracing::info!(
            log_path = %config.log_path.display(),
            overflow_path = %overflow.path().display(),
            remote = remote.is_some(),
            "Session pipeline started"
        );

        let recorder = SessionRecorder {
            buffer: buffer.clone(),
            wake,
            metadata,
            transcriptions_only: config.transcriptions_only,
        };

        Ok(Self {
            buffer,
            recorder,
            coordinator,
            local,
            remote,
            store,
            retry,
            metadata_path: config.metadata_path(),
            deadline: config.shutdown_deadline(),
            tasks,
        })
    }

    pub fn recorder(&self) -> SessionRecorder {
        self.recorder.clone()
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Final flush on drop. Hold it across code that may panic.
    pub fn guard(&self) -> FinalFlushGuard {
        self.coordinator.guard()
    }

    /// Cursor of the local sink.
    pub async fn local_cursor(&self) -> u64 {
        self.local.lock().await.cursor()
    }

    /// Cursor of the remote sink, if remote export is enabled.
    pub async fn remote_cursor(&self) -> Option<u64> {
        match &self.remote {
            Some(remote) => Some(remote.lock().await.cursor()),
            None => None,
        }
    }

    /// Drive the session under the coordinator, then shut down.
    pub async fn run<F, T>(self, session: F) -> (ShutdownReport, Option<Result<T>>)
    where
        F: Future<Output = Result<T>>,
    {
        let (report, output) = self.coordinator.run(session).await;
        (self.finish(report).await, output)
    }

    pub async fn shutdown(self, reason: ShutdownReason) -> ShutdownReport {
        let report = self.coordinator.trigger(reason).await;
        self.finish(report).await
    }

    async fn finish(mut self, report: ShutdownReport) -> ShutdownReport {
        for task in self.tasks.iter_mut() {
            if let Err(e) = task.await {
                tracing::warn!("Flusher task ended abnormally: {}", e);
            }
        }
        self.save_metadata().await;
        tracing::info!(
            reason = %report.reason,
            events = self.buffer.last_sequence(),
            complete = report.is_complete(),
            metadata = ?self.recorder.metadata.snapshot(),
            "Session closed"
        );
        report
    }

    /// Local record first, then the metadata worksheet under its own deadline.
    async fn save_metadata(&self) {
        let metadata = &self.recorder.metadata;
        match metadata.write_record(&self.metadata_path) {
            Ok(()) => tracing::debug!(path = %self.metadata_path.display(), "Call metadata written"),
            Err(e) => tracing::error!(
                path = %self.metadata_path.display(),
                error_kind = e.kind(),
                "Call metadata record failed: {}", e
            ),
        }

        let (Some(store), Some(remote)) = (&self.store, &self.remote) else {
            return;
        };
        let rows = metadata.rows();
        if rows.is_empty() {
            return;
        }
        let worksheet = metadata_worksheet(remote.lock().await.worksheet());
        let export = export_metadata(store.clone(), &worksheet, rows, self.retry);
        match tokio::time::timeout(self.deadline, export).await {
            Ok(Ok(())) => tracing::info!(%worksheet, "Call metadata exported"),
            Ok(Err(e)) => tracing::error!(%worksheet, error_kind = e.kind(), "Call metadata export failed: {}", e),
            Err(_) => tracing::error!(%worksheet, "Call metadata export timed out"),
        }
    }
}

async fn export_metadata(store: Arc<dyn RowStore>, worksheet: &str, rows: Vec<Row>, retry: RetryPolicy) -> Result<()> {
    let (ensured, _) = retry
        .run(|_| {
            let store = store.clone();
            async move { store.ensure_worksheet(worksheet).await }
        })
        .await;
    ensured?;

    let rows = Arc::new(rows);
    let (appended, _) = retry
        .run(|_| {
            let store = store.clone();
            let rows = rows.clone();
            async move { store.append_rows(worksheet, &rows).await }
        })
        .await;
    appended
}

fn remote_store(config: &LedgerConfig) -> Result<Option<Arc<dyn RowStore>>> {
    let Some((id, token)) = config.sheets_credentials() else {
        return Ok(None);
    };
    let client = SheetsClient::new(&config.sheets_endpoint, id, token, config.request_timeout())?;
    Ok(Some(Arc::new(client)))
}

async fn local_flusher(
    sink: Arc<Mutex<LocalSink>>,
    buffer: SharedBuffer,
    wake: Arc<Notify>,
    backstop: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(backstop) => {}
        }
        // Failures are logged by the sink and retried on the next wake.
        let _ = sink.lock().await.flush(&buffer).await;
    }
    tracing::debug!(sink = "local", "Flusher stopped");
}

async fn remote_flusher(
    sink: Arc<Mutex<RemoteSink>>,
    buffer: SharedBuffer,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Dropping a cycle mid-flight releases the lock for the final flush;
        // progress up to the last confirmed batch is kept.
        tokio::select! {
            _ = token.cancelled() => break,
            _ = async {
                let mut sink = sink.lock().await;
                let _ = sink.flush(&buffer).await;
            } => {}
        }
    }
    tracing::debug!(sink = "remote", "Flusher stopped");
}
