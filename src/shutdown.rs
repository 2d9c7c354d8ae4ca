// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Shutdown Coordinator
//!
//! Guarantees every registered sink gets exactly one `flush_final` per
//! process lifetime, whatever ended the session.
//!
//! # Exit paths
//! - session future completes (or returns an error)
//! - Ctrl-C / SIGTERM
//! - external cancellation
//! - panic inside the session (caught in [`ShutdownCoordinator::run`])
//! - [`FinalFlushGuard`] dropped without an explicit shutdown
//!
//! The first trigger runs the final flush; every later or concurrent trigger
//! waits for and returns the same [`ShutdownReport`].

use crate::buffer::SharedBuffer;
use crate::error::Result;
use crate::sink::{Backstop, FlushResult, SharedSink};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    SessionEnded,
    Interrupt,
    Terminate,
    Cancelled,
    Fatal(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::SessionEnded => f.write_str("session ended"),
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::Terminate => f.write_str("terminate"),
            ShutdownReason::Cancelled => f.write_str("cancelled"),
            ShutdownReason::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub results: Vec<FlushResult>,
}

impl ShutdownReport {
    /// Both sinks reached the final sequence.
    pub fn is_complete(&self) -> bool {
        self.results.iter().all(FlushResult::is_complete)
    }

    pub fn result(&self, sink: &str) -> Option<&FlushResult> {
        self.results.iter().find(|r| r.sink == sink)
    }
}

struct Inner {
    buffer: SharedBuffer,
    sinks: Mutex<Vec<(Backstop, SharedSink)>>,
    deadline: Duration,
    token: CancellationToken,
    report: OnceCell<ShutdownReport>,
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new(buffer: SharedBuffer, deadline: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer,
                sinks: Mutex::new(Vec::new()),
                deadline,
                token: CancellationToken::new(),
                report: OnceCell::new(),
            }),
        }
    }

    /// `backstop` must come from the same sink; it is used when the sink
    /// stays locked past the deadline.
    pub fn register(&self, backstop: Backstop, sink: SharedSink) {
        self.inner.sinks.lock().push((backstop, sink));
    }

    /// Cancelled as soon as shutdown begins. Background flushers watch it.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.report.initialized()
    }

    pub fn report(&self) -> Option<ShutdownReport> {
        self.inner.report.get().cloned()
    }

    /// Run the final flush once; later calls return the first report.
    pub async fn trigger(&self, reason: ShutdownReason) -> ShutdownReport {
        self.inner.token.cancel();
        self.inner
            .report
            .get_or_init(|| self.final_flush(reason))
            .await
            .clone()
    }

    async fn final_flush(&self, reason: ShutdownReason) -> ShutdownReport {
        tracing::info!(%reason, "Shutdown: final flush of all sinks");
        let deadline = Instant::now() + self.inner.deadline;
        let sinks = self.inner.sinks.lock().clone();
        let buffer = &self.inner.buffer;

        let flushes = sinks.into_iter().map(|(backstop, sink)| async move {
            match tokio::time::timeout_at(deadline, sink.lock()).await {
                Ok(mut sink) => sink.flush_final(buffer, deadline).await,
                // An in-flight flush still holds the lock. Save the tail from
                // the cursor it last published.
                Err(_) => backstop.overflow_pending(buffer, "sink busy until the shutdown deadline"),
            }
        });
        let results = futures::future::join_all(flushes).await;

        for r in &results {
            if r.is_complete() {
                tracing::info!(sink = r.sink, cursor = r.cursor, written = r.written, "Final flush complete");
            } else {
                tracing::warn!(
                    sink = r.sink,
                    cursor = r.cursor,
                    unexported = r.unexported,
                    overflowed = r.overflowed,
                    error = r.error.as_deref().unwrap_or(""),
                    "Final flush left events unexported"
                );
            }
        }
        ShutdownReport { reason, results }
    }

    /// Drive `session` to completion or until a signal or cancellation
    /// arrives, then run the final flush. The session output is `None` when
    /// the session did not finish on its own.
    pub async fn run<F, T>(&self, session: F) -> (ShutdownReport, Option<Result<T>>)
    where
        F: Future<Output = Result<T>>,
    {
        let session = AssertUnwindSafe(session).catch_unwind();
        tokio::pin!(session);

        let (reason, output) = tokio::select! {
            out = &mut session => match out {
                Ok(Ok(value)) => (ShutdownReason::SessionEnded, Some(Ok(value))),
                Ok(Err(e)) => {
                    tracing::error!(error_kind = e.kind(), "Session failed: {}", e);
                    (ShutdownReason::Fatal(e.to_string()), Some(Err(e)))
                }
                Err(panic) => (ShutdownReason::Fatal(panic_message(panic.as_ref())), None),
            },
            reason = wait_for_signal() => (reason, None),
            _ = self.inner.token.cancelled() => (ShutdownReason::Cancelled, None),
        };

        (self.trigger(reason).await, output)
    }

    /// Scoped final-flush resource. See [`FinalFlushGuard`].
    pub fn guard(&self) -> FinalFlushGuard {
        FinalFlushGuard {
            coordinator: self.clone(),
        }
    }
}

/// Runs the final flush when dropped, unless shutdown already happened.
///
/// The flush runs on a helper thread with its own runtime and the drop
/// blocks until it returns, so it also fires while unwinding.
pub struct FinalFlushGuard {
    coordinator: ShutdownCoordinator,
}

impl Drop for FinalFlushGuard {
    fn drop(&mut self) {
        if self.coordinator.is_finished() {
            return;
        }
        let reason = if std::thread::panicking() {
            ShutdownReason::Fatal("panic".to_string())
        } else {
            ShutdownReason::Fatal("exited without shutdown".to_string())
        };
        let coordinator = self.coordinator.clone();
        let helper = std::thread::spawn(move || {
            match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => {
                    rt.block_on(coordinator.trigger(reason));
                }
                Err(e) => tracing::error!("Final flush runtime failed to start: {}", e),
            }
        });
        if helper.join().is_err() {
            tracing::error!("Final flush thread panicked");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Resolves on Ctrl-C or SIGTERM. If a handler cannot be installed that
/// branch never resolves.
pub async fn wait_for_signal() -> ShutdownReason {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
            ShutdownReason::Interrupt
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            ShutdownReason::Terminate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EventBuffer;
    use crate::error::LedgerError;
    use crate::event::EventDraft;
    use crate::sink::local::{read_overflow, OverflowRecord};
    use crate::sink::{Progress, Sink, SinkState};
    use tempfile::tempdir;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts final flushes and commits everything instantly.
    struct CountingSink {
        name: &'static str,
        cursor: u64,
        finals: Arc<AtomicUsize>,
        progress: Progress,
    }

    #[async_trait]
    impl Sink for CountingSink {
        fn name(&self) -> &'static str {
            self.name
        }

        fn cursor(&self) -> u64 {
            self.cursor
        }

        fn state(&self) -> SinkState {
            SinkState::Committed
        }

        fn backstop(&self) -> Backstop {
            Backstop { sink: self.name, progress: self.progress.clone(), overflow: None }
        }

        async fn flush(&mut self, buffer: &EventBuffer) -> Result<usize> {
            let n = buffer.drain_since(self.cursor).len();
            self.cursor = buffer.last_sequence();
            self.progress.advance(self.cursor);
            Ok(n)
        }

        async fn flush_final(&mut self, buffer: &EventBuffer, _deadline: Instant) -> FlushResult {
            self.finals.fetch_add(1, Ordering::SeqCst);
            let written = self.flush(buffer).await.unwrap_or(0);
            let mut result = FlushResult::new(self.name, self.cursor);
            result.written = written;
            result
        }
    }

    fn setup(n_events: usize) -> (ShutdownCoordinator, Arc<AtomicUsize>) {
        let buffer = EventBuffer::new().shared();
        for _ in 0..n_events {
            buffer.append(EventDraft::note("x")).unwrap();
        }
        let coordinator = ShutdownCoordinator::new(buffer, Duration::from_millis(500));
        let finals = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            let sink = CountingSink { name, cursor: 0, finals: finals.clone(), progress: Progress::default() };
            coordinator.register(sink.backstop(), Arc::new(tokio::sync::Mutex::new(sink)));
        }
        (coordinator, finals)
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let (coordinator, finals) = setup(3);

        let first = coordinator.trigger(ShutdownReason::Interrupt).await;
        let second = coordinator.trigger(ShutdownReason::Interrupt).await;

        assert_eq!(finals.load(Ordering::SeqCst), 2);
        assert!(first.is_complete());
        assert_eq!(second.reason, ShutdownReason::Interrupt);
        assert_eq!(first.result("a").unwrap().written, 3);
        assert_eq!(second.result("a").unwrap().written, 3);
        assert!(coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_flush_once() {
        let (coordinator, finals) = setup(1);
        let c1 = coordinator.clone();
        let c2 = coordinator.clone();

        let (r1, r2) = tokio::join!(
            c1.trigger(ShutdownReason::Interrupt),
            c2.trigger(ShutdownReason::Terminate)
        );
        assert_eq!(finals.load(Ordering::SeqCst), 2);
        assert_eq!(r1.reason, r2.reason);
    }

    #[tokio::test]
    async fn test_run_flushes_after_session_error() {
        let (coordinator, finals) = setup(2);

        let (report, output) = coordinator
            .run(async { Err::<(), _>(LedgerError::BufferExhausted { len: 2 }) })
            .await;

        assert!(matches!(report.reason, ShutdownReason::Fatal(_)));
        assert!(matches!(output, Some(Err(LedgerError::BufferExhausted { .. }))));
        assert_eq!(finals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_flushes_after_panic() {
        let (coordinator, finals) = setup(1);

        let (report, output) = coordinator
            .run(async {
                if finals.load(Ordering::SeqCst) == 0 {
                    panic!("dialogue engine exploded");
                }
                Ok(())
            })
            .await;

        assert_eq!(report.reason, ShutdownReason::Fatal("dialogue engine exploded".to_string()));
        assert!(output.is_none());
        assert_eq!(finals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let (coordinator, finals) = setup(0);
        let token = coordinator.token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let (report, output) = coordinator
            .run(async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;

        assert_eq!(report.reason, ShutdownReason::Cancelled);
        assert!(output.is_none());
        assert_eq!(finals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_guard_flushes_on_drop() {
        let (coordinator, finals) = setup(2);
        {
            let _guard = coordinator.guard();
        }
        assert_eq!(finals.load(Ordering::SeqCst), 2);
        assert!(coordinator.is_finished());

        // Once finished, another guard is a no-op.
        drop(coordinator.guard());
        assert_eq!(finals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_guard_flushes_while_unwinding() {
        let (coordinator, finals) = setup(1);
        let c = coordinator.clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let _guard = c.guard();
            panic!("boom");
        }));

        assert!(outcome.is_err());
        assert_eq!(finals.load(Ordering::SeqCst), 2);
        assert!(matches!(coordinator.report().unwrap().reason, ShutdownReason::Fatal(_)));
    }

    #[tokio::test]
    async fn test_busy_sink_overflows_from_published_cursor() {
        let dir = tempdir().unwrap();
        let overflow_path = dir.path().join("o.jsonl");
        let buffer = EventBuffer::new().shared();
        for _ in 0..3 {
            buffer.append(EventDraft::note("x")).unwrap();
        }
        let coordinator = ShutdownCoordinator::new(buffer.clone(), Duration::from_millis(50));

        // 1. The sink confirmed event 1, then got stuck holding its lock
        let finals = Arc::new(AtomicUsize::new(0));
        let progress = Progress::default();
        progress.advance(1);
        let sink = CountingSink { name: "stuck", cursor: 1, finals: finals.clone(), progress };
        let backstop = Backstop {
            overflow: Some(OverflowRecord::new(&overflow_path)),
            ..sink.backstop()
        };
        let shared: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
        coordinator.register(backstop, shared.clone());
        let held = shared.lock().await;

        // 2. The deadline passes and the tail is saved anyway
        let report = coordinator.trigger(ShutdownReason::Interrupt).await;
        drop(held);

        let result = report.result("stuck").unwrap();
        assert_eq!(finals.load(Ordering::SeqCst), 0);
        assert_eq!(result.cursor, 1);
        assert_eq!(result.unexported, 2);
        assert_eq!(result.overflowed, 2);
        assert!(!result.is_complete());
        let entries = read_overflow(&overflow_path).unwrap();
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);
    }
}
