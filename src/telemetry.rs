// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::error::{LedgerError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs + metrics). Safe to call more than once.
pub fn init_telemetry() -> Result<()> {
    // 1. Tracing (logs)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("convo_ledger=info"));
    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }

    // 2. Metrics (Prometheus)
    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| LedgerError::Config(format!("failed to install Prometheus recorder: {e}")))?;
    if PROM_HANDLE.set(handle).is_err() {
        tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
    }

    metrics::describe_counter!("ledger_events_appended_total", "Events appended to the session buffer");
    metrics::describe_counter!("ledger_sink_events_written_total", "Events durably committed, per sink");
    metrics::describe_counter!("ledger_sink_flush_failures_total", "Failed flushes, per sink and error kind");
    metrics::describe_counter!("ledger_remote_retries_total", "Retried remote store calls");
    metrics::describe_counter!("ledger_overflow_events_total", "Events written to the overflow record, per sink");
    metrics::describe_gauge!("ledger_sink_pending", "Events after the sink cursor");
    Ok(())
}

/// Prometheus exposition text of all recorded metrics.
pub fn render_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
