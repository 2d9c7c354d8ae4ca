// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! convo-ledger: durable dual-sink recording of voice-dialogue sessions.
//!
//! Events go into one in-memory [`EventBuffer`]; a fsynced local log and a
//! batched spreadsheet export each read it from their own cursor, and the
//! [`ShutdownCoordinator`] guarantees one final flush of both on every exit.

pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod metadata;
pub mod recorder;
pub mod retry;
pub mod sheets;
pub mod shutdown;
pub mod sink;
pub mod telemetry;

pub use buffer::{EventBuffer, SharedBuffer};
pub use config::{LedgerConfig, RetryConfig};
pub use error::{LedgerError, Result};
pub use event::{ConversationEvent, EventDraft, EventKind, Speaker};
pub use metadata::CallMetadata;
pub use recorder::{Pipeline, SessionRecorder};
pub use retry::RetryPolicy;
pub use sheets::{MemoryStore, RowStore, SheetsClient};
pub use shutdown::{FinalFlushGuard, ShutdownCoordinator, ShutdownReason, ShutdownReport};
pub use sink::{FlushResult, LocalSink, RemoteSink, Sink, SinkState};
