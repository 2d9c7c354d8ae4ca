// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Event Buffer - Session Source of Truth
//!
//! Holds every event of the session until both sinks have committed it.
//!
//! # Semantics
//! - append-only: events are never mutated or removed
//! - sequence numbers start at 1 and have no gaps
//! - readers never observe a torn event, only more or fewer trailing ones
//! - sinks keep their own cursors; the buffer knows nothing about them
//!
//! # Flow
//! 1. `append()` - the session driver records an occurrence
//! 2. `drain_since(cursor)` - each sink reads what it has not committed yet

use crate::error::{LedgerError, Result};
use crate::event::{ConversationEvent, EventDraft};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type SharedBuffer = Arc<EventBuffer>;

#[derive(Debug, Default)]
pub struct EventBuffer {
    events: RwLock<Vec<Arc<ConversationEvent>>>,

    /// Mirrors `events.len()` for lock-free progress checks.
    last_sequence: AtomicU64,

    /// Optional hard ceiling on the number of events.
    capacity_limit: Option<usize>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            capacity_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn shared(self) -> SharedBuffer {
        Arc::new(self)
    }

    /// Append an event and return its sequence number.
    ///
    /// Never performs I/O. Fails only with [`LedgerError::BufferExhausted`].
    /// The timestamp is clamped so it never precedes the previous event.
    pub fn append(&self, mut draft: EventDraft) -> Result<u64> {
        let mut events = self.events.write();
        let len = events.len();

        if self.capacity_limit.is_some_and(|limit| len >= limit) {
            return Err(LedgerError::BufferExhausted { len });
        }
        events
            .try_reserve(1)
            .map_err(|_| LedgerError::BufferExhausted { len })?;

        if let Some(last) = events.last() {
            if draft.timestamp < last.timestamp() {
                draft.timestamp = last.timestamp();
            }
        }

        let sequence = len as u64 + 1;
        events.push(Arc::new(ConversationEvent::from_draft(sequence, draft)));
        self.last_sequence.store(sequence, Ordering::Release);

        metrics::counter!("ledger_events_appended_total", 1);
        Ok(sequence)
    }

    /// Events with `sequence > cursor`, in order. Pure read.
    pub fn drain_since(&self, cursor: u64) -> Vec<Arc<ConversationEvent>> {
        let events = self.events.read();
        let start = (cursor as usize).min(events.len());
        events[start..].to_vec()
    }

    /// Events with `cursor < sequence <= upto`, in order.
    pub fn range(&self, cursor: u64, upto: u64) -> Vec<Arc<ConversationEvent>> {
        let events = self.events.read();
        let end = (upto as usize).min(events.len());
        let start = (cursor as usize).min(end);
        events[start..end].to_vec()
    }

    /// Sequence of the newest event, 0 when empty.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.last_sequence() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.last_sequence() == 0
    }
}
