// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Conversation events.
//!
//! An event is created as an [`EventDraft`] by whoever observes the
//! occurrence, and becomes an immutable [`ConversationEvent`] once the
//! buffer assigns it a sequence number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Time column format shared by the local log and the remote rows.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    UserUtterance,
    AgentUtterance,
    SystemNote,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::UserUtterance => "user_utterance",
            Self::AgentUtterance => "agent_utterance",
            Self::SystemNote => "system_note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session_start" => Some(Self::SessionStart),
            "session_end" => Some(Self::SessionEnd),
            "user_utterance" => Some(Self::UserUtterance),
            "agent_utterance" => Some(Self::AgentUtterance),
            "system_note" => Some(Self::SystemNote),
            _ => None,
        }
    }

    /// Lifecycle markers carry no text.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::SessionStart | Self::SessionEnd)
    }

    pub fn is_transcription(&self) -> bool {
        matches!(self, Self::UserUtterance | Self::AgentUtterance)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn event_kind(self) -> EventKind {
        match self {
            Speaker::User => EventKind::UserUtterance,
            Speaker::Agent => EventKind::AgentUtterance,
        }
    }
}

/// An occurrence that has not been appended yet.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub text: String,
}

impl EventDraft {
    /// Stamp a new draft with the current wall-clock time.
    ///
    /// Lifecycle kinds always get empty text.
    pub fn new(kind: EventKind, text: impl Into<String>) -> Self {
        Self::at(Utc::now(), kind, text)
    }

    pub fn at(timestamp: DateTime<Utc>, kind: EventKind, text: impl Into<String>) -> Self {
        let text = if kind.is_lifecycle() { String::new() } else { text.into() };
        Self { timestamp, kind, text }
    }

    pub fn session_start() -> Self {
        Self::new(EventKind::SessionStart, "")
    }

    pub fn session_end() -> Self {
        Self::new(EventKind::SessionEnd, "")
    }

    pub fn utterance(speaker: Speaker, text: impl Into<String>) -> Self {
        Self::new(speaker.event_kind(), text)
    }

    pub fn note(text: impl Into<String>) -> Self {
        Self::new(EventKind::SystemNote, text)
    }
}

/// One immutable record of a session occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    sequence: u64,
    timestamp: DateTime<Utc>,
    kind: EventKind,
    text: String,
}

impl ConversationEvent {
    pub(crate) fn from_draft(sequence: u64, draft: EventDraft) -> Self {
        Self {
            sequence,
            timestamp: draft.timestamp,
            kind: draft.kind,
            text: draft.text,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp_text(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// The three exported fields in their fixed order.
    pub fn fields(&self) -> [String; 3] {
        [self.timestamp_text(), self.kind.as_str().to_string(), self.text.clone()]
    }
}
