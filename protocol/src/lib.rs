//! Shared data types for the ttymux session manager.
//!
//! Everything in this crate is plain serde data: it is what the core hands to
//! callers (routing layers, viewers) and what it persists to disk for the
//! per-owner history index, the live-session snapshot, and transcript bodies.

use std::fmt;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Unique session identifier, derived from the owner, the program kind, and
/// the creation instant. Stable for the lifetime of the service process and
/// readable in history files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Governs transcript vs. raw-replay behavior for a session. Immutable after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Chat,
    Terminal,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Chat => f.write_str("chat"),
            SessionMode::Terminal => f.write_str("terminal"),
        }
    }
}

/// Lifecycle phase of a live session. Transitions are strictly monotonic:
/// `NotStarted -> Starting -> Ready`, with `Exited` reachable from any phase
/// and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NotStarted,
    Starting,
    Ready,
    Exited,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::NotStarted => f.write_str("not_started"),
            SessionPhase::Starting => f.write_str("starting"),
            SessionPhase::Ready => f.write_str("ready"),
            SessionPhase::Exited => f.write_str("exited"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One entry of a chat-mode transcript reconstructed from raw output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A file attached to a session while it lives. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub path: PathBuf,
    pub name: String,
    pub added_at: DateTime<Utc>,
}

/// Why a session stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndedReason {
    /// The underlying process exited on its own.
    Exited,
    /// The caller (or a bulk logout/shutdown path) destroyed the session.
    Destroyed,
    /// The idle reaper destroyed the session.
    IdleTimeout,
    /// Synthesized during crash recovery for sessions that were live when the
    /// service last stopped uncleanly.
    ServiceRestart,
}

impl fmt::Display for EndedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndedReason::Exited => f.write_str("exited"),
            EndedReason::Destroyed => f.write_str("destroyed"),
            EndedReason::IdleTimeout => f.write_str("idle_timeout"),
            EndedReason::ServiceRestart => f.write_str("service_restart"),
        }
    }
}

/// Durable, size-capped metadata record summarizing a session. The owner is
/// implicit in the storage partition (one history file per owner); exactly
/// one entry exists per session id within a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session_id: SessionId,
    pub program: String,
    pub variant: String,
    pub mode: SessionMode,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub files_count: usize,
    #[serde(default)]
    pub has_transcript: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_reason: Option<EndedReason>,
}

impl HistoryEntry {
    /// Field-level merge used when a later write targets an existing entry.
    /// Present fields of `update` win; absent fields keep the stored value.
    pub fn merge_from(&mut self, update: HistoryEntry) {
        debug_assert_eq!(self.session_id, update.session_id);
        if update.ended_at.is_some() {
            self.ended_at = update.ended_at;
        }
        if update.title.is_some() {
            self.title = update.title;
        }
        if update.files_count > self.files_count {
            self.files_count = update.files_count;
        }
        self.has_transcript = self.has_transcript || update.has_transcript;
        if update.ended_reason.is_some() {
            self.ended_reason = update.ended_reason;
        }
    }
}

/// Minimal record of a live session, persisted in a single transient snapshot
/// file so an unclean restart can recognize orphaned sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSessionRecord {
    pub session_id: SessionId,
    pub owner: String,
    pub program: String,
    pub variant: String,
    pub mode: SessionMode,
    pub created_at: DateTime<Utc>,
}

/// Caller-facing view of a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub owner: String,
    pub program: String,
    pub variant: String,
    pub mode: SessionMode,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub files_count: usize,
}

/// Static descriptor of a launchable program, as returned by
/// `list_programs`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramDescriptor {
    pub id: String,
    pub name: String,
    pub variants: Vec<VariantDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantDescriptor {
    pub id: String,
    pub name: String,
}
