//! Durable per-owner history, transcripts, and the live-session snapshot.
//!
//! Everything here is plain JSON under the state directory:
//!
//! ```text
//! <state>/history/<owner>.json        history entries, newest first
//! <state>/transcripts/<owner>/<id>.json
//! <state>/live-sessions.json          crash-recovery snapshot
//! ```
//!
//! History writes are read-merge-write, serialized per owner with an async
//! lock so concurrent session teardowns cannot drop each other's entries.
//! Persistence failures degrade the service rather than fail it; they are
//! logged and swallowed.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use ttymux_protocol::HistoryEntry;
use ttymux_protocol::LiveSessionRecord;
use ttymux_protocol::SessionId;
use ttymux_protocol::TranscriptMessage;

const LIVE_SNAPSHOT_FILE: &str = "live-sessions.json";

#[derive(Debug)]
pub(crate) struct HistoryStore {
    root: PathBuf,
    max_entries: usize,
    owner_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HistoryStore {
    pub(crate) fn new(root: PathBuf, max_entries: usize) -> Self {
        Self {
            root,
            max_entries,
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn owner_lock(&self, owner: &str) -> Arc<Mutex<()>> {
        let mut locks = self.owner_locks.lock().await;
        Arc::clone(locks.entry(owner.to_string()).or_default())
    }

    fn history_path(&self, owner: &str) -> PathBuf {
        self.root
            .join("history")
            .join(format!("{}.json", sanitize_component(owner)))
    }

    fn transcript_path(&self, owner: &str, session_id: &SessionId) -> PathBuf {
        self.root
            .join("transcripts")
            .join(sanitize_component(owner))
            .join(format!("{}.json", sanitize_component(session_id.as_str())))
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join(LIVE_SNAPSHOT_FILE)
    }

    /// Inserts or field-merges `entry` into the owner's history file,
    /// keeping entries sorted newest first and capped.
    pub(crate) async fn upsert_entry(&self, owner: &str, entry: HistoryEntry) {
        let lock = self.owner_lock(owner).await;
        let _guard = lock.lock().await;

        let mut entries = self.load_entries_unlocked(owner).await;
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.session_id == entry.session_id)
        {
            existing.merge_from(entry);
        } else {
            entries.push(entry);
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(self.max_entries);
        self.write_entries(owner, &entries).await;
    }

    pub(crate) async fn load_entries(&self, owner: &str) -> Vec<HistoryEntry> {
        let lock = self.owner_lock(owner).await;
        let _guard = lock.lock().await;
        self.load_entries_unlocked(owner).await
    }

    async fn load_entries_unlocked(&self, owner: &str) -> Vec<HistoryEntry> {
        let path = self.history_path(owner);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(owner, path = %path.display(), "malformed history file: {err}");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    async fn write_entries(&self, owner: &str, entries: &[HistoryEntry]) {
        let path = self.history_path(owner);
        if let Err(err) = write_json(&path, entries).await {
            tracing::warn!(owner, path = %path.display(), "failed to write history: {err}");
        }
    }

    pub(crate) async fn rename_entry(
        &self,
        owner: &str,
        session_id: &SessionId,
        title: &str,
    ) -> bool {
        let lock = self.owner_lock(owner).await;
        let _guard = lock.lock().await;

        let mut entries = self.load_entries_unlocked(owner).await;
        let Some(entry) = entries.iter_mut().find(|e| &e.session_id == session_id) else {
            return false;
        };
        entry.title = Some(title.to_string());
        self.write_entries(owner, &entries).await;
        true
    }

    /// Removes the entry and its transcript file. Returns whether an entry
    /// existed.
    pub(crate) async fn delete_entry(&self, owner: &str, session_id: &SessionId) -> bool {
        let lock = self.owner_lock(owner).await;
        let _guard = lock.lock().await;

        let mut entries = self.load_entries_unlocked(owner).await;
        let before = entries.len();
        entries.retain(|e| &e.session_id != session_id);
        let removed = entries.len() != before;
        if removed {
            self.write_entries(owner, &entries).await;
        }
        let _ = tokio::fs::remove_file(self.transcript_path(owner, session_id)).await;
        removed
    }

    pub(crate) async fn write_transcript(
        &self,
        owner: &str,
        session_id: &SessionId,
        messages: &[TranscriptMessage],
    ) {
        let path = self.transcript_path(owner, session_id);
        if let Err(err) = write_json(&path, messages).await {
            tracing::warn!(owner, session_id = %session_id, "failed to write transcript: {err}");
        }
    }

    pub(crate) async fn read_transcript(
        &self,
        owner: &str,
        session_id: &SessionId,
    ) -> Option<Vec<TranscriptMessage>> {
        let path = self.transcript_path(owner, session_id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(messages) => Some(messages),
            Err(err) => {
                tracing::warn!(path = %path.display(), "malformed transcript file: {err}");
                None
            }
        }
    }

    /// Rewrites the crash-recovery snapshot with the currently live
    /// sessions. An empty list removes the file.
    pub(crate) async fn write_live_snapshot(&self, records: &[LiveSessionRecord]) {
        let path = self.snapshot_path();
        if records.is_empty() {
            let _ = tokio::fs::remove_file(&path).await;
            return;
        }
        if let Err(err) = write_json(&path, records).await {
            tracing::warn!(path = %path.display(), "failed to write live snapshot: {err}");
        }
    }

    /// Converts a leftover live snapshot from a previous run into history
    /// entries ended with `ServiceRestart`, then removes the snapshot.
    /// Returns the number of recovered sessions.
    pub(crate) async fn recover_orphans(&self) -> usize {
        let path = self.snapshot_path();
        let records: Vec<LiveSessionRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(path = %path.display(), "malformed live snapshot: {err}");
                    let _ = tokio::fs::remove_file(&path).await;
                    return 0;
                }
            },
            Err(_) => return 0,
        };

        let now = chrono::Utc::now();
        let count = records.len();
        for record in records {
            let entry = HistoryEntry {
                session_id: record.session_id.clone(),
                program: record.program,
                variant: record.variant,
                mode: record.mode,
                created_at: record.created_at,
                ended_at: Some(now),
                title: None,
                files_count: 0,
                has_transcript: false,
                ended_reason: Some(ttymux_protocol::EndedReason::ServiceRestart),
            };
            self.upsert_entry(&record.owner, entry).await;
        }
        let _ = tokio::fs::remove_file(&path).await;
        if count > 0 {
            tracing::info!(count, "recovered orphaned sessions from previous run");
        }
        count
    }
}

/// Keeps owner names and session ids safe as single path components.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
