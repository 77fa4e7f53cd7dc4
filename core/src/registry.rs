//! Session registry: the service-facing API.
//!
//! The registry owns every live session, the idle reaper, and the history
//! store. It is cheaply cloneable; all clones share one inner state.
//!
//! Lifecycle invariants enforced here:
//! - the phase atomic only moves forward, so a session that raced readiness
//!   against exit can never report itself ready again;
//! - input accepted before readiness is flushed in arrival order ahead of
//!   any later input, serialized on the pending-queue lock;
//! - exactly one caller performs teardown for a session, gated on the
//!   EXITED transition, so destroy racing natural exit writes one history
//!   entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use ttymux_protocol::EndedReason;
use ttymux_protocol::HistoryEntry;
use ttymux_protocol::LiveSessionRecord;
use ttymux_protocol::ProgramDescriptor;
use ttymux_protocol::SessionFile;
use ttymux_protocol::SessionId;
use ttymux_protocol::SessionMode;
use ttymux_protocol::SessionSummary;
use ttymux_protocol::TranscriptMessage;

use crate::config::Config;
use crate::errors::Result;
use crate::errors::SessionError;
use crate::history::HistoryStore;
use crate::program::EnvResolver;
use crate::program::ProgramCatalog;
use crate::session::ExitCallback;
use crate::session::OutputCallback;
use crate::session::Session;
use crate::session::SubscriberId;
use crate::session::phase;
use crate::spawn::SpawnedProcess;
use crate::spawn::spawn_shell_process;
use crate::transcript::derive_title;

const INPUT_CHANNEL_CAPACITY: usize = 128;
const DEFAULT_PTY_SIZE: (u16, u16) = (80, 24);
const INPUT_CHUNK_BYTES: usize = 256;
const INPUT_CHUNK_DELAY: Duration = Duration::from_millis(40);
/// Inputs below this size are written whole even for paced programs.
const PACING_THRESHOLD_BYTES: usize = 512;

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: Config,
    catalog: ProgramCatalog,
    env: Arc<dyn EnvResolver>,
    history: HistoryStore,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    /// Most recently created live session per owner.
    active: Mutex<HashMap<String, SessionId>>,
    next_seq: AtomicU64,
    reaper: StdMutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl SessionRegistry {
    /// Builds the registry, recovers any sessions orphaned by a previous
    /// run, and starts the idle reaper when an idle timeout is configured.
    pub async fn new(
        config: Config,
        catalog: ProgramCatalog,
        env: Arc<dyn EnvResolver>,
    ) -> Self {
        let history = HistoryStore::new(config.state_dir.clone(), config.history_max_entries);
        history.recover_orphans().await;

        let registry = Self {
            inner: Arc::new(RegistryInner {
                config,
                catalog,
                env,
                history,
                sessions: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                reaper: StdMutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        };
        registry.start_reaper();
        registry
    }

    pub fn list_programs(&self) -> Vec<ProgramDescriptor> {
        self.inner.catalog.descriptors()
    }

    /// Spawns a new session for `owner`. Catalog validation happens before
    /// any process is started, so unknown programs and variants fail cheap.
    /// `on_exit` fires once, from whichever path finishes the session.
    pub async fn create_session(
        &self,
        owner: &str,
        program_id: &str,
        variant_id: &str,
        mode: SessionMode,
        on_exit: Option<ExitCallback>,
    ) -> Result<SessionSummary> {
        let program = self
            .inner
            .catalog
            .get(program_id)
            .ok_or_else(|| SessionError::unknown_program(program_id))?
            .clone();
        let variant = program
            .variant(variant_id)
            .ok_or_else(|| SessionError::unknown_variant(program_id, variant_id))?
            .clone();

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = SessionId(format!(
            "{owner}-{program_id}-{millis}-{seq:04}",
            millis = Utc::now().timestamp_millis()
        ));

        let cwd = self.inner.config.state_dir.join("work").join(owner);
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|err| SessionError::spawn_failed(err.into()))?;

        let env = self.inner.env.resolve();
        let SpawnedProcess {
            process,
            output_rx,
            exit_rx,
        } = spawn_shell_process(&self.inner.config.shell(), &cwd, &env, DEFAULT_PTY_SIZE)
            .await
            .map_err(SessionError::spawn_failed)?;

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);
        let session = Arc::new(Session::new(
            id.clone(),
            owner.to_string(),
            program.clone(),
            variant.id.clone(),
            mode,
            process,
            input_tx,
            on_exit,
        ));

        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.insert(id.clone(), Arc::clone(&session));
        }
        {
            let mut active = self.inner.active.lock().await;
            active.insert(owner.to_string(), id.clone());
        }
        self.write_live_snapshot().await;
        // The durable index gets the entry up front, not just at teardown,
        // so a hard crash still leaves a record of the session.
        self.inner
            .history
            .upsert_entry(owner, live_entry(&session))
            .await;

        self.spawn_input_delivery(&session, input_rx);
        self.spawn_startup(&session, program.invocation(&variant));
        self.spawn_output_pump(&session, output_rx);
        self.spawn_exit_watcher(&session, exit_rx);

        tracing::info!(
            session_id = %id,
            owner,
            program = program_id,
            variant = %variant.id,
            mode = %mode,
            "session created"
        );
        Ok(session.summary())
    }

    /// Single consumer of the per-session input channel. One task doing all
    /// PTY writes is what makes pre-readiness flush and live input strictly
    /// FIFO, and gives pacing a place to live.
    fn spawn_input_delivery(&self, session: &Arc<Session>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
        let writer_tx = session.process.writer_sender();
        let exited = session.process.exited_flag();
        let paced = session.program.paced_input;
        // Holds no session Arc, so it cannot keep a dead session alive.
        tokio::spawn(async move {
            while let Some(bytes) = input_rx.recv().await {
                if exited.load(Ordering::SeqCst) {
                    break;
                }
                if paced && bytes.len() > PACING_THRESHOLD_BYTES {
                    for chunk in bytes.chunks(INPUT_CHUNK_BYTES) {
                        if exited.load(Ordering::SeqCst) {
                            return;
                        }
                        if writer_tx.send(chunk.to_vec()).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(INPUT_CHUNK_DELAY).await;
                    }
                } else if writer_tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Waits out the shell settle delay, writes the program invocation, and
    /// arms the readiness fallback timer.
    fn spawn_startup(&self, session: &Arc<Session>, invocation: String) {
        let task_session = Arc::clone(session);
        let handle = tokio::spawn(async move {
            let session = task_session;
            tokio::time::sleep(session.program.startup_settle).await;
            if session.is_exited() {
                return;
            }
            let mut line = invocation.into_bytes();
            line.push(b'\n');
            if session.process.writer_sender().send(line).await.is_err() {
                return;
            }
            session.advance_phase(phase::STARTING);

            let fallback = session.program.readiness_fallback;
            let timed = Arc::clone(&session);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(fallback).await;
                tracing::debug!(session_id = %timed.id, "readiness fallback timer fired");
                make_ready(&timed);
            });
            session.arm_fallback_timer(timer);
        });
        session.register_task(handle);
    }

    fn spawn_output_pump(&self, session: &Arc<Session>, mut output_rx: broadcast::Receiver<Vec<u8>>) {
        let task_session = Arc::clone(session);
        let handle = tokio::spawn(async move {
            let session = task_session;
            loop {
                match output_rx.recv().await {
                    Ok(chunk) => {
                        session.touch();
                        // Detection starts only once the invocation has been
                        // written: the hosting shell prints its own prompt
                        // first, and a bare `$ ` would pass the glyph check.
                        if session.is_starting() {
                            let ready = match session.detector.lock() {
                                Ok(mut detector) => {
                                    detector.observe(&chunk);
                                    detector.is_ready(&session.program)
                                }
                                Err(_) => false,
                            };
                            if ready {
                                make_ready(&session);
                            }
                        }
                        session.record_output(&chunk);
                        session.fan_out(&chunk);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %session.id, skipped, "output pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        session.register_task(handle);
    }

    fn spawn_exit_watcher(
        &self,
        session: &Arc<Session>,
        exit_rx: tokio::sync::oneshot::Receiver<i32>,
    ) {
        let registry = self.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let code = exit_rx.await.unwrap_or(-1);
            tracing::info!(session_id = %session.id, code, "session process exited");
            registry.finish_session(&session, EndedReason::Exited).await;
        });
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::not_found(session_id))
    }

    /// Raw terminal input. Before readiness the bytes queue; after, they go
    /// straight to the delivery task.
    pub async fn send_input(&self, session_id: &SessionId, bytes: &[u8]) -> Result<()> {
        let session = self.get_session(session_id).await?;
        session.touch();
        session.record_input_echo(bytes);
        deliver_or_queue(&session, bytes.to_vec()).await;
        Ok(())
    }

    /// Chat message: recorded in the transcript, newline-terminated, then
    /// delivered like any other input.
    pub async fn send_chat_input(&self, session_id: &SessionId, text: &str) -> Result<()> {
        self.record_user_message(session_id, text).await?;
        let session = self.get_session(session_id).await?;
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        deliver_or_queue(&session, bytes).await;
        Ok(())
    }

    /// Appends a user message to the transcript without delivering any
    /// input. The first message derives the session title, which is
    /// persisted immediately so it survives a crash before teardown.
    pub async fn record_user_message(&self, session_id: &SessionId, text: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;
        session.touch();
        let first = match session.transcript.lock() {
            Ok(mut transcript) => transcript.record_user(text),
            Err(_) => false,
        };
        if first && session.set_title_if_empty(derive_title(text)) {
            self.inner
                .history
                .upsert_entry(&session.owner, live_entry(&session))
                .await;
        }
        Ok(())
    }

    pub async fn resize_session(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<()> {
        let session = self.get_session(session_id).await?;
        if let Err(err) = session.process.resize(cols, rows) {
            tracing::warn!(session_id = %session_id, "pty resize failed: {err}");
        }
        Ok(())
    }

    /// Registers a shared file on the session. Returns the new file count.
    pub async fn add_session_file(
        &self,
        session_id: &SessionId,
        file: SessionFile,
    ) -> Result<usize> {
        let session = self.get_session(session_id).await?;
        let count = session.add_file(file);
        self.inner
            .history
            .upsert_entry(&session.owner, live_entry(&session))
            .await;
        Ok(count)
    }

    pub async fn list_session_files(&self, session_id: &SessionId) -> Result<Vec<SessionFile>> {
        let session = self.get_session(session_id).await?;
        Ok(session.files())
    }

    pub async fn subscribe(
        &self,
        session_id: &SessionId,
        callback: OutputCallback,
    ) -> Result<SubscriberId> {
        let session = self.get_session(session_id).await?;
        Ok(session.subscribe(callback))
    }

    /// Unknown sessions are tolerated; the caller may be detaching from a
    /// session that already finished.
    pub async fn unsubscribe(&self, session_id: &SessionId, id: SubscriberId) {
        if let Ok(session) = self.get_session(session_id).await {
            session.unsubscribe(id);
        }
    }

    /// Sanitized replay tail for reconnecting clients.
    pub async fn replay_buffer(&self, session_id: &SessionId) -> Result<String> {
        let session = self.get_session(session_id).await?;
        Ok(session.replay_text())
    }

    /// Recent raw output bytes, escapes included, for viewers that render a
    /// real terminal.
    pub async fn raw_output_tail(&self, session_id: &SessionId) -> Result<Vec<u8>> {
        let session = self.get_session(session_id).await?;
        Ok(session.raw_tail_bytes())
    }

    pub async fn get_session_summary(&self, session_id: &SessionId) -> Result<SessionSummary> {
        let session = self.get_session(session_id).await?;
        Ok(session.summary())
    }

    pub async fn get_active_session(&self, owner: &str) -> Option<SessionSummary> {
        let id = {
            let active = self.inner.active.lock().await;
            active.get(owner).cloned()
        }?;
        let sessions = self.inner.sessions.lock().await;
        sessions.get(&id).map(|s| s.summary())
    }

    pub async fn list_active_sessions(&self, owner: &str) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.lock().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| s.owner == owner)
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Every live session regardless of owner, for administrative views.
    pub async fn list_all_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.lock().await;
        let mut summaries: Vec<SessionSummary> =
            sessions.values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Durable history merged with live sessions. A live session shadows
    /// its durable entry, if an earlier run of the same id left one.
    pub async fn list_history(&self, owner: &str) -> Vec<HistoryEntry> {
        let mut entries = self.inner.history.load_entries(owner).await;
        let live: Vec<Arc<Session>> = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .values()
                .filter(|s| s.owner == owner)
                .cloned()
                .collect()
        };
        for session in live {
            let entry = live_entry(&session);
            if let Some(existing) = entries
                .iter_mut()
                .find(|e| e.session_id == entry.session_id)
            {
                *existing = entry;
            } else {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    /// Live transcript when the session is running, the persisted file
    /// otherwise.
    pub async fn get_transcript(
        &self,
        owner: &str,
        session_id: &SessionId,
    ) -> Option<Vec<TranscriptMessage>> {
        {
            let sessions = self.inner.sessions.lock().await;
            if let Some(session) = sessions.get(session_id)
                && session.owner == owner
            {
                return Some(session.transcript_messages());
            }
        }
        self.inner.history.read_transcript(owner, session_id).await
    }

    pub async fn rename_history(
        &self,
        owner: &str,
        session_id: &SessionId,
        title: &str,
    ) -> bool {
        {
            let sessions = self.inner.sessions.lock().await;
            if let Some(session) = sessions.get(session_id)
                && session.owner == owner
            {
                session.set_title(title.to_string());
            }
        }
        self.inner.history.rename_entry(owner, session_id, title).await
    }

    pub async fn delete_history(&self, owner: &str, session_id: &SessionId) -> bool {
        self.inner.history.delete_entry(owner, session_id).await
    }

    /// Destroys a session by id. Missing sessions are fine; destroy racing
    /// a natural exit must not error.
    pub async fn destroy_session(&self, session_id: &SessionId) -> Result<()> {
        let session = {
            let sessions = self.inner.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        if let Some(session) = session {
            session.process.kill();
            self.finish_session(&session, EndedReason::Destroyed).await;
        }
        Ok(())
    }

    pub async fn destroy_owner_sessions(&self, owner: &str) -> usize {
        let targets: Vec<Arc<Session>> = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .values()
                .filter(|s| s.owner == owner)
                .cloned()
                .collect()
        };
        let count = targets.len();
        for session in targets {
            session.process.kill();
            self.finish_session(&session, EndedReason::Destroyed).await;
        }
        count
    }

    /// Tears down every live session and stops the reaper. Used on service
    /// shutdown so no live snapshot is left behind to "recover".
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.inner.reaper.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
        let targets: Vec<Arc<Session>> = {
            let sessions = self.inner.sessions.lock().await;
            sessions.values().cloned().collect()
        };
        for session in targets {
            session.process.kill();
            self.finish_session(&session, EndedReason::Destroyed).await;
        }
    }

    fn start_reaper(&self) {
        let Some(idle_timeout) = self.inner.config.idle_timeout() else {
            tracing::info!("idle reaper disabled");
            return;
        };
        let sweep = self.inner.config.sweep_interval();
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep).await;
                let stale: Vec<Arc<Session>> = {
                    let sessions = registry.inner.sessions.lock().await;
                    sessions
                        .values()
                        .filter(|s| s.idle_for() >= idle_timeout)
                        .cloned()
                        .collect()
                };
                for session in stale {
                    tracing::info!(
                        session_id = %session.id,
                        owner = %session.owner,
                        "reaping idle session"
                    );
                    session.process.kill();
                    registry
                        .finish_session(&session, EndedReason::IdleTimeout)
                        .await;
                }
            }
        });
        if let Ok(mut slot) = self.inner.reaper.lock() {
            *slot = Some(handle);
        }
    }

    /// One-shot teardown. The EXITED transition elects a single finisher;
    /// every later call returns immediately, which is what makes destroy,
    /// natural exit, and the reaper composable.
    async fn finish_session(&self, session: &Arc<Session>, reason: EndedReason) {
        if !session.advance_phase(phase::EXITED) {
            return;
        }
        session.cancel_fallback_timer();
        session.process.kill();

        if session.mark_history_saved() {
            let has_transcript = session.has_transcript();
            if has_transcript {
                self.inner
                    .history
                    .write_transcript(&session.owner, &session.id, &session.transcript_messages())
                    .await;
            }
            let entry = HistoryEntry {
                session_id: session.id.clone(),
                program: session.program.id.clone(),
                variant: session.variant.clone(),
                mode: session.mode,
                created_at: session.created_at,
                ended_at: Some(Utc::now()),
                title: session.title(),
                files_count: session.files_count(),
                has_transcript,
                ended_reason: Some(reason),
            };
            self.inner.history.upsert_entry(&session.owner, entry).await;
        }

        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.remove(&session.id);
        }
        {
            let mut active = self.inner.active.lock().await;
            if active.get(&session.owner) == Some(&session.id) {
                active.remove(&session.owner);
            }
        }
        self.write_live_snapshot().await;
        if let Some(on_exit) = session.take_exit_handler() {
            on_exit(session.summary(), reason);
        }
        session.clear_subscribers();
        session.abort_tasks();
        tracing::info!(session_id = %session.id, %reason, "session finished");
    }

    async fn write_live_snapshot(&self) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let records: Vec<LiveSessionRecord> = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .values()
                .map(|s| LiveSessionRecord {
                    session_id: s.id.clone(),
                    owner: s.owner.clone(),
                    program: s.program.id.clone(),
                    variant: s.variant.clone(),
                    mode: s.mode,
                    created_at: s.created_at,
                })
                .collect()
        };
        self.inner.history.write_live_snapshot(&records).await;
    }
}

/// Promotes the session from STARTING to READY, flushing queued input first.
/// Serialized on the pending-queue lock against concurrent
/// `deliver_or_queue` calls, which is what keeps queued and live input in
/// one total order. A session that has not yet written its invocation stays
/// put: READY is only reachable from STARTING.
fn make_ready(session: &Arc<Session>) {
    let Ok(mut pending) = session.pending_input.lock() else {
        return;
    };
    if !session.promote_ready() {
        return;
    }
    let dropped = pending.dropped();
    if dropped > 0 {
        tracing::warn!(session_id = %session.id, dropped, "input chunks dropped before readiness");
    }
    // The input channel has seen no traffic before READY and its capacity
    // exceeds the queue bound, so try_send cannot fail here.
    let flushed = pending.drain();
    let count = flushed.len();
    for chunk in flushed {
        let _ = session.input_tx.try_send(chunk);
    }
    drop(pending);
    session.cancel_fallback_timer();
    if count > 0 {
        tracing::debug!(session_id = %session.id, count, "flushed queued input on readiness");
    }
    tracing::info!(session_id = %session.id, "session ready");
}

async fn deliver_or_queue(session: &Arc<Session>, bytes: Vec<u8>) {
    {
        let Ok(mut pending) = session.pending_input.lock() else {
            return;
        };
        if !session.is_ready() && !session.is_exited() {
            pending.push(bytes);
            return;
        }
    }
    let _ = session.input_tx.send(bytes).await;
}

fn live_entry(session: &Arc<Session>) -> HistoryEntry {
    HistoryEntry {
        session_id: session.id.clone(),
        program: session.program.id.clone(),
        variant: session.variant.clone(),
        mode: session.mode,
        created_at: session.created_at,
        ended_at: None,
        title: session.title(),
        files_count: session.files_count(),
        has_transcript: session.has_transcript(),
        ended_reason: None,
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reaper.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}
