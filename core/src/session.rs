//! Per-session state: phase machine, buffers, subscriber fan-out.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use ttymux_protocol::EndedReason;
use ttymux_protocol::SessionFile;
use ttymux_protocol::SessionId;
use ttymux_protocol::SessionMode;
use ttymux_protocol::SessionPhase;
use ttymux_protocol::SessionSummary;
use ttymux_protocol::TranscriptMessage;

use crate::buffers::PendingInputQueue;
use crate::buffers::RollingTail;
use crate::program::ProgramSpec;
use crate::readiness::ReadinessDetector;
use crate::sanitize::AnsiSanitizer;
use crate::sanitize::InputEchoLine;
use crate::spawn::PtyProcess;
use crate::transcript::Transcript;

const RAW_TAIL_HIGH: usize = 256 * 1024;
const RAW_TAIL_LOW: usize = 192 * 1024;
const REPLAY_HIGH_CHARS: usize = 64 * 1024;
const REPLAY_LOW_CHARS: usize = 48 * 1024;
const PENDING_INPUT_MAX_CHUNKS: usize = 64;

/// Phase values for the atomic. Ordering is the state machine: transitions
/// only ever move to a strictly larger value.
pub(crate) mod phase {
    pub(crate) const NOT_STARTED: u8 = 0;
    pub(crate) const STARTING: u8 = 1;
    pub(crate) const READY: u8 = 2;
    pub(crate) const EXITED: u8 = 3;
}

fn phase_from_u8(value: u8) -> SessionPhase {
    match value {
        phase::NOT_STARTED => SessionPhase::NotStarted,
        phase::STARTING => SessionPhase::Starting,
        phase::READY => SessionPhase::Ready,
        _ => SessionPhase::Exited,
    }
}

/// Callback invoked with each raw output chunk a subscriber sees.
pub type OutputCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One-shot callback invoked when the session reaches EXITED, with the final
/// summary and the reason. Runs before subscribers are cleared.
pub type ExitCallback = Box<dyn FnOnce(SessionSummary, EndedReason) + Send>;

/// Token returned by `subscribe`, used to unsubscribe. Callbacks have no
/// usable identity of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Sanitized replay view of the terminal, with input echo reconstruction
/// for terminal-mode sessions whose shell does not echo through our stream
/// fast enough to be useful on reconnect.
#[derive(Debug)]
struct ReplayState {
    sanitizer: AnsiSanitizer,
    text: String,
    echo: InputEchoLine,
}

impl ReplayState {
    fn new() -> Self {
        Self {
            sanitizer: AnsiSanitizer::new(),
            text: String::new(),
            echo: InputEchoLine::new(),
        }
    }

    fn push_output(&mut self, chunk: &[u8]) {
        let mut out = String::new();
        self.sanitizer.push(chunk, &mut out);
        self.text.push_str(&out);
        self.trim();
    }

    fn push_input(&mut self, input: &[u8]) {
        for line in self.echo.push(input) {
            if !self.text.ends_with('\n') && !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str("> ");
            self.text.push_str(&line);
            self.text.push('\n');
        }
        self.trim();
    }

    fn trim(&mut self) {
        if self.text.chars().count() > REPLAY_HIGH_CHARS {
            let drop = self.text.chars().count() - REPLAY_LOW_CHARS;
            if let Some((cut, _)) = self.text.char_indices().nth(drop) {
                self.text.drain(..cut);
            }
        }
    }
}

pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) owner: String,
    pub(crate) program: ProgramSpec,
    pub(crate) variant: String,
    pub(crate) mode: SessionMode,
    pub(crate) created_at: DateTime<Utc>,
    phase: AtomicU8,
    last_activity: StdMutex<Instant>,
    pub(crate) pending_input: StdMutex<PendingInputQueue>,
    pub(crate) transcript: StdMutex<Transcript>,
    raw_tail: StdMutex<RollingTail>,
    replay: StdMutex<ReplayState>,
    pub(crate) detector: StdMutex<ReadinessDetector>,
    files: StdMutex<Vec<SessionFile>>,
    subscribers: StdMutex<HashMap<u64, OutputCallback>>,
    next_subscriber_id: AtomicU64,
    history_saved: AtomicBool,
    title: StdMutex<Option<String>>,
    on_exit: StdMutex<Option<ExitCallback>>,
    pub(crate) process: PtyProcess,
    pub(crate) input_tx: mpsc::Sender<Vec<u8>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    fallback_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        owner: String,
        program: ProgramSpec,
        variant: String,
        mode: SessionMode,
        process: PtyProcess,
        input_tx: mpsc::Sender<Vec<u8>>,
        on_exit: Option<ExitCallback>,
    ) -> Self {
        Self {
            id,
            owner,
            program,
            variant,
            mode,
            created_at: Utc::now(),
            phase: AtomicU8::new(phase::NOT_STARTED),
            last_activity: StdMutex::new(Instant::now()),
            pending_input: StdMutex::new(PendingInputQueue::new(PENDING_INPUT_MAX_CHUNKS)),
            transcript: StdMutex::new(Transcript::new()),
            raw_tail: StdMutex::new(RollingTail::new(RAW_TAIL_HIGH, RAW_TAIL_LOW)),
            replay: StdMutex::new(ReplayState::new()),
            detector: StdMutex::new(ReadinessDetector::new()),
            files: StdMutex::new(Vec::new()),
            subscribers: StdMutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            history_saved: AtomicBool::new(false),
            title: StdMutex::new(None),
            on_exit: StdMutex::new(on_exit),
            process,
            input_tx,
            tasks: StdMutex::new(Vec::new()),
            fallback_timer: StdMutex::new(None),
        }
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        phase_from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == phase::READY
    }

    pub(crate) fn is_starting(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == phase::STARTING
    }

    /// READY is only reachable from STARTING; readiness means nothing before
    /// the program invocation has been written.
    pub(crate) fn promote_ready(&self) -> bool {
        self.phase
            .compare_exchange(
                phase::STARTING,
                phase::READY,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn is_exited(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == phase::EXITED
    }

    /// Advance the phase atomic to `target` if it is strictly ahead of the
    /// current value. Returns true when this call performed the transition.
    /// Backward transitions are impossible by construction.
    pub(crate) fn advance_phase(&self, target: u8) -> bool {
        let mut current = self.phase.load(Ordering::SeqCst);
        loop {
            if current >= target {
                return false;
            }
            match self.phase.compare_exchange(
                current,
                target,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn touch(&self) {
        if let Ok(mut guard) = self.last_activity.lock() {
            *guard = Instant::now();
        }
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|guard| guard.elapsed())
            .unwrap_or_default()
    }

    /// First writer wins; used to persist history exactly once per session.
    pub(crate) fn mark_history_saved(&self) -> bool {
        !self.history_saved.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn take_exit_handler(&self) -> Option<ExitCallback> {
        self.on_exit.lock().ok().and_then(|mut slot| slot.take())
    }

    pub(crate) fn subscribe(&self, callback: OutputCallback) -> SubscriberId {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, callback);
        }
        SubscriberId(id)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriberId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id.0);
        }
    }

    pub(crate) fn clear_subscribers(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }

    /// Best-effort delivery to every subscriber. A panicking callback is
    /// removed and logged; it never takes down the pump or its peers.
    pub(crate) fn fan_out(&self, chunk: &[u8]) {
        let snapshot: Vec<(u64, OutputCallback)> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .iter()
                .map(|(id, cb)| (*id, Arc::clone(cb)))
                .collect(),
            Err(_) => return,
        };
        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(chunk))).is_err() {
                tracing::warn!(session_id = %self.id, subscriber = id, "output subscriber panicked; removing");
                if let Ok(mut subscribers) = self.subscribers.lock() {
                    subscribers.remove(&id);
                }
            }
        }
    }

    pub(crate) fn record_output(&self, chunk: &[u8]) {
        if let Ok(mut tail) = self.raw_tail.lock() {
            tail.extend(chunk);
        }
        if let Ok(mut replay) = self.replay.lock() {
            replay.push_output(chunk);
        }
        if self.mode == SessionMode::Chat
            && let Ok(mut transcript) = self.transcript.lock()
        {
            transcript.push_output(chunk);
        }
    }

    pub(crate) fn record_input_echo(&self, input: &[u8]) {
        if self.mode == SessionMode::Terminal
            && let Ok(mut replay) = self.replay.lock()
        {
            replay.push_input(input);
        }
    }

    pub(crate) fn raw_tail_bytes(&self) -> Vec<u8> {
        self.raw_tail
            .lock()
            .map(|tail| tail.as_bytes().to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn replay_text(&self) -> String {
        self.replay
            .lock()
            .map(|replay| replay.text.clone())
            .unwrap_or_default()
    }

    pub(crate) fn transcript_messages(&self) -> Vec<TranscriptMessage> {
        self.transcript
            .lock()
            .map(|t| t.messages())
            .unwrap_or_default()
    }

    pub(crate) fn has_transcript(&self) -> bool {
        self.transcript
            .lock()
            .map(|t| t.has_user_message())
            .unwrap_or(false)
    }

    pub(crate) fn set_title_if_empty(&self, title: String) -> bool {
        if let Ok(mut guard) = self.title.lock()
            && guard.is_none()
        {
            *guard = Some(title);
            return true;
        }
        false
    }

    pub(crate) fn set_title(&self, title: String) {
        if let Ok(mut guard) = self.title.lock() {
            *guard = Some(title);
        }
    }

    pub(crate) fn title(&self) -> Option<String> {
        self.title.lock().ok().and_then(|guard| guard.clone())
    }

    pub(crate) fn add_file(&self, file: SessionFile) -> usize {
        match self.files.lock() {
            Ok(mut files) => {
                files.push(file);
                files.len()
            }
            Err(_) => 0,
        }
    }

    pub(crate) fn files(&self) -> Vec<SessionFile> {
        self.files
            .lock()
            .map(|files| files.clone())
            .unwrap_or_default()
    }

    pub(crate) fn files_count(&self) -> usize {
        self.files.lock().map(|files| files.len()).unwrap_or(0)
    }

    pub(crate) fn register_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    pub(crate) fn arm_fallback_timer(&self, handle: JoinHandle<()>) {
        if let Ok(mut slot) = self.fallback_timer.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    pub(crate) fn cancel_fallback_timer(&self) {
        if let Ok(mut slot) = self.fallback_timer.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }

    pub(crate) fn abort_tasks(&self) {
        self.cancel_fallback_timer();
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }

    pub(crate) fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            owner: self.owner.clone(),
            program: self.program.id.clone(),
            variant: self.variant.clone(),
            mode: self.mode,
            phase: self.phase(),
            created_at: self.created_at,
            title: self.title(),
            files_count: self.files_count(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort_tasks();
        self.process.kill();
    }
}
