//! End-to-end registry tests against real PTY processes.
//!
//! Sessions here wrap `cat` instead of a real AI CLI, with tiny settle and
//! fallback intervals so readiness and teardown happen quickly.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use ttymux_core::Config;
use ttymux_core::ExitCallback;
use ttymux_core::ProgramCatalog;
use ttymux_core::ProgramSpec;
use ttymux_core::ProgramVariant;
use ttymux_core::SessionError;
use ttymux_core::SessionRegistry;
use ttymux_core::StaticEnvResolver;
use ttymux_core::protocol::EndedReason;
use ttymux_core::protocol::HistoryEntry;
use ttymux_core::protocol::LiveSessionRecord;
use ttymux_core::protocol::MessageRole;
use ttymux_core::protocol::SessionFile;
use ttymux_core::protocol::SessionId;
use ttymux_core::protocol::SessionMode;
use ttymux_core::protocol::SessionPhase;
use ttymux_core::protocol::SessionSummary;

fn cat_program() -> ProgramSpec {
    ProgramSpec {
        id: "cat".to_string(),
        name: "Cat".to_string(),
        command: "cat".to_string(),
        args: Vec::new(),
        variants: vec![ProgramVariant::new("default", "Default", &[])],
        ready_signatures: Vec::new(),
        readiness_fallback: Duration::from_millis(200),
        startup_settle: Duration::from_millis(10),
        paced_input: false,
    }
}

fn test_config(state_dir: &std::path::Path) -> Config {
    Config {
        state_dir: state_dir.to_path_buf(),
        shell: Some("/bin/sh".to_string()),
        // Reaper off unless a test overrides it.
        idle_timeout_secs: 0,
        sweep_interval_secs: 1,
        history_max_entries: 50,
    }
}

fn test_env() -> Arc<StaticEnvResolver> {
    let mut env = std::collections::HashMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    Arc::new(StaticEnvResolver(env))
}

async fn make_registry(state_dir: &std::path::Path) -> SessionRegistry {
    SessionRegistry::new(
        test_config(state_dir),
        ProgramCatalog::new(vec![cat_program()]),
        test_env(),
    )
    .await
}

async fn wait_until<F>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_program_and_variant_fail_before_spawn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let err = registry
        .create_session("alice", "emacs", "default", SessionMode::Terminal, None)
        .await
        .expect_err("unknown program must fail");
    assert!(matches!(err, SessionError::UnknownProgram { .. }));

    let err = registry
        .create_session("alice", "cat", "turbo", SessionMode::Terminal, None)
        .await
        .expect_err("unknown variant must fail");
    assert!(matches!(err, SessionError::UnknownVariant { .. }));

    assert!(registry.list_active_sessions("alice").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_input_flushes_on_readiness_and_reaches_subscribers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let summary = registry
        .create_session("alice", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");
    assert!(matches!(
        summary.phase,
        SessionPhase::NotStarted | SessionPhase::Starting
    ));

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry
        .subscribe(
            &summary.session_id,
            Arc::new(move |chunk: &[u8]| {
                sink.lock().unwrap().extend_from_slice(chunk);
            }),
        )
        .await
        .expect("subscribe");

    // Sent before readiness: must queue and flush once the fallback fires.
    registry
        .send_input(&summary.session_id, b"queued-input-marker\n")
        .await
        .expect("send input");

    wait_until("queued input echoed back", Duration::from_secs(15), || {
        String::from_utf8_lossy(&seen.lock().unwrap()).contains("queued-input-marker")
    })
    .await;

    let summary = registry
        .get_session_summary(&summary.session_id)
        .await
        .expect("summary");
    assert_eq!(summary.phase, SessionPhase::Ready);

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("destroy");
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_is_idempotent_and_writes_one_history_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let summary = registry
        .create_session("bob", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("first destroy");
    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("second destroy is a no-op");
    registry
        .destroy_session(&SessionId("no-such-session".to_string()))
        .await
        .expect("unknown id is tolerated");

    assert!(registry.get_active_session("bob").await.is_none());

    let history = registry.list_history("bob").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].session_id, summary.session_id);
    assert_eq!(history[0].ended_reason, Some(EndedReason::Destroyed));
    assert!(history[0].ended_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_subscriber_does_not_break_delivery_to_peers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let summary = registry
        .create_session("carol", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");

    registry
        .subscribe(
            &summary.session_id,
            Arc::new(|_chunk: &[u8]| panic!("misbehaving subscriber")),
        )
        .await
        .expect("subscribe panicking");

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry
        .subscribe(
            &summary.session_id,
            Arc::new(move |chunk: &[u8]| {
                sink.lock().unwrap().extend_from_slice(chunk);
            }),
        )
        .await
        .expect("subscribe collector");

    registry
        .send_input(&summary.session_id, b"peer-delivery-marker\n")
        .await
        .expect("send input");

    wait_until("peer subscriber received output", Duration::from_secs(15), || {
        String::from_utf8_lossy(&seen.lock().unwrap()).contains("peer-delivery-marker")
    })
    .await;

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("destroy");
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_transcript_survives_session_teardown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let summary = registry
        .create_session("dana", "cat", "default", SessionMode::Chat, None)
        .await
        .expect("create session");

    registry
        .send_chat_input(&summary.session_id, "hello transcript")
        .await
        .expect("send chat input");

    // cat echoes the message back, which becomes the assistant reply.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let recorded = registry
            .get_transcript("dana", &summary.session_id)
            .await
            .is_some_and(|m| {
                m.iter().any(|msg| {
                    msg.role == MessageRole::Assistant && msg.content.contains("hello transcript")
                })
            });
        if recorded {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for assistant message"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let live_summary = registry
        .get_session_summary(&summary.session_id)
        .await
        .expect("summary");
    assert_eq!(live_summary.title.as_deref(), Some("hello transcript"));

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("destroy");

    let history = registry.list_history("dana").await;
    assert_eq!(history.len(), 1);
    assert!(history[0].has_transcript);
    assert_eq!(history[0].title.as_deref(), Some("hello transcript"));

    let persisted = registry
        .get_transcript("dana", &summary.session_id)
        .await
        .expect("persisted transcript");
    assert_eq!(persisted[0].role, MessageRole::User);
    assert_eq!(persisted[0].content, "hello transcript");
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_reaper_destroys_stale_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.idle_timeout_secs = 1;
    config.sweep_interval_secs = 1;
    let registry = SessionRegistry::new(
        config,
        ProgramCatalog::new(vec![cat_program()]),
        test_env(),
    )
    .await;

    let summary = registry
        .create_session("erin", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");

    let deadline = Instant::now() + Duration::from_secs(20);
    while !registry.list_active_sessions("erin").await.is_empty() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for reaper to collect idle session"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let history = registry.list_history("erin").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].session_id, summary.session_id);
    assert_eq!(history[0].ended_reason, Some(EndedReason::IdleTimeout));
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_recovers_orphans_from_live_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");

    let records = vec![LiveSessionRecord {
        session_id: SessionId("frank-cat-1700000000000-0000".to_string()),
        owner: "frank".to_string(),
        program: "cat".to_string(),
        variant: "default".to_string(),
        mode: SessionMode::Terminal,
        created_at: chrono::Utc::now(),
    }];
    let snapshot_path = dir.path().join("live-sessions.json");
    std::fs::write(
        &snapshot_path,
        serde_json::to_vec(&records).expect("serialize records"),
    )
    .expect("write snapshot");

    let registry = make_registry(dir.path()).await;

    assert!(!snapshot_path.exists(), "snapshot must be consumed");
    let history = registry.list_history("frank").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].ended_reason, Some(EndedReason::ServiceRestart));
    assert!(history[0].ended_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn history_rename_and_delete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let summary = registry
        .create_session("gwen", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");
    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("destroy");

    assert!(
        registry
            .rename_history("gwen", &summary.session_id, "renamed run")
            .await
    );
    let history = registry.list_history("gwen").await;
    assert_eq!(history[0].title.as_deref(), Some("renamed run"));

    assert!(registry.delete_history("gwen", &summary.session_id).await);
    assert!(registry.list_history("gwen").await.is_empty());
    assert!(!registry.delete_history("gwen", &summary.session_id).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn shell_prompt_before_launch_does_not_trigger_readiness() {
    let dir = tempfile::tempdir().expect("tempdir");
    // A long settle keeps the session in the pre-launch window while the
    // hosting shell prints its prompt; a long fallback keeps the timer out
    // of the picture.
    let program = ProgramSpec {
        readiness_fallback: Duration::from_secs(30),
        startup_settle: Duration::from_millis(300),
        ..cat_program()
    };
    let mut env = std::collections::HashMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env.insert("PS1".to_string(), "$ ".to_string());
    let registry = SessionRegistry::new(
        test_config(dir.path()),
        ProgramCatalog::new(vec![program]),
        Arc::new(StaticEnvResolver(env)),
    )
    .await;

    let summary = registry
        .create_session("iris", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry
        .subscribe(
            &summary.session_id,
            Arc::new(move |chunk: &[u8]| {
                sink.lock().unwrap().extend_from_slice(chunk);
            }),
        )
        .await
        .expect("subscribe");

    registry
        .send_input(&summary.session_id, b"held-until-ready\n")
        .await
        .expect("send input");

    // Give the shell ample time to print its prompt and the launch to
    // complete; neither may count as program readiness.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let summary = registry
        .get_session_summary(&summary.session_id)
        .await
        .expect("summary");
    assert!(
        matches!(
            summary.phase,
            SessionPhase::NotStarted | SessionPhase::Starting
        ),
        "prompt output promoted the session to {:?}",
        summary.phase
    );
    assert!(
        !String::from_utf8_lossy(&seen.lock().unwrap()).contains("held-until-ready"),
        "queued input leaked into the shell before readiness"
    );

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("destroy");
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_handler_fires_once_on_destroy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let fired: Arc<Mutex<Vec<(SessionSummary, EndedReason)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    let handler: ExitCallback = Box::new(move |summary, reason| {
        sink.lock().unwrap().push((summary, reason));
    });
    let summary = registry
        .create_session("judy", "cat", "default", SessionMode::Terminal, Some(handler))
        .await
        .expect("create session");

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("first destroy");
    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("second destroy is a no-op");

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 1);
    let (exit_summary, reason) = &fired[0];
    assert_eq!(exit_summary.session_id, summary.session_id);
    assert_eq!(exit_summary.phase, SessionPhase::Exited);
    assert_eq!(*reason, EndedReason::Destroyed);
}

#[tokio::test(flavor = "multi_thread")]
async fn history_index_on_disk_tracks_live_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let summary = registry
        .create_session("kara", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");

    // The durable index is written at creation, not only at teardown.
    let index_path = dir.path().join("history").join("kara.json");
    let read_entries = || -> Vec<HistoryEntry> {
        let bytes = std::fs::read(&index_path).expect("read history index");
        serde_json::from_slice(&bytes).expect("parse history index")
    };
    let entries = read_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].session_id, summary.session_id);
    assert!(entries[0].ended_at.is_none());
    assert_eq!(entries[0].files_count, 0);

    registry
        .add_session_file(
            &summary.session_id,
            SessionFile {
                path: dir.path().join("notes.txt"),
                name: "notes.txt".to_string(),
                added_at: chrono::Utc::now(),
            },
        )
        .await
        .expect("add file");

    let entries = read_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].files_count, 1);

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("destroy");

    let entries = read_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].files_count, 1);
    assert_eq!(entries[0].ended_reason, Some(EndedReason::Destroyed));
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_reaper_spares_sessions_with_recent_activity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.idle_timeout_secs = 1;
    config.sweep_interval_secs = 1;
    let registry = SessionRegistry::new(
        config,
        ProgramCatalog::new(vec![cat_program()]),
        test_env(),
    )
    .await;

    let stale = registry
        .create_session("lena", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create stale session");
    let busy = registry
        .create_session("mike", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create busy session");

    let deadline = Instant::now() + Duration::from_secs(20);
    while !registry.list_active_sessions("lena").await.is_empty() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for reaper to collect idle session"
        );
        // Activity on the busy session must keep it out of the sweep.
        registry
            .send_input(&busy.session_id, b"ping\n")
            .await
            .expect("keep busy session fresh");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    assert!(
        registry.get_active_session("mike").await.is_some(),
        "reaper collected a session with recent activity"
    );
    let history = registry.list_history("lena").await;
    assert_eq!(history[0].session_id, stale.session_id);
    assert_eq!(history[0].ended_reason, Some(EndedReason::IdleTimeout));

    registry
        .destroy_session(&busy.session_id)
        .await
        .expect("destroy busy session");
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_chunks_flush_in_submission_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let summary = registry
        .create_session("nora", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry
        .subscribe(
            &summary.session_id,
            Arc::new(move |chunk: &[u8]| {
                sink.lock().unwrap().extend_from_slice(chunk);
            }),
        )
        .await
        .expect("subscribe");

    for line in ["first-order-marker", "second-order-marker", "third-order-marker"] {
        registry
            .send_input(&summary.session_id, format!("{line}\n").as_bytes())
            .await
            .expect("send input");
    }

    wait_until("all markers echoed back", Duration::from_secs(15), || {
        let text = String::from_utf8_lossy(&seen.lock().unwrap()).to_string();
        text.contains("first-order-marker")
            && text.contains("second-order-marker")
            && text.contains("third-order-marker")
    })
    .await;

    let text = String::from_utf8_lossy(&seen.lock().unwrap()).to_string();
    let first = text.find("first-order-marker").expect("first marker");
    let second = text.find("second-order-marker").expect("second marker");
    let third = text.find("third-order-marker").expect("third marker");
    assert!(first < second && second < third, "out of order: {text:?}");

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("destroy");
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_buffer_reconstructs_terminal_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = make_registry(dir.path()).await;

    let summary = registry
        .create_session("hank", "cat", "default", SessionMode::Terminal, None)
        .await
        .expect("create session");

    registry
        .send_input(&summary.session_id, b"replay-marker\n")
        .await
        .expect("send input");

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let text = registry
            .replay_buffer(&summary.session_id)
            .await
            .expect("replay buffer");
        if text.contains("> replay-marker") {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for replay tail, got: {text:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    registry
        .destroy_session(&summary.session_id)
        .await
        .expect("destroy");
}
