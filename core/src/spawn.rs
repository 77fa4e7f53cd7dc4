//! PTY process spawning and I/O plumbing.
//!
//! A spawned session is an interactive shell on a pseudo-terminal, with
//! three background tasks: a blocking reader pumping PTY output into a
//! broadcast channel, a writer draining an mpsc channel into the PTY, and a
//! waiter resolving the exit status into a oneshot.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const READ_BUFFER_SIZE: usize = 8192;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const WRITE_CHANNEL_CAPACITY: usize = 128;

/// Live PTY process handle owned by a session.
pub(crate) struct PtyProcess {
    writer_tx: mpsc::Sender<Vec<u8>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    exited: Arc<AtomicBool>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    wait_handle: JoinHandle<()>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    pub(crate) fn writer_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.writer_tx.clone()
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Shared liveness flag for tasks that must not keep the owning session
    /// alive.
    pub(crate) fn exited_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exited)
    }

    /// Sends SIGKILL. Failure is ignored: the process has usually already
    /// exited by the time teardown races the killer.
    pub(crate) fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }

    pub(crate) fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| anyhow::anyhow!("pty master lock poisoned"))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("resize pty")
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        self.wait_handle.abort();
    }
}

pub(crate) struct SpawnedProcess {
    pub(crate) process: PtyProcess,
    pub(crate) output_rx: broadcast::Receiver<Vec<u8>>,
    pub(crate) exit_rx: oneshot::Receiver<i32>,
}

/// Spawns an interactive shell on a fresh PTY with the given environment and
/// working directory. The program invocation itself is written later by the
/// session startup task, after the shell settles.
pub(crate) async fn spawn_shell_process(
    shell: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    size: (u16, u16),
) -> anyhow::Result<SpawnedProcess> {
    let pty_system = native_pty_system();
    let (cols, rows) = size;
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| anyhow::anyhow!("failed to open pty: {err}"))?;

    let mut command = CommandBuilder::new(shell);
    command.cwd(cwd);
    command.env_clear();
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(command)
        .map_err(|err| anyhow::anyhow!("failed to spawn shell: {err}"))?;
    let killer = child.clone_killer();

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| anyhow::anyhow!("failed to clone pty reader: {err}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|err| anyhow::anyhow!("failed to take pty writer: {err}"))?;

    let (output_tx, output_rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITE_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();
    let exited = Arc::new(AtomicBool::new(false));

    let reader_tx = output_tx.clone();
    let reader_handle = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if reader_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => break,
            }
        }
    });

    let writer = Arc::new(StdMutex::new(writer));
    let writer_handle = tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            let writer = Arc::clone(&writer);
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = writer
                    .lock()
                    .map_err(|_| std::io::Error::other("pty writer lock poisoned"))?;
                guard.write_all(&bytes)?;
                guard.flush()
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
    });

    let wait_exited = Arc::clone(&exited);
    let wait_handle = tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        wait_exited.store(true, Ordering::SeqCst);
        let _ = exit_tx.send(code);
    });

    let process = PtyProcess {
        writer_tx,
        killer: StdMutex::new(killer),
        master: StdMutex::new(pair.master),
        exited,
        reader_handle,
        writer_handle,
        wait_handle,
    };

    Ok(SpawnedProcess {
        process,
        output_rx,
        exit_rx,
    })
}
