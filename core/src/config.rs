use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 3_600;
const DEFAULT_HISTORY_MAX_ENTRIES: usize = 50;

/// Service configuration. Loaded from an optional TOML file; every field has
/// a code default so a missing or partial file is fine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for durable state: per-owner history files, the live
    /// session snapshot, transcript bodies, and per-owner working
    /// directories. Created lazily on first use.
    pub state_dir: PathBuf,
    /// Shell used to host wrapped programs. Defaults to `$SHELL`, falling
    /// back to `/bin/bash`.
    pub shell: Option<String>,
    /// Sessions idle for longer than this are destroyed by the reaper.
    /// Zero or negative disables reaping entirely.
    pub idle_timeout_secs: i64,
    /// Interval between reaper sweeps, independent of session count.
    pub sweep_interval_secs: u64,
    /// Per-owner cap on durable history entries; oldest are dropped.
    pub history_max_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            shell: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            history_max_entries: DEFAULT_HISTORY_MAX_ENTRIES,
        }
    }
}

impl Config {
    /// Read the config file from the conventional location, falling back to
    /// defaults when the file is absent or unparsable. A broken file is a
    /// warning, not a startup failure.
    pub fn load() -> Self {
        let Some(path) = dirs::config_dir().map(|d| d.join("ttymux").join("config.toml")) else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(path = %path.display(), "ignoring unparsable config: {err}");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Idle threshold as a duration; `None` means "never reap".
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs > 0 {
            Some(Duration::from_secs(self.idle_timeout_secs as u64))
        } else {
            None
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/bash".to_string())
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ttymux"))
        .unwrap_or_else(|| std::env::temp_dir().join("ttymux"))
}
