//! Steward configuration.
//!
//! Loaded from `~/.steward/config.toml`. A missing file means defaults;
//! every key is optional:
//!
//! ```toml
//! journal-path = "/home/me/notes/journal.md"
//! recovery-section = "Command Recovery"
//! failure-limit = 3
//! attempt-timeout-secs = 30
//! poll-interval-ms = 100
//! ```
//!
//! The journal path is resolved through a chain:
//!
//! 1. `--journal <path>` — explicit per-command override
//! 2. `STEWARD_JOURNAL` env var
//! 3. `journal-path` in the config file
//! 4. `~/.steward/journal.md`

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{executor::DEFAULT_ATTEMPT_TIMEOUT, timeout::DEFAULT_POLL_INTERVAL, tracker};

/// Environment variable that overrides the configured journal path.
pub const JOURNAL_ENV: &str = "STEWARD_JOURNAL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not determine home directory")]
    NoHome,
}

/// Steward configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Where recovery notes go. See the module docs for the resolution order.
    pub journal_path: Option<PathBuf>,

    /// Journal section that receives recovery notes.
    pub recovery_section: String,

    /// Consecutive terminal failures before escalation.
    pub failure_limit: u32,

    /// Per-attempt timeout for a single command run.
    pub attempt_timeout_secs: u64,

    /// How often a supervised task's budget is checked.
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal_path: None,
            recovery_section: tracker::DEFAULT_RECOVERY_SECTION.to_string(),
            failure_limit: tracker::DEFAULT_FAILURE_LIMIT,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT.as_secs(),
            poll_interval_ms: u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(100),
        }
    }
}

impl Config {
    /// Load config from `~/.steward/config.toml`, or defaults if there is none.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The config file path: `~/.steward/config.toml`.
    pub fn path() -> Option<PathBuf> {
        steward_dir().map(|d| d.join("config.toml"))
    }

    /// Resolve the journal path: flag, then `STEWARD_JOURNAL`, then config, then default.
    pub fn journal_path(&self, explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        self.resolve_journal_path(explicit, env::var_os(JOURNAL_ENV).map(PathBuf::from))
    }

    fn resolve_journal_path(
        &self,
        explicit: Option<&Path>,
        from_env: Option<PathBuf>,
    ) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Some(path) = from_env.filter(|p| !p.as_os_str().is_empty()) {
            return Ok(path);
        }
        if let Some(path) = &self.journal_path {
            return Ok(path.clone());
        }
        steward_dir()
            .map(|d| d.join("journal.md"))
            .ok_or(ConfigError::NoHome)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn steward_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".steward"))
}
