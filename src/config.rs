use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::orchestration::{BackoffPolicy, RunOptions};
use crate::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Name of the per-project state directory.
pub const STATE_DIR_NAME: &str = ".waverun";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_retries: u32,
    pub parallel: bool,
    pub concurrency: usize,
    pub continue_on_failure: bool,
    pub cache_enabled: bool,
    pub verify_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Extra regex patterns appended to the built-in verify denylist.
    pub denylist: Vec<String>,
    /// Shell command run by the CLI executor for each attempt.
    pub executor_command: Option<String>,
    pub cache_dir: Option<String>,
    pub state_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            parallel: false,
            concurrency: DEFAULT_CONCURRENCY,
            continue_on_failure: false,
            cache_enabled: true,
            verify_timeout_secs: DEFAULT_VERIFY_TIMEOUT_SECS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            denylist: Vec::new(),
            executor_command: None,
            cache_dir: None,
            state_dir: None,
        }
    }
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(STATE_DIR_NAME))
    }

    pub fn project_config_path(project: &Path) -> PathBuf {
        project.join(STATE_DIR_NAME).join("waverun.toml")
    }

    pub fn global_config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("waverun.toml"))
    }

    /// Load the project config, then the global one, then defaults.
    pub fn load(project: &Path) -> Result<Self> {
        let project_path = Self::project_config_path(project);
        if project_path.exists() {
            return Self::load_from(&project_path);
        }
        match Self::global_config_path() {
            Ok(global) if global.exists() => Self::load_from(&global),
            _ => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Validation("concurrency must be at least 1".into()));
        }
        if self.verify_timeout_secs == 0 || self.task_timeout_secs == 0 {
            return Err(Error::Validation("timeouts must be greater than zero".into()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(Error::Validation(
                "backoff_max_ms must not be below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn state_dir(&self, project: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) => expand_tilde(dir),
            None => project.join(STATE_DIR_NAME),
        }
    }

    pub fn cache_dir(&self, project: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => expand_tilde(dir),
            None => self.state_dir(project).join("cache"),
        }
    }

    pub fn ledger_dir(&self, project: &Path) -> PathBuf {
        self.state_dir(project).join("ledger")
    }

    /// Effective worker limit: sequential unless parallel mode is on.
    pub fn effective_concurrency(&self) -> usize {
        if self.parallel {
            self.concurrency.max(1)
        } else {
            1
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            concurrency: self.effective_concurrency(),
            continue_on_failure: self.continue_on_failure,
            cache_enabled: self.cache_enabled,
            force: false,
            resume: false,
            max_retries: self.max_retries,
            verify_timeout: Duration::from_secs(self.verify_timeout_secs),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
