use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RESERVATION_ESTIMATE: u64 = 20_000;
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;

/// Engine configuration, read from `~/.kiln/kiln.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tasks allowed in flight at once.
    pub max_concurrent: usize,
    /// Agent calls per task, including the first.
    pub max_attempts: u32,
    /// Token ceiling for the whole run. Absent means unbounded.
    pub token_budget: Option<u64>,
    /// Tokens held per in-flight task until its real usage is known.
    pub reservation_estimate: u64,
    /// Fraction of the ceiling that triggers the budget warning.
    pub warning_ratio: f64,
    /// Pause for approval once about half the tasks have settled.
    pub midpoint_gate: bool,
    /// Agent CLI binary.
    pub agent_command: String,
    pub agent_timeout_secs: u64,
    /// Record a commit per successful task.
    pub use_git: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            token_budget: None,
            reservation_estimate: DEFAULT_RESERVATION_ESTIMATE,
            warning_ratio: crate::budget::DEFAULT_WARNING_RATIO,
            midpoint_gate: false,
            agent_command: "claude".to_string(),
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            use_git: true,
        }
    }
}

impl Config {
    pub fn kiln_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".kiln"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::kiln_dir()?.join("kiln.toml"))
    }

    /// Load the user config, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(?config, "config loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Validation("max_concurrent must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Validation("max_attempts must be at least 1".into()));
        }
        if !(self.warning_ratio > 0.0 && self.warning_ratio <= 1.0) {
            return Err(Error::Validation("warning_ratio must be in (0, 1]".into()));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}
