use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::registry::{StageDef, StageRegistry};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub db_path: Option<String>,
    pub output_dir: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    /// Replaces the built-in pipeline when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_dispatches: usize,
    pub poll_interval_ms: u64,
    pub agent_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: 4,
            poll_interval_ms: 500,
            agent_timeout_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// External reasoning command used to enrich parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "claude".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScanConfig {
    /// Pattern classes reported as informational instead of blocking.
    pub allow: Vec<String>,
}

impl Config {
    pub fn data_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".testforge"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("testforge.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("testforge.log"))
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::data_dir()?.join("testforge.db")),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from("generated"))
    }

    /// Built-in pipeline unless `[[stages]]` overrides it. Always validated.
    pub fn registry(&self) -> Result<StageRegistry> {
        if self.stages.is_empty() {
            StageRegistry::default_pipeline()
        } else {
            StageRegistry::new(self.stages.clone())
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let mut config: Self = if path.exists() {
            toml::from_str(&fs::read_to_string(path)?)?
        } else {
            debug!("config file not found, using defaults");
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        debug!(
            max_concurrent = config.scheduler.max_concurrent_dispatches,
            max_attempts = config.retry.max_attempts,
            ai_enabled = config.ai.enabled,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let data_dir = Self::data_dir()?;
        if !data_dir.exists() {
            debug!(dir = %data_dir.display(), "creating data directory");
            fs::create_dir_all(&data_dir)?;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("TESTFORGE_DB_PATH") {
            self.db_path = Some(path);
        }
        if let Some(n) = std::env::var("TESTFORGE_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.scheduler.max_concurrent_dispatches = n;
        }
        if let Ok(v) = std::env::var("TESTFORGE_AI_ENABLED") {
            self.ai.enabled = flag_enabled(&v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_dispatches == 0 {
            return Err(Error::Validation(
                "scheduler.max_concurrent_dispatches must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Validation(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }
}

pub(crate) fn flag_enabled(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
