use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::matcher::{DEFAULT_MIN_CONFIDENCE, DEFAULT_TOP_K};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Project used by `/v1/search` and `/v1/remove` when none is given.
    #[serde(default = "default_project")]
    pub default_project: String,
}

fn default_project() -> String {
    "DMS".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}
fn default_min_confidence() -> f32 {
    DEFAULT_MIN_CONFIDENCE
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Directory for `{project}.json` index snapshots. No snapshots when unset.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval_secs(),
            snapshot_dir: None,
        }
    }
}

fn default_resync_interval_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FeedbackConfig {
    /// Unanswered queries shorter than this (in bytes) are not recorded.
    #[serde(default)]
    pub min_unanswered_len: usize,
}

impl Config {
    /// The settings every bot instance is built with.
    pub fn bot_settings(&self) -> BotSettings {
        BotSettings {
            top_k: self.matching.top_k,
            min_confidence: self.matching.min_confidence,
            resync_interval: Duration::from_secs(self.sync.resync_interval_secs),
            snapshot_dir: self.sync.snapshot_dir.clone(),
        }
    }
}

/// Process-wide knobs shared by all bot instances.
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub top_k: usize,
    pub min_confidence: f32,
    pub resync_interval: Duration,
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            resync_interval: Duration::from_secs(default_resync_interval_secs()),
            snapshot_dir: None,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.matching.top_k == 0 {
        anyhow::bail!("matching.top_k must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.matching.min_confidence) {
        anyhow::bail!("matching.min_confidence must be in [0.0, 1.0]");
    }

    if config.sync.resync_interval_secs == 0 {
        anyhow::bail!("sync.resync_interval_secs must be >= 1");
    }

    Ok(config)
}

/// Typed form of the JSON stored in `projects.config`.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub data_source: String,
    #[serde(default)]
    pub project: String,
    /// Directory scanned for `*.json` / `*.yml` / `*.yaml` corpus files at cold start.
    #[serde(default)]
    pub dir_corpus: Option<PathBuf>,
    /// Explicit snapshot file; overrides `sync.snapshot_dir`.
    #[serde(default)]
    pub store_file: Option<PathBuf>,
}

const KNOWN_DRIVERS: [&str; 3] = ["", "sqlite", "sqlite3"];

impl ProjectConfig {
    /// Parses and validates a project's config. An empty string means defaults.
    pub fn parse(project: &str, raw: &str) -> Result<Self, Error> {
        let config: ProjectConfig = if raw.trim().is_empty() {
            ProjectConfig::default()
        } else {
            serde_json::from_str(raw).map_err(|e| {
                Error::Config(format!("project '{}' has invalid config: {}", project, e))
            })?
        };

        if !KNOWN_DRIVERS.contains(&config.driver.as_str()) {
            return Err(Error::Config(format!(
                "project '{}' uses unsupported driver '{}'",
                project, config.driver
            )));
        }

        if !config.project.is_empty() && config.project != project {
            return Err(Error::Config(format!(
                "project '{}' config names a different project '{}'",
                project, config.project
            )));
        }

        Ok(config)
    }

    /// Where this project's snapshot lives, if anywhere.
    pub fn snapshot_path(&self, project: &str, snapshot_dir: Option<&Path>) -> Option<PathBuf> {
        self.store_file
            .clone()
            .or_else(|| snapshot_dir.map(|dir| dir.join(format!("{}.json", project))))
    }
}
