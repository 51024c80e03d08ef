use crate::core::applier::{ApplyMode, RulesetApplier};
use crate::core::safety::{DEFAULT_ADMIN_PORT, SafetyAnalyzer};
use crate::elevation::ElevationMethod;
use crate::utils::{default_database_path, get_data_dir};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";

/// Upper bound for `command_timeout_secs`
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Rule-engine binary, looked up on `PATH` unless absolute
    #[serde(default = "default_nft_binary")]
    pub nft_binary: PathBuf,
    /// Simulation mode: nothing is ever spawned
    #[serde(default)]
    pub simulate: bool,
    /// Store file; `None` means `<data dir>/policies.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Wrapper for the apply step; `None` auto-detects
    #[serde(default)]
    pub elevation: Option<ElevationMethod>,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    /// Timeout for rule-engine calls (0 disables, clamped to 3600 seconds).
    /// Applies through sudo, run0 or pkexec are not timed.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Default row count for history and audit listings
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nft_binary: default_nft_binary(),
            simulate: false,
            database_path: None,
            elevation: None,
            admin_port: DEFAULT_ADMIN_PORT,
            command_timeout_secs: default_command_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_nft_binary() -> PathBuf {
    PathBuf::from("nft")
}

fn default_admin_port() -> u16 {
    DEFAULT_ADMIN_PORT
}

fn default_command_timeout() -> u64 {
    30
}

fn default_history_limit() -> usize {
    200
}

impl AppConfig {
    /// Clamps out-of-range values loaded from disk
    pub fn validated(mut self) -> Self {
        if self.command_timeout_secs > MAX_COMMAND_TIMEOUT_SECS {
            tracing::warn!(
                "command_timeout_secs {} exceeds {MAX_COMMAND_TIMEOUT_SECS}, clamping",
                self.command_timeout_secs
            );
            self.command_timeout_secs = MAX_COMMAND_TIMEOUT_SECS;
        }
        if let Err(e) = validators::validate_port(self.admin_port) {
            tracing::warn!("admin_port: {e}, using {DEFAULT_ADMIN_PORT}");
            self.admin_port = DEFAULT_ADMIN_PORT;
        }
        if self.history_limit == 0 {
            self.history_limit = default_history_limit();
        }
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0)
            .then(|| Duration::from_secs(self.command_timeout_secs.min(MAX_COMMAND_TIMEOUT_SECS)))
    }

    /// Configured store path, or the default under the data dir
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path.clone().or_else(default_database_path)
    }

    pub fn applier(&self) -> RulesetApplier {
        let mode = if self.simulate {
            ApplyMode::Simulated
        } else {
            ApplyMode::Live
        };
        RulesetApplier::new(self.nft_binary.clone(), mode, self.elevation)
            .with_timeout(self.timeout())
    }

    pub fn analyzer(&self) -> SafetyAnalyzer {
        SafetyAnalyzer::new(self.admin_port)
    }
}

/// `<data dir>/config.json`
pub fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Saves the config to the default location. No-op without a data dir.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_config_to(&path, config).await,
        None => Ok(()),
    }
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file created with mode 0o600.
/// 2. Flushes it to disk.
/// 3. Atomically renames it over `path`.
pub async fn save_config_to(path: &Path, config: &AppConfig) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let json = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)
        .await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from the default location, or defaults if missing.
pub async fn load_config() -> AppConfig {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => AppConfig::default(),
    }
}

/// Loads the config at `path`; missing or corrupt files yield defaults.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => config.validated(),
            Err(e) => {
                tracing::warn!("Ignoring corrupt config {}: {e}", path.display());
                AppConfig::default()
            }
        },
        Err(_) => AppConfig::default(),
    }
}
