use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub bronze_dir: Option<PathBuf>,
    #[serde(default)]
    pub duckdb_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Shared secret expected in the X-API-Key header. Empty disables the check.
    #[serde(default)]
    pub api_key: String,
    /// HMAC-SHA256 signing secret. Empty disables signature verification.
    #[serde(default)]
    pub hmac_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,
}

fn default_debounce_secs() -> u64 {
    60
}
fn default_pipeline_timeout_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdempotencyConfig {
    /// Ledger entries older than this many days are swept on write.
    /// Zero keeps the ledger forever.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

impl StorageConfig {
    pub fn csv_path(&self) -> PathBuf {
        self.data_dir.join("logs.csv")
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("logs.sqlite")
    }

    pub fn bronze_root(&self) -> PathBuf {
        self.bronze_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("bronze"))
    }

    pub fn duckdb_file(&self) -> PathBuf {
        self.duckdb_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("hvdc.duckdb"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Secrets may come from the environment instead of the config file.
    if let Ok(key) = std::env::var("HVDC_API_KEY") {
        config.auth.api_key = key;
    }
    if let Ok(secret) = std::env::var("HVDC_HMAC_SECRET") {
        config.auth.hmac_secret = secret;
    }

    if config.server.bind.is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }
    if config.server.debounce_secs == 0 {
        anyhow::bail!("server.debounce_secs must be >= 1");
    }
    if config.server.pipeline_timeout_secs == 0 {
        anyhow::bail!("server.pipeline_timeout_secs must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_fall_back_to_data_dir() {
        let cfg: Config = toml::from_str(
            r#"
[storage]
data_dir = "data"

[server]
bind = "127.0.0.1:0"
"#,
        )
        .unwrap();
        assert_eq!(cfg.storage.csv_path(), PathBuf::from("data/logs.csv"));
        assert_eq!(cfg.storage.sqlite_path(), PathBuf::from("data/logs.sqlite"));
        assert_eq!(cfg.storage.bronze_root(), PathBuf::from("data/bronze"));
        assert_eq!(cfg.storage.duckdb_file(), PathBuf::from("data/hvdc.duckdb"));
        assert_eq!(cfg.server.debounce_secs, 60);
        assert_eq!(cfg.idempotency.retention_days, 30);
    }

    #[test]
    fn explicit_bronze_and_duckdb_paths_win() {
        let cfg: Config = toml::from_str(
            r#"
[storage]
data_dir = "data"
bronze_dir = "elsewhere/bronze"
duckdb_path = "elsewhere/kpi.duckdb"

[server]
bind = "127.0.0.1:0"
"#,
        )
        .unwrap();
        assert_eq!(cfg.storage.bronze_root(), PathBuf::from("elsewhere/bronze"));
        assert_eq!(
            cfg.storage.duckdb_file(),
            PathBuf::from("elsewhere/kpi.duckdb")
        );
    }
}
