use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::security::SignatureSettings;

const DEFAULT_CONFIG_FILE: &str = "server_telemetry.conf";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_API_TOKEN: &str = "telemetry-secret-token";
const DEFAULT_HMAC_SECRET: &str = "telemetry-hmac-secret";
const DEFAULT_HMAC_DRIFT: i64 = 30;
const DEFAULT_HMAC_REPLAY_TTL: i64 = 120;
const DEFAULT_DB_PATH: &str = "./telemetry.db";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Signed telemetry ingestion relay with live WebSocket fan-out", version)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[clap(long, env = "PORT", help = "Port to listen on.")]
    pub port: Option<u16>,

    #[clap(long, env = "TELEMETRY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "API_TOKEN", hide_env_values = true, help = "Static token expected in X-Api-Token.")]
    pub api_token: Option<String>,

    #[clap(long, env = "HMAC_SECRET", hide_env_values = true, help = "Shared HMAC-SHA256 signing secret.")]
    pub hmac_secret: Option<String>,

    #[clap(long, env = "HMAC_DRIFT", help = "Allowed clock drift for signed requests, in seconds.")]
    pub hmac_drift: Option<i64>,

    #[clap(long, env = "HMAC_REPLAY_TTL", help = "How long accepted signatures are remembered, in seconds.")]
    pub hmac_replay_ttl: Option<i64>,

    #[clap(long, env = "DB_PATH", help = "SQLite database file.")]
    pub db_path: Option<PathBuf>,

    #[clap(long, env = "DB_MAX_CONNECTIONS", help = "Maximum pooled database connections.")]
    pub db_max_connections: Option<u32>,

    #[clap(long, env = "TELEMETRY_LOG_DIR", help = "Directory for rolling log files. Console only when unset.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SEND_TIMEOUT_MS", help = "Per-viewer send timeout in milliseconds.")]
    pub send_timeout_ms: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            api_token: other.api_token.or(self.api_token),
            hmac_secret: other.hmac_secret.or(self.hmac_secret),
            hmac_drift: other.hmac_drift.or(self.hmac_drift),
            hmac_replay_ttl: other.hmac_replay_ttl.or(self.hmac_replay_ttl),
            db_path: other.db_path.or(self.db_path),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(DEFAULT_PORT),
            api_token: Some(DEFAULT_API_TOKEN.to_string()),
            hmac_secret: Some(DEFAULT_HMAC_SECRET.to_string()),
            hmac_drift: Some(DEFAULT_HMAC_DRIFT),
            hmac_replay_ttl: Some(DEFAULT_HMAC_REPLAY_TTL),
            db_path: Some(PathBuf::from(DEFAULT_DB_PATH)),
            db_max_connections: Some(DEFAULT_DB_MAX_CONNECTIONS),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            send_timeout_ms: Some(DEFAULT_SEND_TIMEOUT_MS),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn api_token(&self) -> &str {
        self.api_token.as_deref().unwrap_or(DEFAULT_API_TOKEN)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
    }

    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.unwrap_or(DEFAULT_SEND_TIMEOUT_MS))
    }

    pub fn signature_settings(&self) -> SignatureSettings {
        SignatureSettings {
            secret: self
                .hmac_secret
                .as_deref()
                .unwrap_or(DEFAULT_HMAC_SECRET)
                .as_bytes()
                .to_vec(),
            drift_secs: self.hmac_drift.unwrap_or(DEFAULT_HMAC_DRIFT),
            retention_secs: self.hmac_replay_ttl.unwrap_or(DEFAULT_HMAC_REPLAY_TTL),
        }
    }

    /// Both TLS paths, when both are configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.api_token().is_empty() {
            anyhow::bail!("api token must not be empty");
        }
        if self.hmac_secret.as_deref().is_some_and(str::is_empty) {
            anyhow::bail!("hmac secret must not be empty");
        }
        if self.hmac_drift.is_some_and(|d| d < 0) {
            anyhow::bail!("hmac drift must not be negative");
        }
        if self.hmac_replay_ttl.is_some_and(|t| t <= 0) {
            anyhow::bail!("hmac replay ttl must be positive");
        }
        if self.send_timeout_ms == Some(0) {
            anyhow::bail!("send timeout must be positive");
        }
        Ok(())
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    resolve_config(Config::parse())
}

// defaults -> config file -> environment/CLI
fn resolve_config(cli_args: Config) -> anyhow::Result<Config> {
    let mut current_config = Config::defaults();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_file_path.exists() {
        let file_config = read_config_file(&config_file_path)?;
        current_config = current_config.merge(file_config);
    } else if cli_args.config_path.is_some() {
        anyhow::bail!("config file not found at {}", config_file_path.display());
    }

    current_config = current_config.merge(cli_args);
    current_config.validate()?;
    Ok(current_config)
}

fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}
