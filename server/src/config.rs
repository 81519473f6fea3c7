//! Configuration management for Huddle Server

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub turn: TurnConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub calls: CallsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
    /// Finished call records older than this are purged.
    pub call_retention_days: u64,
    pub cleanup_interval_minutes: u64,
    pub session_ttl_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    pub enabled: bool,
    pub urls: Vec<String>,
    pub username: String,
    /// Shared secret with the TURN server (REST API credentials).
    pub secret: String,
    pub credential_type: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub master_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Invitees still ringing after this long are treated as rejected.
    pub invite_timeout_secs: u64,
    /// Non-terminal participants per call, initiator included.
    pub max_participants: usize,
    pub sweep_interval_secs: u64,
}

impl CallsConfig {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            invite_timeout_secs: 45,
            max_participants: 8,
            sweep_interval_secs: 5,
        }
    }
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            Ok(config)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9443,
            },
            storage: StorageConfig {
                database_path: "./data/huddle.db".to_string(),
                call_retention_days: 30,
                cleanup_interval_minutes: 60,
                session_ttl_hours: 24 * 30,
            },
            turn: TurnConfig {
                enabled: true,
                urls: vec![
                    "turn:turn.example.com:3478".to_string(),
                    "turns:turn.example.com:5349".to_string(),
                ],
                username: "huddle".to_string(),
                secret: "change-this-secret".to_string(),
                credential_type: "password".to_string(),
                ttl_seconds: 86400, // 24 hours
            },
            admin: AdminConfig {
                master_key: "CHANGE-THIS-ADMIN-KEY-IMMEDIATELY".to_string(),
            },
            calls: CallsConfig::default(),
        }
    }
}
