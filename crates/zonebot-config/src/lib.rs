//! Zonebot Configuration
//!
//! TOML configuration loading with environment variable overrides

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Numeric Telegram user id of the bot owner. The owner bypasses all
    /// group-admin checks and is the only identity allowed to add the bot
    /// to new groups.
    #[serde(default)]
    pub owner_id: i64,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Single external quarantine service base URL, if any.
    pub base_url: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default = "default_self_bot_id")]
    pub self_bot_id: String,
    /// When enabled, registered quarantine peers are fanned out to in
    /// addition to `base_url`.
    #[serde(default)]
    pub sync_enabled: bool,
    #[serde(default = "default_release_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
    #[serde(default)]
    pub peers: Vec<PeerInstance>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            secret_key: None,
            self_bot_id: default_self_bot_id(),
            sync_enabled: false,
            timeout_secs: default_release_timeout(),
            retry_attempts: default_retry_attempts(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            result_ttl_secs: default_result_ttl(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInstance {
    pub id: String,
    pub url: String,
    pub secret: Option<String>,
    #[serde(default = "default_peer_role")]
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this instance. When set, the self-ping keep-alive loop
    /// is started against `{external_url}/ping`.
    pub external_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            external_url: None,
        }
    }
}

fn default_self_bot_id() -> String {
    "trigger_1".to_string()
}

fn default_release_timeout() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_result_ttl() -> u64 {
    300
}

fn default_peer_role() -> String {
    "quarantine".to_string()
}

fn default_port() -> u16 {
    3000
}

impl ReleaseConfig {
    /// Peers participating in the release fan-out. Only quarantine-role
    /// peers are targeted, and only when sync is enabled.
    pub fn quarantine_peers(&self) -> Vec<&PeerInstance> {
        if !self.sync_enabled {
            return Vec::new();
        }
        self.peers
            .iter()
            .filter(|peer| peer.role.eq_ignore_ascii_case("quarantine"))
            .collect()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from environment variables alone, for
    /// deployments without a config file.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("zonebot").join("config.toml"))
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.core.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("zonebot"),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var("ZONEBOT_DB_PATH") {
            let path = path.trim();
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        self.data_dir().join("zonebot.db")
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = env_string("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(owner) = env_string("OWNER_ID") {
            if let Ok(id) = owner.parse() {
                self.telegram.owner_id = id;
            }
        }
        if let Some(url) = env_string("RELEASE_URL") {
            self.release.base_url = Some(url);
        }
        if let Some(secret) = env_string("RELEASE_SECRET") {
            self.release.secret_key = Some(secret);
        }
        if let Some(id) = env_string("SELF_BOT_ID") {
            self.release.self_bot_id = id;
        }
        if let Some(flag) = env_string("SYNC_ENABLED") {
            self.release.sync_enabled = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(port) = env_string("PORT") {
            if let Ok(port) = port.parse() {
                self.gateway.port = port;
            }
        }
        if let Some(url) = env_string("EXTERNAL_URL") {
            self.gateway.external_url = Some(url);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token is required (or set BOT_TOKEN)");
        }
        if self.telegram.owner_id <= 0 {
            anyhow::bail!("telegram.owner_id is required (or set OWNER_ID)");
        }

        let mut peer_ids = HashSet::new();
        for peer in &self.release.peers {
            let id = peer.id.trim();
            if id.is_empty() {
                anyhow::bail!("Peer id cannot be empty");
            }
            if !peer_ids.insert(id.to_string()) {
                anyhow::bail!("Duplicate peer id '{}'", id);
            }
            if peer.url.trim().is_empty() {
                anyhow::bail!("Peer '{}' has an empty url", id);
            }
        }

        if self.release.breaker_threshold == 0 {
            anyhow::bail!("release.breaker_threshold must be at least 1");
        }
        if self.release.retry_attempts == 0 {
            anyhow::bail!("release.retry_attempts must be at least 1");
        }

        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let mut config = Config::default();
        config.telegram.bot_token = "123456:TESTTOKEN".to_string();
        config.telegram.owner_id = 42;
        config
    }

    #[test]
    fn validate_rejects_missing_token() {
        let mut config = base_config();
        config.telegram.bot_token = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_peer_ids() {
        let mut config = base_config();
        config.release.peers = vec![
            PeerInstance {
                id: "q1".to_string(),
                url: "https://a.example".to_string(),
                secret: None,
                role: "quarantine".to_string(),
            },
            PeerInstance {
                id: "q1".to_string(),
                url: "https://b.example".to_string(),
                secret: None,
                role: "quarantine".to_string(),
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn quarantine_peers_empty_when_sync_disabled() {
        let mut config = base_config();
        config.release.peers = vec![PeerInstance {
            id: "q1".to_string(),
            url: "https://a.example".to_string(),
            secret: None,
            role: "quarantine".to_string(),
        }];
        assert!(config.release.quarantine_peers().is_empty());
        config.release.sync_enabled = true;
        assert_eq!(config.release.quarantine_peers().len(), 1);
    }

    #[test]
    fn quarantine_peers_filters_by_role() {
        let mut config = base_config();
        config.release.sync_enabled = true;
        config.release.peers = vec![
            PeerInstance {
                id: "q1".to_string(),
                url: "https://a.example".to_string(),
                secret: None,
                role: "quarantine".to_string(),
            },
            PeerInstance {
                id: "m1".to_string(),
                url: "https://b.example".to_string(),
                secret: None,
                role: "moderation".to_string(),
            },
        ];
        let peers = config.release.quarantine_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "q1");
    }

    #[test]
    fn parse_minimal_toml_applies_defaults() {
        let toml = r#"
            [telegram]
            bot_token = "123456:TESTTOKEN"
            owner_id = 42
        "#;
        let config: Config = toml::from_str(toml).expect("parse");
        assert_eq!(config.release.self_bot_id, "trigger_1");
        assert_eq!(config.release.breaker_threshold, 5);
        assert_eq!(config.release.timeout_secs, 10);
        assert_eq!(config.gateway.port, 3000);
        assert!(!config.release.sync_enabled);
    }

    #[test]
    fn parse_peers_with_default_role() {
        let toml = r#"
            [telegram]
            bot_token = "123456:TESTTOKEN"
            owner_id = 42

            [[release.peers]]
            id = "trigger_2"
            url = "bot2.example.com"
        "#;
        let config: Config = toml::from_str(toml).expect("parse");
        assert_eq!(config.release.peers.len(), 1);
        assert_eq!(config.release.peers[0].role, "quarantine");
    }
}
