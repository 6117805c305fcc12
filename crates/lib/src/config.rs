//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.handover/config.json`) and environment.
//! Webhook URLs may be overridden by env so the same file works across deployments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP control API settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Automation (workflow engine) webhook endpoints.
    #[serde(default)]
    pub automation: AutomationConfig,

    /// Operator/bot ownership timings.
    #[serde(default)]
    pub ownership: OwnershipConfig,

    /// Periodic snapshot of conversation state.
    #[serde(default)]
    pub backup: BackupConfig,

    /// Messaging transport bridge.
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Control API bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP control API (default 3001).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    3001
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Where inbound messages and takeover requests are posted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    /// Receives every inbound conversation message. Overridden by HANDOVER_INBOUND_WEBHOOK_URL.
    pub inbound_webhook_url: Option<String>,
    /// Receives bot takeover requests. Overridden by HANDOVER_BOT_RESPONSE_URL.
    pub bot_response_url: Option<String>,
    /// Per-request timeout for webhook calls (default 10).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            inbound_webhook_url: None,
            bot_response_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Ownership timings. The operator timeout and bot delay can be changed at runtime via the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipConfig {
    /// Minutes without operator activity before the bot takes over (default 2).
    #[serde(default = "default_operator_timeout_minutes")]
    pub operator_timeout_minutes: u64,
    /// Seconds between an operator disconnect and the bot takeover request (default 2).
    #[serde(default = "default_bot_delay_seconds")]
    pub bot_delay_seconds: u64,
    /// Hours without inbound messages before a session is reaped (default 24).
    #[serde(default = "default_cleanup_threshold_hours")]
    pub cleanup_threshold_hours: u64,
    /// How often the reaper runs (default 60).
    #[serde(default = "default_reap_interval_minutes")]
    pub reap_interval_minutes: u64,
}

fn default_operator_timeout_minutes() -> u64 {
    2
}

fn default_bot_delay_seconds() -> u64 {
    2
}

fn default_cleanup_threshold_hours() -> u64 {
    24
}

fn default_reap_interval_minutes() -> u64 {
    60
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            operator_timeout_minutes: default_operator_timeout_minutes(),
            bot_delay_seconds: default_bot_delay_seconds(),
            cleanup_threshold_hours: default_cleanup_threshold_hours(),
            reap_interval_minutes: default_reap_interval_minutes(),
        }
    }
}

impl OwnershipConfig {
    pub fn operator_timeout(&self) -> Duration {
        Duration::from_secs(self.operator_timeout_minutes.saturating_mul(60))
    }

    pub fn bot_delay(&self) -> Duration {
        Duration::from_secs(self.bot_delay_seconds)
    }

    pub fn cleanup_threshold(&self) -> Duration {
        Duration::from_secs(self.cleanup_threshold_hours.saturating_mul(60 * 60))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_minutes.max(1).saturating_mul(60))
    }
}

/// Snapshot file and interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Snapshot file. Relative paths resolve against the config file's parent; default `conversation_backup.json` there.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Minutes between snapshots (default 10).
    #[serde(default = "default_backup_interval_minutes")]
    pub interval_minutes: u64,
}

fn default_backup_interval_minutes() -> u64 {
    10
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval_minutes: default_backup_interval_minutes(),
        }
    }
}

impl BackupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1).saturating_mul(60))
    }
}

/// Messaging transport bridge config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// Bridge endpoint that delivers outgoing messages. When unset, sending fails with "not configured".
    pub send_url: Option<String>,
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the inbound webhook URL: env HANDOVER_INBOUND_WEBHOOK_URL overrides config.
pub fn resolve_inbound_webhook_url(config: &Config) -> Option<String> {
    env_non_empty("HANDOVER_INBOUND_WEBHOOK_URL")
        .or_else(|| trimmed(config.automation.inbound_webhook_url.as_ref()))
}

/// Resolve the bot response URL: env HANDOVER_BOT_RESPONSE_URL overrides config.
pub fn resolve_bot_response_url(config: &Config) -> Option<String> {
    env_non_empty("HANDOVER_BOT_RESPONSE_URL")
        .or_else(|| trimmed(config.automation.bot_response_url.as_ref()))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HANDOVER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".handover").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Resolve the snapshot path: `backup.path` if set (relative to the config file's parent), else `conversation_backup.json` beside the config.
pub fn resolve_backup_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.backup.path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("conversation_backup.json"),
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_timings() {
        let config = Config::default();
        assert_eq!(config.gateway.port, 3001);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.ownership.operator_timeout(), Duration::from_secs(120));
        assert_eq!(config.ownership.bot_delay(), Duration::from_secs(2));
        assert_eq!(
            config.ownership.cleanup_threshold(),
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(config.backup.interval(), Duration::from_secs(600));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "ownership": { "operatorTimeoutMinutes": 5 }, "automation": { "botResponseUrl": "http://n8n/bot" } }"#,
        )
        .unwrap();
        assert_eq!(config.ownership.operator_timeout_minutes, 5);
        assert_eq!(config.ownership.bot_delay_seconds, 2);
        assert_eq!(config.automation.request_timeout_secs, 10);
        assert_eq!(
            config.automation.bot_response_url.as_deref(),
            Some("http://n8n/bot")
        );
    }

    #[test]
    fn huge_durations_saturate() {
        let config: Config = serde_json::from_str(
            r#"{ "ownership": { "operatorTimeoutMinutes": 18446744073709551615, "cleanupThresholdHours": 18446744073709551615 } }"#,
        )
        .unwrap();
        assert_eq!(config.ownership.operator_timeout(), Duration::from_secs(u64::MAX));
        assert_eq!(config.ownership.cleanup_threshold(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn resolve_backup_path_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.handover/config.json");
        assert_eq!(
            resolve_backup_path(&config, path),
            PathBuf::from("/home/user/.handover/conversation_backup.json")
        );
    }

    #[test]
    fn resolve_backup_path_relative_and_absolute() {
        let mut config = Config::default();
        let path = Path::new("/home/user/.handover/config.json");
        config.backup.path = Some(PathBuf::from("state/backup.json"));
        assert_eq!(
            resolve_backup_path(&config, path),
            PathBuf::from("/home/user/.handover/state/backup.json")
        );
        config.backup.path = Some(PathBuf::from("/var/lib/handover/backup.json"));
        assert_eq!(
            resolve_backup_path(&config, path),
            PathBuf::from("/var/lib/handover/backup.json")
        );
    }

    #[test]
    fn load_config_missing_file_is_default() {
        let path = std::env::temp_dir().join(format!("handover-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.gateway.port, 3001);
    }
}
