//! Configuration management for Courier gateway

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

/// Courier gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (broker database, cache)
    pub data_dir: PathBuf,

    /// Path to the broker `SQLite` database
    pub broker_path: PathBuf,

    /// Primary directory for session credential material
    pub session_dir: PathBuf,

    /// Backup directory for session credential material
    pub session_backup_dir: PathBuf,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Per-queue throughput and concurrency caps
    pub queues: QueueConfig,

    /// Forgotten-customer recovery configuration
    pub recovery: RecoveryConfig,

    /// AI reply-generation configuration
    pub ai: AiConfig,

    /// Protocol bridge configuration
    pub bridge: BridgeConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,
}

/// Per-queue throughput and concurrency caps
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Concurrent message jobs per worker pool
    pub message_concurrency: usize,

    /// Message jobs per second cap
    pub message_per_second: u32,

    /// Concurrent automation jobs
    pub automation_concurrency: usize,

    /// Concurrent campaign jobs
    pub campaign_concurrency: usize,

    /// Campaign sends per minute cap (outbound rate-limit protection)
    pub campaign_per_minute: u32,

    /// Delay between consecutive campaign sends
    pub campaign_send_delay: Duration,

    /// Recovery scans per minute cap (always 1 concurrent)
    pub recovery_per_minute: u32,

    /// Worker poll interval when a queue is empty
    pub poll_interval: Duration,
}

/// Forgotten-customer recovery configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Delay between the first successful connect and the scan trigger
    pub trigger_delay: Duration,

    /// Default average-ticket value in minor currency units, used for value
    /// estimation when no booking history exists
    pub default_avg_ticket_cents: i64,

    /// Conversations quieter than this are not stalled yet
    pub min_silence_hours: i64,

    /// Silence gaps older than this are ignored (customer likely lost)
    pub max_silence_hours: i64,
}

/// AI reply-generation configuration
#[derive(Debug, Clone)]
pub struct AiConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint
    pub base_url: String,

    /// API key, if the endpoint requires one
    pub api_key: Option<String>,

    /// Model identifier for reply generation
    pub model: String,
}

/// Protocol bridge configuration
///
/// The bridge is a sidecar process that speaks the chat protocol and exposes
/// an HTTP control surface. It calls back into the gateway webhook for
/// lifecycle and inbound-message events.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base URL of the bridge control API
    pub base_url: String,

    /// Shared secret for bridge requests
    pub api_key: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:18891".to_string(),
            api_key: String::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            message_concurrency: 5,
            message_per_second: 10,
            automation_concurrency: 3,
            campaign_concurrency: 3,
            campaign_per_minute: 100,
            campaign_send_delay: Duration::from_millis(600),
            recovery_per_minute: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            trigger_delay: Duration::from_secs(10),
            default_avg_ticket_cents: 10_000,
            min_silence_hours: 6,
            max_silence_hours: 720,
        }
    }
}

impl Config {
    /// Load configuration from the environment
    ///
    /// # Errors
    ///
    /// Returns error if the data directory cannot be created
    pub fn load() -> Result<Self> {
        // Determine data directory (~/.local/share/courier on Linux)
        let data_dir = std::env::var("COURIER_DATA_DIR").map_or_else(
            |_| {
                directories::ProjectDirs::from("dev", "courier", "courier")
                    .map_or_else(|| PathBuf::from("."), |d| d.data_dir().to_path_buf())
            },
            PathBuf::from,
        );
        std::fs::create_dir_all(&data_dir)?;

        let broker_path = std::env::var("COURIER_BROKER_PATH")
            .map_or_else(|_| data_dir.join("courier.db"), PathBuf::from);

        let session_dir = std::env::var("COURIER_SESSION_DIR")
            .map_or_else(|_| data_dir.join("sessions"), PathBuf::from);
        let session_backup_dir = std::env::var("COURIER_SESSION_BACKUP_DIR")
            .map_or_else(|_| data_dir.join("sessions-backup"), PathBuf::from);

        let api_server = ApiServerConfig {
            port: std::env::var("COURIER_API_PORT")
                .or_else(|_| std::env::var("PORT"))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(18890),
        };

        let mut queues = QueueConfig::default();
        if let Some(n) = env_parse("COURIER_MESSAGE_CONCURRENCY") {
            queues.message_concurrency = n;
        }
        if let Some(n) = env_parse("COURIER_CAMPAIGN_PER_MINUTE") {
            queues.campaign_per_minute = n;
        }

        let mut recovery = RecoveryConfig::default();
        if let Some(secs) = env_parse::<u64>("COURIER_RECOVERY_DELAY_SECS") {
            recovery.trigger_delay = Duration::from_secs(secs);
        }
        if let Some(cents) = env_parse("COURIER_AVG_TICKET_CENTS") {
            recovery.default_avg_ticket_cents = cents;
        }

        let ai = AiConfig {
            base_url: std::env::var("COURIER_AI_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: std::env::var("COURIER_AI_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        };

        let bridge = BridgeConfig {
            base_url: std::env::var("COURIER_BRIDGE_URL")
                .unwrap_or_else(|_| BridgeConfig::default().base_url),
            api_key: std::env::var("COURIER_BRIDGE_API_KEY").unwrap_or_default(),
        };

        let mut config = Self {
            data_dir,
            broker_path,
            session_dir,
            session_backup_dir,
            api_server,
            queues,
            recovery,
            ai,
            bridge,
        };
        config.apply_file_overrides()?;
        Ok(config)
    }

    /// Overlay settings from a `config.toml` in the data directory (or the
    /// path named by `COURIER_CONFIG`). File settings override environment
    /// defaults.
    fn apply_file_overrides(&mut self) -> Result<()> {
        let path = std::env::var("COURIER_CONFIG")
            .map_or_else(|_| self.data_dir.join("config.toml"), PathBuf::from);
        if !path.exists() {
            return Ok(());
        }

        let file = FileConfig::read(&path)?;
        tracing::debug!(path = %path.display(), "loaded config file");

        if let Some(bridge) = file.bridge {
            if let Some(url) = bridge.base_url {
                self.bridge.base_url = url;
            }
            if let Some(key) = bridge.api_key {
                self.bridge.api_key = key;
            }
        }
        if let Some(ai) = file.ai {
            if let Some(url) = ai.base_url {
                self.ai.base_url = url;
            }
            if let Some(key) = ai.api_key {
                self.ai.api_key = Some(key);
            }
            if let Some(model) = ai.model {
                self.ai.model = model;
            }
        }
        if let Some(queues) = file.queues {
            if let Some(n) = queues.message_concurrency {
                self.queues.message_concurrency = n;
            }
            if let Some(n) = queues.campaign_per_minute {
                self.queues.campaign_per_minute = n;
            }
            if let Some(ms) = queues.campaign_send_delay_ms {
                self.queues.campaign_send_delay = Duration::from_millis(ms);
            }
        }
        if let Some(recovery) = file.recovery {
            if let Some(cents) = recovery.default_avg_ticket_cents {
                self.recovery.default_avg_ticket_cents = cents;
            }
            if let Some(hours) = recovery.min_silence_hours {
                self.recovery.min_silence_hours = hours;
            }
            if let Some(hours) = recovery.max_silence_hours {
                self.recovery.max_silence_hours = hours;
            }
        }

        Ok(())
    }
}

/// Optional overrides parsed from `config.toml`
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bridge: Option<FileBridge>,
    ai: Option<FileAi>,
    queues: Option<FileQueues>,
    recovery: Option<FileRecovery>,
}

#[derive(Debug, Deserialize)]
struct FileBridge {
    base_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileAi {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileQueues {
    message_concurrency: Option<usize>,
    campaign_per_minute: Option<u32>,
    campaign_send_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileRecovery {
    default_avg_ticket_cents: Option<i64>,
    min_silence_hours: Option<i64>,
    max_silence_hours: Option<i64>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_defaults_match_published_caps() {
        let q = QueueConfig::default();
        assert_eq!(q.campaign_per_minute, 100);
        assert_eq!(q.recovery_per_minute, 1);
        assert_eq!(q.message_concurrency, 5);
    }

    #[test]
    fn config_file_parses_partial_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[queues]\ncampaign_per_minute = 30\n\n[ai]\nmodel = \"gpt-4o\"\n",
        )
        .unwrap();

        let file = FileConfig::read(&path).unwrap();
        assert_eq!(file.queues.unwrap().campaign_per_minute, Some(30));
        assert_eq!(file.ai.unwrap().model.as_deref(), Some("gpt-4o"));
        assert!(file.bridge.is_none());
    }

    #[test]
    fn recovery_defaults() {
        let r = RecoveryConfig::default();
        assert_eq!(r.trigger_delay, Duration::from_secs(10));
        assert_eq!(r.default_avg_ticket_cents, 10_000);
        assert_eq!(r.max_silence_hours, 720);
    }
}
