use config::{Config as ConfigLoader, ConfigError, Environment, File};
use herald::{Backoff, ChatConfig, JobRouterConfig, MonitorConfig, ReconnectPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub chat: ChatSection,
    pub jobs: JobsSection,
    pub monitor: MonitorSection,
    pub logging: LoggingConfig,

    // Secrets (from ENV only)
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSection {
    pub endpoint: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    pub connect_timeout_ms: u64,
}

impl From<&ChatSection> for ChatConfig {
    fn from(section: &ChatSection) -> Self {
        let policy = ReconnectPolicy::new()
            .with_max_retries(section.max_retries)
            .with_base_delay(Duration::from_millis(section.base_delay_ms))
            .with_max_delay(Duration::from_millis(section.max_delay_ms))
            .with_backoff(section.backoff)
            .with_connect_timeout(Duration::from_millis(section.connect_timeout_ms));
        ChatConfig::new(section.endpoint.clone()).with_policy(policy)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsSection {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub endpoint: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl From<&JobsSection> for JobRouterConfig {
    fn from(section: &JobsSection) -> Self {
        let policy = ReconnectPolicy::new()
            .with_max_retries(section.max_retries)
            .with_base_delay(Duration::from_millis(section.base_delay_ms))
            .with_max_delay(Duration::from_millis(section.max_delay_ms));
        JobRouterConfig::new(section.endpoint.clone()).with_policy(policy)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Absolute URL, or a path joined onto `server.base_url`
    pub probe_url: String,
    pub probe_interval_ms: u64,
    /// Round trips slower than this report "slow"
    pub rtt_budget_ms: u64,
    pub probe_timeout_ms: u64,
}

impl From<&MonitorSection> for MonitorConfig {
    fn from(section: &MonitorSection) -> Self {
        MonitorConfig::default()
            .with_probe_interval(Duration::from_millis(section.probe_interval_ms))
            .with_rtt_budget(Duration::from_millis(section.rtt_budget_ms))
            .with_probe_timeout(Duration::from_millis(section.probe_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from TOML files and environment variables
    ///
    /// Hierarchy (weakest to strongest):
    /// 1. config/default.toml
    /// 2. config/{ENV}.toml (if ENV is set)
    /// 3. Environment variables such as `HERALD__CHAT__MAX_RETRIES=5`
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("ENV").unwrap_or_else(|_| "dev".to_string());

        let builder = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                Environment::with_prefix("HERALD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;

        let mut cfg: Config = config.try_deserialize()?;

        // Bearer token from ENV (not in TOML); chat works unauthenticated without it
        cfg.token = std::env::var("HERALD_TOKEN").ok().filter(|t| !t.is_empty());

        Ok(cfg)
    }

    /// Load config from a specific path (useful for testing)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = ConfigLoader::builder().add_source(File::from(path.as_ref()));

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn probe_url(&self) -> String {
        let url = &self.monitor.probe_url;
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.clone();
        }
        format!(
            "{}/{}",
            self.server.base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }
}
