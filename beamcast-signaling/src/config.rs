use serde::Deserialize;

use crate::engine::{default_codecs, EngineSettings};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Comma separated list, or `*` for any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    #[serde(default)]
    pub announced_ip: Option<String>,
    #[serde(default = "default_rtc_min_port")]
    pub rtc_min_port: u16,
    #[serde(default = "default_rtc_max_port")]
    pub rtc_max_port: u16,
    /// Capacity of the notification bus per receiver.
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

fn default_port() -> u16 { 8080 }
fn default_allowed_origins() -> String { "*".into() }
fn default_listen_ip() -> String { "127.0.0.1".into() }
fn default_rtc_min_port() -> u16 { 40000 }
fn default_rtc_max_port() -> u16 { 49999 }
fn default_notification_buffer() -> usize { 1024 }

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("BEAMCAST_SIGNALING").separator("__"))
            .build()?;
        let config: Self = config.try_deserialize()?;

        if config.rtc_min_port > config.rtc_max_port {
            anyhow::bail!(
                "rtc_min_port ({}) must not exceed rtc_max_port ({})",
                config.rtc_min_port,
                config.rtc_max_port
            );
        }
        Ok(config)
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.announced_ip.clone(),
            min_port: config.rtc_min_port,
            max_port: config.rtc_max_port,
            codecs: default_codecs(),
        }
    }
}
