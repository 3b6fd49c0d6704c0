use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Postgres URL. Without one the service keeps streams in memory.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,
    /// Comma separated list, or `*` for any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,
}

fn default_port() -> u16 { 8081 }
fn default_db_pool_size() -> u32 { 10 }
fn default_allowed_origins() -> String { "*".into() }

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("BEAMCAST_STREAMS").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
