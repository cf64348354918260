use anyhow::{Context, Result};
use config::{Config, ConfigBuilder, Environment, File};
use log::LevelFilter;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "veredicto.toml";
pub const ENV_PREFIX: &str = "VEREDICTO";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub db: DbSettings,
    pub authority: AuthoritySettings,
    pub log_level: String,
}
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    /// Put internal error causes into responses. Development only.
    pub expose_internal_errors: bool,
}
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DbSettings {
    pub url: String,
}
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AuthoritySettings {
    /// Contract gateway. Without it the service runs on its own ledger.
    #[serde(default)]
    pub url: Option<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub api_key: Option<String>,
}
impl AuthoritySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// Defaults, then the config file (if present), then `VEREDICTO__*`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_from(
            path.unwrap_or(DEFAULT_CONFIG_FILE),
            Environment::with_prefix(ENV_PREFIX),
        )
    }
    fn load_from(path: &str, environment: Environment) -> Result<Self> {
        defaults()?
            .add_source(File::with_name(path).required(false))
            .add_source(
                environment
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Couldn't read configuration from {}", path))?
            .try_deserialize()
            .context("Invalid configuration")
    }
    pub fn log_level(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .with_context(|| format!("Unknown log level {}", self.log_level))
    }
}
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                port: 8081,
                expose_internal_errors: false,
            },
            db: DbSettings {
                url: "sqlite::memory:".to_string(),
            },
            authority: AuthoritySettings {
                url: None,
                timeout_ms: 5000,
                api_key: None,
            },
            log_level: "debug".to_string(),
        }
    }
}

fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>> {
    let settings = Settings::default();
    Ok(Config::builder()
        .set_default("server.port", i64::from(settings.server.port))?
        .set_default(
            "server.expose_internal_errors",
            settings.server.expose_internal_errors,
        )?
        .set_default("db.url", settings.db.url)?
        .set_default(
            "authority.timeout_ms",
            i64::try_from(settings.authority.timeout_ms)?,
        )?
        .set_default("log_level", settings.log_level)?)
}
