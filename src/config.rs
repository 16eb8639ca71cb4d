//! Environment-driven configuration.

use thiserror::Error;

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const TELEGRAM_BOT_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";
pub const YANDEX_CLIENT_ID_ENV: &str = "YANDEX_CLIENT_ID";

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the health endpoint.
    pub host: String,
    pub port: u16,
    pub bot_token: String,
    pub yandex_client_id: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("one or more environment variables are not set: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("invalid {PORT_ENV} value `{0}`")]
    InvalidPort(String),
}

impl Config {
    /// Load configuration from process environment variables.
    ///
    /// Every missing variable is reported in one error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let mut require = |name: &str| match lookup(name) {
            Some(v) if !v.is_empty() => v,
            _ => {
                missing.push(name.to_string());
                String::new()
            }
        };

        let host = require(HOST_ENV);
        let port = require(PORT_ENV);
        let bot_token = require(TELEGRAM_BOT_TOKEN_ENV);
        let yandex_client_id = require(YANDEX_CLIENT_ID_ENV);

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(port))?;

        Ok(Self {
            host,
            port,
            bot_token,
            yandex_client_id,
        })
    }
}
