//! Server configuration loaded from environment variables (and `.env`).
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `TANDEM_HOST`, default `0.0.0.0`
    pub host: IpAddr,

    /// Env: `TANDEM_PORT`, default `3000`
    pub port: u16,

    /// SQLite database file.
    /// Env: `TANDEM_DB_PATH`, default `tandem.db`
    pub db_path: PathBuf,

    /// HMAC secret for session tokens.
    /// Env: `TANDEM_JWT_SECRET`, default is a development-only value.
    pub jwt_secret: String,

    /// Lifetime of issued tokens.
    /// Env: `TANDEM_TOKEN_TTL_DAYS`, default `30`
    pub token_ttl_days: i64,
}

const DEV_SECRET: &str = "dev-secret-change-me";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 3000,
            db_path: PathBuf::from("tandem.db"),
            jwt_secret: DEV_SECRET.to_string(),
            token_ttl_days: 30,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = get("TANDEM_HOST") {
            match host.parse() {
                Ok(parsed) => config.host = parsed,
                Err(_) => warn!(value = %host, "Invalid TANDEM_HOST, using default"),
            }
        }

        if let Some(port) = get("TANDEM_PORT") {
            match port.parse() {
                Ok(parsed) => config.port = parsed,
                Err(_) => warn!(value = %port, "Invalid TANDEM_PORT, using default"),
            }
        }

        if let Some(path) = get("TANDEM_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        match get("TANDEM_JWT_SECRET") {
            Some(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ => warn!("TANDEM_JWT_SECRET not set, using development secret"),
        }

        if let Some(days) = get("TANDEM_TOKEN_TTL_DAYS") {
            match days.parse::<i64>() {
                Ok(parsed) if parsed > 0 => config.token_ttl_days = parsed,
                _ => warn!(value = %days, "Invalid TANDEM_TOKEN_TTL_DAYS, using default"),
            }
        }

        config
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
