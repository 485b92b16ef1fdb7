use std::env;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite:rusty_rank.db";
const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_POLL_DURATION_SECONDS: u64 = 7200;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    /// Lifetime of a poll document in the store, set once at creation.
    pub poll_duration: Duration,
    pub token_duration: Duration,
    pub server_addr: SocketAddr,
    pub cors_origin: Option<String>,
    pub sweep_interval: Duration,
}

impl Config {
    /// Reads configuration from the process environment (after `dotenvy` has run).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let poll_duration = Duration::from_secs(seconds(&lookup, "POLL_DURATION", DEFAULT_POLL_DURATION_SECONDS)?);

        // Tokens live as long as the poll unless configured otherwise
        let token_duration = Duration::from_secs(seconds(&lookup, "TOKEN_DURATION", poll_duration.as_secs())?);

        let sweep_interval =
            Duration::from_secs(seconds(&lookup, "SWEEP_INTERVAL_SECONDS", DEFAULT_SWEEP_INTERVAL_SECONDS)?);

        let raw_addr = lookup("SERVER_ADDR").unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string());
        let server_addr = raw_addr.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
            key: "SERVER_ADDR",
            value: raw_addr.clone(),
            reason: e.to_string(),
        })?;

        let cors_origin = lookup("CORS_ORIGIN").filter(|s| !s.is_empty());

        Ok(Self {
            database_url,
            jwt_secret,
            poll_duration,
            token_duration,
            server_addr,
            cors_origin,
            sweep_interval,
        })
    }
}

fn seconds<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid { key, value: raw, reason: "must be positive".to_string() }),
        Ok(value) => Ok(value),
        Err(e) => Err(ConfigError::Invalid { key, value: raw.clone(), reason: e.to_string() }),
    }
}
