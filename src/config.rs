use crate::error::{AppError, AppResult};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://taskwarden.db";
const DEFAULT_JOBS_FILE: &str = "jobs.yml";
const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
const DEFAULT_INSTANCE_BATCH: usize = 5;
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Process configuration gathered from the environment. Command line flags
/// override individual fields after loading.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub skip_db_init: bool,
    pub jobs_file: PathBuf,
    pub http_bind: SocketAddr,
    pub instance_batch: usize,
    pub handler_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_bind_raw = lookup("HTTP_BIND").unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let http_bind = http_bind_raw.parse::<SocketAddr>().map_err(|e| {
            AppError::configuration(format!("Invalid HTTP_BIND '{}': {}", http_bind_raw, e))
        })?;

        let instance_batch = parse_number(&lookup, "INSTANCE_BATCH", DEFAULT_INSTANCE_BATCH as u64)?;
        if instance_batch == 0 {
            return Err(AppError::configuration("INSTANCE_BATCH must be at least 1"));
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            skip_db_init: parse_flag(lookup("SKIP_DB_INIT").as_deref(), false),
            jobs_file: PathBuf::from(
                lookup("JOBS_FILE").unwrap_or_else(|| DEFAULT_JOBS_FILE.to_string()),
            ),
            http_bind,
            instance_batch: instance_batch as usize,
            handler_timeout: Duration::from_secs(parse_number(
                &lookup,
                "HANDLER_TIMEOUT_SECS",
                DEFAULT_HANDLER_TIMEOUT_SECS,
            )?),
            shutdown_grace: Duration::from_secs(parse_number(
                &lookup,
                "SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )?),
        })
    }
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off`; anything else yields
/// the default.
pub fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn parse_number<F>(lookup: &F, key: &str, default: u64) -> AppResult<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<u64>().map_err(|e| {
            AppError::configuration(format!("Invalid {} '{}': {}", key, raw, e))
        }),
        _ => Ok(default),
    }
}
