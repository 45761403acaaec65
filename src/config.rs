use log::{info, warn};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::validation::{sanitize_device_key, ValidationLimits};

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

const MAX_PARTITION_HOURS: u64 = 366 * 24;
const MAX_DAYS: u64 = 36_500;
const MAX_SECS: u64 = MAX_DAYS * DAY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Json,
    Postgres { database_url: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub storage_root: PathBuf,
    pub backend: StorageBackend,
    pub partition_interval: Duration,
    /// Zero disables deletion of old partitions
    pub retention: Duration,
    pub compression: bool,
    pub snapshot_interval: Duration,
    pub stale_sweep_interval: Duration,
    pub retention_sweep_interval: Duration,
    pub client_idle_timeout: Duration,
    pub device_idle_horizon: Duration,
    pub ring_capacity: usize,
    pub limits: ValidationLimits,
    pub shutdown_grace: Duration,
    /// Display-name aliases keyed by canonical device key
    pub device_names: HashMap<String, String>,
}

impl ServerConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage_root = lookup("STORAGE_ROOT")
            .filter(|root| !root.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let backend = match lookup("STORAGE_BACKEND")
            .unwrap_or_else(|| "json".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => StorageBackend::Json,
            "postgres" | "postgresql" => {
                let database_url = lookup("DATABASE_URL")
                    .ok_or("DATABASE_URL environment variable not set")?;
                StorageBackend::Postgres { database_url }
            }
            other => return Err(format!("Unknown STORAGE_BACKEND '{}'", other).into()),
        };

        let partition_hours = bounded(&lookup, "PARTITION_INTERVAL_HOURS", 24, MAX_PARTITION_HOURS)?;
        if partition_hours == 0 {
            return Err("PARTITION_INTERVAL_HOURS must be at least 1".into());
        }
        let ring_capacity: usize = parse_var(&lookup, "RING_CAPACITY", 1000)?;
        if ring_capacity == 0 {
            return Err("RING_CAPACITY must be at least 1".into());
        }

        let config = ServerConfig {
            storage_root,
            backend,
            partition_interval: Duration::from_secs(partition_hours * HOUR),
            retention: Duration::from_secs(bounded(&lookup, "RETENTION_DAYS", 90, MAX_DAYS)? * DAY),
            compression: parse_var(&lookup, "COMPRESSION_ENABLED", true)?,
            snapshot_interval: secs(&lookup, "SNAPSHOT_INTERVAL_SECS", 300)?,
            stale_sweep_interval: secs(&lookup, "STALE_SWEEP_INTERVAL_SECS", 60)?,
            retention_sweep_interval: secs(&lookup, "RETENTION_SWEEP_INTERVAL_SECS", DAY)?,
            client_idle_timeout: secs(&lookup, "CLIENT_IDLE_TIMEOUT_SECS", 300)?,
            device_idle_horizon: Duration::from_secs(
                bounded(&lookup, "DEVICE_IDLE_DAYS", 30, MAX_DAYS)? * DAY,
            ),
            ring_capacity,
            limits: ValidationLimits {
                max_age: secs(&lookup, "MAX_READING_AGE_SECS", HOUR)?,
                max_future_skew: secs(&lookup, "MAX_FUTURE_SKEW_SECS", 300)?,
            },
            shutdown_grace: secs(&lookup, "SHUTDOWN_GRACE_SECS", 10)?,
            device_names: lookup("RUUVI_TAGS")
                .map(|tags| parse_device_names(&tags))
                .unwrap_or_default(),
        };

        for (interval, name) in [
            (config.snapshot_interval, "SNAPSHOT_INTERVAL_SECS"),
            (config.stale_sweep_interval, "STALE_SWEEP_INTERVAL_SECS"),
            (config.retention_sweep_interval, "RETENTION_SWEEP_INTERVAL_SECS"),
        ] {
            if interval.is_zero() {
                return Err(format!("{} must be at least 1", name).into());
            }
        }

        info!(
            "Storage root {}, partition interval {}h, retention {} days",
            config.storage_root.display(),
            partition_hours,
            config.retention.as_secs() / DAY
        );
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| format!("Invalid {} '{}': {}", key, value, e).into()),
        _ => Ok(default),
    }
}

/// Parse a whole-number variable that must not exceed `max`
fn bounded<F>(lookup: &F, key: &str, default: u64, max: u64) -> Result<u64, Box<dyn std::error::Error>>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_var(lookup, key, default)?;
    if value > max {
        return Err(format!("{} must be at most {}", key, max).into());
    }
    Ok(value)
}

fn secs<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, Box<dyn std::error::Error>>
where
    F: Fn(&str) -> Option<String>,
{
    bounded(lookup, key, default, MAX_SECS).map(Duration::from_secs)
}

/// Parse `MAC=Name,MAC=Name` pairs into canonical device key aliases
pub fn parse_device_names(tags: &str) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for pair in tags.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((mac, name)) => {
                let name = name.trim();
                match sanitize_device_key(mac.trim()) {
                    Some(key) if !name.is_empty() => {
                        names.insert(key, name.to_string());
                    }
                    _ => warn!("Ignoring invalid RUUVI_TAGS entry '{}'", pair),
                }
            }
            None => warn!("Failed to split RUUVI_TAGS pair '{}'", pair),
        }
    }
    names
}
