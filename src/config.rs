//! Engine configuration.
//!
//! Read from the process environment (`SyncConfig::from_env`) or from any
//! key lookup (`SyncConfig::from_lookup`). `CLOUD_DATABASE_URL` accepts either
//! a plain URL or an encoded connection string carrying `{ "url", "key" }`,
//! as JSON or URL-safe base64 of that JSON.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::error::{Result, SyncError};

pub const ENV_ENABLE_CLOUD_SYNC: &str = "ENABLE_CLOUD_SYNC";
pub const ENV_CLOUD_DATABASE_URL: &str = "CLOUD_DATABASE_URL";
pub const ENV_SYNC_INTERVAL_MINUTES: &str = "SYNC_INTERVAL_MINUTES";
pub const ENV_AUTO_SYNC: &str = "AUTO_SYNC";
const ENV_SYNC_API_KEY: &str = "SYNC_API_KEY";
const ENV_SYNC_DATA_DIR: &str = "SYNC_DATA_DIR";
const ENV_SYNC_BATCH_SIZE: &str = "SYNC_BATCH_SIZE";
const ENV_SYNC_MAX_ATTEMPTS: &str = "SYNC_MAX_ATTEMPTS";
const ENV_SYNC_BACKOFF_BASE_SECS: &str = "SYNC_BACKOFF_BASE_SECS";
const ENV_SYNC_BACKOFF_CAP_SECS: &str = "SYNC_BACKOFF_CAP_SECS";
const ENV_SYNC_PROBE_TIMEOUT_SECS: &str = "SYNC_PROBE_TIMEOUT_SECS";
const ENV_SYNC_PROBE_CACHE_SECS: &str = "SYNC_PROBE_CACHE_SECS";
const ENV_SYNC_REQUEST_TIMEOUT_SECS: &str = "SYNC_REQUEST_TIMEOUT_SECS";
const ENV_SYNC_RETENTION_DAYS: &str = "SYNC_RETENTION_DAYS";
const ENV_SYNC_LOG_JSON: &str = "SYNC_LOG_JSON";

const DEFAULT_INTERVAL_MINUTES: u64 = 30;
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 2;
const DEFAULT_BACKOFF_CAP_SECS: u64 = 300;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_PROBE_CACHE_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Exponential backoff parameters for transient push failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            cap: Duration::from_secs(DEFAULT_BACKOFF_CAP_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    pub remote_url: Option<String>,
    pub api_key: Option<Zeroizing<String>>,
    pub interval: Duration,
    pub auto_sync: bool,
    pub data_dir: PathBuf,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
    pub probe_timeout: Duration,
    pub probe_cache_ttl: Duration,
    pub request_timeout: Duration,
    pub retention: Duration,
    pub log_json: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_url: None,
            api_key: None,
            interval: Duration::from_secs(DEFAULT_INTERVAL_MINUTES * 60),
            auto_sync: true,
            data_dir: PathBuf::from("data"),
            batch_size: DEFAULT_BATCH_SIZE,
            backoff: BackoffPolicy::default(),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            probe_cache_ttl: Duration::from_secs(DEFAULT_PROBE_CACHE_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * 24 * 60 * 60),
            log_json: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let raw_url = get(ENV_CLOUD_DATABASE_URL);
        let (remote_url, embedded_key) = match raw_url.as_deref() {
            Some(raw) => {
                let (url, key) = parse_connection_string(raw);
                (Some(url), key)
            }
            None => (None, None),
        };
        let api_key = get(ENV_SYNC_API_KEY)
            .or(embedded_key)
            .map(Zeroizing::new);

        let interval_minutes = parse_u64(&get, ENV_SYNC_INTERVAL_MINUTES)?
            .unwrap_or(DEFAULT_INTERVAL_MINUTES);
        if interval_minutes == 0 {
            return Err(SyncError::Config(format!(
                "{ENV_SYNC_INTERVAL_MINUTES} must be at least 1"
            )));
        }

        let batch_size = parse_u64(&get, ENV_SYNC_BATCH_SIZE)?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .max(1);

        let backoff = BackoffPolicy {
            base: secs_or(&get, ENV_SYNC_BACKOFF_BASE_SECS, defaults.backoff.base)?,
            cap: secs_or(&get, ENV_SYNC_BACKOFF_CAP_SECS, defaults.backoff.cap)?,
            max_attempts: parse_u64(&get, ENV_SYNC_MAX_ATTEMPTS)?
                .map(|v| v.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
        };
        if backoff.cap < backoff.base {
            return Err(SyncError::Config(format!(
                "{ENV_SYNC_BACKOFF_CAP_SECS} must not be smaller than {ENV_SYNC_BACKOFF_BASE_SECS}"
            )));
        }

        let retention_days =
            parse_u64(&get, ENV_SYNC_RETENTION_DAYS)?.unwrap_or(DEFAULT_RETENTION_DAYS);

        let config = Self {
            enabled: parse_bool(&get, ENV_ENABLE_CLOUD_SYNC)?.unwrap_or(false),
            remote_url,
            api_key,
            interval: Duration::from_secs(interval_minutes * 60),
            auto_sync: parse_bool(&get, ENV_AUTO_SYNC)?.unwrap_or(true),
            data_dir: get(ENV_SYNC_DATA_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            batch_size,
            backoff,
            probe_timeout: secs_or(&get, ENV_SYNC_PROBE_TIMEOUT_SECS, defaults.probe_timeout)?,
            probe_cache_ttl: secs_or(&get, ENV_SYNC_PROBE_CACHE_SECS, defaults.probe_cache_ttl)?,
            request_timeout: secs_or(
                &get,
                ENV_SYNC_REQUEST_TIMEOUT_SECS,
                defaults.request_timeout,
            )?,
            retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            log_json: parse_bool(&get, ENV_SYNC_LOG_JSON)?.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    /// Sync enabled without a remote is a misconfiguration, not a silent no-op.
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.remote_url.is_none() {
            return Err(SyncError::Config(format!(
                "{ENV_ENABLE_CLOUD_SYNC} is set but {ENV_CLOUD_DATABASE_URL} is missing"
            )));
        }
        if self.probe_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(SyncError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sync.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_bool<G>(get: &G, key: &str) -> Result<Option<bool>>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(SyncError::Config(format!("{key}: expected a boolean, got {raw:?}"))),
        },
    }
}

fn parse_u64<G>(get: &G, key: &str) -> Result<Option<u64>>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{key}: expected an integer, got {raw:?}"))),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_u64(get, key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Normalise a remote base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 || compact.contains("://") {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Split a `CLOUD_DATABASE_URL` value into a normalised base URL and an
/// optional embedded API key.
pub fn parse_connection_string(raw: &str) -> (String, Option<String>) {
    if let Some(payload) = decode_connection_payload(raw) {
        let url = payload
            .get("url")
            .and_then(Value::as_str)
            .map(normalize_base_url)
            .filter(|s| !s.is_empty());
        if let Some(url) = url {
            let key = payload
                .get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            return (url, key);
        }
    }
    (normalize_base_url(raw), None)
}
