//! HTTP transport for the remote store.
//!
//! Endpoints, relative to the normalised base URL:
//! - `HEAD /api/health` reachability probe
//! - `POST /api/sync/push` one mutation; 200 accepted, 409 conflict,
//!   400/422 rejected
//! - `GET  /api/sync/changes?since=&limit=` change feed

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{PullPage, PushAck, PushRequest, RemoteChange, RemoteStore};
use crate::config::{normalize_base_url, SyncConfig};
use crate::error::{Result, SyncError};

const API_KEY_HEADER: &str = "X-Sync-Api-Key";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Push bodies above this size are sent zstd-compressed.
const COMPRESS_THRESHOLD: usize = 16 * 1024;
const COMPRESS_LEVEL: i32 = 3;

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    api_key: Option<Zeroizing<String>>,
}

impl HttpRemoteStore {
    pub fn new(
        base_url: &str,
        api_key: Option<Zeroizing<String>>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let url = config
            .remote_url
            .as_deref()
            .ok_or_else(|| SyncError::Config("no remote URL configured".into()))?;
        Self::new(url, config.api_key.clone(), config.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key.as_str());
        }
        req
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach sync server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid sync server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Sync endpoint not found".to_string(),
        429 => "Sync server is rate limiting requests".to_string(),
        s if s >= 500 => "Sync server error".to_string(),
        _ => "Unexpected response from sync server".to_string(),
    }
}

/// Best-effort message from an error body, falling back to the status text.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let body = body_text.trim();
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status_error(status));
        return match json.get("details").or_else(|| json.get("errors")) {
            Some(details) => format!("{message} (HTTP {}): {details}", status.as_u16()),
            None => format!("{message} (HTTP {})", status.as_u16()),
        };
    }
    if body.is_empty() {
        format!("{} (HTTP {})", status_error(status), status.as_u16())
    } else {
        format!("{} (HTTP {}): {body}", status_error(status), status.as_u16())
    }
}

/// zstd-compress large bodies; small ones, or a failed compression, go plain.
fn encode_body(raw: Vec<u8>) -> (Vec<u8>, bool) {
    if raw.len() <= COMPRESS_THRESHOLD {
        return (raw, false);
    }
    match zstd::stream::encode_all(std::io::Cursor::new(&raw), COMPRESS_LEVEL) {
        Ok(compressed) if compressed.len() < raw.len() => (compressed, true),
        Ok(_) => (raw, false),
        Err(e) => {
            warn!("zstd compression failed, sending uncompressed: {e}");
            (raw, false)
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedBody {
    remote_version: i64,
}

#[derive(Deserialize)]
struct ConflictBody {
    remote: RemoteChange,
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn probe(&self) -> Result<()> {
        let resp = self
            .request(reqwest::Method::HEAD, "/api/health")
            .send()
            .await
            .map_err(|e| SyncError::Transport(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SyncError::Transport(status_error(status)))
        }
    }

    async fn push(&self, request: &PushRequest) -> Result<PushAck> {
        let (body, compressed) = encode_body(serde_json::to_vec(request)?);
        let mut req = self
            .request(reqwest::Method::POST, "/api/sync/push")
            .header(CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key);
        if compressed {
            req = req.header(CONTENT_ENCODING, "zstd");
        }

        let resp = req
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::Transport(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| SyncError::Transport(friendly_error(&self.base_url, &e)))?;

        debug!(
            entity_type = %request.entity_type,
            entity_id = %request.entity_id,
            status = status.as_u16(),
            compressed,
            "Push response"
        );

        match status {
            s if s.is_success() => {
                let accepted: AcceptedBody = serde_json::from_str(&body_text).map_err(|e| {
                    SyncError::Transport(format!("Invalid JSON from sync server: {e}"))
                })?;
                Ok(PushAck::Accepted {
                    remote_version: accepted.remote_version,
                })
            }
            StatusCode::CONFLICT => {
                let conflict: ConflictBody = serde_json::from_str(&body_text).map_err(|e| {
                    SyncError::Transport(format!("Invalid conflict body from sync server: {e}"))
                })?;
                Ok(PushAck::Conflict {
                    remote: conflict.remote,
                })
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(SyncError::Validation(error_detail(status, &body_text)))
            }
            _ => Err(SyncError::Transport(error_detail(status, &body_text))),
        }
    }

    async fn pull(&self, since: Option<&str>, limit: usize) -> Result<PullPage> {
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(cursor) = since {
            query.push(("since", cursor.to_string()));
        }

        let resp = self
            .request(reqwest::Method::GET, "/api/sync/changes")
            .query(&query)
            .send()
            .await
            .map_err(|e| SyncError::Transport(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| SyncError::Transport(friendly_error(&self.base_url, &e)))?;

        if !status.is_success() {
            return Err(SyncError::Transport(error_detail(status, &body_text)));
        }
        if body_text.trim().is_empty() {
            return Ok(PullPage::default());
        }
        serde_json::from_str(&body_text)
            .map_err(|e| SyncError::Transport(format!("Invalid JSON from sync server: {e}")))
    }
}
