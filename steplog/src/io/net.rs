//! Network adapter for tools that call HTTP services.
//!
//! Requests go through a [`Transport`]. In `Record` mode every exchange is
//! saved to a content-addressed [`ReplayCache`] (`<request_hash>.json`); in
//! `Replay` mode the cache answers instead of the network and a miss is an
//! error, never a silent live call.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::codec::{canonical_value_bytes, sha256_hex};
use crate::core::types::RetryReason;
use crate::tool::ToolError;

const AUTHORIZATION: &str = "authorization";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn new(method: &str, url: &str, timeout_ms: u64) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout_ms,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Content hash identifying the request.
    ///
    /// Header names are case-folded and `Authorization` is left out, so
    /// rotating credentials does not invalidate recordings.
    pub fn request_hash(&self) -> String {
        let headers: BTreeMap<String, &str> = self
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .filter(|(name, _)| name != AUTHORIZATION)
            .collect();
        let payload = json!({
            "method": self.method.to_ascii_uppercase(),
            "url": self.url,
            "headers": headers,
            "body": self.body,
        });
        sha256_hex(&canonical_value_bytes(&payload))
    }

    /// Copy safe to persist: credentials removed.
    fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.headers
            .retain(|name, _| !name.eq_ignore_ascii_case(AUTHORIZATION));
        copy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// Wall time of one exchange. `did_timeout` is only ever true on the latency
/// carried by [`NetworkError::Timeout`]; a returned response was on time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyInfo {
    pub duration_ms: u64,
    pub did_timeout: bool,
}

/// A response plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkResponse {
    pub request_hash: String,
    pub response: HttpResponse,
    pub latency: LatencyInfo,
    pub replayed: bool,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request to {url} timed out after {timeout_ms}ms ({elapsed}ms elapsed)", elapsed = .latency.duration_ms)]
    Timeout {
        url: String,
        timeout_ms: u64,
        latency: LatencyInfo,
    },
    #[error("request to {url} was rate limited")]
    RateLimited { url: String },
    #[error("request to {url} failed: {message}")]
    Connection { url: String, message: String },
    #[error("no recorded response for request {request_hash}")]
    ReplayMiss { request_hash: String },
    #[error("replay cache {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("replay cache entry {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl NetworkError {
    pub fn retry_reason(&self) -> RetryReason {
        match self {
            NetworkError::Timeout { .. } => RetryReason::Timeout,
            NetworkError::RateLimited { .. } => RetryReason::RateLimited,
            NetworkError::Connection { .. } => RetryReason::NetworkError,
            NetworkError::ReplayMiss { .. }
            | NetworkError::Cache { .. }
            | NetworkError::Codec { .. } => RetryReason::RuntimeError,
        }
    }
}

impl From<NetworkError> for ToolError {
    fn from(err: NetworkError) -> Self {
        let reason = err.retry_reason();
        ToolError::new(reason, reason.is_retryable(), err.to_string())
    }
}

/// Something that can perform a live HTTP exchange.
pub trait Transport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, NetworkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Live,
    Record,
    Replay,
}

/// One persisted exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedExchange {
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub latency: LatencyInfo,
}

/// Directory of recorded exchanges keyed by request hash.
#[derive(Debug, Clone)]
pub struct ReplayCache {
    dir: PathBuf,
}

impl ReplayCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, request_hash: &str) -> PathBuf {
        self.dir.join(format!("{request_hash}.json"))
    }

    pub fn load(&self, request_hash: &str) -> Result<Option<RecordedExchange>, NetworkError> {
        let path = self.entry_path(request_hash);
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "loading recorded exchange");
        let content = fs::read_to_string(&path).map_err(|source| NetworkError::Cache {
            path: path.clone(),
            source,
        })?;
        let exchange =
            serde_json::from_str(&content).map_err(|source| NetworkError::Codec { path, source })?;
        Ok(Some(exchange))
    }

    pub fn store(
        &self,
        request_hash: &str,
        exchange: &RecordedExchange,
    ) -> Result<PathBuf, NetworkError> {
        fs::create_dir_all(&self.dir).map_err(|source| NetworkError::Cache {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.entry_path(request_hash);
        let mut content =
            serde_json::to_string_pretty(exchange).map_err(|source| NetworkError::Codec {
                path: path.clone(),
                source,
            })?;
        content.push('\n');
        fs::write(&path, content).map_err(|source| NetworkError::Cache {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "recorded exchange");
        Ok(path)
    }
}

/// Routes requests to the network, the cache, or both.
pub struct NetworkAdapter {
    mode: NetworkMode,
    transport: Option<Box<dyn Transport>>,
    cache: Option<ReplayCache>,
}

impl std::fmt::Debug for NetworkAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkAdapter")
            .field("mode", &self.mode)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl NetworkAdapter {
    pub fn live(transport: impl Transport + 'static) -> Self {
        Self {
            mode: NetworkMode::Live,
            transport: Some(Box::new(transport)),
            cache: None,
        }
    }

    pub fn record(transport: impl Transport + 'static, cache: ReplayCache) -> Self {
        Self {
            mode: NetworkMode::Record,
            transport: Some(Box::new(transport)),
            cache: Some(cache),
        }
    }

    pub fn replay(cache: ReplayCache) -> Self {
        Self {
            mode: NetworkMode::Replay,
            transport: None,
            cache: Some(cache),
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn request(&self, request: &HttpRequest) -> Result<NetworkResponse, NetworkError> {
        let request_hash = request.request_hash();
        match (self.mode, &self.transport, &self.cache) {
            (NetworkMode::Replay, _, Some(cache)) => {
                let Some(exchange) = cache.load(&request_hash)? else {
                    warn!(request_hash = %request_hash, url = %request.url, "replay miss");
                    return Err(NetworkError::ReplayMiss { request_hash });
                };
                Ok(NetworkResponse {
                    request_hash,
                    response: exchange.response,
                    latency: exchange.latency,
                    replayed: true,
                })
            }
            (NetworkMode::Live | NetworkMode::Record, Some(transport), cache) => {
                let (response, latency) = send_timed(transport.as_ref(), request)?;
                if self.mode == NetworkMode::Record
                    && let Some(cache) = cache
                {
                    cache.store(
                        &request_hash,
                        &RecordedExchange {
                            request: request.redacted(),
                            response: response.clone(),
                            latency,
                        },
                    )?;
                }
                Ok(NetworkResponse {
                    request_hash,
                    response,
                    latency,
                    replayed: false,
                })
            }
            _ => Err(NetworkError::Connection {
                url: request.url.clone(),
                message: format!("adapter in {:?} mode is not configured", self.mode),
            }),
        }
    }
}

/// Send and classify by elapsed time and status.
fn send_timed(
    transport: &dyn Transport,
    request: &HttpRequest,
) -> Result<(HttpResponse, LatencyInfo), NetworkError> {
    let started = Instant::now();
    let response = transport.send(request)?;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let latency = LatencyInfo {
        duration_ms,
        did_timeout: request.timeout_ms > 0 && duration_ms > request.timeout_ms,
    };
    debug!(
        url = %request.url,
        status = response.status,
        duration_ms,
        did_timeout = latency.did_timeout,
        "http exchange"
    );

    if latency.did_timeout {
        return Err(NetworkError::Timeout {
            url: request.url.clone(),
            timeout_ms: request.timeout_ms,
            latency,
        });
    }
    if response.status == 429 {
        return Err(NetworkError::RateLimited {
            url: request.url.clone(),
        });
    }
    Ok((response, latency))
}
