//! JSON-RPC 2.0 client for the aria2 engine.
//!
//! Every call is an HTTP POST of
//! `{"jsonrpc":"2.0","id":..,"method":"aria2.<verb>","params":["token:<secret>", ..]}`
//! to `<base>/jsonrpc`. A response is valid only when it carries `result` and
//! no `error`; anything else becomes an [`RpcError`] holding both the request
//! and the raw response.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, trace};

use super::RpcError;
use super::types::{FileEntry, GlobalStat, SessionInfo, TaskStatus, VersionInfo};

/// Desktop browser identity sent to CDNs unless overridden.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/141.0.0.0 Safari/537.36 Edg/141.0.0.0";

/// Per-request HTTP timeout; the engine is local so anything slower is a hang.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a freshly spawned engine gets to answer `getVersion`.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-download options for [`EngineRpcClient::add_uri`].
#[derive(Debug, Clone, Default)]
pub struct AddUriOptions {
    /// Overrides the client's default user agent.
    pub user_agent: Option<String>,
    /// Sent as `all-proxy`.
    pub proxy: Option<String>,
    /// Raw engine options merged over the base options.
    pub extra: Map<String, Value>,
}

/// Typed client for one engine instance.
///
/// Cheap to clone; clones share the HTTP connection pool and request-id counter.
#[derive(Debug, Clone)]
pub struct EngineRpcClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    user_agent: String,
    next_id: Arc<AtomicU64>,
}

impl EngineRpcClient {
    /// Creates a client for the engine at `base_url` (e.g. `http://127.0.0.1:6800`).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Client`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, secret: &str) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(RpcError::Client)?;

        Ok(Self {
            http,
            endpoint: format!("{}/jsonrpc", base_url.trim_end_matches('/')),
            token: format!("token:{secret}"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Replaces the default user agent sent with every submission.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Full RPC endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends one call and returns its `result` member.
    ///
    /// `method` is the verb without the `aria2.` prefix; the secret token is
    /// prepended to `params`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Http`] on transport failure, [`RpcError::Remote`]
    /// when the response carries `error`, and [`RpcError::MissingResult`]
    /// when it carries no `result`.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let method = format!("aria2.{method}");
        let mut full_params = Vec::with_capacity(params.len() + 1);
        full_params.push(Value::String(self.token.clone()));
        full_params.extend(params);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": full_params,
        });
        trace!(%method, id, "rpc call");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&envelope)
            .send()
            .await
            .map_err(|source| RpcError::Http {
                method: method.clone(),
                source,
            })?;
        let body = response.text().await.map_err(|source| RpcError::Http {
            method: method.clone(),
            source,
        })?;

        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        let Some(Value::Object(mut object)) = parsed else {
            return Err(RpcError::MissingResult {
                request: envelope.to_string(),
                response: body,
            });
        };

        if object.get("error").is_some_and(|error| !error.is_null()) {
            return Err(RpcError::Remote {
                request: envelope.to_string(),
                response: body,
            });
        }
        match object.remove("result") {
            Some(result) if !result.is_null() => Ok(result),
            _ => Err(RpcError::MissingResult {
                request: envelope.to_string(),
                response: body,
            }),
        }
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| RpcError::Decode {
            method: format!("aria2.{method}"),
            message: e.to_string(),
        })
    }

    async fn gid_echo(&self, method: &str, gid: &str) -> Result<bool, RpcError> {
        let result = self.call(method, vec![json!(gid)]).await?;
        Ok(result.as_str() == Some(gid))
    }

    async fn ok_call(&self, method: &str, params: Vec<Value>) -> Result<bool, RpcError> {
        let result = self.call(method, params).await?;
        Ok(result.as_str() == Some("OK"))
    }

    /// Queues a download of `url` into `dir/filename` and returns its GID.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`]; [`RpcError::Decode`] if the result is not a string.
    #[instrument(skip(self, options), fields(dir = %dir.display()))]
    pub async fn add_uri(
        &self,
        url: &str,
        dir: &Path,
        filename: &str,
        options: &AddUriOptions,
    ) -> Result<String, RpcError> {
        let mut engine_options = Map::new();
        engine_options.insert("dir".to_string(), json!(dir.display().to_string()));
        engine_options.insert("out".to_string(), json!(filename));
        engine_options.insert(
            "user-agent".to_string(),
            json!(options.user_agent.as_deref().unwrap_or(self.user_agent.as_str())),
        );
        if let Some(proxy) = &options.proxy {
            engine_options.insert("all-proxy".to_string(), json!(proxy));
        }
        for (key, value) in &options.extra {
            engine_options.insert(key.clone(), value.clone());
        }

        let result = self
            .call("addUri", vec![json!([url]), Value::Object(engine_options)])
            .await?;
        match result {
            Value::String(gid) => {
                debug!(%gid, "download queued");
                Ok(gid)
            }
            other => Err(RpcError::Decode {
                method: "aria2.addUri".to_string(),
                message: format!("expected gid string, got {other}"),
            }),
        }
    }

    /// Removes a download; true iff the engine echoes the GID.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    #[instrument(skip(self))]
    pub async fn remove(&self, gid: &str) -> Result<bool, RpcError> {
        self.gid_echo("remove", gid).await
    }

    /// Removes a download without waiting for engine-side cleanup.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    #[instrument(skip(self))]
    pub async fn force_remove(&self, gid: &str) -> Result<bool, RpcError> {
        self.gid_echo("forceRemove", gid).await
    }

    /// Pauses a download.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    #[instrument(skip(self))]
    pub async fn pause(&self, gid: &str) -> Result<bool, RpcError> {
        self.gid_echo("pause", gid).await
    }

    /// Pauses a download immediately.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    #[instrument(skip(self))]
    pub async fn force_pause(&self, gid: &str) -> Result<bool, RpcError> {
        self.gid_echo("forcePause", gid).await
    }

    /// Resumes a paused download.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    #[instrument(skip(self))]
    pub async fn unpause(&self, gid: &str) -> Result<bool, RpcError> {
        self.gid_echo("unpause", gid).await
    }

    /// Pauses everything; true iff the engine answers `OK`.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn pause_all(&self) -> Result<bool, RpcError> {
        self.ok_call("pauseAll", Vec::new()).await
    }

    /// Pauses everything immediately.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn force_pause_all(&self) -> Result<bool, RpcError> {
        self.ok_call("forcePauseAll", Vec::new()).await
    }

    /// Resumes everything.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn unpause_all(&self) -> Result<bool, RpcError> {
        self.ok_call("unpauseAll", Vec::new()).await
    }

    /// Drops every finished/errored/removed result from engine memory.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn purge_download_result(&self) -> Result<bool, RpcError> {
        self.ok_call("purgeDownloadResult", Vec::new()).await
    }

    /// Drops one stopped result from engine memory.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    #[instrument(skip(self))]
    pub async fn remove_download_result(&self, gid: &str) -> Result<bool, RpcError> {
        self.ok_call("removeDownloadResult", vec![json!(gid)]).await
    }

    /// Queries the state of one download.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    #[instrument(skip(self))]
    pub async fn tell_status(&self, gid: &str) -> Result<TaskStatus, RpcError> {
        self.call_as("tellStatus", vec![json!(gid), json!(TaskStatus::KEYS)])
            .await
    }

    /// Lists the files of one download.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    #[instrument(skip(self))]
    pub async fn get_files(&self, gid: &str) -> Result<Vec<FileEntry>, RpcError> {
        self.call_as("getFiles", vec![json!(gid)]).await
    }

    /// Engine-wide counters (speeds, active/waiting/stopped counts).
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn get_global_stat(&self) -> Result<GlobalStat, RpcError> {
        self.call_as("getGlobalStat", Vec::new()).await
    }

    /// Engine-wide options as reported by the engine.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn get_global_option(&self) -> Result<Map<String, Value>, RpcError> {
        self.call_as("getGlobalOption", Vec::new()).await
    }

    /// Engine version and compiled-in features.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn get_version(&self) -> Result<VersionInfo, RpcError> {
        self.call_as("getVersion", Vec::new()).await
    }

    /// Session identifier of the running engine.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn get_session_info(&self) -> Result<SessionInfo, RpcError> {
        self.call_as("getSessionInfo", Vec::new()).await
    }

    /// Polls `getVersion` until the engine answers or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotReady`] on timeout.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<VersionInfo, RpcError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_version().await {
                Ok(version) => {
                    debug!(version = %version.version, "engine ready");
                    return Ok(version);
                }
                Err(e) => trace!(error = %e, "engine not ready yet"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RpcError::NotReady(timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_builds_endpoint_and_token() {
        let client = EngineRpcClient::new("http://127.0.0.1:6800/", "abc").unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:6800/jsonrpc");
        assert_eq!(client.token, "token:abc");
        assert_eq!(client.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_with_user_agent_overrides_default() {
        let client = EngineRpcClient::new("http://127.0.0.1:6800", "abc")
            .unwrap()
            .with_user_agent("mirror-test/1.0");
        assert_eq!(client.user_agent, "mirror-test/1.0");
    }

    #[tokio::test]
    async fn test_call_transport_error_names_method() {
        // Port 9 (discard) on loopback is closed in test environments.
        let client = EngineRpcClient::new("http://127.0.0.1:9", "abc").unwrap();
        let err = client.get_global_stat().await.unwrap_err();
        match err {
            RpcError::Http { method, .. } => assert_eq!(method, "aria2.getGlobalStat"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
