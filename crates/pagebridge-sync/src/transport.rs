//! Authenticated request/response channel to the remote system.
//!
//! Every remote operation is one [`RemoteCall`] sent through a [`Transport`].
//! The engine never holds two calls in flight for one session.

use crate::error::RemoteError;
use crate::scripts::ScriptAsset;
use serde_json::Value;

/// Entity kinds the remote can create through its structured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Folder,
    Collection,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Folder => "Folder",
            EntityKind::Collection => "JournalEntry",
        }
    }
}

#[derive(Debug, Clone)]
pub enum RemoteCall {
    /// Remote sessions currently attached to the relay
    ListSessions,
    /// Run a script asset remotely and return its `result`
    Execute {
        script: &'static ScriptAsset,
        args: Value,
    },
    /// Create one entity; returns the created entity
    Create { kind: EntityKind, data: Value },
    /// Store raw bytes at `path/filename`
    Upload {
        path: String,
        filename: String,
        bytes: Vec<u8>,
        overwrite: bool,
    },
    /// List files under a remote directory: `{ "files": [..] }`
    ListFiles { path: String },
}

impl RemoteCall {
    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            RemoteCall::ListSessions => "list-sessions".to_string(),
            RemoteCall::Execute { script, .. } => format!("execute:{}", script.name),
            RemoteCall::Create { kind, .. } => format!("create:{}", kind.as_str()),
            RemoteCall::Upload { filename, .. } => format!("upload:{filename}"),
            RemoteCall::ListFiles { path } => format!("list-files:{path}"),
        }
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, call: RemoteCall) -> Result<Value, RemoteError>;
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::config::SyncConfig;
    use crate::error::SessionError;
    use reqwest::{Client, RequestBuilder};
    use std::time::Duration;

    const API_KEY_HEADER: &str = "x-api-key";

    /// [`Transport`] over the relay's HTTP API.
    pub struct HttpTransport {
        client: Client,
        base_url: String,
        api_key: String,
        client_id: String,
    }

    impl HttpTransport {
        pub fn new(config: &SyncConfig) -> Result<Self, SessionError> {
            if let Some(missing) = config.missing_setting() {
                return Err(SessionError::MissingSetting(missing));
            }
            let client = Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .map_err(|e| SessionError::Unreachable(RemoteError::Network(e.to_string())))?;

            Ok(Self {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_key: config.api_key.clone(),
                client_id: config.client_id.clone(),
            })
        }

        fn url(&self, endpoint: &str) -> String {
            format!("{}/{}", self.base_url, endpoint)
        }

        async fn send(&self, request: RequestBuilder) -> Result<Value, RemoteError> {
            let response = request
                .header(API_KEY_HEADER, &self.api_key)
                .send()
                .await
                .map_err(|e| RemoteError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(RemoteError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            response
                .json()
                .await
                .map_err(|e| RemoteError::Network(e.to_string()))
        }
    }

    #[async_trait::async_trait]
    impl Transport for HttpTransport {
        async fn call(&self, call: RemoteCall) -> Result<Value, RemoteError> {
            let client_id = [("clientId", self.client_id.as_str())];
            match call {
                RemoteCall::ListSessions => self.send(self.client.get(self.url("clients"))).await,
                RemoteCall::Execute { script, args } => {
                    let body = serde_json::json!({ "script": script.render(&args) });
                    let request = self
                        .client
                        .post(self.url("execute-js"))
                        .query(&client_id)
                        .json(&body);
                    let mut response = self.send(request).await?;
                    if let Some(error) = response.get("error").and_then(Value::as_str) {
                        return Err(RemoteError::Rejected(error.to_string()));
                    }
                    response
                        .get_mut("result")
                        .map(Value::take)
                        .ok_or_else(|| RemoteError::schema(script.name, "missing `result`"))
                }
                RemoteCall::Create { kind, data } => {
                    let body = serde_json::json!({ "entityType": kind.as_str(), "data": data });
                    let request = self
                        .client
                        .post(self.url("create"))
                        .query(&client_id)
                        .json(&body);
                    let mut response = self.send(request).await?;
                    response
                        .get_mut("entity")
                        .map(Value::take)
                        .ok_or_else(|| RemoteError::schema("create", "missing `entity`"))
                }
                RemoteCall::Upload {
                    path,
                    filename,
                    bytes,
                    overwrite,
                } => {
                    let overwrite = if overwrite { "true" } else { "false" };
                    let request = self
                        .client
                        .post(self.url("upload"))
                        .query(&client_id)
                        .query(&[
                            ("path", path.as_str()),
                            ("filename", filename.as_str()),
                            ("overwrite", overwrite),
                        ])
                        .header("Content-Type", "application/octet-stream")
                        .body(bytes);
                    self.send(request).await
                }
                RemoteCall::ListFiles { path } => {
                    let request = self
                        .client
                        .get(self.url("file-system"))
                        .query(&client_id)
                        .query(&[("path", path.as_str())]);
                    self.send(request).await
                }
            }
        }
    }
}
