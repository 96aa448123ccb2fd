//! Origin HTTP Adapter
//!
//! Implements `OriginNotifier` and `ReplySink` over HTTP. Both calls carry
//! the exchange token as a bearer credential.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::ports::{LifecycleReply, OriginNotifier, ReplyAck, ReplySink};
use crate::error::{Error, Result};

/// Path prefix of object resources on the origin host
const OBJECT_PATH: &str = "file";

/// Origin client configuration
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Bearer token sent with every call
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// reqwest-backed origin client
pub struct HttpOriginClient {
    client: Client,
    token: Option<String>,
}

impl std::fmt::Debug for HttpOriginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOriginClient")
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl HttpOriginClient {
    pub fn new(config: OriginConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token: config.token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// `{host}/file/{id}`, tolerating a trailing slash on `host`
pub fn object_url(host: &str, id: Uuid) -> String {
    format!("{}/{}/{}", host.trim_end_matches('/'), OBJECT_PATH, id)
}

#[async_trait]
impl OriginNotifier for HttpOriginClient {
    #[instrument(skip(self))]
    async fn object_failed(&self, host: &str, id: Uuid) -> Result<()> {
        let url = object_url(host, id);
        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(Error::Origin)?;

        if !response.status().is_success() {
            return Err(Error::OriginStatus {
                host: host.to_string(),
                status: response.status().as_u16(),
            });
        }

        debug!(%url, "Origin notified of failed object");
        Ok(())
    }
}

#[async_trait]
impl ReplySink for HttpOriginClient {
    #[instrument(skip(self, reply), fields(command = %reply.id))]
    async fn deliver(&self, host: &str, reply: &LifecycleReply) -> Result<ReplyAck> {
        let response = self
            .authorize(self.client.post(host))
            .json(reply)
            .send()
            .await
            .map_err(Error::Origin)?;

        match response.status() {
            StatusCode::RESET_CONTENT => Ok(ReplyAck::Reset),
            status if status.is_success() => Ok(ReplyAck::Accepted),
            status => Err(Error::OriginStatus {
                host: host.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}
