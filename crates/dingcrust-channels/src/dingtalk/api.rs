use std::sync::RwLock;
use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

use super::error::DingTalkError;
use super::token::CredentialCache;

/// Header carrying the robot's access token on every OpenAPI call.
pub const ACCESS_TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

/// Upper bound on any single OpenAPI request, token exchange included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!("dingtalk: http client with timeout unavailable ({e}), using defaults");
            Client::new()
        })
}

/// Shared, authenticated transport for the DingTalk OpenAPI.
///
/// One instance is shared by every conversation. The HTTP client can be
/// released at shutdown; calls made afterwards fail with
/// [`DingTalkError::TransportClosed`].
pub struct DingTalkApi {
    base_url: String,
    timeout: Duration,
    http: RwLock<Option<Client>>,
    credentials: CredentialCache,
}

impl DingTalkApi {
    pub fn new(
        base_url: impl Into<String>,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            http: RwLock::new(Some(build_client(DEFAULT_REQUEST_TIMEOUT))),
            credentials: CredentialCache::new(app_key, app_secret),
        }
    }

    /// Bound every request (and so every token refresh) by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.http = RwLock::new(Some(build_client(timeout)));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Clone of the live HTTP client (cheap: `Client` is reference counted).
    pub fn client(&self) -> Result<Client, DingTalkError> {
        self.http
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DingTalkError::TransportClosed)
    }

    /// Install a fresh HTTP client if the previous one was released.
    pub fn reopen(&self) {
        let mut http = self.http.write().unwrap_or_else(|e| e.into_inner());
        if http.is_none() {
            *http = Some(build_client(self.timeout));
        }
    }

    /// Release the shared HTTP client. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.http
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.http.read().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    pub async fn access_token(&self) -> Result<String, DingTalkError> {
        let http = self.client()?;
        self.credentials.get_token(&http, &self.base_url).await
    }

    /// Issue an authenticated JSON call. Any status other than 200 is a
    /// [`DingTalkError::Remote`]; the response body is returned on success.
    pub async fn call(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<String, DingTalkError> {
        let token = self.access_token().await?;
        let http = self.client()?;

        let resp = http
            .request(method, self.url(path))
            .header(ACCESS_TOKEN_HEADER, token)
            .json(body)
            .send()
            .await
            .map_err(|source| DingTalkError::Transport { op, source })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() != 200 {
            if status.as_u16() == 401 {
                warn!("dingtalk: {op} rejected token, forcing refresh");
                self.credentials.invalidate().await;
            }
            return Err(DingTalkError::Remote {
                op,
                status: status.as_u16(),
                body: text,
            });
        }

        debug!("dingtalk: {op} ok");
        Ok(text)
    }
}
