use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::error::DingTalkError;

/// Tokens are treated as expired this long before the server says so.
const EARLY_EXPIRY: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_TTL_SECS: u64 = 7200;

#[derive(Debug, Clone)]
struct Credential {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    access_token: Option<String>,
    expire_in: Option<u64>,
}

/// Process-wide cache for the robot's bearer token.
///
/// The lock is held across a refresh, so concurrent callers that race past
/// expiry wait for one exchange instead of issuing their own. The exchange
/// is bounded by the timeout of the client it is given.
pub struct CredentialCache {
    app_key: String,
    app_secret: String,
    cached: Mutex<Option<Credential>>,
}

impl CredentialCache {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            cached: Mutex::new(None),
        }
    }

    /// Return a valid access token, exchanging credentials when the cached
    /// one is missing or inside its early-expiry window.
    ///
    /// A failed exchange leaves the previous entry in place; it is never
    /// handed out once expired.
    pub async fn get_token(&self, http: &Client, base_url: &str) -> Result<String, DingTalkError> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref()
            && Instant::now() < credential.expires_at
        {
            return Ok(credential.token.clone());
        }

        let credential = self.exchange(http, base_url).await.inspect_err(|e| {
            error!("dingtalk: failed to get access token: {e}");
        })?;
        let token = credential.token.clone();
        *cached = Some(credential);
        Ok(token)
    }

    /// Drop the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }

    async fn exchange(&self, http: &Client, base_url: &str) -> Result<Credential, DingTalkError> {
        let url = format!("{base_url}/v1.0/oauth2/accessToken");
        let body = json!({
            "appKey": self.app_key,
            "appSecret": self.app_secret,
        });

        let resp = http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DingTalkError::Auth(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DingTalkError::Auth(format!(
                "token endpoint returned {}: {text}",
                status.as_u16()
            )));
        }

        let parsed: AccessTokenResponse = resp
            .json()
            .await
            .map_err(|e| DingTalkError::Auth(format!("invalid token response: {e}")))?;

        let token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DingTalkError::Auth("token response missing accessToken".into()))?;

        let ttl = Duration::from_secs(parsed.expire_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS));
        debug!("dingtalk: refreshed access token (ttl {}s)", ttl.as_secs());

        Ok(Credential {
            token,
            expires_at: Instant::now() + ttl.saturating_sub(EARLY_EXPIRY),
        })
    }
}
