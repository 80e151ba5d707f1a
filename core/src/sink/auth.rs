use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::UpstreamError;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// OIDC client-credentials token source with an in-memory cache.
pub struct TokenSource {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(token_endpoint: String, client_id: String, client_secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_endpoint,
            client_id,
            client_secret,
            cached: Mutex::new(None),
        }
    }

    /// Returns a valid access token, fetching a new one when the cache is stale.
    pub async fn token(&self) -> Result<String, UpstreamError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn fetch(&self) -> Result<CachedToken, UpstreamError> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| UpstreamError::Auth {
                reason: format!("token request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Auth {
                reason: format!("token endpoint returned {status}"),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| UpstreamError::Auth {
            reason: format!("invalid token response: {e}"),
        })?;

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(0));
        debug!(expires_in = ?lifetime, "fetched access token");
        Ok(CachedToken {
            value: body.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        })
    }
}
