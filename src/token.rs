//! Cached access token with singleflight refresh and a background proactive
//! refresh loop.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

const TOKEN_ENDPOINT: &str = "https://bots.qq.com/app/getAppAccessToken";
const REFRESH_SKEW: Duration = Duration::from_secs(5 * 60);
const DEFAULT_EXPIRES_IN: u64 = 7200;

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

/// Per-account cached access token.
///
/// `GetAccessToken` is safe to call concurrently: a single fetch is
/// in flight at a time per `TokenStore` and concurrent callers share its
/// result (singleflight).
pub struct TokenStore {
    client: reqwest::Client,
    app_id: String,
    client_secret: String,
    endpoint: String,
    cached: RwLock<Option<CachedToken>>,
    inflight: Mutex<()>,
}

impl TokenStore {
    pub fn new(client: reqwest::Client, app_id: String, client_secret: String) -> TokenStore {
        TokenStore {
            client,
            app_id,
            client_secret,
            endpoint: TOKEN_ENDPOINT.to_string(),
            cached: RwLock::new(None),
            inflight: Mutex::new(()),
        }
    }

    /// Point this store at a different token endpoint; used in tests to
    /// redirect fetches at a [`wiremock::MockServer`].
    #[doc(hidden)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> TokenStore {
        self.endpoint = endpoint.into();
        self
    }

    /// Return the cached token if still fresh, otherwise fetch a new one.
    /// Concurrent callers during a fetch all await the same underlying
    /// request via the `inflight` mutex.
    pub async fn get_access_token(&self) -> Result<String> {
        if let Some(token) = self.fresh_cached().await {
            return Ok(token);
        }

        let _guard = self.inflight.lock().await;

        // Someone else may have refreshed while we waited for the lock.
        if let Some(token) = self.fresh_cached().await {
            return Ok(token);
        }

        let fetched = self.fetch().await?;
        let mut cached = self.cached.write().await;
        *cached = Some(fetched.clone());
        Ok(fetched.value)
    }

    async fn fresh_cached(&self) -> Option<String> {
        let cached = self.cached.read().await;
        let cached = cached.as_ref()?;
        if chrono::Utc::now() < cached.expires_at - REFRESH_SKEW {
            Some(cached.value.clone())
        } else {
            None
        }
    }

    /// Drop the cached value without cancelling an in-flight fetch; the
    /// next caller starts a fresh one.
    pub async fn clear_cache(&self) {
        let mut cached = self.cached.write().await;
        *cached = None;
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let body = serde_json::json!({
            "appId": self.app_id,
            "clientSecret": self.client_secret,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let parsed: TokenResponse = response.json().await?;

        let Some(access_token) = parsed.access_token else {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                code: None,
                message: "token response missing access_token".to_string(),
            });
        };

        let expires_in: u64 = parsed
            .expires_in
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_EXPIRES_IN);

        Ok(CachedToken {
            value: access_token,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(expires_in as i64),
        })
    }
}

/// Handle returned by [`spawn_background_refresh`]; dropping or calling
/// [`BackgroundRefreshHandle::stop`] cancels the loop idempotently.
pub struct BackgroundRefreshHandle {
    stop_tx: broadcast::Sender<()>,
}

impl BackgroundRefreshHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Start the cooperative background refresh task: sleep until
/// `expiresAt - 5min - uniform(0,30s)`, then refresh; on failure sleep 5s
/// and retry.
pub fn spawn_background_refresh(store: Arc<TokenStore>) -> BackgroundRefreshHandle {
    let (stop_tx, mut stop_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        loop {
            let sleep_for = match store.get_access_token().await {
                Ok(_) => {
                    let cached = store.cached.read().await;
                    match cached.as_ref() {
                        Some(cached) => {
                            let until_refresh = cached.expires_at - REFRESH_SKEW - chrono::Utc::now();
                            let jitter = rand::thread_rng().gen_range(0..30_000u64);
                            let base_ms = until_refresh.num_milliseconds().max(0) as u64;
                            Duration::from_millis(base_ms.saturating_sub(jitter))
                        }
                        None => Duration::from_secs(5),
                    }
                }
                Err(err) => {
                    warn!("background token refresh failed: {err}");
                    Duration::from_secs(5)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    debug!("background token refresh waking up");
                    store.clear_cache().await;
                }
                _ = stop_rx.recv() => {
                    debug!("background token refresh stopping");
                    return;
                }
            }
        }
    });

    BackgroundRefreshHandle { stop_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_and_caches_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/getAppAccessToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": "7200"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = TokenStore::new(reqwest::Client::new(), "app".into(), "secret".into())
            .with_endpoint(format!("{}/app/getAppAccessToken", server.uri()));

        let first = store.get_access_token().await.unwrap();
        let second = store.get_access_token().await.unwrap();
        assert_eq!(first, "tok-1");
        assert_eq!(second, "tok-1");
    }

    #[tokio::test]
    async fn missing_access_token_is_fatal_for_the_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/getAppAccessToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "expires_in": "7200"
            })))
            .mount(&server)
            .await;

        let store = TokenStore::new(reqwest::Client::new(), "app".into(), "secret".into())
            .with_endpoint(format!("{}/app/getAppAccessToken", server.uri()));

        assert!(store.get_access_token().await.is_err());
    }

    #[tokio::test]
    async fn clear_cache_does_not_cancel_inflight_fetch() {
        let store = Arc::new(TokenStore::new(
            reqwest::Client::new(),
            "app".into(),
            "secret".into(),
        ));
        // Seed a fresh token directly to validate fresh_cached()'s skew math
        // without a network call.
        {
            let mut cached = store.cached.write().await;
            *cached = Some(CachedToken {
                value: "seeded".into(),
                expires_at: chrono::Utc::now() + chrono::Duration::minutes(10),
            });
        }
        assert_eq!(store.get_access_token().await.unwrap(), "seeded");

        store.clear_cache().await;
        assert!(store.fresh_cached().await.is_none());
    }

    #[tokio::test]
    async fn token_near_expiry_is_not_considered_fresh() {
        let store = TokenStore::new(reqwest::Client::new(), "app".into(), "secret".into());
        {
            let mut cached = store.cached.write().await;
            *cached = Some(CachedToken {
                value: "about-to-expire".into(),
                expires_at: chrono::Utc::now() + chrono::Duration::seconds(60),
            });
        }
        assert!(store.fresh_cached().await.is_none());
    }
}
