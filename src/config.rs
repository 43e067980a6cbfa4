//! Account configuration and the capability interface into the host process.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::InboundEvent;
use crate::Result;

/// Where an account's `clientSecret` was sourced from — informational only,
/// used when redacting logs and when deciding whether `ClearTokenCache`
/// should also prompt the host to re-read the secret from disk/env.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    Config,
    File,
    Env,
    None,
}

/// A single bot account's immutable configuration, normalized by the host
/// before a [`crate::gateway::GatewayFsm`] is constructed for it.
///
/// This crate never reads nested/optional config itself — it consumes this
/// fully-populated value only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub app_id: String,
    pub client_secret: String,
    pub secret_source: SecretSource,
    pub system_prompt: Option<String>,
    pub image_server_base_url: Option<String>,
    #[serde(default)]
    pub markdown_support: bool,
    pub proxy_url: Option<String>,
}

impl Account {
    /// Build an `Account` from the `QQBOT_APP_ID`/`QQBOT_CLIENT_SECRET`
    /// environment fallback, used when no configured account exists yet
    /// (first-run / onboarding).
    pub fn from_env_default(id: impl Into<String>) -> Option<Account> {
        let app_id = std::env::var("QQBOT_APP_ID").ok()?;
        let client_secret = std::env::var("QQBOT_CLIENT_SECRET").ok()?;
        Some(Account {
            id: id.into(),
            name: "default".to_string(),
            enabled: true,
            app_id,
            client_secret,
            secret_source: SecretSource::Env,
            system_prompt: None,
            image_server_base_url: None,
            markdown_support: false,
            proxy_url: proxy_from_env(),
        })
    }

    /// Resolve the effective proxy URL: the account's configured value wins
    /// over the environment.
    pub fn effective_proxy(&self) -> Option<String> {
        self.proxy_url.clone().or_else(proxy_from_env)
    }
}

/// `HTTPS_PROXY`/`HTTP_PROXY` (and lowercase variants) fallback.
fn proxy_from_env() -> Option<String> {
    for key in ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"] {
        if let Ok(v) = std::env::var(key) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
    }
    None
}

/// Outcome of delivering an inbound envelope to the external reply pipeline.
#[derive(Debug, Clone)]
pub struct PartialReply {
    pub text: Option<String>,
    pub media_urls: Vec<String>,
    pub ended: bool,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The capability surface this crate is handed by the surrounding plugin
/// host, as an explicit trait rather than an ambient runtime handle. A
/// gateway never reaches into global state to do any of this.
pub trait HostServices: Send + Sync + 'static {
    /// Resolve which agent/reply pipeline route should handle an inbound
    /// envelope (e.g. by account + message kind).
    fn resolve_agent_route(&self, account_id: &str, event: &InboundEvent) -> String;

    /// Turn a normalized [`InboundEvent`] into whatever envelope shape the
    /// reply pipeline expects.
    fn format_inbound_envelope(&self, account_id: &str, event: &InboundEvent) -> serde_json::Value;

    /// Submit an envelope to the reply pipeline and await its first/only
    /// reply. C2C callers that want incremental chunks as they're produced
    /// should prefer `dispatch_reply_streaming`.
    fn dispatch_reply<'a>(
        &'a self,
        route: &'a str,
        envelope: serde_json::Value,
    ) -> BoxFuture<'a, Result<PartialReply>>;

    /// Submit an envelope to the reply pipeline and return a channel of
    /// [`PartialReply`] chunks as the pipeline produces them, the last of
    /// which has `ended == true`. Used to drive a C2C `StreamSession`
    /// chunk-by-chunk instead of waiting for one complete reply.
    fn dispatch_reply_streaming<'a>(
        &'a self,
        route: &'a str,
        envelope: serde_json::Value,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<PartialReply>>>;

    /// Record that an account produced activity, for host-side metrics;
    /// never fatal if it fails.
    fn record_activity(&self, account_id: &str, kind: &str);

    /// Persist a config change back to disk (e.g. after onboarding);
    /// unrelated to `SessionStore`, which this crate owns directly.
    fn write_config_file(&self, path: &str, contents: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_proxy_prefers_configured_value() {
        let mut account = sample_account();
        account.proxy_url = Some("http://configured:8080".to_string());
        assert_eq!(
            account.effective_proxy(),
            Some("http://configured:8080".to_string())
        );
    }

    fn sample_account() -> Account {
        Account {
            id: "a1".into(),
            name: "test".into(),
            enabled: true,
            app_id: "app".into(),
            client_secret: "secret".into(),
            secret_source: SecretSource::Config,
            system_prompt: None,
            image_server_base_url: None,
            markdown_support: false,
            proxy_url: None,
        }
    }
}
