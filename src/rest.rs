//! JSON REST client over an optional forward proxy.

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{GatewayError, Result};

const API_BASE: &str = "https://api.sgroup.qq.com";

/// Build a `reqwest::Client`, honoring an account's HTTP proxy if set.
pub fn build_client(proxy_url: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

/// Thin JSON REST client; every request is bot-authenticated via the
/// `Authorization: QQBot <token>` header.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(client: reqwest::Client) -> RestClient {
        RestClient {
            client,
            base_url: API_BASE.to_string(),
        }
    }

    #[doc(hidden)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> RestClient {
        self.base_url = base_url.into();
        self
    }

    pub async fn request(
        &self,
        token: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = format!(
            "{}{}{}",
            self.base_url,
            if path.starts_with('/') { "" } else { "/" },
            path
        );

        trace!(%url, body = %redact(body), "rest request");

        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", format!("QQBot {token}"))
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            if status.as_u16() == 204 {
                return Ok(Value::Null);
            }
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_slice(&bytes)?);
        }

        let parsed: Option<Value> = response.json().await.ok();
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(Value::as_i64);
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();

        debug!(status = status.as_u16(), %message, "rest error response");

        Err(GatewayError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

/// Redact `access_token`/`clientSecret` before logging a request body.
fn redact(body: Option<&Value>) -> String {
    let Some(body) = body else {
        return "<none>".to_string();
    };
    let mut clone = body.clone();
    if let Value::Object(map) = &mut clone {
        for key in ["access_token", "clientSecret", "token"] {
            if map.contains_key(key) {
                map.insert(key.to_string(), Value::String("<redacted>".to_string()));
            }
        }
    }
    clone.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_bot_authorization_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gateway"))
            .and(header("Authorization", "QQBot tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "url": "wss://x" })))
            .mount(&server)
            .await;

        let rest = RestClient::new(reqwest::Client::new()).with_base_url(server.uri());
        let value = rest.request("tok-1", Method::GET, "/gateway", None).await.unwrap();
        assert_eq!(value["url"], "wss://x");
    }

    #[tokio::test]
    async fn non_2xx_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/users/u1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "code": 11244,
                "message": "access_token invalid"
            })))
            .mount(&server)
            .await;

        let rest = RestClient::new(reqwest::Client::new()).with_base_url(server.uri());
        let err = rest
            .request("bad", Method::POST, "/v2/users/u1/messages", Some(&serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(err.looks_like_auth_expired());
    }

    #[test]
    fn redact_strips_secret_fields() {
        let body = serde_json::json!({ "access_token": "secret", "msg_type": 0 });
        let redacted = redact(Some(&body));
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("msg_type"));
    }
}
