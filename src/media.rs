//! Two-step rich-media send: upload, then reference by `file_info`.

use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

use crate::error::Result;
use crate::rest::RestClient;
use crate::target::{MediaSource, Target};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file_info: String,
}

/// Uploads an image (by public URL or base64) and returns the `file_info`
/// token the subsequent `msg_type=7` send references.
pub struct MediaUploader<'a> {
    rest: &'a RestClient,
}

impl<'a> MediaUploader<'a> {
    pub fn new(rest: &'a RestClient) -> MediaUploader<'a> {
        MediaUploader { rest }
    }

    pub async fn upload(&self, token: &str, target: &Target, source: &MediaSource) -> Result<String> {
        let path = match target {
            Target::C2C(openid) => format!("/v2/users/{openid}/files"),
            Target::Group(openid) => format!("/v2/groups/{openid}/files"),
            Target::Channel(_) => {
                return Err(crate::error::GatewayError::PayloadInvalid {
                    reason: "channels do not accept rich media uploads",
                })
            }
        };

        let mut body = json!({
            "file_type": 1,
            "srv_send_msg": false,
        });
        match source {
            MediaSource::PublicUrl(url) => body["url"] = json!(url),
            MediaSource::DataUrl(data_url) => {
                let b64 = data_url
                    .split_once("base64,")
                    .map(|(_, rest)| rest)
                    .unwrap_or(data_url.as_str());
                body["file_data"] = json!(b64);
            }
            MediaSource::LocalPath(_) => {
                return Err(crate::error::GatewayError::PayloadInvalid {
                    reason: "local paths must be materialized to a data URL before upload",
                })
            }
        }

        let response = self.rest.request(token, Method::POST, &path, Some(&body)).await?;
        let parsed: UploadResponse = serde_json::from_value(response)?;
        Ok(parsed.file_info)
    }

    /// Send the previously uploaded image as a `msg_type=7` message.
    pub async fn send(
        &self,
        token: &str,
        target: &Target,
        file_info: &str,
        msg_seq: u64,
        reply_to_id: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut body = json!({
            "media": { "file_info": file_info },
            "msg_type": 7,
            "msg_seq": msg_seq,
        });
        if let Some(id) = reply_to_id {
            body["msg_id"] = json!(id);
        }

        let path = match target {
            Target::C2C(openid) => format!("/v2/users/{openid}/messages"),
            Target::Group(openid) => format!("/v2/groups/{openid}/messages"),
            Target::Channel(_) => {
                return Err(crate::error::GatewayError::PayloadInvalid {
                    reason: "channels do not accept rich media messages",
                })
            }
        };

        self.rest.request(token, Method::POST, &path, Some(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn upload_by_public_url_returns_file_info() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/users/u1/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "file_info": "abc123"
            })))
            .mount(&server)
            .await;

        let rest = RestClient::new(reqwest::Client::new()).with_base_url(server.uri());
        let uploader = MediaUploader::new(&rest);
        let info = uploader
            .upload(
                "tok",
                &Target::C2C("u1".into()),
                &MediaSource::PublicUrl("https://example.com/a.png".into()),
            )
            .await
            .unwrap();
        assert_eq!(info, "abc123");
    }

    #[tokio::test]
    async fn channel_target_rejects_upload() {
        let rest = RestClient::new(reqwest::Client::new());
        let uploader = MediaUploader::new(&rest);
        let err = uploader
            .upload(
                "tok",
                &Target::Channel("c1".into()),
                &MediaSource::PublicUrl("https://example.com/a.png".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::PayloadInvalid { .. }));
    }
}
