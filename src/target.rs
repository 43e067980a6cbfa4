//! Outbound target parsing and media source normalization.

use std::path::PathBuf;

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{GatewayError, Result};

/// Parsed destination of an outbound send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    C2C(String),
    Group(String),
    Channel(String),
}

static HEX32: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{32}$").unwrap());

impl Target {
    /// Parse strings of the form `[qqbot:](c2c:<id>|group:<id>|channel:<id>|<openid>)`.
    /// A bare 32-hex id defaults to C2C, the far more common unprefixed
    /// target shape in practice.
    pub fn parse(raw: &str) -> Result<Target> {
        let raw = raw.strip_prefix("qqbot:").unwrap_or(raw);
        if let Some(id) = raw.strip_prefix("c2c:") {
            return Ok(Target::C2C(id.to_string()));
        }
        if let Some(id) = raw.strip_prefix("group:") {
            return Ok(Target::Group(id.to_string()));
        }
        if let Some(id) = raw.strip_prefix("channel:") {
            return Ok(Target::Channel(id.to_string()));
        }
        if HEX32.is_match(raw) {
            return Ok(Target::C2C(raw.to_string()));
        }
        Err(GatewayError::PayloadInvalid {
            reason: "unrecognized target format",
        })
    }

    /// Inverse of [`Target::parse`] for the forms that carry a prefix; bare
    /// C2C ids format with the `c2c:` prefix even though `parse` also
    /// accepts the bare hex form — `parse(format(t)) == t` is the invariant,
    /// not byte-identity with arbitrary input.
    pub fn format(&self) -> String {
        match self {
            Target::C2C(id) => format!("c2c:{id}"),
            Target::Group(id) => format!("group:{id}"),
            Target::Channel(id) => format!("channel:{id}"),
        }
    }
}

/// One resolved image to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    PublicUrl(String),
    DataUrl(String),
    LocalPath(PathBuf),
}

const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

impl MediaSource {
    /// Classify a raw string the way `ImageResolver` and `SendMedia` both
    /// need to.
    pub fn classify(raw: &str) -> Option<MediaSource> {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Some(MediaSource::PublicUrl(raw.to_string()))
        } else if raw.starts_with("data:image/") {
            Some(MediaSource::DataUrl(raw.to_string()))
        } else if raw.starts_with('/') {
            let ext = PathBuf::from(raw)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            match ext {
                Some(e) if SUPPORTED_IMAGE_EXTENSIONS.contains(&e.as_str()) => {
                    Some(MediaSource::LocalPath(PathBuf::from(raw)))
                }
                _ => None,
            }
        } else {
            None
        }
    }

    fn mime_for_extension(ext: &str) -> &'static str {
        match ext {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "bmp" => "image/bmp",
            _ => "application/octet-stream",
        }
    }

    /// Read a `LocalPath` off disk and rewrite it in place to a `DataUrl`
    /// before upload. No-op for the other variants.
    pub async fn materialize(self) -> Result<MediaSource> {
        match self {
            MediaSource::LocalPath(path) => {
                let bytes = tokio::fs::read(&path).await?;
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_ascii_lowercase();
                let mime = Self::mime_for_extension(&ext);
                let encoded = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    &bytes,
                );
                Ok(MediaSource::DataUrl(format!("data:{mime};base64,{encoded}")))
            }
            other => Ok(other),
        }
    }
}

/// A single outbound reply request from the host/reply pipeline.
#[derive(Debug, Clone)]
pub struct OutboundIntent {
    pub target: String,
    pub text: Option<String>,
    pub media_sources: Vec<String>,
    pub reply_to_id: Option<String>,
    pub account_id: String,
}
