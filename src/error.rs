//! Error types for the gateway client and outbound dispatcher.

use thiserror::Error;

/// Gateway client `Result` alias type.
pub type Result<T> = ::std::result::Result<T, GatewayError>;

/// Error kinds surfaced by this crate.
///
/// These map directly onto the error taxonomy the connect/reconnect and
/// outbound paths reason about; callers match on variants rather than on
/// string content wherever the protocol gives us a structured signal.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport-level failure (TCP/TLS/WebSocket).
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// An HTTP request could not even be dispatched.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// A WebSocket-specific failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be parsed as the expected JSON shape.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(#[from] serde_json::Error),

    /// A non-2xx REST response.
    #[error("api error {status}: {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    /// The cached access token was rejected and needs a forced refresh.
    #[error("access token expired or rejected")]
    AuthExpired,

    /// The platform is rate limiting this client.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Server sent op 9 (Invalid Session).
    #[error("invalid session (resumable = {resumable})")]
    InvalidSession { resumable: bool },

    /// The bot account was taken offline or banned; do not reconnect.
    #[error("bot terminated: {reason}")]
    BotTerminated { reason: &'static str },

    /// The passive reply quota for a message was exhausted and no fallback
    /// was possible.
    #[error("reply quota exhausted")]
    QuotaExhausted,

    /// A request was rejected before any network call because its payload
    /// was structurally invalid (e.g. empty active-message content).
    #[error("invalid payload: {reason}")]
    PayloadInvalid { reason: &'static str },

    /// The per-account abort signal fired while an operation was pending.
    #[error("cancelled")]
    Cancelled,

    /// A protocol invariant was violated (unexpected frame during handshake).
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

impl GatewayError {
    /// Best-effort classification of an [`Api`] error as an expired/invalid
    /// token: a 401 status, or a message containing `token`/`access_token`.
    pub fn looks_like_auth_expired(&self) -> bool {
        match self {
            GatewayError::Api { status, message, .. } => {
                *status == 401
                    || message.contains("token")
                    || message.contains("access_token")
            }
            GatewayError::AuthExpired => true,
            _ => false,
        }
    }

    /// Whether the failure text matches the platform's rate-limit signature,
    /// independent of HTTP status (some gateway-connect failures surface it
    /// as a plain string rather than a structured 429).
    pub fn looks_like_rate_limited(&self) -> bool {
        match self {
            GatewayError::RateLimited { .. } => true,
            GatewayError::Api { code, message, .. } => {
                *code == Some(100_001) || message.contains("Too many requests")
            }
            _ => false,
        }
    }
}

/// Outcome of an outbound send, never panicking the caller on partial
/// failure.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OutboundResult {
    pub message_id: Option<String>,
    pub timestamp: Option<String>,
    pub error: Option<String>,
}

impl OutboundResult {
    pub fn ok(message_id: impl Into<String>, timestamp: Option<String>) -> Self {
        OutboundResult {
            message_id: Some(message_id.into()),
            timestamp,
            error: None,
        }
    }

    pub fn err(error: impl std::fmt::Display) -> Self {
        OutboundResult {
            message_id: None,
            timestamp: None,
            error: Some(error.to_string()),
        }
    }
}
