//! Outbound routing: text vs. media, active/passive fallback, markdown body
//! shaping, and C2C streaming.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Account;
use crate::error::{GatewayError, OutboundResult, Result};
use crate::image::ImageResolver;
use crate::media::MediaUploader;
use crate::msg_seq::MsgSeqCounter;
use crate::reply_limiter::{ReplyDecision, ReplyLimiter};
use crate::rest::RestClient;
use crate::target::{MediaSource, OutboundIntent, Target};
use crate::token::TokenStore;

const STREAM_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

/// Ties together the reply limiter, token store, REST client, and media
/// uploader to carry out a single [`OutboundIntent`].
pub struct OutboundDispatcher {
    account: Account,
    rest: RestClient,
    token_store: Arc<TokenStore>,
    reply_limiter: Arc<ReplyLimiter>,
    msg_seq: Arc<MsgSeqCounter>,
}

impl OutboundDispatcher {
    pub fn new(
        account: Account,
        rest: RestClient,
        token_store: Arc<TokenStore>,
        reply_limiter: Arc<ReplyLimiter>,
        msg_seq: Arc<MsgSeqCounter>,
    ) -> OutboundDispatcher {
        OutboundDispatcher { account, rest, token_store, reply_limiter, msg_seq }
    }

    /// Sends a text message, routing through the passive/active path.
    pub async fn send_text(&self, mut intent: OutboundIntent) -> OutboundResult {
        match self.send_text_inner(&mut intent).await {
            Ok(value) => OutboundResult::ok(
                value_str(&value, "id").unwrap_or_default(),
                value_str(&value, "timestamp"),
            ),
            Err(err) => OutboundResult::err(err),
        }
    }

    async fn send_text_inner(&self, intent: &mut OutboundIntent) -> Result<serde_json::Value> {
        let target = Target::parse(&intent.target)?;
        let is_passive = self.resolve_passive(intent);

        if intent.reply_to_id.is_none() {
            let trimmed = intent.text.as_deref().map(str::trim).unwrap_or("");
            if trimmed.is_empty() {
                return Err(GatewayError::PayloadInvalid {
                    reason: "content required for proactive message",
                });
            }
        }

        let msg_seq = self.msg_seq.next(intent.reply_to_id.as_deref().unwrap_or(&intent.target));
        let body = self.build_text_body(intent, msg_seq).await?;
        let path = passive_or_active_text_path(&target, is_passive);

        let result = self.request_with_auth_retry(Method::POST, &path, &body).await;

        if result.is_ok() && is_passive {
            if let Some(id) = &intent.reply_to_id {
                self.reply_limiter.record_reply(id);
            }
        }
        result
    }

    /// Sends a C2C typing indicator (`input_notify`). Unlike text/media this
    /// has no active fallback: a typing indicator tied to an expired reply
    /// window is simply dropped rather than sent as a standalone message.
    pub async fn send_typing_indicator(&self, c2c_openid: &str, reply_to_id: &str, input_second: u32) -> Result<()> {
        if !matches!(self.reply_limiter.check(reply_to_id), ReplyDecision::Allow { .. }) {
            return Ok(());
        }
        let msg_seq = self.msg_seq.next(reply_to_id);
        let body = json!({
            "input_notify": { "input_type": 1, "input_second": input_second },
            "msg_type": 6,
            "msg_seq": msg_seq,
            "msg_id": reply_to_id,
        });
        let path = format!("/v2/users/{c2c_openid}/messages");
        self.request_with_auth_retry(Method::POST, &path, &body).await?;
        Ok(())
    }

    /// Decides passive vs. active and mutates `intent.reply_to_id` to
    /// `None` on fallback, clearing it *before* the REST call so the body
    /// never carries `msg_id`.
    fn resolve_passive(&self, intent: &mut OutboundIntent) -> bool {
        let Some(reply_to_id) = intent.reply_to_id.clone() else {
            return false;
        };

        match self.reply_limiter.check(&reply_to_id) {
            ReplyDecision::Allow { .. } => true,
            ReplyDecision::FallbackExpired => {
                debug!(message_id = %reply_to_id, "reply window expired, falling back to active");
                intent.reply_to_id = None;
                false
            }
            ReplyDecision::FallbackLimitExceeded => {
                debug!(message_id = %reply_to_id, "reply quota exhausted, falling back to active");
                intent.reply_to_id = None;
                false
            }
        }
    }

    async fn build_text_body(&self, intent: &OutboundIntent, msg_seq: u64) -> Result<serde_json::Value> {
        let text = intent.text.clone().unwrap_or_default();

        let mut body = if self.account.markdown_support {
            let content = self.build_markdown_content(&text, intent).await;
            json!({ "markdown": { "content": content }, "msg_type": 2, "msg_seq": msg_seq })
        } else {
            json!({ "content": text, "msg_type": 0, "msg_seq": msg_seq })
        };

        if let Some(id) = &intent.reply_to_id {
            body["msg_id"] = json!(id);
        }
        Ok(body)
    }

    async fn build_markdown_content(&self, text: &str, intent: &OutboundIntent) -> String {
        let target_is_c2c = Target::parse(&intent.target)
            .map(|t| matches!(t, Target::C2C(_)))
            .unwrap_or(false);

        if !target_is_c2c {
            return text.to_string();
        }

        let Some(raw) = intent.media_sources.first() else {
            return text.to_string();
        };
        let Some(MediaSource::PublicUrl(url)) = MediaSource::classify(raw) else {
            return text.to_string();
        };

        let (w, h) = self.peek_image_size(&url).await.unwrap_or((512, 512));
        format!("{text}\n![#{w}px #{h}px]({url})")
    }

    /// Range-GET the first 64 KiB of a public image URL to decode its true
    /// pixel size.
    async fn peek_image_size(&self, url: &str) -> Option<(u32, u32)> {
        let client = reqwest::Client::new();
        let response = client
            .get(url)
            .header("Range", "bytes=0-65535")
            .send()
            .await
            .ok()?;
        let bytes = response.bytes().await.ok()?;
        ImageResolver::decode_image_size(&bytes)
    }

    async fn request_with_auth_retry(
        &self,
        method: Method,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let token = self.token_store.get_access_token().await?;
        match self.rest.request(&token, method.clone(), path, Some(body)).await {
            Err(err) if err.looks_like_auth_expired() => {
                warn!("auth-shaped error, clearing token cache and retrying once");
                self.token_store.clear_cache().await;
                let token = self.token_store.get_access_token().await?;
                self.rest.request(&token, method, path, Some(body)).await
            }
            other => other,
        }
    }

    /// Uploads media, sends it by `file_info`, then a best-effort separate
    /// text follow-up. Channels fall back to a text link/placeholder since
    /// they don't accept rich media.
    pub async fn send_media(
        &self,
        mut intent: OutboundIntent,
        media_url: String,
    ) -> OutboundResult {
        match self.send_media_inner(&mut intent, media_url).await {
            Ok(value) => OutboundResult::ok(
                value_str(&value, "id").unwrap_or_default(),
                value_str(&value, "timestamp"),
            ),
            Err(err) => OutboundResult::err(err),
        }
    }

    async fn send_media_inner(
        &self,
        intent: &mut OutboundIntent,
        media_url: String,
    ) -> Result<serde_json::Value> {
        let target = Target::parse(&intent.target)?;
        let is_passive = self.resolve_passive(intent);

        let source = MediaSource::classify(&media_url).ok_or(GatewayError::PayloadInvalid {
            reason: "unrecognized media source",
        })?;

        if let Target::Channel(_) = target {
            return self.send_channel_media_fallback(intent, source).await;
        }

        let source = source.materialize().await?;
        let token = self.token_store.get_access_token().await?;
        let uploader = MediaUploader::new(&self.rest);
        let file_info = uploader.upload(&token, &target, &source).await?;

        let msg_seq = self.msg_seq.next(intent.reply_to_id.as_deref().unwrap_or(&intent.target));
        let media_result = uploader
            .send(&token, &target, &file_info, msg_seq, intent.reply_to_id.as_deref())
            .await?;

        if is_passive {
            if let Some(id) = &intent.reply_to_id {
                self.reply_limiter.record_reply(id);
            }
        }

        if let Some(text) = intent.text.as_deref() {
            if !text.trim().is_empty() {
                let mut follow_up = intent.clone();
                follow_up.media_sources.clear();
                if let Err(err) = self.send_text_inner(&mut follow_up).await {
                    warn!("text follow-up after media send failed (media send still succeeded): {err}");
                }
            }
        }

        Ok(media_result)
    }

    async fn send_channel_media_fallback(
        &self,
        intent: &mut OutboundIntent,
        source: MediaSource,
    ) -> Result<serde_json::Value> {
        let suffix = match source {
            MediaSource::PublicUrl(url) => format!("\n{url}"),
            MediaSource::DataUrl(_) | MediaSource::LocalPath(_) => {
                "\n[图片无法在频道中发送]".to_string()
            }
        };
        let mut text_only = intent.clone();
        text_only.text = Some(format!("{}{}", intent.text.clone().unwrap_or_default(), suffix));
        text_only.media_sources.clear();
        self.send_text_inner(&mut text_only).await
    }
}

fn passive_or_active_text_path(target: &Target, is_passive: bool) -> String {
    match (target, is_passive) {
        (Target::C2C(openid), _) => format!("/v2/users/{openid}/messages"),
        (Target::Group(openid), _) => format!("/v2/groups/{openid}/messages"),
        (Target::Channel(channel_id), _) => format!("/channels/{channel_id}/messages"),
    }
}

fn value_str(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Per-session C2C streaming state, enforcing strictly increasing chunk
/// indices and a single in-flight chunk.
pub struct StreamSession {
    dispatcher: Arc<StreamingDispatcher>,
    sending_lock: Mutex<()>,
    index: std::sync::atomic::AtomicU64,
    stream_id: Mutex<Option<String>>,
    ended: std::sync::atomic::AtomicBool,
    pending_full_text: Mutex<Option<String>>,
}

/// The subset of dispatcher state the streaming path needs, kept separate
/// so `StreamSession` doesn't need the whole `OutboundDispatcher`.
pub struct StreamingDispatcher {
    pub rest: RestClient,
    pub token_store: Arc<TokenStore>,
    pub msg_seq: Arc<MsgSeqCounter>,
    pub openid: String,
}

impl StreamSession {
    pub fn new(dispatcher: Arc<StreamingDispatcher>) -> StreamSession {
        StreamSession {
            dispatcher,
            sending_lock: Mutex::new(()),
            index: std::sync::atomic::AtomicU64::new(0),
            stream_id: Mutex::new(None),
            ended: std::sync::atomic::AtomicBool::new(false),
            pending_full_text: Mutex::new(None),
        }
    }

    /// Send one streaming chunk. If the lock is held (another chunk is in
    /// flight), the text is stashed as `pendingFullText` and sent as the
    /// next chunk once the lock frees.
    pub async fn send_chunk(&self, text: String, is_final: bool) -> Result<()> {
        if self.ended.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }

        let guard = match self.sending_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let mut pending = self.pending_full_text.lock().await;
                *pending = Some(text);
                return Ok(());
            }
        };

        self.send_chunk_locked(text, is_final, guard).await
    }

    async fn send_chunk_locked<'a>(
        &self,
        text: String,
        is_final: bool,
        guard: tokio::sync::MutexGuard<'a, ()>,
    ) -> Result<()> {
        let index = self.index.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let state = if is_final { 10u8 } else { 1u8 };

        let token = self.dispatcher.token_store.get_access_token().await?;
        let stream_id = self.stream_id.lock().await.clone();

        let mut body = json!({
            "content": text,
            "msg_type": 0,
            "msg_seq": self.dispatcher.msg_seq.next(&self.dispatcher.openid),
            "stream": { "state": state, "index": index },
        });
        if let Some(id) = &stream_id {
            body["stream"]["id"] = json!(id);
        }

        let path = format!("/v2/users/{}/messages", self.dispatcher.openid);
        let response = self.dispatcher.rest.request(&token, Method::POST, &path, Some(&body)).await?;

        if stream_id.is_none() {
            if let Some(id) = response.get("stream_id").and_then(|v| v.as_str()) {
                *self.stream_id.lock().await = Some(id.to_string());
            }
        }

        if is_final {
            self.ended.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        drop(guard);

        let stashed = self.pending_full_text.lock().await.take();
        if let Some(stashed) = stashed {
            Box::pin(self.send_chunk(stashed, false)).await?;
        }

        Ok(())
    }

    /// Send an empty keepalive chunk if no real chunk is currently in
    /// flight (lock not held).
    pub async fn maybe_keepalive(&self) -> Result<()> {
        if self.sending_lock.try_lock().is_err() {
            return Ok(());
        }
        self.send_chunk(String::new(), false).await
    }

    pub fn keepalive_interval() -> Duration {
        STREAM_KEEPALIVE_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> Account {
        Account {
            id: "a1".into(),
            name: "test".into(),
            enabled: true,
            app_id: "app".into(),
            client_secret: "secret".into(),
            secret_source: crate::config::SecretSource::Config,
            system_prompt: None,
            image_server_base_url: None,
            markdown_support: false,
            proxy_url: None,
        }
    }

    fn dispatcher_with_base(base: String) -> OutboundDispatcher {
        OutboundDispatcher::new(
            sample_account(),
            RestClient::new(reqwest::Client::new()).with_base_url(base),
            Arc::new(TokenStore::new(reqwest::Client::new(), "app".into(), "secret".into())),
            Arc::new(ReplyLimiter::new()),
            Arc::new(MsgSeqCounter::new()),
        )
    }

    #[tokio::test]
    async fn active_send_with_empty_text_fails_without_network_call() {
        let dispatcher = dispatcher_with_base("http://127.0.0.1:1".to_string());
        let intent = OutboundIntent {
            target: "c2c:u1".into(),
            text: Some("   ".into()),
            media_sources: vec![],
            reply_to_id: None,
            account_id: "a1".into(),
        };
        let result = dispatcher.send_text(intent).await;
        assert!(result.error.is_some());
        assert!(result.error.unwrap().contains("content required"));
    }

    #[tokio::test]
    async fn fallback_clears_reply_to_id_before_building_body() {
        let dispatcher = dispatcher_with_base("http://example.invalid".to_string());
        let mut intent = OutboundIntent {
            target: "c2c:u1".into(),
            text: Some("hi".into()),
            media_sources: vec![],
            reply_to_id: Some("m1".into()),
            account_id: "a1".into(),
        };
        for _ in 0..4 {
            dispatcher.reply_limiter.record_reply("m1");
        }
        let is_passive = dispatcher.resolve_passive(&mut intent);
        assert!(!is_passive);
        assert!(intent.reply_to_id.is_none());
    }

    #[tokio::test]
    async fn typing_indicator_is_dropped_once_reply_quota_is_exhausted() {
        let dispatcher = dispatcher_with_base("http://127.0.0.1:1".to_string());
        for _ in 0..4 {
            dispatcher.reply_limiter.record_reply("m1");
        }
        let result = dispatcher.send_typing_indicator("u1", "m1", 5).await;
        assert!(result.is_ok());
    }
}
