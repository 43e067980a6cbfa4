//! Per-account gateway state machine: connect, identify/resume, the receive
//! loop, heartbeat, and reconnect orchestration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::Method;
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::config::{Account, HostServices};
use crate::dispatcher::{OutboundDispatcher, StreamSession, StreamingDispatcher};
use crate::error::{GatewayError, Result};
use crate::image::ImageResolver;
use crate::inbound_queue::InboundQueue;
use crate::intents::{downgrade, INTENT_LEVELS};
use crate::model::{DispatchEvent, GatewayFrame, InboundEvent, InboundKind, RawFrame, SentFrame};
use crate::msg_seq::MsgSeqCounter;
use crate::reconnect::{ReconnectAction, ReconnectPolicy};
use crate::reply_limiter::ReplyLimiter;
use crate::rest::RestClient;
use crate::session_store::{SessionState, SessionStore};
use crate::target::{MediaSource, OutboundIntent, Target};
use crate::token::TokenStore;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const INVALID_SESSION_DELAY: Duration = Duration::from_secs(3);
const REPLY_PIPELINE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct GatewayUrlResponse {
    url: String,
}

/// What ended one connection attempt, handed back up to the reconnect loop.
enum ConnectOutcome {
    /// Caller asked us to stop (`GatewayHandle::stop`).
    Stopped,
    /// The socket closed with this WebSocket close code.
    Close(u16),
    /// Server sent op 7 (Reconnect); treat like a clean close asking for an
    /// immediate resume attempt.
    ServerReconnect,
    /// Server sent op 9 (Invalid Session); `resumable` decides whether the
    /// next attempt may resume or must re-identify.
    InvalidSession { resumable: bool },
}

/// Ties every other module together into the per-account connection loop.
pub struct GatewayFsm {
    account: Account,
    host: Arc<dyn HostServices>,
    rest: RestClient,
    token_store: Arc<TokenStore>,
    session_store: Arc<SessionStore>,
    dispatcher: Arc<OutboundDispatcher>,
    inbound_queue: InboundQueue,
}

impl GatewayFsm {
    pub fn new(
        account: Account,
        host: Arc<dyn HostServices>,
        rest: RestClient,
        token_store: Arc<TokenStore>,
        session_store: Arc<SessionStore>,
        reply_limiter: Arc<ReplyLimiter>,
        msg_seq: Arc<MsgSeqCounter>,
    ) -> GatewayFsm {
        let dispatcher = Arc::new(OutboundDispatcher::new(
            account.clone(),
            rest.clone(),
            Arc::clone(&token_store),
            reply_limiter,
            Arc::clone(&msg_seq),
        ));

        let worker_dispatcher = Arc::clone(&dispatcher);
        let worker_host = Arc::clone(&host);
        let worker_rest = rest.clone();
        let worker_token_store = Arc::clone(&token_store);
        let worker_msg_seq = Arc::clone(&msg_seq);
        let account_id = account.id.clone();
        let inbound_queue = InboundQueue::spawn(move |event: InboundEvent| {
            let dispatcher = Arc::clone(&worker_dispatcher);
            let host = Arc::clone(&worker_host);
            let rest = worker_rest.clone();
            let token_store = Arc::clone(&worker_token_store);
            let msg_seq = Arc::clone(&worker_msg_seq);
            let account_id = account_id.clone();
            async move {
                deliver_reply(dispatcher, host, rest, token_store, msg_seq, account_id, event).await;
            }
        });

        GatewayFsm {
            account,
            host,
            rest,
            token_store,
            session_store,
            dispatcher,
            inbound_queue,
        }
    }

    pub fn dispatcher(&self) -> &Arc<OutboundDispatcher> {
        &self.dispatcher
    }

    pub fn queue_stats(&self) -> (u64, u64) {
        (self.inbound_queue.processed_count(), self.inbound_queue.dropped_count())
    }

    /// Spawn the reconnect loop as a background task and return a handle the
    /// host can use to cancel it.
    pub fn start(self: Arc<Self>) -> GatewayHandle {
        let abort = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let task_abort = Arc::clone(&abort);
        let task_stopped = Arc::clone(&stopped);
        let fsm = Arc::clone(&self);
        let task = tokio::spawn(async move {
            fsm.run_reconnect_loop(task_abort, task_stopped).await;
        });

        GatewayHandle { abort, stopped, task }
    }

    async fn run_reconnect_loop(&self, abort: Arc<Notify>, stopped: Arc<AtomicBool>) {
        let mut policy = ReconnectPolicy::new();
        let mut session = self
            .session_store
            .load(&self.account.id)
            .await
            .unwrap_or_default();
        let mut intent_level = session.intent_level_index;

        loop {
            if stopped.load(Ordering::SeqCst) {
                return;
            }

            let outcome = self
                .connect_and_run(&mut session, &mut intent_level, &mut policy, &abort)
                .await;

            let action = match outcome {
                Ok(ConnectOutcome::Stopped) => return,
                Ok(ConnectOutcome::Close(code)) => policy.action_for_close_code(code),
                Ok(ConnectOutcome::ServerReconnect) => ReconnectAction::Reconnect {
                    delay: policy.next_delay().unwrap_or(Duration::from_secs(60)),
                    keep_session: true,
                },
                // Both resumable and non-resumable Invalid Session refresh
                // the token and reconnect after a flat delay, not the
                // backoff schedule.
                Ok(ConnectOutcome::InvalidSession { resumable }) => ReconnectAction::RefreshTokenAndReconnect {
                    delay: INVALID_SESSION_DELAY,
                    keep_session: resumable,
                },
                Err(err) => {
                    warn!(account = %self.account.id, "gateway connect attempt failed: {err}");
                    policy.action_for_connect_error(&err)
                }
            };

            match action {
                ReconnectAction::Stop => return,
                ReconnectAction::StopPermanently { reason } => {
                    warn!(account = %self.account.id, %reason, "gateway will not reconnect");
                    return;
                }
                ReconnectAction::Reconnect { delay, keep_session } => {
                    if !keep_session {
                        self.reset_session(&mut session, &mut intent_level).await;
                    }
                    if self.sleep_or_abort(delay, &abort).await {
                        return;
                    }
                }
                ReconnectAction::RefreshTokenAndReconnect { delay, keep_session } => {
                    self.token_store.clear_cache().await;
                    if !keep_session {
                        self.reset_session(&mut session, &mut intent_level).await;
                    }
                    if self.sleep_or_abort(delay, &abort).await {
                        return;
                    }
                }
            }
        }
    }

    async fn reset_session(&self, session: &mut SessionState, intent_level: &mut usize) {
        *session = SessionState::default();
        *intent_level = downgrade(*intent_level);
        session.intent_level_index = *intent_level;
        self.session_store.clear(&self.account.id).await;
    }

    /// Sleep for `delay`, waking early (and returning `true`) if the host
    /// asked us to stop in the meantime.
    async fn sleep_or_abort(&self, delay: Duration, abort: &Arc<Notify>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = abort.notified() => true,
        }
    }

    async fn connect_and_run(
        &self,
        session: &mut SessionState,
        intent_level: &mut usize,
        policy: &mut ReconnectPolicy,
        abort: &Arc<Notify>,
    ) -> Result<ConnectOutcome> {
        let token = self.token_store.get_access_token().await?;
        let gateway: GatewayUrlResponse = serde_json::from_value(
            self.rest.request(&token, Method::GET, "/gateway", None).await?,
        )?;

        debug!(account = %self.account.id, url = %gateway.url, "connecting to gateway");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&gateway.url).await?;
        let (sink, mut stream) = ws_stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let first = tokio::time::timeout(HELLO_TIMEOUT, stream.next())
            .await
            .map_err(|_| GatewayError::Protocol("no Hello frame within timeout"))?
            .ok_or(GatewayError::Protocol("gateway closed before Hello"))??;

        let heartbeat_interval_ms = match decode_message(first)? {
            Some(GatewayFrame::Hello { heartbeat_interval_ms }) => heartbeat_interval_ms,
            _ => return Err(GatewayError::Protocol("expected Hello as first frame")),
        };

        let last_seq = Arc::new(std::sync::atomic::AtomicU64::new(session.last_seq.unwrap_or(0)));
        let heartbeat_stop = Arc::new(Notify::new());
        spawn_heartbeat(Arc::clone(&sink), heartbeat_interval_ms, Arc::clone(&last_seq), Arc::clone(&heartbeat_stop));

        let gateway_token = format!("QQBot {token}");
        let identify_or_resume = if session.is_resumable() {
            SentFrame::resume(
                gateway_token,
                session.session_id.clone().unwrap(),
                session.last_seq.unwrap(),
            )
        } else {
            SentFrame::identify(gateway_token, INTENT_LEVELS[*intent_level].bits())
        };
        send_frame(&sink, &identify_or_resume).await?;

        policy.on_open();

        let outcome = loop {
            tokio::select! {
                _ = abort.notified() => break ConnectOutcome::Stopped,
                message = stream.next() => {
                    let Some(message) = message else {
                        break ConnectOutcome::Close(1006);
                    };
                    let message = match message {
                        Ok(m) => m,
                        Err(err) => {
                            warn!(account = %self.account.id, "websocket read error: {err}");
                            break ConnectOutcome::Close(1006);
                        }
                    };

                    if let Message::Close(frame) = &message {
                        let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                        break ConnectOutcome::Close(code);
                    }

                    match decode_message(message) {
                        Ok(Some(frame)) => {
                            if let Some(terminal) = self
                                .handle_frame(frame, session, intent_level, &last_seq)
                                .await
                            {
                                break terminal;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => trace!(account = %self.account.id, "ignoring unparseable frame: {err}"),
                    }
                }
            }
        };

        heartbeat_stop.notify_waiters();
        Ok(outcome)
    }

    /// Returns `Some(outcome)` when this frame should end the connection.
    async fn handle_frame(
        &self,
        frame: GatewayFrame,
        session: &mut SessionState,
        intent_level: &mut usize,
        last_seq: &Arc<std::sync::atomic::AtomicU64>,
    ) -> Option<ConnectOutcome> {
        match frame {
            GatewayFrame::Hello { .. } => {
                trace!("ignoring unexpected Hello on an already-established connection");
                None
            }
            GatewayFrame::HeartbeatAck => None,
            GatewayFrame::Reconnect => Some(ConnectOutcome::ServerReconnect),
            GatewayFrame::InvalidSession { resumable } => {
                if !resumable {
                    session.session_id = None;
                    session.last_seq = None;
                    *intent_level = downgrade(*intent_level);
                }
                Some(ConnectOutcome::InvalidSession { resumable })
            }
            GatewayFrame::Dispatch { seq, event } => {
                last_seq.store(seq, Ordering::Relaxed);
                session.last_seq = Some(seq);

                match event {
                    DispatchEvent::Ready(ready) => {
                        session.session_id = Some(ready.session_id);
                        session.intent_level_index = *intent_level;
                        session.last_connected_at = Some(chrono::Utc::now());
                        if let Err(err) = self.session_store.save_now(&self.account.id, session).await {
                            warn!(account = %self.account.id, "failed to persist session on Ready: {err}");
                        }
                        info!(account = %self.account.id, "gateway ready");
                    }
                    DispatchEvent::Resumed => {
                        info!(account = %self.account.id, "gateway resumed");
                    }
                    other => {
                        self.session_store.save_lazy(&self.account.id, session.clone()).await;
                        if let Some(inbound) = InboundEvent::from_dispatch(other) {
                            self.host.record_activity(&self.account.id, "message");
                            self.inbound_queue.enqueue(inbound).await;
                        }
                    }
                }
                None
            }
        }
    }
}

async fn send_frame(
    sink: &Arc<Mutex<futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >>>,
    frame: &SentFrame,
) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    sink.lock().await.send(Message::Text(text)).await?;
    Ok(())
}

fn spawn_heartbeat(
    sink: Arc<Mutex<futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >>>,
    interval_ms: u64,
    last_seq: Arc<std::sync::atomic::AtomicU64>,
    stop: Arc<Notify>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let seq = last_seq.load(Ordering::Relaxed);
                    let seq = if seq == 0 { None } else { Some(seq) };
                    let frame = SentFrame::heartbeat(seq);
                    if let Err(err) = send_frame(&sink, &frame).await {
                        warn!("heartbeat send failed: {err}");
                        return;
                    }
                }
                _ = stop.notified() => return,
            }
        }
    });
}

fn decode_message(message: Message) -> Result<Option<GatewayFrame>> {
    let text = match message {
        Message::Text(text) => text,
        Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => return Ok(None),
    };
    let raw: RawFrame = serde_json::from_str(&text)?;
    Ok(raw.decode()?)
}

/// Map a normalized inbound event to the `Target` an outbound reply to it
/// should go to.
fn target_for_inbound(event: &InboundEvent) -> Target {
    match event.kind {
        InboundKind::C2C => Target::C2C(event.sender_id.clone()),
        InboundKind::Group => Target::Group(
            event.group_openid.clone().unwrap_or_else(|| event.sender_id.clone()),
        ),
        InboundKind::Guild | InboundKind::Dm => {
            Target::Channel(event.channel_id.clone().unwrap_or_else(|| event.sender_id.clone()))
        }
    }
}

/// The actual reply-pipeline round trip invoked by the inbound worker:
/// format the envelope, hand it to the host, resolve any images in the
/// reply, and send the result back out. C2C events are handed to
/// [`deliver_reply_streaming`] instead, since that's the only kind a
/// `StreamSession` is defined for.
async fn deliver_reply(
    dispatcher: Arc<OutboundDispatcher>,
    host: Arc<dyn HostServices>,
    rest: RestClient,
    token_store: Arc<TokenStore>,
    msg_seq: Arc<MsgSeqCounter>,
    account_id: String,
    event: InboundEvent,
) {
    if event.kind == InboundKind::C2C {
        deliver_reply_streaming(dispatcher, host, rest, token_store, msg_seq, account_id, event).await;
        return;
    }

    let route = host.resolve_agent_route(&account_id, &event);
    let envelope = host.format_inbound_envelope(&account_id, &event);
    let target = target_for_inbound(&event);

    let reply = match tokio::time::timeout(REPLY_PIPELINE_TIMEOUT, host.dispatch_reply(&route, envelope)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            warn!(account = %account_id, message_id = %event.message_id, "reply pipeline failed: {err}");
            let text = if err.looks_like_auth_expired() {
                "出错了：请检查应用配置是否正确".to_string()
            } else {
                "出错了，请稍后再试".to_string()
            };
            notify_failure(&dispatcher, &account_id, &target, &event.message_id, text).await;
            return;
        }
        Err(_) => {
            warn!(account = %account_id, message_id = %event.message_id, "reply pipeline timed out");
            notify_failure(&dispatcher, &account_id, &target, &event.message_id, "响应超时，请稍后再试".to_string()).await;
            return;
        }
    };

    let Some(text) = reply.text else {
        return;
    };

    let resolved = ImageResolver::resolve(&text, &reply.media_urls);
    let base_intent = OutboundIntent {
        target: target.format(),
        text: Some(resolved.cleaned_text),
        media_sources: vec![],
        reply_to_id: Some(event.message_id.clone()),
        account_id: account_id.clone(),
    };

    let result = if let Some(source) = resolved.sources.into_iter().next() {
        dispatcher.send_media(base_intent, media_source_to_string(source)).await
    } else {
        dispatcher.send_text(base_intent).await
    };

    if let Some(err) = result.error {
        warn!(account = %account_id, message_id = %event.message_id, "reply send failed: {err}");
    }
}

/// Drives a multi-chunk C2C reply: opens the streaming pipeline, then feeds
/// each [`crate::config::PartialReply`] chunk it produces into a
/// `StreamSession` as it arrives, rather than waiting for one complete
/// reply. Falls back to the same user-visible failure notice as
/// [`deliver_reply`] on an open failure/timeout; a failure mid-stream (a
/// chunk send erroring, the channel closing early, or a per-chunk timeout)
/// is logged and the stream is simply abandoned, since there is no single
/// reply left to retry.
async fn deliver_reply_streaming(
    dispatcher: Arc<OutboundDispatcher>,
    host: Arc<dyn HostServices>,
    rest: RestClient,
    token_store: Arc<TokenStore>,
    msg_seq: Arc<MsgSeqCounter>,
    account_id: String,
    event: InboundEvent,
) {
    let route = host.resolve_agent_route(&account_id, &event);
    let envelope = host.format_inbound_envelope(&account_id, &event);
    let target = target_for_inbound(&event);

    let mut rx = match tokio::time::timeout(
        REPLY_PIPELINE_TIMEOUT,
        host.dispatch_reply_streaming(&route, envelope),
    )
    .await
    {
        Ok(Ok(rx)) => rx,
        Ok(Err(err)) => {
            warn!(account = %account_id, message_id = %event.message_id, "streaming reply pipeline failed: {err}");
            let text = if err.looks_like_auth_expired() {
                "出错了：请检查应用配置是否正确".to_string()
            } else {
                "出错了，请稍后再试".to_string()
            };
            notify_failure(&dispatcher, &account_id, &target, &event.message_id, text).await;
            return;
        }
        Err(_) => {
            warn!(account = %account_id, message_id = %event.message_id, "streaming reply pipeline timed out");
            notify_failure(&dispatcher, &account_id, &target, &event.message_id, "响应超时，请稍后再试".to_string()).await;
            return;
        }
    };

    let target_str = target.format();
    let stream_dispatcher = Arc::new(StreamingDispatcher {
        rest,
        token_store,
        msg_seq,
        openid: event.sender_id.clone(),
    });
    let session = StreamSession::new(stream_dispatcher);

    let mut last_chunk: Option<crate::config::PartialReply> = None;
    loop {
        let chunk = match tokio::time::timeout(REPLY_PIPELINE_TIMEOUT, rx.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) => {
                warn!(account = %account_id, message_id = %event.message_id, "streaming reply chunk timed out");
                break;
            }
        };

        let ended = chunk.ended;
        let text = chunk.text.clone().unwrap_or_default();
        if let Err(err) = session.send_chunk(text, ended).await {
            warn!(account = %account_id, message_id = %event.message_id, "streaming chunk send failed: {err}");
            break;
        }

        last_chunk = Some(chunk);
        if ended {
            break;
        }
    }

    let Some(last_chunk) = last_chunk else {
        return;
    };
    let Some(source) = ImageResolver::resolve(
        &last_chunk.text.unwrap_or_default(),
        &last_chunk.media_urls,
    )
    .sources
    .into_iter()
    .next() else {
        return;
    };

    let media_intent = OutboundIntent {
        target: target_str,
        text: None,
        media_sources: vec![],
        reply_to_id: Some(event.message_id.clone()),
        account_id: account_id.clone(),
    };
    if let Some(err) = dispatcher.send_media(media_intent, media_source_to_string(source)).await.error {
        warn!(account = %account_id, message_id = %event.message_id, "post-stream media send failed: {err}");
    }
}

/// Push a short, user-visible notice back to the originating target after
/// the reply pipeline errors or times out. Best-effort: a failure here is
/// logged, not retried, so a dead reply pipeline can't also wedge sends.
async fn notify_failure(
    dispatcher: &OutboundDispatcher,
    account_id: &str,
    target: &Target,
    message_id: &str,
    text: String,
) {
    let intent = OutboundIntent {
        target: target.format(),
        text: Some(text),
        media_sources: vec![],
        reply_to_id: Some(message_id.to_string()),
        account_id: account_id.to_string(),
    };
    if let Some(err) = dispatcher.send_text(intent).await.error {
        warn!(account = %account_id, message_id = %message_id, "failure notice send failed: {err}");
    }
}

fn media_source_to_string(source: MediaSource) -> String {
    match source {
        MediaSource::PublicUrl(url) => url,
        MediaSource::DataUrl(url) => url,
        MediaSource::LocalPath(path) => path.display().to_string(),
    }
}

/// Cancellation/join handle for a running [`GatewayFsm`] reconnect loop.
pub struct GatewayHandle {
    abort: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl GatewayHandle {
    /// Request the loop stop; any in-progress connection attempt is allowed
    /// to unwind rather than being killed mid-write.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.abort.notify_waiters();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_for_inbound_prefers_group_openid() {
        let event = InboundEvent {
            kind: InboundKind::Group,
            sender_id: "sender".into(),
            sender_name: None,
            content: String::new(),
            message_id: "m1".into(),
            timestamp: None,
            channel_id: None,
            guild_id: None,
            group_openid: Some("grp1".into()),
            attachments: vec![],
        };
        assert_eq!(target_for_inbound(&event), Target::Group("grp1".into()));
    }

    #[test]
    fn target_for_inbound_c2c_uses_sender() {
        let event = InboundEvent {
            kind: InboundKind::C2C,
            sender_id: "u1".into(),
            sender_name: None,
            content: String::new(),
            message_id: "m1".into(),
            timestamp: None,
            channel_id: None,
            guild_id: None,
            group_openid: None,
            attachments: vec![],
        };
        assert_eq!(target_for_inbound(&event), Target::C2C("u1".into()));
    }
}
