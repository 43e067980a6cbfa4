//! Gateway wire envelopes: the op-code/dispatch-event frames exchanged over
//! the WebSocket connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame as it comes off the WebSocket, before its `d` payload has been
/// interpreted. Decoding happens in exactly one place
/// ([`GatewayFrame::decode`]) since the wire format hands back duck-typed
/// JSON blobs whose shape depends on `op`/`t`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    pub op: u8,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

/// A frame that has been classified into its concrete op-code variant.
#[derive(Debug, Clone)]
pub enum GatewayFrame {
    /// Op 10 — connection parameters, carries the heartbeat interval in ms.
    Hello { heartbeat_interval_ms: u64 },
    /// Op 0 — an event dispatch, `s` is always positive for these.
    Dispatch { seq: u64, event: DispatchEvent },
    /// Op 11 — heartbeat acknowledged; purely informational.
    HeartbeatAck,
    /// Op 7 — server wants us to reconnect (and, ideally, resume).
    Reconnect,
    /// Op 9 — the session could not be resumed/established.
    InvalidSession { resumable: bool },
}

/// Decoded dispatch (`op: 0`) event bodies this crate understands. Anything
/// else is ignored, logged at `trace!`.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Ready(ReadyPayload),
    Resumed,
    C2CMessageCreate(MessageCreatePayload),
    GroupAtMessageCreate(MessageCreatePayload),
    AtMessageCreate(MessageCreatePayload),
    DirectMessageCreate(MessageCreatePayload),
    Unknown(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub user: Option<ReadyUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageAttachment {
    pub content_type: Option<String>,
    pub url: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageCreatePayload {
    pub id: String,
    pub content: Option<String>,
    #[serde(default)]
    pub author: Option<MessageAuthor>,
    #[serde(default)]
    pub group_openid: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub attachments: Vec<MessageAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageAuthor {
    pub id: Option<String>,
    pub member_openid: Option<String>,
    pub union_openid: Option<String>,
    pub username: Option<String>,
}

impl RawFrame {
    /// Classify a raw frame into a [`GatewayFrame`]. Returns `None` for
    /// dispatch events of a type this crate does not act on (e.g. guild
    /// lifecycle events) — the caller should still update `lastSeq` for
    /// those since `s` was still positive.
    pub fn decode(self) -> Result<Option<GatewayFrame>, serde_json::Error> {
        match self.op {
            10 => {
                let interval = self
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_u64)
                    .unwrap_or(40_000);
                Ok(Some(GatewayFrame::Hello {
                    heartbeat_interval_ms: interval,
                }))
            }
            11 => Ok(Some(GatewayFrame::HeartbeatAck)),
            7 => Ok(Some(GatewayFrame::Reconnect)),
            9 => {
                let resumable = self.d.as_bool().unwrap_or(false);
                Ok(Some(GatewayFrame::InvalidSession { resumable }))
            }
            0 => {
                let seq = self.s.unwrap_or(0);
                let event = match self.t.as_deref() {
                    Some("READY") => DispatchEvent::Ready(serde_json::from_value(self.d)?),
                    Some("RESUMED") => DispatchEvent::Resumed,
                    Some("C2C_MESSAGE_CREATE") => {
                        DispatchEvent::C2CMessageCreate(serde_json::from_value(self.d)?)
                    }
                    Some("GROUP_AT_MESSAGE_CREATE") => {
                        DispatchEvent::GroupAtMessageCreate(serde_json::from_value(self.d)?)
                    }
                    Some("AT_MESSAGE_CREATE") => {
                        DispatchEvent::AtMessageCreate(serde_json::from_value(self.d)?)
                    }
                    Some("DIRECT_MESSAGE_CREATE") => {
                        DispatchEvent::DirectMessageCreate(serde_json::from_value(self.d)?)
                    }
                    Some(other) => DispatchEvent::Unknown(other.to_string()),
                    None => DispatchEvent::Unknown(String::new()),
                };
                Ok(Some(GatewayFrame::Dispatch { seq, event }))
            }
            _ => Ok(None),
        }
    }
}

/// Outbound frames this client ever sends. Kept as a single enum, serialized
/// untagged via explicit `json!` construction rather than derive, since the
/// `d` shape varies by op and one variant per op-code reads clearly here.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SentFrame {
    Identify {
        #[serde(rename = "op")]
        op: u8,
        d: IdentifyPayload,
    },
    Resume {
        #[serde(rename = "op")]
        op: u8,
        d: ResumePayload,
    },
    Heartbeat {
        #[serde(rename = "op")]
        op: u8,
        d: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub intents: u32,
    pub shard: [u8; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

impl SentFrame {
    pub fn identify(token: String, intents: u32) -> SentFrame {
        SentFrame::Identify {
            op: 2,
            d: IdentifyPayload {
                token,
                intents,
                shard: [0, 1],
            },
        }
    }

    pub fn resume(token: String, session_id: String, seq: u64) -> SentFrame {
        SentFrame::Resume {
            op: 6,
            d: ResumePayload {
                token,
                session_id,
                seq,
            },
        }
    }

    pub fn heartbeat(last_seq: Option<u64>) -> SentFrame {
        SentFrame::Heartbeat {
            op: 1,
            d: last_seq,
        }
    }
}
