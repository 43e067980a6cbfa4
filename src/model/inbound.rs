//! Normalized inbound envelope handed to [`crate::inbound_queue::InboundQueue`].

use serde::Serialize;

use super::op::{DispatchEvent, MessageAttachment, MessageCreatePayload};

/// Which surface an inbound message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundKind {
    C2C,
    Dm,
    Guild,
    Group,
}

/// A single inbound attachment, normalized from the wire shape.
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub content_type: Option<String>,
    pub url: Option<String>,
    pub filename: Option<String>,
}

impl From<MessageAttachment> for Attachment {
    fn from(a: MessageAttachment) -> Self {
        Attachment {
            content_type: a.content_type,
            url: a.url,
            filename: a.filename,
        }
    }
}

/// A normalized inbound user event, independent of which of the four
/// dispatch event types it arrived as.
#[derive(Debug, Clone, Serialize)]
pub struct InboundEvent {
    pub kind: InboundKind,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub message_id: String,
    pub timestamp: Option<String>,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
    pub group_openid: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl InboundEvent {
    /// Translate a decoded dispatch event into a normalized inbound event.
    /// Returns `None` for dispatch variants that carry no user message
    /// (`Ready`/`Resumed`/`Unknown`).
    pub fn from_dispatch(event: DispatchEvent) -> Option<InboundEvent> {
        let (kind, payload) = match event {
            DispatchEvent::C2CMessageCreate(p) => (InboundKind::C2C, p),
            DispatchEvent::GroupAtMessageCreate(p) => (InboundKind::Group, p),
            DispatchEvent::AtMessageCreate(p) => (InboundKind::Guild, p),
            DispatchEvent::DirectMessageCreate(p) => (InboundKind::Dm, p),
            DispatchEvent::Ready(_) | DispatchEvent::Resumed | DispatchEvent::Unknown(_) => {
                return None
            }
        };
        Some(Self::from_payload(kind, payload))
    }

    fn from_payload(kind: InboundKind, payload: MessageCreatePayload) -> InboundEvent {
        let author = payload.author.as_ref();
        let sender_id = author
            .and_then(|a| a.member_openid.clone().or_else(|| a.union_openid.clone()).or_else(|| a.id.clone()))
            .unwrap_or_default();
        let sender_name = author.and_then(|a| a.username.clone());

        InboundEvent {
            kind,
            sender_id,
            sender_name,
            content: payload.content.unwrap_or_default(),
            message_id: payload.id,
            timestamp: payload.timestamp,
            channel_id: payload.channel_id,
            guild_id: payload.guild_id,
            group_openid: payload.group_openid,
            attachments: payload.attachments.into_iter().map(Attachment::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::op::MessageAuthor;

    #[test]
    fn prefers_member_openid_for_sender_id() {
        let payload = MessageCreatePayload {
            id: "m1".into(),
            content: Some("hi".into()),
            author: Some(MessageAuthor {
                id: Some("legacy".into()),
                member_openid: Some("open1".into()),
                union_openid: None,
                username: Some("alice".into()),
            }),
            group_openid: None,
            channel_id: None,
            guild_id: None,
            timestamp: None,
            attachments: vec![],
        };
        let event = InboundEvent::from_payload(InboundKind::C2C, payload);
        assert_eq!(event.sender_id, "open1");
        assert_eq!(event.sender_name.as_deref(), Some("alice"));
    }

    #[test]
    fn ready_and_resumed_produce_no_inbound_event() {
        assert!(InboundEvent::from_dispatch(DispatchEvent::Resumed).is_none());
    }
}
