//! Wire and normalized data types.

mod inbound;
mod op;

pub use inbound::{Attachment, InboundEvent, InboundKind};
pub use op::{
    DispatchEvent, GatewayFrame, IdentifyPayload, MessageAttachment, MessageAuthor,
    MessageCreatePayload, RawFrame, ReadyPayload, ReadyUser, ResumePayload, SentFrame,
};
