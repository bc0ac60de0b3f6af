//! Conversion of raw channel frames into validated push events.

use shared::{
    domain::{
        ActorId, ConversationId, DeliveryState, Direction, Message, MessageId, TenantId,
    },
    error::ApiError,
    protocol::{MessageWire, ServerFrame},
};
use tracing::warn;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    MessageCreated(Message),
    MessageUpdated(Message),
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Typing {
        conversation_id: ConversationId,
        actor_id: ActorId,
        is_typing: bool,
    },
}

impl PushEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageCreated(message) | Self::MessageUpdated(message) => {
                &message.conversation_id
            }
            Self::MessageDeleted {
                conversation_id, ..
            }
            | Self::Typing {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Push(PushEvent),
    AuthRejected(String),
    ServerError(ApiError),
    /// Frame addressed to another tenant; never surfaced to this session.
    ForeignTenant(TenantId),
}

pub fn decode_frame(text: &str, tenant: &TenantId) -> Result<DecodedFrame, SyncError> {
    let frame: ServerFrame = serde_json::from_str(text)
        .map_err(|err| SyncError::InvalidEvent(format!("malformed frame: {err}")))?;

    let (frame_tenant, event) = match frame {
        ServerFrame::AuthRejected { reason } => return Ok(DecodedFrame::AuthRejected(reason)),
        ServerFrame::Error(error) => return Ok(DecodedFrame::ServerError(error)),
        ServerFrame::MessageCreated {
            tenant_id,
            conversation_id,
            message,
        } => (
            tenant_id,
            PushEvent::MessageCreated(message_from_wire(message, &conversation_id)?),
        ),
        ServerFrame::MessageUpdated {
            tenant_id,
            conversation_id,
            message,
        } => (
            tenant_id,
            PushEvent::MessageUpdated(message_from_wire(message, &conversation_id)?),
        ),
        ServerFrame::MessageDeleted {
            tenant_id,
            conversation_id,
            message_id,
        } => {
            if message_id.trim().is_empty() {
                return Err(SyncError::InvalidEvent("deleted message id is empty".into()));
            }
            (
                tenant_id,
                PushEvent::MessageDeleted {
                    conversation_id,
                    message_id: MessageId::server(message_id),
                },
            )
        }
        ServerFrame::Typing {
            tenant_id,
            conversation_id,
            actor_id,
            is_typing,
        } => (
            tenant_id,
            PushEvent::Typing {
                conversation_id,
                actor_id,
                is_typing,
            },
        ),
    };

    if &frame_tenant != tenant {
        warn!(
            expected = %tenant,
            received = %frame_tenant,
            conversation_id = %event.conversation_id(),
            "dropping frame for foreign tenant"
        );
        return Ok(DecodedFrame::ForeignTenant(frame_tenant));
    }

    Ok(DecodedFrame::Push(event))
}

/// Validates a wire message and converts it into a confirmed `Message`.
/// Used for both push frames and history responses.
pub fn message_from_wire(
    wire: MessageWire,
    conversation_id: &ConversationId,
) -> Result<Message, SyncError> {
    if wire.id.trim().is_empty() {
        return Err(SyncError::InvalidEvent("message id is empty".into()));
    }
    if &wire.conversation_id != conversation_id {
        return Err(SyncError::InvalidEvent(format!(
            "message {} belongs to conversation {}, frame targets {}",
            wire.id, wire.conversation_id, conversation_id
        )));
    }
    let content = wire.content.filter(|text| !text.is_empty());
    if content.is_none() && wire.attachment.is_none() {
        return Err(SyncError::InvalidEvent(format!(
            "message {} has neither content nor attachment",
            wire.id
        )));
    }

    let delivery_state = wire.delivery_state.unwrap_or(match wire.direction {
        Direction::Outbound => DeliveryState::Sent,
        Direction::Inbound => DeliveryState::Delivered,
    });

    Ok(Message {
        id: MessageId::server(wire.id),
        conversation_id: wire.conversation_id,
        direction: wire.direction,
        content,
        attachment: wire.attachment,
        timestamp: wire.timestamp,
        delivery_state,
        reply_to: wire.reply_to.map(|id| MessageId::parse(&id)),
        edited: false,
    })
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
