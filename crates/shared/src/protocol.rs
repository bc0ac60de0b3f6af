use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{ActorId, AttachmentRef, ConversationId, DeliveryState, Direction, TenantId},
    error::ApiError,
};

/// Frames written by the client on the persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Identify {
        actor_id: ActorId,
        display_name: String,
        tenant_id: TenantId,
    },
    JoinRoom {
        conversation_id: ConversationId,
    },
    LeaveRoom {
        conversation_id: ConversationId,
    },
    Emit {
        event: String,
        payload: serde_json::Value,
    },
}

/// Message shape shared by REST responses and push frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWire {
    pub id: String,
    pub conversation_id: ConversationId,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        default,
        deserialize_with = "attachment_object_or_json_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub attachment: Option<AttachmentRef>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_state: Option<DeliveryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Some producers embed the attachment descriptor as a JSON-encoded string
/// rather than an object. Both forms decode to the same `AttachmentRef`.
fn attachment_object_or_json_string<'de, D>(
    deserializer: D,
) -> Result<Option<AttachmentRef>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Object(AttachmentRef),
        Encoded(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Object(attachment)) => Ok(Some(attachment)),
        Some(Raw::Encoded(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Encoded(text)) => serde_json::from_str(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Frames pushed by the server. Every conversation-scoped frame is tagged
/// with the tenant it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    MessageCreated {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        message: MessageWire,
    },
    MessageUpdated {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        message: MessageWire,
    },
    MessageDeleted {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        message_id: String,
    },
    Typing {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        actor_id: ActorId,
        is_typing: bool,
    },
    AuthRejected {
        reason: String,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationWire {
    pub id: ConversationId,
    pub counterpart_name: String,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPage {
    pub items: Vec<ConversationWire>,
    #[serde(default)]
    pub next_page: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub client_timestamp: DateTime<Utc>,
}

/// Acknowledgement of a send. Servers that deliver confirmation only over
/// the channel leave `message_id` empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendAck {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageBody {
    pub content: String,
}
