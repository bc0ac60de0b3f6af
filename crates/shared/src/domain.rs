use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(ActorId);
id_newtype!(TenantId);
id_newtype!(ConversationId);

const PROVISIONAL_PREFIX: &str = "local-";

/// Identity of a timeline entry. Provisional ids are minted locally and are
/// replaced by the server-assigned id once the message is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    Provisional(Uuid),
    Server(String),
}

impl MessageId {
    pub fn provisional() -> Self {
        Self::Provisional(Uuid::new_v4())
    }

    pub fn server(id: impl Into<String>) -> Self {
        Self::Server(id.into())
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    /// Parses the textual form produced by `Display`.
    pub fn parse(raw: &str) -> Self {
        raw.strip_prefix(PROVISIONAL_PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map(Self::Provisional)
            .unwrap_or_else(|| Self::Server(raw.to_string()))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(uuid) => write!(f, "{PROVISIONAL_PREFIX}{uuid}"),
            Self::Server(id) => f.write_str(id),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub direction: Direction,
    pub content: Option<String>,
    pub attachment: Option<AttachmentRef>,
    pub timestamp: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub edited: bool,
}

impl Message {
    /// Builds a locally originated entry that has not been confirmed yet.
    pub fn provisional(
        conversation_id: ConversationId,
        content: Option<String>,
        attachment: Option<AttachmentRef>,
        reply_to: Option<MessageId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::provisional(),
            conversation_id,
            direction: Direction::Outbound,
            content,
            attachment,
            timestamp,
            delivery_state: DeliveryState::Pending,
            reply_to,
            edited: false,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub counterpart_name: String,
    pub last_message_preview: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    pub unread_count: u32,
    pub is_selected: bool,
}

/// Cache identity of a message attachment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub account_id: TenantId,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.account_id, self.conversation_id, self.message_id
        )
    }
}
