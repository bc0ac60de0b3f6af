use shared::domain::{AttachmentKey, ConversationId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("channel authentication rejected: {0}")]
    TransportAuth(String),
    #[error("channel unreachable after {attempts} attempts: {reason}")]
    TransportConnect { attempts: u32, reason: String },
    #[error("channel is not connected")]
    NotConnected,
    #[error("connect was cancelled by a newer connect or disconnect")]
    ConnectCancelled,
    #[error("failed to send message: {0}")]
    Send(String),
    #[error("failed to fetch history for conversation {conversation_id}: {reason}")]
    HistoryFetch {
        conversation_id: ConversationId,
        reason: String,
    },
    #[error(transparent)]
    AttachmentFetch(#[from] AttachmentFetchError),
    #[error("invalid push event: {0}")]
    InvalidEvent(String),
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// Failure of a single attachment fetch. Cloned to every caller that was
/// coalesced onto the same fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to fetch attachment {key}: {reason}")]
pub struct AttachmentFetchError {
    pub key: AttachmentKey,
    pub reason: String,
}
