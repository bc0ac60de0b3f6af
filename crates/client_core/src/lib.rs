//! Client-side synchronization core for the support console: the push
//! channel, per-conversation message reconciliation, the conversation list,
//! the shared attachment cache and a polling fallback.

pub mod api;
pub mod attachments;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod index;
pub mod poller;
pub mod reconciler;
pub mod transport;

pub use api::{AttachmentUpload, ConsoleApi, HttpConsoleApi, SendRequest};
pub use attachments::{
    ApiAttachmentFetcher, AttachmentCache, AttachmentFetcher, AttachmentKind, AttachmentState,
    AttachmentStatus,
};
pub use config::{load_settings, SyncSettings};
pub use console::{ConsoleSession, ConversationView};
pub use error::{AttachmentFetchError, SyncError};
pub use index::ConversationIndex;
pub use poller::PollingFallbackFetcher;
pub use reconciler::{HistoryState, MessageReconciler};
pub use transport::{ConnectionState, Credentials, ReconnectPolicy, TransportSession, WsConnector};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
