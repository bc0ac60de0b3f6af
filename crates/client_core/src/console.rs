//! Session hub that wires the transport, the conversation index, the open
//! conversation's reconciler and the shared attachment cache together.

use std::sync::{Arc, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use shared::domain::{
    ActorId, AttachmentKey, ConversationId, ConversationSummary, DeliveryState, Message,
    MessageId, TenantId,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{
    api::{AttachmentUpload, ConsoleApi},
    attachments::{AttachmentCache, AttachmentStatus, FetchResult},
    config::SyncSettings,
    error::SyncError,
    events::PushEvent,
    index::ConversationIndex,
    reconciler::{
        load_history, resubmit, submit, HistoryState, MessageReconciler, OutgoingDraft,
        SharedReconciler,
    },
    transport::{Credentials, TransportEvent, TransportSession},
};

/// What a conversation view renders from. Dropping it is enough to stop
/// observing; `close_conversation` is what stops routing into it.
pub struct ConversationView {
    pub conversation_id: ConversationId,
    pub messages: watch::Receiver<Vec<Message>>,
    pub history: watch::Receiver<HistoryState>,
    reconciler: SharedReconciler,
}

#[derive(Clone)]
struct OpenConversation {
    id: ConversationId,
    reconciler: SharedReconciler,
}

type OpenSlot = Arc<Mutex<Option<OpenConversation>>>;

pub struct ConsoleSession {
    settings: SyncSettings,
    account_id: TenantId,
    api: Arc<dyn ConsoleApi>,
    transport: Arc<TransportSession>,
    attachments: Arc<AttachmentCache>,
    index: Arc<Mutex<ConversationIndex>>,
    open: OpenSlot,
    router: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleSession {
    /// Builds the hub and starts routing transport events. The transport
    /// does not need to be connected yet.
    pub fn new(
        settings: SyncSettings,
        account_id: TenantId,
        api: Arc<dyn ConsoleApi>,
        transport: Arc<TransportSession>,
        attachments: Arc<AttachmentCache>,
    ) -> Self {
        let index = Arc::new(Mutex::new(ConversationIndex::new()));
        let open: OpenSlot = Arc::new(Mutex::new(None));
        let router = tokio::spawn(route_events(
            BroadcastStream::new(transport.subscribe_events()),
            Arc::clone(&index),
            Arc::clone(&open),
        ));

        Self {
            settings,
            account_id,
            api,
            transport,
            attachments,
            index,
            open,
            router: std::sync::Mutex::new(Some(router)),
        }
    }

    pub fn transport(&self) -> &Arc<TransportSession> {
        &self.transport
    }

    pub fn attachments(&self) -> &Arc<AttachmentCache> {
        &self.attachments
    }

    pub async fn connect(&self, credentials: Credentials) -> Result<(), SyncError> {
        self.transport.connect(credentials).await
    }

    pub async fn watch_conversations(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.index.lock().await.subscribe()
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.index.lock().await.summaries().to_vec()
    }

    pub async fn typing(&self, conversation_id: &ConversationId) -> Vec<ActorId> {
        self.index.lock().await.typing(conversation_id)
    }

    /// Fetches one listing page into the index. Returns the next page, if any.
    pub async fn load_conversations(&self, page: u32) -> Result<Option<u32>, SyncError> {
        let listing = self
            .api
            .list_conversations(page, self.settings.conversation_page_size)
            .await?;
        debug!(page, count = listing.summaries.len(), "conversation page loaded");
        self.index.lock().await.merge_page(listing.summaries);
        Ok(listing.next_page)
    }

    /// Makes `conversation_id` the open conversation. Any previous one is
    /// closed first; its history fetch keeps running against its own state.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> ConversationView {
        let reconciler =
            MessageReconciler::shared(conversation_id.clone(), self.settings.match_tolerance);
        let view = {
            let guard = reconciler.lock().await;
            ConversationView {
                conversation_id: conversation_id.clone(),
                messages: guard.subscribe(),
                history: guard.watch_history(),
                reconciler: Arc::clone(&reconciler),
            }
        };

        let previous = self.open.lock().await.replace(OpenConversation {
            id: conversation_id.clone(),
            reconciler: Arc::clone(&reconciler),
        });
        if let Some(previous) = previous {
            self.release(previous).await;
        }

        if !self.index.lock().await.select(&conversation_id) {
            debug!(%conversation_id, "opened conversation is not in the index");
        }
        if !self.transport.subscribe_room(conversation_id.clone()).await {
            debug!(%conversation_id, "room join deferred until the channel is up");
        }

        let api = Arc::clone(&self.api);
        let limit = self.settings.history_page_size;
        tokio::spawn(async move {
            if let Err(err) = load_history(&reconciler, api.as_ref(), limit).await {
                debug!("initial history load failed: {err}");
            }
        });

        info!(%conversation_id, "conversation opened");
        view
    }

    pub async fn close_conversation(&self) {
        let Some(previous) = self.open.lock().await.take() else {
            return;
        };
        self.release(previous).await;
        self.index.lock().await.clear_selection();
    }

    pub async fn open_conversation_id(&self) -> Option<ConversationId> {
        self.open.lock().await.as_ref().map(|open| open.id.clone())
    }

    pub async fn send_text(
        &self,
        content: impl Into<String>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, SyncError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(SyncError::Send("message is empty".into()));
        }
        self.send(OutgoingDraft {
            content: Some(content),
            attachment: None,
            reply_to,
        })
        .await
    }

    pub async fn send_attachment(
        &self,
        upload: AttachmentUpload,
        caption: Option<String>,
    ) -> Result<MessageId, SyncError> {
        self.send(OutgoingDraft {
            content: caption.filter(|c| !c.trim().is_empty()),
            attachment: Some(upload),
            reply_to: None,
        })
        .await
    }

    pub async fn retry_send(&self, provisional: &MessageId) -> Result<MessageId, SyncError> {
        let open = self.require_open().await?;
        resubmit(&open.reconciler, self.api.as_ref(), provisional).await
    }

    pub async fn edit_message(
        &self,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Result<(), SyncError> {
        let open = self.require_open().await?;
        let content = content.into();
        let mut edited = open
            .reconciler
            .lock()
            .await
            .messages()
            .iter()
            .find(|m| &m.id == message_id && !m.is_provisional())
            .cloned()
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;

        self.api
            .edit_message(&open.id, message_id, &content)
            .await?;

        edited.content = Some(content);
        open.reconciler.lock().await.apply_update(edited.clone());
        self.index.lock().await.apply_edit(&edited);
        Ok(())
    }

    /// Deletes on the server, or just discards a local entry that never got
    /// a server id.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), SyncError> {
        let open = self.require_open().await?;
        if !message_id.is_provisional() {
            self.api.delete_message(&open.id, message_id).await?;
        }
        if !open.reconciler.lock().await.apply_delete(message_id) {
            debug!(id = %message_id, "deleted message was not in the timeline");
        }
        Ok(())
    }

    pub async fn reload_history(&self) -> Result<usize, SyncError> {
        let open = self.require_open().await?;
        load_history(&open.reconciler, self.api.as_ref(), self.settings.history_page_size).await
    }

    /// Ids of entries in the open conversation whose send failed.
    pub async fn failed_sends(&self) -> Vec<MessageId> {
        let Ok(open) = self.require_open().await else {
            return Vec::new();
        };
        let reconciler = open.reconciler.lock().await;
        reconciler
            .messages()
            .iter()
            .filter(|m| m.delivery_state == DeliveryState::Failed)
            .map(|m| m.id.clone())
            .collect()
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<(), SyncError> {
        let open = self.require_open().await?;
        self.transport.send_typing(&open.id, is_typing).await
    }

    /// Render-time status of a message's attachment, or `None` when the
    /// message has none.
    pub fn resolve_attachment(&self, message: &Message) -> Option<AttachmentStatus> {
        let hint = message.attachment.as_ref()?;
        Some(self.attachments.resolve(&self.attachment_key(message), Some(hint)))
    }

    /// Retry affordance for a failed attachment.
    pub async fn fetch_attachment(&self, message: &Message) -> Option<FetchResult> {
        message.attachment.as_ref()?;
        Some(self.attachments.request(&self.attachment_key(message)).await)
    }

    /// Stops routing, closes the open conversation and the channel. The
    /// attachment cache is shared and is shut down by its owner.
    pub async fn shutdown(&self) {
        self.close_conversation().await;
        self.stop_router();
        self.transport.disconnect().await;
        info!("console session shut down");
    }

    async fn send(&self, draft: OutgoingDraft) -> Result<MessageId, SyncError> {
        let open = self.require_open().await?;
        submit(&open.reconciler, self.api.as_ref(), draft, Utc::now()).await
    }

    async fn require_open(&self) -> Result<OpenConversation, SyncError> {
        self.open
            .lock()
            .await
            .clone()
            .ok_or(SyncError::NoOpenConversation)
    }

    async fn release(&self, previous: OpenConversation) {
        previous.reconciler.lock().await.detach();
        self.transport.unsubscribe_room(&previous.id).await;
        debug!(conversation_id = %previous.id, "conversation closed");
    }

    fn attachment_key(&self, message: &Message) -> AttachmentKey {
        AttachmentKey {
            account_id: self.account_id.clone(),
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
        }
    }

    fn stop_router(&self) {
        if let Some(router) = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            router.abort();
        }
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        self.stop_router();
    }
}

async fn route_events(
    mut events: BroadcastStream<TransportEvent>,
    index: Arc<Mutex<ConversationIndex>>,
    open: OpenSlot,
) {
    while let Some(item) = events.next().await {
        match item {
            Ok(TransportEvent::Push(push)) => route_push(push, &index, &open).await,
            Ok(TransportEvent::StateChanged(state)) => debug!(?state, "transport state"),
            Ok(TransportEvent::ServerError(err)) => {
                warn!(code = ?err.code, "server reported an error: {}", err.message);
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event router fell behind; reload history to resync");
            }
        }
    }
    debug!("event router stopped");
}

async fn route_push(push: PushEvent, index: &Mutex<ConversationIndex>, open: &OpenSlot) {
    let target = {
        let open = open.lock().await;
        open.as_ref()
            .filter(|o| &o.id == push.conversation_id())
            .map(|o| Arc::clone(&o.reconciler))
    };

    match push {
        PushEvent::MessageCreated(message) => {
            index.lock().await.apply_message(&message);
            if let Some(reconciler) = target {
                reconciler.lock().await.apply_push(message);
            }
        }
        PushEvent::MessageUpdated(message) => {
            index.lock().await.apply_edit(&message);
            if let Some(reconciler) = target {
                reconciler.lock().await.apply_update(message);
            }
        }
        PushEvent::MessageDeleted { message_id, .. } => {
            if let Some(reconciler) = target {
                reconciler.lock().await.apply_delete(&message_id);
            }
        }
        PushEvent::Typing {
            conversation_id,
            actor_id,
            is_typing,
        } => {
            index
                .lock()
                .await
                .set_typing(&conversation_id, actor_id, is_typing);
        }
    }
}

#[cfg(test)]
#[path = "tests/console_tests.rs"]
mod tests;
