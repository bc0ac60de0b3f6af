//! Per-conversation timeline that merges optimistic sends, the history
//! snapshot and push deliveries into one ordered, deduplicated sequence.
//!
//! Provisional entries are matched to their confirmed counterparts by
//! direction, payload and a timestamp tolerance window. Confirmed ids are
//! idempotent: a second delivery of the same id never changes the timeline.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{AttachmentRef, ConversationId, DeliveryState, Message, MessageId},
    protocol::SendAck,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::{AttachmentUpload, ConsoleApi, SendRequest},
    error::SyncError,
};

pub type SharedReconciler = Arc<Mutex<MessageReconciler>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryState {
    Idle,
    Loading,
    Loaded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The confirmed id was already present.
    Duplicate,
    ReplacedProvisional { provisional: MessageId },
    Inserted,
    /// The event targets another conversation and was not applied.
    ForeignConversation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Provisional slot now carries the server id.
    Confirmed(MessageId),
    /// A push already delivered the server id; the provisional entry is gone.
    CollapsedIntoPush(MessageId),
    /// Accepted without an id; the entry stays provisional until a push
    /// matches it.
    AwaitingPush,
    UnknownProvisional,
}

#[derive(Debug, Clone, Default)]
pub struct OutgoingDraft {
    pub content: Option<String>,
    pub attachment: Option<AttachmentUpload>,
    pub reply_to: Option<MessageId>,
}

pub struct MessageReconciler {
    conversation_id: ConversationId,
    timeline: Vec<Message>,
    tolerance: chrono::Duration,
    history: HistoryState,
    outbox: HashMap<MessageId, AttachmentUpload>,
    messages_tx: watch::Sender<Vec<Message>>,
    history_tx: watch::Sender<HistoryState>,
    attached: bool,
}

impl MessageReconciler {
    pub fn new(conversation_id: ConversationId, tolerance: Duration) -> Self {
        let (messages_tx, _) = watch::channel(Vec::new());
        let (history_tx, _) = watch::channel(HistoryState::Idle);
        Self {
            conversation_id,
            timeline: Vec::new(),
            tolerance: chrono::Duration::from_std(tolerance)
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
            history: HistoryState::Idle,
            outbox: HashMap::new(),
            messages_tx,
            history_tx,
            attached: true,
        }
    }

    pub fn shared(conversation_id: ConversationId, tolerance: Duration) -> SharedReconciler {
        Arc::new(Mutex::new(Self::new(conversation_id, tolerance)))
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.timeline
    }

    pub fn history_state(&self) -> &HistoryState {
        &self.history
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.messages_tx.subscribe()
    }

    pub fn watch_history(&self) -> watch::Receiver<HistoryState> {
        self.history_tx.subscribe()
    }

    /// Stops publishing to the view. State keeps being updated so late
    /// results still land in this conversation's own timeline.
    pub fn detach(&mut self) {
        self.attached = false;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Inserts a provisional outbound entry at the position implied by `now`.
    pub fn begin_send(&mut self, draft: &OutgoingDraft, now: DateTime<Utc>) -> Message {
        let attachment = draft.attachment.as_ref().map(|upload| AttachmentRef {
            file_name: Some(upload.file_name.clone()),
            mime_type: upload.mime_type.clone(),
            size_bytes: Some(upload.bytes.len() as u64),
        });
        let message = Message::provisional(
            self.conversation_id.clone(),
            draft.content.clone(),
            attachment,
            draft.reply_to.clone(),
            now,
        );
        if let Some(upload) = draft.attachment.clone() {
            self.outbox.insert(message.id.clone(), upload);
        }

        let position = self.timeline.partition_point(|m| m.timestamp <= now);
        self.timeline.insert(position, message.clone());
        debug!(conversation_id = %self.conversation_id, id = %message.id, "provisional entry added");
        self.publish();
        message
    }

    pub fn confirm_send(&mut self, provisional: &MessageId, ack: &SendAck) -> AckOutcome {
        let Some(server_id) = ack.message_id.as_deref().filter(|id| !id.is_empty()) else {
            let outcome = match self.position_of(provisional) {
                Some(idx) => {
                    let entry = &mut self.timeline[idx];
                    if entry.delivery_state == DeliveryState::Pending {
                        entry.delivery_state = DeliveryState::Sent;
                    }
                    AckOutcome::AwaitingPush
                }
                None => AckOutcome::UnknownProvisional,
            };
            self.publish();
            return outcome;
        };
        let server_id = MessageId::server(server_id);
        self.outbox.remove(provisional);

        if self.position_of(&server_id).is_some() {
            let before = self.timeline.len();
            self.timeline.retain(|m| &m.id != provisional);
            if self.timeline.len() != before {
                debug!(id = %server_id, "send ack arrived after push; dropped provisional entry");
                self.publish();
            }
            return AckOutcome::CollapsedIntoPush(server_id);
        }

        let Some(idx) = self.position_of(provisional) else {
            return AckOutcome::UnknownProvisional;
        };
        let entry = &mut self.timeline[idx];
        entry.id = server_id.clone();
        entry.delivery_state = DeliveryState::Sent;
        if let Some(timestamp) = ack.timestamp {
            entry.timestamp = timestamp;
        }
        self.restore_order();
        self.publish();
        AckOutcome::Confirmed(server_id)
    }

    /// Marks a provisional entry as failed. The entry stays visible.
    pub fn fail_send(&mut self, provisional: &MessageId) -> bool {
        let Some(idx) = self.position_of(provisional) else {
            return false;
        };
        self.timeline[idx].delivery_state = DeliveryState::Failed;
        self.publish();
        true
    }

    /// Moves a failed entry back to pending and rebuilds its request.
    pub fn prepare_retry(&mut self, provisional: &MessageId) -> Option<SendRequest> {
        let idx = self.position_of(provisional)?;
        let entry = &mut self.timeline[idx];
        if entry.delivery_state != DeliveryState::Failed {
            return None;
        }
        entry.delivery_state = DeliveryState::Pending;
        let request = SendRequest {
            content: entry.content.clone(),
            reply_to: entry.reply_to.clone(),
            client_timestamp: entry.timestamp,
            attachment: self.outbox.get(provisional).cloned(),
        };
        self.publish();
        Some(request)
    }

    pub fn apply_push(&mut self, message: Message) -> PushOutcome {
        let outcome = self.merge_confirmed(message);
        if !matches!(outcome, PushOutcome::Duplicate | PushOutcome::ForeignConversation) {
            self.publish();
        }
        outcome
    }

    pub fn begin_history(&mut self) {
        self.set_history(HistoryState::Loading);
    }

    /// Folds a history snapshot in with the same rules as push delivery, so
    /// local provisionals survive and redelivered ids collapse.
    pub fn apply_history(&mut self, snapshot: Vec<Message>) {
        let mut inserted = 0usize;
        for message in snapshot {
            if matches!(
                self.merge_confirmed(message),
                PushOutcome::Inserted | PushOutcome::ReplacedProvisional { .. }
            ) {
                inserted += 1;
            }
        }
        info!(
            conversation_id = %self.conversation_id,
            merged = inserted,
            total = self.timeline.len(),
            "history applied"
        );
        self.set_history(HistoryState::Loaded);
        self.publish();
    }

    pub fn fail_history(&mut self, reason: impl Into<String>) {
        self.set_history(HistoryState::Failed(reason.into()));
    }

    pub fn apply_update(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        let Some(idx) = self.position_of(&message.id) else {
            return false;
        };
        let entry = &mut self.timeline[idx];
        if entry.content == message.content && entry.attachment == message.attachment {
            return false;
        }
        entry.content = message.content;
        if message.attachment.is_some() {
            entry.attachment = message.attachment;
        }
        entry.edited = true;
        self.publish();
        true
    }

    pub fn apply_delete(&mut self, message_id: &MessageId) -> bool {
        let before = self.timeline.len();
        self.timeline.retain(|m| &m.id != message_id);
        self.outbox.remove(message_id);
        let removed = self.timeline.len() != before;
        if removed {
            self.publish();
        }
        removed
    }

    fn merge_confirmed(&mut self, message: Message) -> PushOutcome {
        if message.conversation_id != self.conversation_id {
            return PushOutcome::ForeignConversation;
        }
        if self.position_of(&message.id).is_some() {
            debug!(id = %message.id, "duplicate delivery ignored");
            return PushOutcome::Duplicate;
        }

        if let Some(idx) = self.find_provisional_match(&message) {
            let provisional = std::mem::replace(&mut self.timeline[idx], message);
            self.outbox.remove(&provisional.id);
            let entry = &mut self.timeline[idx];
            if entry.attachment.is_none() {
                entry.attachment = provisional.attachment;
            }
            if entry.reply_to.is_none() {
                entry.reply_to = provisional.reply_to;
            }
            debug!(provisional = %provisional.id, id = %entry.id, "provisional entry reconciled");
            self.restore_order();
            return PushOutcome::ReplacedProvisional {
                provisional: provisional.id,
            };
        }

        self.timeline.push(message);
        self.timeline.sort_by_key(|m| m.timestamp);
        PushOutcome::Inserted
    }

    /// Closest provisional entry with the same direction and payload inside
    /// the tolerance window.
    fn find_provisional_match(&self, message: &Message) -> Option<usize> {
        self.timeline
            .iter()
            .enumerate()
            .filter(|(_, candidate)| {
                candidate.is_provisional()
                    && candidate.direction == message.direction
                    && same_payload(candidate, message)
            })
            .map(|(idx, candidate)| (idx, (candidate.timestamp - message.timestamp).abs()))
            .filter(|(_, skew)| *skew <= self.tolerance)
            .min_by_key(|(_, skew)| *skew)
            .map(|(idx, _)| idx)
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.timeline.iter().position(|m| &m.id == id)
    }

    fn restore_order(&mut self) {
        if !self
            .timeline
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
        {
            self.timeline.sort_by_key(|m| m.timestamp);
        }
    }

    fn set_history(&mut self, state: HistoryState) {
        self.history = state.clone();
        if self.attached {
            self.history_tx.send_replace(state);
        }
    }

    fn publish(&self) {
        if self.attached {
            self.messages_tx.send_replace(self.timeline.clone());
        }
    }
}

fn same_payload(provisional: &Message, confirmed: &Message) -> bool {
    if provisional.content != confirmed.content {
        return false;
    }
    if provisional.content.is_some() {
        return true;
    }
    // Attachment-only messages: compare the file name when both carry one.
    match (&provisional.attachment, &confirmed.attachment) {
        (Some(local), Some(remote)) => match (&local.file_name, &remote.file_name) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        },
        _ => false,
    }
}

/// Inserts the provisional entry, issues the send request without holding
/// the lock, then confirms or fails the entry. Returns the entry's final id.
pub async fn submit(
    reconciler: &SharedReconciler,
    api: &dyn ConsoleApi,
    draft: OutgoingDraft,
    now: DateTime<Utc>,
) -> Result<MessageId, SyncError> {
    let (conversation_id, provisional) = {
        let mut guard = reconciler.lock().await;
        let provisional = guard.begin_send(&draft, now);
        (guard.conversation_id().clone(), provisional)
    };
    let request = SendRequest {
        content: draft.content,
        reply_to: draft.reply_to,
        client_timestamp: now,
        attachment: draft.attachment,
    };
    deliver(reconciler, api, &conversation_id, provisional.id, request).await
}

/// Re-issues a failed send for the same provisional entry.
pub async fn resubmit(
    reconciler: &SharedReconciler,
    api: &dyn ConsoleApi,
    provisional: &MessageId,
) -> Result<MessageId, SyncError> {
    let (conversation_id, request) = {
        let mut guard = reconciler.lock().await;
        let request = guard
            .prepare_retry(provisional)
            .ok_or_else(|| SyncError::UnknownMessage(provisional.to_string()))?;
        (guard.conversation_id().clone(), request)
    };
    deliver(reconciler, api, &conversation_id, provisional.clone(), request).await
}

async fn deliver(
    reconciler: &SharedReconciler,
    api: &dyn ConsoleApi,
    conversation_id: &ConversationId,
    provisional: MessageId,
    request: SendRequest,
) -> Result<MessageId, SyncError> {
    match api.send_message(conversation_id, request).await {
        Ok(ack) => {
            let outcome = reconciler.lock().await.confirm_send(&provisional, &ack);
            Ok(match outcome {
                AckOutcome::Confirmed(id) | AckOutcome::CollapsedIntoPush(id) => id,
                AckOutcome::AwaitingPush | AckOutcome::UnknownProvisional => provisional,
            })
        }
        Err(err) => {
            warn!(%conversation_id, id = %provisional, "send failed: {err:#}");
            reconciler.lock().await.fail_send(&provisional);
            Err(SyncError::Send(err.to_string()))
        }
    }
}

/// Fetches the history snapshot and merges it. Failures are surfaced on the
/// history status and are not retried here.
pub async fn load_history(
    reconciler: &SharedReconciler,
    api: &dyn ConsoleApi,
    limit: u32,
) -> Result<usize, SyncError> {
    let conversation_id = {
        let mut guard = reconciler.lock().await;
        guard.begin_history();
        guard.conversation_id().clone()
    };
    match api.fetch_history(&conversation_id, limit, None).await {
        Ok(snapshot) => {
            let count = snapshot.len();
            reconciler.lock().await.apply_history(snapshot);
            Ok(count)
        }
        Err(err) => {
            warn!(%conversation_id, "history fetch failed: {err:#}");
            let reason = err.to_string();
            reconciler.lock().await.fail_history(reason.clone());
            Err(SyncError::HistoryFetch {
                conversation_id,
                reason,
            })
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
