use std::collections::{BTreeSet, HashMap, VecDeque};

use shared::domain::{ActorId, ConversationId, ConversationSummary, Message, MessageId};
use tokio::sync::watch;
use tracing::debug;

const PREVIEW_MAX_CHARS: usize = 80;
/// Message ids remembered per conversation for redelivery detection.
const RECENT_IDS_PER_CONVERSATION: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// No summary exists for the conversation; nothing was created.
    Unknown,
    Redelivered,
    Updated { unread_count: u32 },
}

/// Conversation summaries kept newest-first, driven by the push stream.
pub struct ConversationIndex {
    summaries: Vec<ConversationSummary>,
    typing: HashMap<ConversationId, BTreeSet<ActorId>>,
    recent: HashMap<ConversationId, VecDeque<MessageId>>,
    summaries_tx: watch::Sender<Vec<ConversationSummary>>,
}

impl Default for ConversationIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationIndex {
    pub fn new() -> Self {
        let (summaries_tx, _) = watch::channel(Vec::new());
        Self {
            summaries: Vec::new(),
            typing: HashMap::new(),
            recent: HashMap::new(),
            summaries_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.summaries_tx.subscribe()
    }

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn get(&self, id: &ConversationId) -> Option<&ConversationSummary> {
        self.summaries.iter().find(|s| &s.id == id)
    }

    pub fn selected(&self) -> Option<&ConversationId> {
        self.summaries.iter().find(|s| s.is_selected).map(|s| &s.id)
    }

    /// Folds in a page from the conversation listing. Existing entries keep
    /// their live preview when the listing is older, and selection survives.
    pub fn merge_page(&mut self, page: Vec<ConversationSummary>) {
        for incoming in page {
            match self.summaries.iter_mut().find(|s| s.id == incoming.id) {
                Some(existing) => {
                    existing.counterpart_name = incoming.counterpart_name;
                    if incoming.last_message_time > existing.last_message_time {
                        existing.last_message_preview = incoming.last_message_preview;
                        existing.last_message_time = incoming.last_message_time;
                        existing.last_message_id = incoming.last_message_id;
                    }
                    if !existing.is_selected {
                        existing.unread_count = incoming.unread_count;
                    }
                }
                None => self.summaries.push(ConversationSummary {
                    is_selected: false,
                    ..incoming
                }),
            }
        }
        self.sort_and_publish();
    }

    /// Applies a new-message push. Unread grows by one per event for every
    /// conversation except the selected one. A push whose id is the preview's
    /// or among the last few ids seen for the conversation is a redelivery.
    pub fn apply_message(&mut self, message: &Message) -> IndexOutcome {
        let Some(summary) = self
            .summaries
            .iter_mut()
            .find(|s| s.id == message.conversation_id)
        else {
            debug!(conversation_id = %message.conversation_id, "push for unknown conversation");
            return IndexOutcome::Unknown;
        };

        let recent = self.recent.entry(message.conversation_id.clone()).or_default();
        if summary.last_message_id.as_ref() == Some(&message.id) || recent.contains(&message.id) {
            return IndexOutcome::Redelivered;
        }
        if recent.len() == RECENT_IDS_PER_CONVERSATION {
            recent.pop_front();
        }
        recent.push_back(message.id.clone());

        let is_newer = summary
            .last_message_time
            .map_or(true, |current| message.timestamp >= current);
        if is_newer {
            summary.last_message_preview = Some(preview_for(message));
            summary.last_message_time = Some(message.timestamp);
            summary.last_message_id = Some(message.id.clone());
        }
        if !summary.is_selected {
            summary.unread_count = summary.unread_count.saturating_add(1);
        }
        let unread_count = summary.unread_count;

        self.sort_and_publish();
        IndexOutcome::Updated { unread_count }
    }

    /// Refreshes the preview after an edit, when the edited message is the
    /// one being previewed.
    pub fn apply_edit(&mut self, message: &Message) -> bool {
        let Some(summary) = self
            .summaries
            .iter_mut()
            .find(|s| s.id == message.conversation_id)
        else {
            return false;
        };
        if summary.last_message_id.as_ref() != Some(&message.id) {
            return false;
        }
        summary.last_message_preview = Some(preview_for(message));
        self.publish();
        true
    }

    /// Single-selection: clears every other summary and resets unread.
    pub fn select(&mut self, id: &ConversationId) -> bool {
        if !self.summaries.iter().any(|s| &s.id == id) {
            return false;
        }
        for summary in &mut self.summaries {
            summary.is_selected = &summary.id == id;
            if summary.is_selected {
                summary.unread_count = 0;
            }
        }
        self.publish();
        true
    }

    pub fn clear_selection(&mut self) {
        for summary in &mut self.summaries {
            summary.is_selected = false;
        }
        self.publish();
    }

    pub fn set_typing(&mut self, conversation_id: &ConversationId, actor: ActorId, is_typing: bool) {
        let actors = self.typing.entry(conversation_id.clone()).or_default();
        if is_typing {
            actors.insert(actor);
        } else {
            actors.remove(&actor);
            if actors.is_empty() {
                self.typing.remove(conversation_id);
            }
        }
    }

    pub fn typing(&self, conversation_id: &ConversationId) -> Vec<ActorId> {
        self.typing
            .get(conversation_id)
            .map(|actors| actors.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn sort_and_publish(&mut self) {
        // Newest first; conversations without messages sink to the bottom.
        self.summaries
            .sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        self.publish();
    }

    fn publish(&self) {
        self.summaries_tx.send_replace(self.summaries.clone());
    }
}

fn preview_for(message: &Message) -> String {
    if let Some(content) = message.content.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        let mut preview: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
        if content.chars().count() > PREVIEW_MAX_CHARS {
            preview.push('…');
        }
        return preview;
    }
    match message.attachment.as_ref().and_then(|a| a.file_name.as_deref()) {
        Some(name) => format!("[attachment] {name}"),
        None => "[attachment]".to_string(),
    }
}

#[cfg(test)]
#[path = "tests/index_tests.rs"]
mod tests;
