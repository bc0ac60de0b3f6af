//! In-memory `ConsoleApi` used across unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{
        AttachmentKey, ConversationId, ConversationSummary, DeliveryState, Direction, Message,
        MessageId,
    },
    protocol::SendAck,
};

use crate::api::{ConsoleApi, ConversationListing, FetchedAttachment, SendRequest};

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("valid time")
        + chrono::Duration::seconds(seconds)
}

pub(crate) fn confirmed(
    conversation: &str,
    id: &str,
    direction: Direction,
    content: &str,
    seconds: i64,
) -> Message {
    Message {
        id: MessageId::server(id),
        conversation_id: ConversationId::new(conversation),
        direction,
        content: Some(content.to_string()),
        attachment: None,
        timestamp: at(seconds),
        delivery_state: match direction {
            Direction::Outbound => DeliveryState::Sent,
            Direction::Inbound => DeliveryState::Delivered,
        },
        reply_to: None,
        edited: false,
    }
}

pub(crate) fn summary(id: &str, name: &str) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId::new(id),
        counterpart_name: name.to_string(),
        last_message_preview: None,
        last_message_time: None,
        last_message_id: None,
        unread_count: 0,
        is_selected: false,
    }
}

#[derive(Default)]
pub(crate) struct FakeConsoleApi {
    pub conversations: Mutex<Vec<ConversationSummary>>,
    pub history: Mutex<HashMap<ConversationId, Vec<Message>>>,
    pub history_failures: AtomicU32,
    pub history_calls: AtomicU32,
    pub history_delay: Mutex<Option<Duration>>,
    pub send_results: Mutex<VecDeque<std::result::Result<SendAck, String>>>,
    pub sent: Mutex<Vec<(ConversationId, SendRequest)>>,
    pub edits: Mutex<Vec<(MessageId, String)>>,
    pub deletes: Mutex<Vec<MessageId>>,
    pub attachment_fetches: AtomicU32,
    pub attachment_failures: AtomicU32,
    pub attachment_delay: Mutex<Option<Duration>>,
    pub attachment_mime: Mutex<Option<String>>,
}

impl FakeConsoleApi {
    pub fn with_history(self, conversation: &str, messages: Vec<Message>) -> Self {
        self.history
            .lock()
            .expect("history")
            .insert(ConversationId::new(conversation), messages);
        self
    }

    pub fn push_send_result(&self, result: std::result::Result<SendAck, String>) {
        self.send_results.lock().expect("send results").push_back(result);
    }

    pub fn ack(id: &str, seconds: i64) -> std::result::Result<SendAck, String> {
        Ok(SendAck {
            message_id: Some(id.to_string()),
            timestamp: Some(at(seconds)),
        })
    }

    pub fn fetch_count(&self) -> u32 {
        self.attachment_fetches.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent").len()
    }
}

#[async_trait]
impl ConsoleApi for FakeConsoleApi {
    async fn list_conversations(&self, page: u32, page_size: u32) -> Result<ConversationListing> {
        let all = self.conversations.lock().expect("conversations").clone();
        let start = (page * page_size) as usize;
        let summaries: Vec<_> = all
            .iter()
            .skip(start)
            .take(page_size as usize)
            .cloned()
            .collect();
        let next_page = (start + summaries.len() < all.len()).then_some(page + 1);
        Ok(ConversationListing {
            summaries,
            next_page,
        })
    }

    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        _limit: u32,
        _before: Option<&MessageId>,
    ) -> Result<Vec<Message>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.history_delay.lock().expect("delay");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .history_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("history service unavailable"));
        }
        Ok(self
            .history
            .lock()
            .expect("history")
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendRequest,
    ) -> Result<SendAck> {
        self.sent
            .lock()
            .expect("sent")
            .push((conversation_id.clone(), request));
        let next = self.send_results.lock().expect("send results").pop_front();
        match next {
            Some(Ok(ack)) => Ok(ack),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(SendAck::default()),
        }
    }

    async fn edit_message(
        &self,
        _conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<()> {
        self.edits
            .lock()
            .expect("edits")
            .push((message_id.clone(), content.to_string()));
        Ok(())
    }

    async fn delete_message(
        &self,
        _conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()> {
        self.deletes.lock().expect("deletes").push(message_id.clone());
        Ok(())
    }

    async fn fetch_attachment(&self, key: &AttachmentKey) -> Result<FetchedAttachment> {
        let fetch_number = self.attachment_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.attachment_delay.lock().expect("delay");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .attachment_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("attachment store timed out"));
        }
        Ok(FetchedAttachment {
            bytes: Bytes::from(format!("{key}#{fetch_number}")),
            mime_type: self.attachment_mime.lock().expect("mime").clone(),
        })
    }
}
