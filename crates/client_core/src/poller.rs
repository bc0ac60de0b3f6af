use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::domain::{AttachmentRef, ConversationId, Message};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

use crate::{
    api::ConsoleApi,
    config::{floor_period, SyncSettings},
};

/// Periodic full re-fetch of one conversation, for views that do not run a
/// reconciler. Each successful poll replaces the timeline wholesale.
pub struct PollingFallbackFetcher {
    conversation_id: ConversationId,
    messages_tx: Arc<watch::Sender<Vec<Message>>>,
    refresh: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl PollingFallbackFetcher {
    /// Starts polling immediately; the first fetch happens on the first tick.
    pub fn start(
        api: Arc<dyn ConsoleApi>,
        conversation_id: ConversationId,
        interval: Duration,
        limit: u32,
    ) -> Self {
        let interval = floor_period("poll interval", interval);
        let (messages_tx, _) = watch::channel(Vec::new());
        let messages_tx = Arc::new(messages_tx);
        let refresh = Arc::new(Notify::new());

        let task = tokio::spawn(poll_loop(
            api,
            conversation_id.clone(),
            interval,
            limit,
            Arc::clone(&messages_tx),
            Arc::clone(&refresh),
        ));

        Self {
            conversation_id,
            messages_tx,
            refresh,
            task: Some(task),
        }
    }

    pub fn from_settings(
        api: Arc<dyn ConsoleApi>,
        conversation_id: ConversationId,
        settings: &SyncSettings,
    ) -> Self {
        Self::start(
            api,
            conversation_id,
            settings.poll_interval,
            settings.history_page_size,
        )
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.messages_tx.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages_tx.borrow().clone()
    }

    /// Shows an optimistic send until the next refresh supersedes it.
    pub fn append_local(
        &self,
        content: Option<String>,
        attachment: Option<AttachmentRef>,
        now: DateTime<Utc>,
    ) -> Message {
        let message = Message::provisional(self.conversation_id.clone(), content, attachment, None, now);
        let appended = message.clone();
        self.messages_tx.send_modify(|messages| messages.push(appended));
        message
    }

    /// Triggers a poll without waiting for the next tick.
    pub fn refresh_now(&self) {
        self.refresh.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(conversation_id = %self.conversation_id, "polling stopped");
        }
    }
}

impl Drop for PollingFallbackFetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    api: Arc<dyn ConsoleApi>,
    conversation_id: ConversationId,
    interval: Duration,
    limit: u32,
    messages_tx: Arc<watch::Sender<Vec<Message>>>,
    refresh: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = refresh.notified() => ticker.reset(),
        }

        match api.fetch_history(&conversation_id, limit, None).await {
            Ok(mut messages) => {
                messages.sort_by_key(|m| m.timestamp);
                debug!(conversation_id = %conversation_id, count = messages.len(), "poll refreshed timeline");
                messages_tx.send_replace(messages);
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "poll failed, keeping current timeline: {err:#}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
