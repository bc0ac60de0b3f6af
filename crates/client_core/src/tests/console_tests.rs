use super::*;

use std::{future::Future, sync::atomic::Ordering, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use shared::{
    domain::{DeliveryState, Direction},
    protocol::ClientFrame,
};
use tokio::sync::mpsc;

use crate::{
    attachments::{ApiAttachmentFetcher, AttachmentState},
    test_support::{confirmed, summary, FakeConsoleApi},
    transport::{ChannelConnectError, ChannelConnector, ChannelLink, ReconnectPolicy},
};

struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
    to_client: mpsc::UnboundedSender<String>,
}

impl ServerEnd {
    fn push(&self, frame: String) {
        self.to_client.send(frame).expect("client reading");
    }
}

struct LoopbackConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait]
impl ChannelConnector for LoopbackConnector {
    async fn open(&self, _credentials: &Credentials) -> Result<ChannelLink, ChannelConnectError> {
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            from_client,
            to_client,
        });
        Ok(ChannelLink {
            outbound,
            inbound,
            io_tasks: Vec::new(),
        })
    }
}

struct Harness {
    api: Arc<FakeConsoleApi>,
    session: ConsoleSession,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Harness {
    fn new(api: FakeConsoleApi) -> Self {
        api.conversations
            .lock()
            .expect("conversations")
            .extend([summary("c-1", "Ada"), summary("c-2", "Grace")]);
        let api = Arc::new(api);
        let dyn_api: Arc<dyn ConsoleApi> = api.clone();

        let (servers_tx, servers) = mpsc::unbounded_channel();
        let transport = TransportSession::new(
            Arc::new(LoopbackConnector {
                servers: servers_tx,
            }),
            ReconnectPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
        );
        let settings = SyncSettings::default();
        let attachments = AttachmentCache::from_settings(
            Arc::new(ApiAttachmentFetcher::new(Arc::clone(&dyn_api))),
            &settings,
        );
        let session = ConsoleSession::new(
            settings,
            TenantId::new("acme"),
            dyn_api,
            transport,
            attachments,
        );
        Self {
            api,
            session,
            servers,
        }
    }

    async fn connect(&mut self) -> ServerEnd {
        self.session
            .connect(Credentials {
                actor_id: ActorId::new("agent-1"),
                display_name: "Dana".into(),
                tenant_id: TenantId::new("acme"),
                bearer: "secret".into(),
            })
            .await
            .expect("connected");
        self.servers.recv().await.expect("server end")
    }

    async fn unread(&self, id: &str) -> u32 {
        self.session
            .conversations()
            .await
            .iter()
            .find(|s| s.id.as_str() == id)
            .map(|s| s.unread_count)
            .expect("summary")
    }
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

fn message_json(
    conversation: &str,
    id: &str,
    direction: &str,
    content: &str,
    timestamp: DateTime<Utc>,
) -> serde_json::Value {
    json!({
        "id": id,
        "conversation_id": conversation,
        "direction": direction,
        "content": content,
        "timestamp": timestamp.to_rfc3339(),
    })
}

fn frame(kind: &str, conversation: &str, message: serde_json::Value) -> String {
    json!({
        "type": kind,
        "payload": {
            "tenant_id": "acme",
            "conversation_id": conversation,
            "message": message,
        }
    })
    .to_string()
}

async fn wait_for_messages(
    view: &mut ConversationView,
    predicate: impl FnMut(&Vec<Message>) -> bool,
) -> Vec<Message> {
    within(view.messages.wait_for(predicate))
        .await
        .expect("reconciler alive")
        .clone()
}

#[tokio::test]
async fn opening_a_conversation_selects_it_and_loads_history() {
    let harness = Harness::new(FakeConsoleApi::default().with_history(
        "c-1",
        vec![
            confirmed("c-1", "srv-1", Direction::Inbound, "hi", 1),
            confirmed("c-1", "srv-2", Direction::Outbound, "hello", 2),
        ],
    ));
    assert_eq!(harness.session.load_conversations(0).await.expect("page"), None);

    let mut view = harness.session.open_conversation(ConversationId::new("c-1")).await;
    within(view.history.wait_for(|h| *h == HistoryState::Loaded))
        .await
        .expect("history status");

    assert_eq!(view.messages.borrow().len(), 2);
    let conversations = harness.session.conversations().await;
    let selected: Vec<_> = conversations
        .iter()
        .filter(|s| s.is_selected)
        .map(|s| s.id.as_str())
        .collect();
    assert_eq!(selected, vec!["c-1"]);
    assert_eq!(
        harness.session.transport().rooms().await,
        vec![ConversationId::new("c-1")]
    );
}

#[tokio::test]
async fn pushes_update_index_always_and_timeline_only_when_open() {
    let mut harness = Harness::new(FakeConsoleApi::default());
    let mut server = harness.connect().await;
    harness.session.load_conversations(0).await.expect("page");
    let mut view = harness.session.open_conversation(ConversationId::new("c-1")).await;
    assert!(matches!(
        server.from_client.try_recv(),
        Ok(ClientFrame::Identify { .. })
    ));
    assert_eq!(
        server.from_client.try_recv().ok(),
        Some(ClientFrame::JoinRoom {
            conversation_id: ConversationId::new("c-1")
        })
    );

    server.push(frame(
        "message_created",
        "c-2",
        message_json("c-2", "srv-20", "inbound", "elsewhere", Utc::now()),
    ));
    server.push(frame(
        "message_created",
        "c-1",
        message_json("c-1", "srv-10", "inbound", "here", Utc::now()),
    ));

    let timeline = wait_for_messages(&mut view, |m| !m.is_empty()).await;
    let ids: Vec<_> = timeline.iter().map(|m| m.id.to_string()).collect();
    assert_eq!(ids, vec!["srv-10"]);
    assert_eq!(harness.unread("c-2").await, 1);
    assert_eq!(harness.unread("c-1").await, 0);
}

#[tokio::test]
async fn acknowledged_send_and_its_push_collapse_into_one_entry() {
    let mut harness = Harness::new(FakeConsoleApi::default());
    let server = harness.connect().await;
    let mut view = harness.session.open_conversation(ConversationId::new("c-1")).await;
    within(view.history.wait_for(|h| *h == HistoryState::Loaded))
        .await
        .expect("history status");
    harness.api.push_send_result(Ok(shared::protocol::SendAck {
        message_id: Some("srv-9".into()),
        timestamp: Some(Utc::now()),
    }));

    let id = harness.session.send_text("hello", None).await.expect("sent");
    assert_eq!(id, MessageId::server("srv-9"));

    server.push(frame(
        "message_created",
        "c-1",
        message_json("c-1", "srv-9", "outbound", "hello", Utc::now()),
    ));
    server.push(frame(
        "message_created",
        "c-1",
        message_json("c-1", "srv-10", "inbound", "thanks", Utc::now()),
    ));

    let timeline = wait_for_messages(&mut view, |m| m.len() == 2).await;
    assert_eq!(timeline[0].id, MessageId::server("srv-9"));
    assert_eq!(timeline[0].delivery_state, DeliveryState::Sent);
    assert!(timeline.iter().all(|m| !m.is_provisional()));
}

#[tokio::test]
async fn push_replaces_provisional_when_ack_carried_no_id() {
    let mut harness = Harness::new(FakeConsoleApi::default());
    let server = harness.connect().await;
    let mut view = harness.session.open_conversation(ConversationId::new("c-1")).await;
    within(view.history.wait_for(|h| *h == HistoryState::Loaded))
        .await
        .expect("history status");

    let provisional = harness.session.send_text("hello", None).await.expect("sent");
    assert!(provisional.is_provisional());

    server.push(frame(
        "message_created",
        "c-1",
        message_json("c-1", "srv-11", "outbound", "hello", Utc::now()),
    ));

    let timeline =
        wait_for_messages(&mut view, |m| m.iter().any(|m| !m.is_provisional())).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].id, MessageId::server("srv-11"));
}

#[tokio::test]
async fn failed_send_can_be_retried_or_discarded() {
    let harness = Harness::new(FakeConsoleApi::default());
    let mut view = harness.session.open_conversation(ConversationId::new("c-1")).await;

    harness.api.push_send_result(Err("gateway timeout".into()));
    harness.api.push_send_result(Err("gateway timeout".into()));
    harness.api.push_send_result(FakeConsoleApi::ack("srv-3", 0));

    assert!(matches!(
        harness.session.send_text("first", None).await,
        Err(SyncError::Send(_))
    ));
    assert!(harness.session.send_text("second", None).await.is_err());
    let failed: Vec<_> = view
        .messages
        .borrow_and_update()
        .iter()
        .filter(|m| m.delivery_state == DeliveryState::Failed)
        .map(|m| m.id.clone())
        .collect();
    assert_eq!(failed.len(), 2);

    let confirmed_id = harness.session.retry_send(&failed[0]).await.expect("retried");
    assert_eq!(confirmed_id, MessageId::server("srv-3"));

    harness.session.delete_message(&failed[1]).await.expect("discarded");
    assert!(harness.api.deletes.lock().expect("deletes").is_empty());

    let timeline = view.messages.borrow().clone();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].id, MessageId::server("srv-3"));
    assert_eq!(harness.api.sent_count(), 3);
}

#[tokio::test]
async fn edit_updates_server_and_local_timeline() {
    let harness = Harness::new(FakeConsoleApi::default().with_history(
        "c-1",
        vec![confirmed("c-1", "srv-1", Direction::Outbound, "helo", 1)],
    ));
    let mut view = harness.session.open_conversation(ConversationId::new("c-1")).await;
    within(view.history.wait_for(|h| *h == HistoryState::Loaded))
        .await
        .expect("history status");

    harness
        .session
        .edit_message(&MessageId::server("srv-1"), "hello")
        .await
        .expect("edited");

    let timeline = view.messages.borrow().clone();
    assert_eq!(timeline[0].content.as_deref(), Some("hello"));
    assert!(timeline[0].edited);
    assert_eq!(
        harness.api.edits.lock().expect("edits").as_slice(),
        &[(MessageId::server("srv-1"), "hello".to_string())]
    );
    assert!(matches!(
        harness
            .session
            .edit_message(&MessageId::server("srv-404"), "x")
            .await,
        Err(SyncError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn closing_stops_routing_into_the_old_view() {
    let mut harness = Harness::new(FakeConsoleApi::default());
    let server = harness.connect().await;
    harness.session.load_conversations(0).await.expect("page");
    let mut view = harness.session.open_conversation(ConversationId::new("c-1")).await;
    within(view.history.wait_for(|h| *h == HistoryState::Loaded))
        .await
        .expect("history status");
    view.messages.borrow_and_update();

    harness.session.close_conversation().await;
    server.push(frame(
        "message_created",
        "c-1",
        message_json("c-1", "srv-1", "inbound", "late", Utc::now()),
    ));
    within(async {
        while harness.unread("c-1").await == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await;

    assert!(view.messages.borrow().is_empty());
    assert!(harness.session.transport().rooms().await.is_empty());
    assert!(harness
        .session
        .conversations()
        .await
        .iter()
        .all(|s| !s.is_selected));
}

#[tokio::test]
async fn late_history_for_a_closed_conversation_stays_out_of_the_views() {
    let api = FakeConsoleApi::default().with_history(
        "c-1",
        vec![confirmed("c-1", "srv-1", Direction::Inbound, "hi", 1)],
    );
    *api.history_delay.lock().expect("delay") = Some(Duration::from_millis(50));
    let harness = Harness::new(api);

    let first = harness.session.open_conversation(ConversationId::new("c-1")).await;
    let mut second = harness.session.open_conversation(ConversationId::new("c-2")).await;
    within(second.history.wait_for(|h| *h == HistoryState::Loaded))
        .await
        .expect("history status");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.api.history_calls.load(Ordering::SeqCst), 2);
    assert!(second.messages.borrow().is_empty());
    assert!(first.messages.borrow().is_empty());
    assert!(!first.messages.has_changed().unwrap_or(false));
    assert_ne!(*first.history.borrow(), HistoryState::Loaded);

    let closed = first.reconciler.lock().await;
    assert!(!closed.is_attached());
    assert_eq!(*closed.history_state(), HistoryState::Loaded);
    let ids: Vec<String> = closed.messages().iter().map(|m| m.id.to_string()).collect();
    assert_eq!(ids, vec!["srv-1"]);
    drop(closed);
    assert_eq!(
        harness.session.open_conversation_id().await,
        Some(ConversationId::new("c-2"))
    );
}

#[tokio::test]
async fn typing_pushes_reach_the_index() {
    let mut harness = Harness::new(FakeConsoleApi::default());
    let server = harness.connect().await;
    server.push(
        json!({
            "type": "typing",
            "payload": {
                "tenant_id": "acme",
                "conversation_id": "c-2",
                "actor_id": "cust-7",
                "is_typing": true,
            }
        })
        .to_string(),
    );

    let conversation = ConversationId::new("c-2");
    within(async {
        while harness.session.typing(&conversation).await.is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert_eq!(
        harness.session.typing(&conversation).await,
        vec![ActorId::new("cust-7")]
    );
}

#[tokio::test]
async fn operations_without_open_conversation_are_rejected() {
    let harness = Harness::new(FakeConsoleApi::default());
    assert!(matches!(
        harness.session.send_text("hi", None).await,
        Err(SyncError::NoOpenConversation)
    ));
    assert!(matches!(
        harness.session.reload_history().await,
        Err(SyncError::NoOpenConversation)
    ));
}

#[tokio::test]
async fn attachment_messages_resolve_through_the_shared_cache() {
    let api = FakeConsoleApi::default();
    *api.attachment_mime.lock().expect("mime") = Some("application/pdf".into());
    let harness = Harness::new(api);
    let mut message = confirmed("c-1", "srv-1", Direction::Inbound, "", 1);
    message.content = None;
    message.attachment = Some(shared::domain::AttachmentRef {
        file_name: Some("invoice.pdf".into()),
        ..Default::default()
    });

    let fetched = harness
        .session
        .fetch_attachment(&message)
        .await
        .expect("has attachment")
        .expect("fetched");
    let status = harness.session.resolve_attachment(&message).expect("status");

    match status.state {
        AttachmentState::Ready(resource) => assert!(Arc::ptr_eq(&resource, &fetched)),
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(
        harness.session.attachments().read(fetched.handle),
        Some(Bytes::from("acme/c-1/srv-1#1"))
    );
    assert!(harness
        .session
        .resolve_attachment(&confirmed("c-1", "srv-2", Direction::Inbound, "text", 2))
        .is_none());
}
