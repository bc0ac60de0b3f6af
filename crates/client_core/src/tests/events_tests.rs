use super::*;

use serde_json::json;

fn tenant() -> TenantId {
    TenantId::new("acme")
}

fn created_frame(tenant_id: &str, conversation_id: &str, message: serde_json::Value) -> String {
    json!({
        "type": "message_created",
        "payload": {
            "tenant_id": tenant_id,
            "conversation_id": conversation_id,
            "message": message,
        }
    })
    .to_string()
}

#[test]
fn decodes_new_message_with_default_delivery_state() {
    let frame = created_frame(
        "acme",
        "c-1",
        json!({
            "id": "srv-42",
            "conversation_id": "c-1",
            "direction": "outbound",
            "content": "hi",
            "timestamp": "2024-05-01T10:00:01Z"
        }),
    );

    let decoded = decode_frame(&frame, &tenant()).expect("decode");
    let DecodedFrame::Push(PushEvent::MessageCreated(message)) = decoded else {
        panic!("unexpected frame: {decoded:?}");
    };
    assert_eq!(message.id, MessageId::server("srv-42"));
    assert_eq!(message.delivery_state, DeliveryState::Sent);
    assert!(!message.is_provisional());
}

#[test]
fn inbound_messages_default_to_delivered() {
    let frame = created_frame(
        "acme",
        "c-1",
        json!({
            "id": "srv-7",
            "conversation_id": "c-1",
            "direction": "inbound",
            "content": "order shipped?",
            "timestamp": "2024-05-01T10:00:01Z"
        }),
    );

    let Ok(DecodedFrame::Push(PushEvent::MessageCreated(message))) =
        decode_frame(&frame, &tenant())
    else {
        panic!("expected message");
    };
    assert_eq!(message.delivery_state, DeliveryState::Delivered);
}

#[test]
fn frames_for_other_tenants_are_dropped() {
    let frame = created_frame(
        "globex",
        "c-1",
        json!({
            "id": "srv-1",
            "conversation_id": "c-1",
            "direction": "inbound",
            "content": "not yours",
            "timestamp": "2024-05-01T10:00:01Z"
        }),
    );

    let decoded = decode_frame(&frame, &tenant()).expect("decode");
    assert_eq!(decoded, DecodedFrame::ForeignTenant(TenantId::new("globex")));
}

#[test]
fn rejects_message_without_content_or_attachment() {
    let frame = created_frame(
        "acme",
        "c-1",
        json!({
            "id": "srv-1",
            "conversation_id": "c-1",
            "direction": "inbound",
            "content": "",
            "timestamp": "2024-05-01T10:00:01Z"
        }),
    );

    let err = decode_frame(&frame, &tenant()).expect_err("must reject");
    assert!(matches!(err, SyncError::InvalidEvent(_)));
}

#[test]
fn rejects_conversation_mismatch_and_garbage() {
    let frame = created_frame(
        "acme",
        "c-1",
        json!({
            "id": "srv-1",
            "conversation_id": "c-2",
            "direction": "inbound",
            "content": "hello",
            "timestamp": "2024-05-01T10:00:01Z"
        }),
    );
    assert!(decode_frame(&frame, &tenant()).is_err());
    assert!(decode_frame("{not json", &tenant()).is_err());
}

#[test]
fn auth_rejection_is_surfaced_without_tenant_check() {
    let frame = json!({"type": "auth_rejected", "payload": {"reason": "revoked"}}).to_string();
    assert_eq!(
        decode_frame(&frame, &tenant()).expect("decode"),
        DecodedFrame::AuthRejected("revoked".into())
    );
}

#[test]
fn decodes_typing_and_delete() {
    let typing = json!({
        "type": "typing",
        "payload": {
            "tenant_id": "acme",
            "conversation_id": "c-3",
            "actor_id": "agent-9",
            "is_typing": true
        }
    })
    .to_string();
    assert_eq!(
        decode_frame(&typing, &tenant()).expect("decode"),
        DecodedFrame::Push(PushEvent::Typing {
            conversation_id: ConversationId::new("c-3"),
            actor_id: ActorId::new("agent-9"),
            is_typing: true,
        })
    );

    let deleted = json!({
        "type": "message_deleted",
        "payload": {"tenant_id": "acme", "conversation_id": "c-3", "message_id": "srv-5"}
    })
    .to_string();
    assert_eq!(
        decode_frame(&deleted, &tenant()).expect("decode"),
        DecodedFrame::Push(PushEvent::MessageDeleted {
            conversation_id: ConversationId::new("c-3"),
            message_id: MessageId::server("srv-5"),
        })
    );
}
