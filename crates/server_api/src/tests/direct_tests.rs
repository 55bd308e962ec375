use super::*;

use crate::{session, PresenceRegistry};
use shared::protocol::DELETED_PLACEHOLDER;
use storage::Storage;
use tokio::sync::mpsc::UnboundedReceiver;

async fn setup() -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    ApiContext {
        storage,
        presence: PresenceRegistry::new(),
    }
}

async fn signed_in(ctx: &ApiContext, name: &str) -> (ClientHandle, UnboundedReceiver<ServerEvent>) {
    let (handle, mut rx) = ClientHandle::new();
    session::register(ctx, name, "secret", &handle)
        .await
        .expect("register");
    drain(&mut rx);
    (handle, rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn new_messages(events: &[ServerEvent]) -> Vec<MessagePayload> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::NewMessage(payload) => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

fn chat_history(events: &[ServerEvent]) -> Option<Vec<MessagePayload>> {
    events.iter().find_map(|event| match event {
        ServerEvent::ChatHistory(messages) => Some(messages.clone()),
        _ => None,
    })
}

#[tokio::test]
async fn send_echoes_to_sender_and_delivers_to_recipient() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (_bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    drain(&mut alice_rx);

    send_message(&ctx, &alice, "alice", "bob", "hi", None)
        .await
        .expect("send");

    let echoes = new_messages(&drain(&mut alice_rx));
    assert_eq!(echoes.len(), 1);
    assert_eq!(echoes[0].from, "alice");
    assert_eq!(echoes[0].to.as_deref(), Some("bob"));
    assert_eq!(echoes[0].text, "hi");
    assert!(!echoes[0].is_read);
    assert!(echoes[0].group_id.is_none());

    let delivered = new_messages(&drain(&mut bob_rx));
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, echoes[0].id);
}

#[tokio::test]
async fn send_to_an_offline_recipient_only_persists() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, _bob_rx) = signed_in(&ctx, "bob").await;
    session::disconnect(&ctx, &bob).await;
    drain(&mut alice_rx);

    send_message(&ctx, &alice, "alice", "bob", "missed you", None)
        .await
        .expect("send");

    assert_eq!(new_messages(&drain(&mut alice_rx)).len(), 1);
    let conversation = ctx
        .storage
        .conversation_between("alice", "bob")
        .await
        .expect("conversation");
    assert_eq!(conversation.len(), 1);
    assert!(!conversation[0].is_read);
}

#[tokio::test]
async fn send_to_an_unknown_user_fails() {
    let ctx = setup().await;
    let (alice, _alice_rx) = signed_in(&ctx, "alice").await;

    let err = send_message(&ctx, &alice, "alice", "ghost", "hello?", None)
        .await
        .expect_err("unknown recipient");
    assert!(matches!(err, ChatError::UnknownUser));
}

#[tokio::test]
async fn history_is_ascending_and_marks_the_counterpart_read() {
    let ctx = setup().await;
    let (alice, _alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    send_message(&ctx, &alice, "alice", "bob", "one", None)
        .await
        .expect("send");
    send_message(&ctx, &bob, "bob", "alice", "two", None)
        .await
        .expect("send");
    send_message(&ctx, &alice, "alice", "bob", "three", None)
        .await
        .expect("send");
    drain(&mut bob_rx);

    fetch_history(&ctx, &bob, "bob", "alice")
        .await
        .expect("history");

    let events = drain(&mut bob_rx);
    let history = chat_history(&events).expect("chat history");
    let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
    // Reading flips alice -> bob, leaves bob -> alice alone.
    assert_eq!(
        ctx.storage.unread_count("alice", "bob").await.expect("count"),
        0
    );
    assert_eq!(
        ctx.storage.unread_count("bob", "alice").await.expect("count"),
        1
    );
    // Counts changed, so both parties got a friends refresh.
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::FriendsList(_))));
}

#[tokio::test]
async fn rereading_history_still_refreshes_the_lists() {
    let ctx = setup().await;
    let (alice, _alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    send_message(&ctx, &alice, "alice", "bob", "hello", None)
        .await
        .expect("send");
    fetch_history(&ctx, &bob, "bob", "alice")
        .await
        .expect("first read");
    drain(&mut bob_rx);

    fetch_history(&ctx, &bob, "bob", "alice")
        .await
        .expect("second read");

    let events = drain(&mut bob_rx);
    let history = chat_history(&events).expect("chat history");
    assert!(history.iter().all(|message| message.is_read));
    // The refresh follows every fetch, even with nothing left to flip.
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::FriendsList(_))));
}

#[tokio::test]
async fn delete_is_author_only() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, _bob_rx) = signed_in(&ctx, "bob").await;
    drain(&mut alice_rx);
    send_message(&ctx, &alice, "alice", "bob", "mine", None)
        .await
        .expect("send");
    let message_id = new_messages(&drain(&mut alice_rx))[0].id;

    let err = delete_message(&ctx, &bob, "bob", message_id)
        .await
        .expect_err("not the author");
    assert!(matches!(err, ChatError::NotAuthorized));
    let stored = ctx
        .storage
        .get_message(message_id)
        .await
        .expect("get message")
        .expect("message exists");
    assert!(!stored.deleted);

    let err = delete_message(&ctx, &alice, "alice", MessageId(999_999))
        .await
        .expect_err("missing message");
    assert!(matches!(err, ChatError::MessageNotFound));
}

#[tokio::test]
async fn delete_notifies_both_sides_and_redacts_history() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    drain(&mut alice_rx);
    send_message(&ctx, &alice, "alice", "bob", "typo", None)
        .await
        .expect("send");
    let message_id = new_messages(&drain(&mut alice_rx))[0].id;
    drain(&mut bob_rx);

    delete_message(&ctx, &alice, "alice", message_id)
        .await
        .expect("delete");

    for rx in [&mut alice_rx, &mut bob_rx] {
        let events = drain(rx);
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::MessageDeleted { message_id: deleted } if *deleted == message_id
        )));
    }

    fetch_history(&ctx, &bob, "bob", "alice")
        .await
        .expect("history");
    let history = chat_history(&drain(&mut bob_rx)).expect("chat history");
    assert_eq!(history[0].text, DELETED_PLACEHOLDER);
    assert!(history[0].deleted);
}

#[tokio::test]
async fn replies_must_reference_the_same_conversation() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    let (_carol, _carol_rx) = signed_in(&ctx, "carol").await;
    drain(&mut alice_rx);
    send_message(&ctx, &alice, "alice", "bob", "original", None)
        .await
        .expect("send");
    let original_id = new_messages(&drain(&mut alice_rx))[0].id;
    drain(&mut bob_rx);

    send_message(&ctx, &bob, "bob", "alice", "reply", Some(original_id))
        .await
        .expect("reply");
    let reply = &new_messages(&drain(&mut bob_rx))[0];
    assert_eq!(reply.reply_to, Some(original_id));

    let err = send_message(&ctx, &alice, "alice", "carol", "stolen", Some(original_id))
        .await
        .expect_err("reply outside the conversation");
    assert!(matches!(err, ChatError::MessageNotFound));
}
