use super::*;

use crate::{direct, session, PresenceRegistry};
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

fn friends_list(events: &[ServerEvent]) -> Option<Vec<FriendEntry>> {
    events.iter().find_map(|event| match event {
        ServerEvent::FriendsList(entries) => Some(entries.clone()),
        _ => None,
    })
}

fn requests_list(events: &[ServerEvent]) -> Option<Vec<String>> {
    events.iter().find_map(|event| match event {
        ServerEvent::RequestsList(requesters) => Some(requesters.clone()),
        _ => None,
    })
}

#[tokio::test]
async fn request_confirms_and_notifies_the_target() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (_bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    drain(&mut alice_rx);

    send_request(&ctx, &alice, "alice", "bob")
        .await
        .expect("request");

    let confirmations = drain(&mut alice_rx);
    match &confirmations[0] {
        ServerEvent::FriendAdded { success, message } => {
            assert!(*success);
            assert_eq!(message, "Friend request sent");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    let incoming = drain(&mut bob_rx);
    assert!(incoming
        .iter()
        .any(|event| matches!(event, ServerEvent::NewRequest { from } if from == "alice")));
}

#[tokio::test]
async fn duplicate_and_reverse_requests_are_rejected() {
    let ctx = setup().await;
    let (alice, _alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, _bob_rx) = signed_in(&ctx, "bob").await;

    send_request(&ctx, &alice, "alice", "bob")
        .await
        .expect("request");

    let err = send_request(&ctx, &alice, "alice", "bob")
        .await
        .expect_err("duplicate");
    assert!(matches!(err, ChatError::DuplicateRequest));
    assert_eq!(err.to_string(), "Request already exists");

    let err = send_request(&ctx, &bob, "bob", "alice")
        .await
        .expect_err("reverse duplicate");
    assert!(matches!(err, ChatError::DuplicateRequest));
}

#[tokio::test]
async fn self_and_unknown_targets_are_rejected() {
    let ctx = setup().await;
    let (alice, _alice_rx) = signed_in(&ctx, "alice").await;

    let err = send_request(&ctx, &alice, "alice", "alice")
        .await
        .expect_err("self request");
    assert!(matches!(err, ChatError::SelfRequest));

    let err = send_request(&ctx, &alice, "alice", "ghost")
        .await
        .expect_err("unknown target");
    assert!(matches!(err, ChatError::UnknownUser));
}

#[tokio::test]
async fn accept_creates_a_mutual_friendship() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    send_request(&ctx, &alice, "alice", "bob")
        .await
        .expect("request");
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    accept_request(&ctx, &bob, "bob", "alice")
        .await
        .expect("accept");

    let bob_events = drain(&mut bob_rx);
    let bob_friends = friends_list(&bob_events).expect("friends list");
    assert_eq!(bob_friends.len(), 1);
    assert_eq!(bob_friends[0].username, "alice");
    assert!(bob_friends[0].online);
    assert_eq!(bob_friends[0].unread, 0);
    assert!(requests_list(&bob_events).expect("requests list").is_empty());

    let alice_events = drain(&mut alice_rx);
    let alice_friends = friends_list(&alice_events).expect("friends list");
    assert_eq!(alice_friends[0].username, "bob");

    assert_eq!(
        ctx.storage.friends_of("alice").await.expect("friends"),
        vec!["bob"]
    );
    assert_eq!(
        ctx.storage.friends_of("bob").await.expect("friends"),
        vec!["alice"]
    );
}

#[tokio::test]
async fn accepting_without_a_pending_request_is_a_noop() {
    let ctx = setup().await;
    let (_alice, _alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    drain(&mut bob_rx);

    accept_request(&ctx, &bob, "bob", "alice")
        .await
        .expect("accept");

    assert!(drain(&mut bob_rx).is_empty());
    assert!(ctx
        .storage
        .friends_of("bob")
        .await
        .expect("friends")
        .is_empty());
}

#[tokio::test]
async fn reject_discards_the_request_and_allows_a_retry() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    send_request(&ctx, &alice, "alice", "bob")
        .await
        .expect("request");
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    reject_request(&ctx, &bob, "bob", "alice")
        .await
        .expect("reject");

    let bob_events = drain(&mut bob_rx);
    assert!(requests_list(&bob_events).expect("requests list").is_empty());
    // The requester is not told about the rejection.
    assert!(drain(&mut alice_rx).is_empty());
    assert!(ctx
        .storage
        .edge_between("alice", "bob")
        .await
        .expect("edge lookup")
        .is_none());

    // With the edge gone, a fresh request goes through again.
    send_request(&ctx, &alice, "alice", "bob")
        .await
        .expect("second request");
}

#[tokio::test]
async fn remove_friend_severs_both_sides() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    send_request(&ctx, &alice, "alice", "bob")
        .await
        .expect("request");
    accept_request(&ctx, &bob, "bob", "alice")
        .await
        .expect("accept");
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    // Severing from the side that never sent the original request.
    remove_friend(&ctx, &bob, "bob", "alice")
        .await
        .expect("remove");

    assert!(friends_list(&drain(&mut bob_rx))
        .expect("friends list")
        .is_empty());
    assert!(friends_list(&drain(&mut alice_rx))
        .expect("friends list")
        .is_empty());

    // Removing again finds nothing and stays quiet.
    remove_friend(&ctx, &bob, "bob", "alice")
        .await
        .expect("repeat remove");
    assert!(drain(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn friend_entries_carry_unread_and_last_seen() {
    let ctx = setup().await;
    let (alice, mut alice_rx) = signed_in(&ctx, "alice").await;
    let (bob, mut bob_rx) = signed_in(&ctx, "bob").await;
    send_request(&ctx, &alice, "alice", "bob")
        .await
        .expect("request");
    accept_request(&ctx, &bob, "bob", "alice")
        .await
        .expect("accept");

    direct::send_message(&ctx, &bob, "bob", "alice", "first", None)
        .await
        .expect("message");
    direct::send_message(&ctx, &bob, "bob", "alice", "second", None)
        .await
        .expect("message");
    session::disconnect(&ctx, &bob).await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    list_friends(&ctx, &alice, "alice").await.expect("list");

    let entries = friends_list(&drain(&mut alice_rx)).expect("friends list");
    assert_eq!(entries.len(), 1);
    let bob_entry = &entries[0];
    assert_eq!(bob_entry.username, "bob");
    assert!(!bob_entry.online);
    assert_eq!(bob_entry.unread, 2);
    assert!(bob_entry.last_seen.is_some());
}
