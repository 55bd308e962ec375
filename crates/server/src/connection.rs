use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use server_api::{direct, friends, groups, session, signals, ApiContext, ClientHandle};
use shared::{
    error::ChatError,
    protocol::{ClientRequest, ServerEvent},
};
use tracing::debug;

use crate::app_state::AppState;

/// Drives one client connection. A writer task drains the session's event
/// queue into the socket while this task decodes frames and dispatches them;
/// the connection's identity is whatever the last successful auth set.
pub(crate) async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut events) = ClientHandle::new();

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut identity: Option<String> = None;
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(request) => dispatch(&state, &handle, &mut identity, &request).await,
                Err(error) => {
                    debug!(%error, "discarding malformed client frame");
                    handle.send(ServerEvent::ActionFailed {
                        message: "unrecognized event".to_string(),
                    });
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    session::disconnect(&state.api, &handle).await;
    writer.abort();
}

/// Runs one request against the engines, shaping any failure into the reply
/// event the client expects for that request kind.
pub(crate) async fn dispatch(
    state: &AppState,
    handle: &ClientHandle,
    identity: &mut Option<String>,
    request: &ClientRequest,
) {
    if let Err(err) = try_dispatch(state, handle, identity, request).await {
        handle.send(failure_event(request, err.to_string()));
    }
}

async fn try_dispatch(
    state: &AppState,
    handle: &ClientHandle,
    identity: &mut Option<String>,
    request: &ClientRequest,
) -> Result<(), ChatError> {
    let ctx = &state.api;
    match request {
        ClientRequest::Register { username, password } => {
            *identity = Some(session::register(ctx, username, password, handle).await?);
            Ok(())
        }
        ClientRequest::Login { username, password } => {
            *identity = Some(session::login(ctx, username, password, handle).await?);
            Ok(())
        }
        ClientRequest::AutoLogin { username } => {
            *identity = Some(session::auto_login(ctx, username, handle).await?);
            Ok(())
        }
        request => match identity.as_deref() {
            Some(user) => route(ctx, handle, user, request).await,
            None => Err(ChatError::validation("not authenticated")),
        },
    }
}

async fn route(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    request: &ClientRequest,
) -> Result<(), ChatError> {
    match request {
        ClientRequest::GetFriends => friends::list_friends(ctx, handle, user).await,
        ClientRequest::AddFriend { username } => {
            friends::send_request(ctx, handle, user, username).await
        }
        ClientRequest::GetRequests => friends::list_requests(ctx, handle, user).await,
        ClientRequest::AcceptRequest { username } => {
            friends::accept_request(ctx, handle, user, username).await
        }
        ClientRequest::RejectRequest { username } => {
            friends::reject_request(ctx, handle, user, username).await
        }
        ClientRequest::RemoveFriend { username } => {
            friends::remove_friend(ctx, handle, user, username).await
        }
        ClientRequest::SendMessage { to, text, reply_to } => {
            direct::send_message(ctx, handle, user, to, text, *reply_to).await
        }
        ClientRequest::GetChatHistory { with_user } => {
            direct::fetch_history(ctx, handle, user, with_user).await
        }
        ClientRequest::DeleteMessage { message_id } => {
            direct::delete_message(ctx, handle, user, *message_id).await
        }
        ClientRequest::Typing(target) => signals::typing(ctx, user, target).await,
        ClientRequest::StopTyping(target) => signals::stop_typing(ctx, user, target).await,
        ClientRequest::GetLastSeen { username } => signals::last_seen(ctx, handle, username).await,
        ClientRequest::CreateGroup { name, members } => {
            groups::create_group(ctx, handle, user, name, members).await
        }
        ClientRequest::GetGroups => groups::list_groups(ctx, handle, user).await,
        ClientRequest::GetGroupInfo { group_id } => groups::info(ctx, handle, user, *group_id).await,
        ClientRequest::AddGroupMember { group_id, username } => {
            groups::add_member(ctx, handle, user, *group_id, username).await
        }
        ClientRequest::RemoveGroupMember { group_id, username } => {
            groups::remove_member(ctx, handle, user, *group_id, username).await
        }
        ClientRequest::LeaveGroup { group_id } => groups::leave(ctx, handle, user, *group_id).await,
        ClientRequest::SendGroupMessage {
            group_id,
            text,
            reply_to,
        } => groups::send_message(ctx, handle, user, *group_id, text, *reply_to).await,
        ClientRequest::GetGroupChatHistory { group_id } => {
            groups::fetch_history(ctx, handle, user, *group_id).await
        }
        ClientRequest::DeleteGroupMessage {
            group_id,
            message_id,
        } => groups::delete_message(ctx, handle, user, *group_id, *message_id).await,
        // Auth requests never reach routing.
        ClientRequest::Register { .. }
        | ClientRequest::Login { .. }
        | ClientRequest::AutoLogin { .. } => Ok(()),
    }
}

fn failure_event(request: &ClientRequest, message: String) -> ServerEvent {
    match request {
        ClientRequest::Register { .. }
        | ClientRequest::Login { .. }
        | ClientRequest::AutoLogin { .. } => ServerEvent::AuthResponse {
            success: false,
            user: None,
            message: Some(message),
        },
        ClientRequest::AddFriend { .. } => ServerEvent::FriendAdded {
            success: false,
            message,
        },
        ClientRequest::CreateGroup { .. } => ServerEvent::GroupCreated {
            success: false,
            group: None,
            message: Some(message),
        },
        _ => ServerEvent::ActionFailed { message },
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
