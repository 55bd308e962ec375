use shared::{
    error::ChatError,
    protocol::{FriendEntry, ServerEvent},
};

use crate::{internal, presence::ClientHandle, ApiContext};

/// Files a friend request and notifies the target if they are online. The
/// single-edge rule makes requests, reverse requests and friendships mutually
/// exclusive between any two users.
pub async fn send_request(
    ctx: &ApiContext,
    handle: &ClientHandle,
    from: &str,
    to: &str,
) -> Result<(), ChatError> {
    if from == to {
        return Err(ChatError::SelfRequest);
    }
    if !ctx.storage.user_exists(to).await.map_err(internal)? {
        return Err(ChatError::UnknownUser);
    }
    if ctx
        .storage
        .edge_between(from, to)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ChatError::DuplicateRequest);
    }
    ctx.storage
        .insert_pending_edge(from, to)
        .await
        .map_err(internal)?;
    if let Some(target) = ctx.presence.handle_for(to) {
        target.send(ServerEvent::NewRequest {
            from: from.to_string(),
        });
    }
    handle.send(ServerEvent::FriendAdded {
        success: true,
        message: "Friend request sent".to_string(),
    });
    Ok(())
}

/// Flips the pending edge into a friendship. Accepting a request that is no
/// longer pending is a quiet no-op rather than an error.
pub async fn accept_request(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    requester: &str,
) -> Result<(), ChatError> {
    if !ctx
        .storage
        .accept_pending_edge(requester, user)
        .await
        .map_err(internal)?
    {
        return Ok(());
    }
    handle.send(friends_list_event(ctx, user).await?);
    handle.send(requests_list_event(ctx, user).await?);
    refresh_friends(ctx, &[requester]).await?;
    Ok(())
}

pub async fn reject_request(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    requester: &str,
) -> Result<(), ChatError> {
    if !ctx
        .storage
        .delete_pending_edge(requester, user)
        .await
        .map_err(internal)?
    {
        return Ok(());
    }
    handle.send(requests_list_event(ctx, user).await?);
    Ok(())
}

/// Severs a friendship from either side and refreshes both parties' lists.
pub async fn remove_friend(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    friend: &str,
) -> Result<(), ChatError> {
    if !ctx
        .storage
        .delete_accepted_edge(user, friend)
        .await
        .map_err(internal)?
    {
        return Ok(());
    }
    handle.send(friends_list_event(ctx, user).await?);
    refresh_friends(ctx, &[friend]).await?;
    Ok(())
}

pub async fn list_friends(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
) -> Result<(), ChatError> {
    handle.send(friends_list_event(ctx, user).await?);
    Ok(())
}

pub async fn list_requests(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
) -> Result<(), ChatError> {
    handle.send(requests_list_event(ctx, user).await?);
    Ok(())
}

pub(crate) async fn friends_list_event(
    ctx: &ApiContext,
    username: &str,
) -> Result<ServerEvent, ChatError> {
    Ok(ServerEvent::FriendsList(
        friend_entries(ctx, username).await?,
    ))
}

pub(crate) async fn requests_list_event(
    ctx: &ApiContext,
    username: &str,
) -> Result<ServerEvent, ChatError> {
    let requesters = ctx
        .storage
        .pending_requesters_for(username)
        .await
        .map_err(internal)?;
    Ok(ServerEvent::RequestsList(requesters))
}

/// Pushes a rebuilt friends list to each named user that is online. Offline
/// users rebuild their view on next login instead.
pub(crate) async fn refresh_friends(ctx: &ApiContext, users: &[&str]) -> Result<(), ChatError> {
    for user in users {
        if let Some(target) = ctx.presence.handle_for(user) {
            target.send(friends_list_event(ctx, user).await?);
        }
    }
    Ok(())
}

async fn friend_entries(ctx: &ApiContext, username: &str) -> Result<Vec<FriendEntry>, ChatError> {
    let friends = ctx.storage.friends_of(username).await.map_err(internal)?;
    let mut entries = Vec::with_capacity(friends.len());
    for friend in friends {
        let unread = ctx
            .storage
            .unread_count(&friend, username)
            .await
            .map_err(internal)?;
        let last_seen = ctx
            .storage
            .get_user(&friend)
            .await
            .map_err(internal)?
            .and_then(|user| user.last_seen);
        entries.push(FriendEntry {
            online: ctx.presence.is_online(&friend),
            username: friend,
            unread,
            last_seen,
        });
    }
    Ok(entries)
}

#[cfg(test)]
#[path = "tests/friends_tests.rs"]
mod tests;
