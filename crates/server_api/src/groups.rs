use shared::{
    domain::{GroupId, MessageId},
    error::ChatError,
    protocol::{GroupPayload, GroupSummary, MessagePayload, MessageScope, ServerEvent},
};
use storage::{StoredGroup, StoredGroupMessage};

use crate::{display_text, internal, presence::ClientHandle, ApiContext};

/// Creates a group. The creator is always on the roster whether or not the
/// submitted member list names them, and becomes the group's fixed admin.
pub async fn create_group(
    ctx: &ApiContext,
    handle: &ClientHandle,
    created_by: &str,
    name: &str,
    members: &[String],
) -> Result<(), ChatError> {
    if name.trim().is_empty() {
        return Err(ChatError::validation("group name cannot be empty"));
    }
    let mut roster = vec![created_by.to_string()];
    for member in members {
        if member == created_by || roster.contains(member) {
            continue;
        }
        if !ctx.storage.user_exists(member).await.map_err(internal)? {
            return Err(ChatError::UnknownUser);
        }
        roster.push(member.clone());
    }
    let group_id = ctx
        .storage
        .insert_group(name, created_by, &roster)
        .await
        .map_err(internal)?;
    let group = require_group(ctx, group_id).await?;
    handle.send(ServerEvent::GroupCreated {
        success: true,
        group: Some(group_payload(&group)),
        message: None,
    });
    refresh_groups(ctx, &group.members).await?;
    Ok(())
}

/// Only the group admin may add members. Everyone currently in the group,
/// the newcomer included, hears about the change.
pub async fn add_member(
    ctx: &ApiContext,
    handle: &ClientHandle,
    acting_user: &str,
    group_id: GroupId,
    username: &str,
) -> Result<(), ChatError> {
    let group = require_group(ctx, group_id).await?;
    if group.created_by != acting_user {
        return Err(ChatError::NotAuthorized);
    }
    if !ctx.storage.user_exists(username).await.map_err(internal)? {
        return Err(ChatError::UnknownUser);
    }
    if !ctx
        .storage
        .add_group_member(group_id, username)
        .await
        .map_err(internal)?
    {
        return Err(ChatError::AlreadyMember);
    }
    let event = ServerEvent::GroupMemberAdded {
        success: true,
        group_id,
        username: username.to_string(),
    };
    let group = require_group(ctx, group_id).await?;
    notify_members(ctx, &group, acting_user, &event);
    handle.send(event);
    refresh_groups(ctx, &group.members).await?;
    Ok(())
}

/// Admin-only removal. The admin themself can never be removed, which keeps
/// every group owned for its whole lifetime. Removing someone who is not on
/// the roster quietly does nothing.
pub async fn remove_member(
    ctx: &ApiContext,
    handle: &ClientHandle,
    acting_user: &str,
    group_id: GroupId,
    username: &str,
) -> Result<(), ChatError> {
    let group = require_group(ctx, group_id).await?;
    if group.created_by != acting_user {
        return Err(ChatError::NotAuthorized);
    }
    if username == group.created_by {
        return Err(ChatError::CannotRemoveAdmin);
    }
    if !ctx
        .storage
        .remove_group_member(group_id, username)
        .await
        .map_err(internal)?
    {
        return Ok(());
    }
    let event = ServerEvent::GroupMemberRemoved {
        success: true,
        group_id,
        removed_user: username.to_string(),
    };
    if let Some(removed) = ctx.presence.handle_for(username) {
        removed.send(event.clone());
    }
    let group = require_group(ctx, group_id).await?;
    notify_members(ctx, &group, acting_user, &event);
    handle.send(event);
    refresh_groups(ctx, &group.members).await?;
    refresh_groups(ctx, &[username.to_string()]).await?;
    Ok(())
}

/// Any member but the admin may leave; the group itself survives.
pub async fn leave(
    ctx: &ApiContext,
    handle: &ClientHandle,
    username: &str,
    group_id: GroupId,
) -> Result<(), ChatError> {
    let group = require_group(ctx, group_id).await?;
    if group.created_by == username {
        return Err(ChatError::AdminCannotLeave);
    }
    if !ctx
        .storage
        .remove_group_member(group_id, username)
        .await
        .map_err(internal)?
    {
        return Ok(());
    }
    let event = ServerEvent::GroupMemberRemoved {
        success: true,
        group_id,
        removed_user: username.to_string(),
    };
    let group = require_group(ctx, group_id).await?;
    notify_members(ctx, &group, username, &event);
    handle.send(event);
    refresh_groups(ctx, &group.members).await?;
    refresh_groups(ctx, &[username.to_string()]).await?;
    Ok(())
}

/// Persists a group message and fans it out to every other member that is
/// online. The sender's echoed copy claims `is_read` so their own list never
/// counts it as unread; the stored flag stays false for everyone else.
pub async fn send_message(
    ctx: &ApiContext,
    handle: &ClientHandle,
    from: &str,
    group_id: GroupId,
    text: &str,
    reply_to: Option<MessageId>,
) -> Result<(), ChatError> {
    let group = require_group(ctx, group_id).await?;
    if !group.members.iter().any(|member| member == from) {
        return Err(ChatError::NotAuthorized);
    }
    if let Some(reply_to) = reply_to {
        if !ctx
            .storage
            .group_message_in_group(reply_to, group_id)
            .await
            .map_err(internal)?
        {
            return Err(ChatError::MessageNotFound);
        }
    }
    let stored = ctx
        .storage
        .insert_group_message(group_id, from, text, reply_to)
        .await
        .map_err(internal)?;
    for member in &group.members {
        if member == from {
            continue;
        }
        if let Some(target) = ctx.presence.handle_for(member) {
            target.send(ServerEvent::NewMessage(message_payload(&stored)));
        }
    }
    let mut echo = message_payload(&stored);
    echo.is_read = true;
    handle.send(ServerEvent::NewMessage(echo));
    refresh_groups(ctx, &group.members).await?;
    Ok(())
}

/// Returns the group's history with its metadata, then marks every message
/// not authored by the requester as read. The flag is shared by the whole
/// group, exactly like the stored model it mirrors, not a per-member receipt.
pub async fn fetch_history(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    group_id: GroupId,
) -> Result<(), ChatError> {
    let group = require_group(ctx, group_id).await?;
    if !group.members.iter().any(|member| member == user) {
        return Err(ChatError::NotAuthorized);
    }
    let stored = ctx
        .storage
        .group_conversation(group_id)
        .await
        .map_err(internal)?;
    let messages = stored.iter().map(message_payload).collect();
    handle.send(ServerEvent::GroupChatHistory {
        messages,
        group: group_payload(&group),
    });

    ctx.storage
        .mark_group_read_excluding(group_id, user)
        .await
        .map_err(internal)?;
    refresh_groups(ctx, &group.members).await?;
    Ok(())
}

/// Soft-deletes a group message; author-only, even if the author has since
/// left the group.
pub async fn delete_message(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    group_id: GroupId,
    message_id: MessageId,
) -> Result<(), ChatError> {
    let Some(message) = ctx
        .storage
        .get_group_message(message_id)
        .await
        .map_err(internal)?
    else {
        return Err(ChatError::MessageNotFound);
    };
    if message.group_id != group_id {
        return Err(ChatError::MessageNotFound);
    }
    if message.from_user != user {
        return Err(ChatError::NotAuthorized);
    }
    ctx.storage
        .mark_group_message_deleted(message_id)
        .await
        .map_err(internal)?;
    let event = ServerEvent::MessageDeleted { message_id };
    let group = require_group(ctx, group_id).await?;
    notify_members(ctx, &group, user, &event);
    handle.send(event);
    Ok(())
}

pub async fn list_groups(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
) -> Result<(), ChatError> {
    handle.send(groups_list_event(ctx, user).await?);
    Ok(())
}

pub async fn info(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    group_id: GroupId,
) -> Result<(), ChatError> {
    let group = require_group(ctx, group_id).await?;
    if !group.members.iter().any(|member| member == user) {
        return Err(ChatError::NotAuthorized);
    }
    handle.send(ServerEvent::GroupInfo {
        group: group_payload(&group),
    });
    Ok(())
}

pub(crate) async fn groups_list_event(
    ctx: &ApiContext,
    username: &str,
) -> Result<ServerEvent, ChatError> {
    let groups = ctx
        .storage
        .groups_for_user(username)
        .await
        .map_err(internal)?;
    let mut summaries = Vec::with_capacity(groups.len());
    for group in groups {
        let unread = ctx
            .storage
            .group_unread_count(group.id, username)
            .await
            .map_err(internal)?;
        summaries.push(GroupSummary {
            id: group.id,
            name: group.name,
            members: group.members,
            unread,
        });
    }
    Ok(ServerEvent::GroupsList(summaries))
}

pub(crate) async fn refresh_groups(ctx: &ApiContext, members: &[String]) -> Result<(), ChatError> {
    for member in members {
        if let Some(target) = ctx.presence.handle_for(member) {
            target.send(groups_list_event(ctx, member).await?);
        }
    }
    Ok(())
}

fn notify_members(ctx: &ApiContext, group: &StoredGroup, acting_user: &str, event: &ServerEvent) {
    for member in &group.members {
        if member == acting_user {
            continue;
        }
        if let Some(target) = ctx.presence.handle_for(member) {
            target.send(event.clone());
        }
    }
}

async fn require_group(ctx: &ApiContext, group_id: GroupId) -> Result<StoredGroup, ChatError> {
    ctx.storage
        .get_group(group_id)
        .await
        .map_err(internal)?
        .ok_or(ChatError::GroupNotFound)
}

fn group_payload(group: &StoredGroup) -> GroupPayload {
    GroupPayload {
        id: group.id,
        name: group.name.clone(),
        members: group.members.clone(),
        created_by: group.created_by.clone(),
    }
}

fn message_payload(message: &StoredGroupMessage) -> MessagePayload {
    MessagePayload {
        id: message.id,
        from: message.from_user.clone(),
        to: None,
        group_id: Some(message.group_id),
        text: display_text(&message.text, message.deleted),
        timestamp: message.timestamp,
        is_read: message.is_read,
        deleted: message.deleted,
        reply_to: message.reply_to,
        scope: Some(MessageScope::Group),
    }
}

#[cfg(test)]
#[path = "tests/groups_tests.rs"]
mod tests;
