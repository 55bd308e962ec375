use shared::{
    domain::MessageId,
    error::ChatError,
    protocol::{MessagePayload, ServerEvent},
};
use storage::StoredMessage;

use crate::{display_text, friends, internal, presence::ClientHandle, ApiContext};

/// Persists a direct message, delivers it live to the recipient when online,
/// and unconditionally echoes it back to the sender's own connection.
pub async fn send_message(
    ctx: &ApiContext,
    handle: &ClientHandle,
    from: &str,
    to: &str,
    text: &str,
    reply_to: Option<MessageId>,
) -> Result<(), ChatError> {
    if !ctx.storage.user_exists(to).await.map_err(internal)? {
        return Err(ChatError::UnknownUser);
    }
    if let Some(reply_to) = reply_to {
        if !ctx
            .storage
            .message_in_conversation(reply_to, from, to)
            .await
            .map_err(internal)?
        {
            return Err(ChatError::MessageNotFound);
        }
    }
    let stored = ctx
        .storage
        .insert_message(from, to, text, reply_to)
        .await
        .map_err(internal)?;
    let payload = direct_payload(&stored);
    if let Some(recipient) = ctx.presence.handle_for(to) {
        recipient.send(ServerEvent::NewMessage(payload.clone()));
    }
    handle.send(ServerEvent::NewMessage(payload));
    // Unread counts changed for the recipient's view of the sender.
    friends::refresh_friends(ctx, &[from, to]).await?;
    Ok(())
}

/// Returns the merged two-way history in timestamp order, then marks the
/// counterpart's messages as read and refreshes both friend views.
pub async fn fetch_history(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    with_user: &str,
) -> Result<(), ChatError> {
    let stored = ctx
        .storage
        .conversation_between(user, with_user)
        .await
        .map_err(internal)?;
    let messages = stored.iter().map(direct_payload).collect();
    handle.send(ServerEvent::ChatHistory(messages));

    ctx.storage
        .mark_conversation_read(with_user, user)
        .await
        .map_err(internal)?;
    friends::refresh_friends(ctx, &[user, with_user]).await?;
    Ok(())
}

/// Soft-deletes a message; only its author may do so. Both participants are
/// notified so open conversation views can redact the bubble.
pub async fn delete_message(
    ctx: &ApiContext,
    handle: &ClientHandle,
    user: &str,
    message_id: MessageId,
) -> Result<(), ChatError> {
    let Some(message) = ctx.storage.get_message(message_id).await.map_err(internal)? else {
        return Err(ChatError::MessageNotFound);
    };
    if message.from_user != user {
        return Err(ChatError::NotAuthorized);
    }
    ctx.storage
        .mark_message_deleted(message_id)
        .await
        .map_err(internal)?;
    let event = ServerEvent::MessageDeleted { message_id };
    if message.to_user != user {
        if let Some(counterpart) = ctx.presence.handle_for(&message.to_user) {
            counterpart.send(event.clone());
        }
    }
    handle.send(event);
    Ok(())
}

pub(crate) fn direct_payload(message: &StoredMessage) -> MessagePayload {
    MessagePayload {
        id: message.id,
        from: message.from_user.clone(),
        to: Some(message.to_user.clone()),
        group_id: None,
        text: display_text(&message.text, message.deleted),
        timestamp: message.timestamp,
        is_read: message.is_read,
        deleted: message.deleted,
        reply_to: message.reply_to,
        scope: None,
    }
}

#[cfg(test)]
#[path = "tests/direct_tests.rs"]
mod tests;
