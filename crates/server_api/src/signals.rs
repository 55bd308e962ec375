use shared::{
    domain::GroupId,
    error::ChatError,
    protocol::{ServerEvent, SignalTarget},
};

use crate::{internal, presence::ClientHandle, ApiContext};

/// Typing signals are fire-and-forget: nothing is persisted, offline or
/// unknown targets simply drop the signal, and no failure flows back.
pub async fn typing(ctx: &ApiContext, from: &str, target: &SignalTarget) -> Result<(), ChatError> {
    forward(ctx, from, target, true).await
}

pub async fn stop_typing(
    ctx: &ApiContext,
    from: &str,
    target: &SignalTarget,
) -> Result<(), ChatError> {
    forward(ctx, from, target, false).await
}

/// Reports a user's availability: the live presence flag plus the last
/// recorded disconnect time.
pub async fn last_seen(
    ctx: &ApiContext,
    handle: &ClientHandle,
    username: &str,
) -> Result<(), ChatError> {
    let Some(user) = ctx.storage.get_user(username).await.map_err(internal)? else {
        return Err(ChatError::UnknownUser);
    };
    handle.send(ServerEvent::LastSeen {
        online: ctx.presence.is_online(&user.username),
        username: user.username,
        last_seen: user.last_seen,
    });
    Ok(())
}

async fn forward(
    ctx: &ApiContext,
    from: &str,
    target: &SignalTarget,
    active: bool,
) -> Result<(), ChatError> {
    match target {
        SignalTarget::Direct { to } => {
            if let Some(counterpart) = ctx.presence.handle_for(to) {
                counterpart.send(signal_event(from, None, active));
            }
        }
        SignalTarget::Group { group_id } => {
            let Some(group) = ctx.storage.get_group(*group_id).await.map_err(internal)? else {
                return Ok(());
            };
            if !group.members.iter().any(|member| member == from) {
                return Ok(());
            }
            for member in &group.members {
                if member == from {
                    continue;
                }
                if let Some(target) = ctx.presence.handle_for(member) {
                    target.send(signal_event(from, Some(*group_id), active));
                }
            }
        }
    }
    Ok(())
}

fn signal_event(from: &str, group_id: Option<GroupId>, active: bool) -> ServerEvent {
    if active {
        ServerEvent::Typing {
            from: from.to_string(),
            group_id,
        }
    } else {
        ServerEvent::StopTyping {
            from: from.to_string(),
            group_id,
        }
    }
}

#[cfg(test)]
#[path = "tests/signals_tests.rs"]
mod tests;
