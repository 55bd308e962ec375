use chrono::Utc;
use shared::{
    error::ChatError,
    protocol::{ServerEvent, UserPayload},
};
use tracing::{error, info};

use crate::{
    friends, groups, internal,
    password::{hash_password, verify_password},
    presence::ClientHandle,
    ApiContext,
};

const MAX_USERNAME_CHARS: usize = 12;

/// Creates an account and starts a session on the requesting connection.
pub async fn register(
    ctx: &ApiContext,
    username: &str,
    password: &str,
    handle: &ClientHandle,
) -> Result<String, ChatError> {
    validate_username(username)?;
    let password_hash = hash_password(password);
    let inserted = ctx
        .storage
        .insert_user(username, &password_hash)
        .await
        .map_err(internal)?;
    if !inserted {
        return Err(ChatError::DuplicateIdentity);
    }
    info!(%username, "account created");
    begin_session(ctx, username, handle).await
}

pub async fn login(
    ctx: &ApiContext,
    username: &str,
    password: &str,
    handle: &ClientHandle,
) -> Result<String, ChatError> {
    let Some(user) = ctx.storage.get_user(username).await.map_err(internal)? else {
        return Err(ChatError::InvalidCredentials);
    };
    if !verify_password(password, &user.password_hash) {
        return Err(ChatError::InvalidCredentials);
    }
    begin_session(ctx, username, handle).await
}

/// Resumes a remembered session by username alone, trusting the client's
/// stored identity the way the reference client's local session does.
pub async fn auto_login(
    ctx: &ApiContext,
    username: &str,
    handle: &ClientHandle,
) -> Result<String, ChatError> {
    if !ctx.storage.user_exists(username).await.map_err(internal)? {
        return Err(ChatError::UnknownUser);
    }
    begin_session(ctx, username, handle).await
}

/// Tears down the session bound to this connection, if it still owns one.
/// The conn-id guard in the registry keeps a displaced session's late
/// disconnect from touching the newer session's presence or last-seen.
pub async fn disconnect(ctx: &ApiContext, handle: &ClientHandle) {
    let Some(username) = ctx.presence.unregister(handle) else {
        return;
    };
    let last_seen = Utc::now();
    if let Err(err) = ctx.storage.set_last_seen(&username, last_seen).await {
        error!(%username, error = %err, "failed to persist last_seen on disconnect");
    }
    ctx.presence.broadcast(&ServerEvent::UserOffline {
        username: username.clone(),
        last_seen,
    });
    info!(%username, "session ended");
}

async fn begin_session(
    ctx: &ApiContext,
    username: &str,
    handle: &ClientHandle,
) -> Result<String, ChatError> {
    // A connection re-authenticating under a different name goes offline as
    // its previous identity first, so one connection never holds two
    // registry entries.
    match ctx.presence.username_for(handle) {
        Some(previous) if previous != username => disconnect(ctx, handle).await,
        _ => {}
    }
    if let Some(displaced) = ctx.presence.register(username, handle.clone()) {
        displaced.send(ServerEvent::SessionReplaced {
            username: username.to_string(),
        });
    }
    ctx.presence.broadcast(&ServerEvent::UserOnline {
        username: username.to_string(),
    });
    handle.send(ServerEvent::AuthResponse {
        success: true,
        user: Some(UserPayload {
            username: username.to_string(),
        }),
        message: None,
    });
    push_account_state(ctx, username, handle).await;
    info!(%username, "session started");
    Ok(username.to_string())
}

/// Freshly authenticated clients get their friends, pending requests and
/// groups without asking. Failures here do not undo the authentication.
async fn push_account_state(ctx: &ApiContext, username: &str, handle: &ClientHandle) {
    let events = [
        friends::friends_list_event(ctx, username).await,
        friends::requests_list_event(ctx, username).await,
        groups::groups_list_event(ctx, username).await,
    ];
    for event in events {
        match event {
            Ok(event) => handle.send(event),
            Err(err) => handle.send(ServerEvent::ActionFailed {
                message: err.to_string(),
            }),
        }
    }
}

fn validate_username(username: &str) -> Result<(), ChatError> {
    let length = username.chars().count();
    if length == 0 || length > MAX_USERNAME_CHARS {
        return Err(ChatError::validation(
            "username must be between 1 and 12 characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
