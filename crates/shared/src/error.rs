use thiserror::Error;

/// User-facing failures of chat operations. The `Display` strings are exactly
/// what clients receive in `auth-response` / `friend-added` / `action-failed`
/// payloads, so changing one is a wire-visible change.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("Username already exists")]
    DuplicateIdentity,
    #[error("User not found")]
    UnknownUser,
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("cannot send a friend request to yourself")]
    SelfRequest,
    #[error("Request already exists")]
    DuplicateRequest,
    #[error("not authorized")]
    NotAuthorized,
    #[error("user is already a member")]
    AlreadyMember,
    #[error("the group admin cannot be removed")]
    CannotRemoveAdmin,
    #[error("the group admin cannot leave the group")]
    AdminCannotLeave,
    #[error("group not found")]
    GroupNotFound,
    #[error("message not found")]
    MessageNotFound,
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
