use shared::error::ChatError;
use storage::Storage;

pub mod direct;
pub mod friends;
pub mod groups;
pub mod password;
pub mod presence;
pub mod session;
pub mod signals;

pub use presence::{ClientHandle, PresenceRegistry};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub presence: PresenceRegistry,
}

fn internal(err: anyhow::Error) -> ChatError {
    tracing::error!(error = %err, "storage operation failed");
    ChatError::Storage(err.to_string())
}

fn display_text(text: &str, deleted: bool) -> String {
    if deleted {
        shared::protocol::DELETED_PLACEHOLDER.to_string()
    } else {
        text.to_string()
    }
}
