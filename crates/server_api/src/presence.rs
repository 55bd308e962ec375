use parking_lot::Mutex;
use shared::protocol::ServerEvent;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Write half of one client connection. Cloned into the registry and into
/// every fan-out path; the receiver side is drained by the connection's
/// writer task.
#[derive(Clone)]
pub struct ClientHandle {
    conn_id: Uuid,
    tx: UnboundedSender<ServerEvent>,
}

impl ClientHandle {
    pub fn new() -> (Self, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queues an event for the connection. A closed receiver means the
    /// connection is already gone, which delivery treats as offline.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

/// Maps authenticated usernames to their live connection handles. The lock is
/// never held across an await; callers clone handles out and send after the
/// guard is dropped.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<HashMap<String, ClientHandle>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a username to a connection, last login wins. Returns the handle
    /// this registration displaced when a different connection held the name.
    pub fn register(&self, username: &str, handle: ClientHandle) -> Option<ClientHandle> {
        let conn_id = handle.conn_id;
        let previous = self.inner.lock().insert(username.to_string(), handle);
        previous.filter(|displaced| displaced.conn_id != conn_id)
    }

    /// Unbinds a username only while this exact connection still owns it, so
    /// the delayed disconnect of a displaced session cannot evict the newer
    /// one. Returns the username that was freed.
    pub fn unregister(&self, handle: &ClientHandle) -> Option<String> {
        let mut map = self.inner.lock();
        let username = map
            .iter()
            .find(|(_, bound)| bound.conn_id == handle.conn_id)
            .map(|(name, _)| name.clone())?;
        map.remove(&username);
        Some(username)
    }

    /// Looks up which username, if any, this exact connection is bound to.
    pub fn username_for(&self, handle: &ClientHandle) -> Option<String> {
        self.inner
            .lock()
            .iter()
            .find(|(_, bound)| bound.conn_id == handle.conn_id)
            .map(|(name, _)| name.clone())
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.inner.lock().contains_key(username)
    }

    pub fn handle_for(&self, username: &str) -> Option<ClientHandle> {
        self.inner.lock().get(username).cloned()
    }

    pub fn broadcast(&self, event: &ServerEvent) {
        for handle in self.inner.lock().values() {
            handle.send(event.clone());
        }
    }
}
