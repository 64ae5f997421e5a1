//! Live connection registry.
//!
//! One user may hold many simultaneous connections (devices, tabs).  Both
//! indexes live behind a single `RwLock` so they always mutate together;
//! registration and removal are safe under concurrent access from
//! independent connection-handling tasks.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use courier_shared::{ConnectionId, ConversationId, ServerFrame, UserId};

/// Outbound handle for one live connection.
struct ConnectionHandle {
    user_id: UserId,
    sender: mpsc::UnboundedSender<ServerFrame>,
    joined: HashSet<ConversationId>,
    last_activity: Instant,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl Inner {
    /// Remove one connection; returns its user and whether it was the
    /// user's last connection.
    fn remove(&mut self, connection_id: ConnectionId) -> Option<(UserId, bool)> {
        let handle = self.connections.remove(&connection_id)?;
        let user_id = handle.user_id;
        let last = match self.by_user.get_mut(&user_id) {
            Some(set) => {
                set.remove(&connection_id);
                if set.is_empty() {
                    self.by_user.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        Some((user_id, last))
    }
}

/// Concurrency-safe table of live connections, indexed by connection id and
/// by user id.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.  Returns `true` when this is the user's first live
    /// connection (i.e. the user just came online).
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            connection_id,
            ConnectionHandle {
                user_id,
                sender,
                joined: HashSet::new(),
                last_activity: Instant::now(),
            },
        );
        let set = inner.by_user.entry(user_id).or_default();
        set.insert(connection_id);
        set.len() == 1
    }

    /// Remove a connection.  Returns the owning user and whether it was
    /// their last connection.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<(UserId, bool)> {
        self.inner.write().await.remove(connection_id)
    }

    /// Refresh a connection's liveness stamp.
    pub async fn touch(&self, connection_id: ConnectionId) {
        if let Some(handle) = self.inner.write().await.connections.get_mut(&connection_id) {
            handle.last_activity = Instant::now();
        }
    }

    pub async fn join_conversation(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) {
        if let Some(handle) = self.inner.write().await.connections.get_mut(&connection_id) {
            handle.joined.insert(conversation_id);
        }
    }

    pub async fn leave_conversation(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) {
        if let Some(handle) = self.inner.write().await.connections.get_mut(&connection_id) {
            handle.joined.remove(&conversation_id);
        }
    }

    /// Write a frame to every live connection of one user.
    ///
    /// Returns the number of connections reached.  A failed write means the
    /// receiving task is gone; such connections are implicitly unregistered.
    pub async fn send_to_user(&self, user_id: UserId, frame: &ServerFrame) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let inner = self.inner.read().await;
            let Some(connection_ids) = inner.by_user.get(&user_id) else {
                return 0;
            };
            for connection_id in connection_ids {
                match inner.connections.get(connection_id) {
                    Some(handle) if handle.sender.send(frame.clone()).is_ok() => {
                        delivered += 1;
                    }
                    _ => dead.push(*connection_id),
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write().await;
            for connection_id in dead {
                debug!(connection = %connection_id, user = %user_id, "dropping dead connection");
                inner.remove(connection_id);
            }
        }

        delivered
    }

    /// Write a frame only to the user's connections that have joined the
    /// given conversation.  Used for ephemeral events (typing) that follow
    /// the original join/leave subscription semantics.
    pub async fn send_to_user_joined(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        frame: &ServerFrame,
    ) -> usize {
        let inner = self.inner.read().await;
        let Some(connection_ids) = inner.by_user.get(&user_id) else {
            return 0;
        };
        let mut delivered = 0;
        for connection_id in connection_ids {
            if let Some(handle) = inner.connections.get(connection_id) {
                if handle.joined.contains(&conversation_id)
                    && handle.sender.send(frame.clone()).is_ok()
                {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Whether the user holds at least one live connection.
    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.read().await.by_user.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Evict connections silent beyond `timeout`.  Returns the evicted
    /// connections along with whether each was its user's last one.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<(ConnectionId, UserId, bool)> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let stale: Vec<ConnectionId> = inner
            .connections
            .iter()
            .filter(|(_, handle)| now.duration_since(handle.last_activity) > timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for connection_id in stale {
            if let Some((user_id, last)) = inner.remove(connection_id) {
                evicted.push((connection_id, user_id, last));
            }
        }
        evicted
    }
}
