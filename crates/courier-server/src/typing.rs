//! Ephemeral typing indicators.
//!
//! Typing state lives only in memory, is never queued offline, and expires
//! server-side after a short window so a client that vanishes mid-keystroke
//! does not appear to type forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use courier_shared::{ConversationId, UserId};

/// Per-conversation map of who is typing and when they last refreshed.
pub struct TypingTracker {
    typing: RwLock<HashMap<ConversationId, HashMap<UserId, Instant>>>,
    ttl: Duration,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            typing: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Start/refresh or stop a user's typing state.  Returns `true` when the
    /// visible state changed (so the caller knows whether to broadcast).
    pub async fn set_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    ) -> bool {
        let mut typing = self.typing.write().await;
        if is_typing {
            let entry = typing.entry(conversation_id).or_default();
            entry.insert(user_id, Instant::now()).is_none()
        } else {
            match typing.get_mut(&conversation_id) {
                Some(users) => {
                    let removed = users.remove(&user_id).is_some();
                    if users.is_empty() {
                        typing.remove(&conversation_id);
                    }
                    removed
                }
                None => false,
            }
        }
    }

    /// Users currently typing in a conversation (fresh entries only).
    pub async fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let typing = self.typing.read().await;
        match typing.get(&conversation_id) {
            Some(users) => users
                .iter()
                .filter(|(_, refreshed)| refreshed.elapsed() <= self.ttl)
                .map(|(user_id, _)| *user_id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop entries past the TTL.  Returns the expirations so the caller can
    /// broadcast the implicit "stopped typing".
    pub async fn sweep(&self) -> Vec<(ConversationId, UserId)> {
        let mut typing = self.typing.write().await;
        let mut expired = Vec::new();
        typing.retain(|conversation_id, users| {
            users.retain(|user_id, refreshed| {
                if refreshed.elapsed() > self.ttl {
                    expired.push((*conversation_id, *user_id));
                    false
                } else {
                    true
                }
            });
            !users.is_empty()
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_stop_report_changes() {
        let tracker = TypingTracker::new(Duration::from_secs(5));
        let conversation = ConversationId::new();
        let user = UserId::new();

        assert!(tracker.set_typing(conversation, user, true).await);
        // Refresh is not a visible change.
        assert!(!tracker.set_typing(conversation, user, true).await);
        assert_eq!(tracker.typing_users(conversation).await, vec![user]);

        assert!(tracker.set_typing(conversation, user, false).await);
        assert!(!tracker.set_typing(conversation, user, false).await);
        assert!(tracker.typing_users(conversation).await.is_empty());
    }

    #[tokio::test]
    async fn expiry_without_explicit_stop() {
        let tracker = TypingTracker::new(Duration::from_millis(0));
        let conversation = ConversationId::new();
        let user = UserId::new();

        tracker.set_typing(conversation, user, true).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(tracker.typing_users(conversation).await.is_empty());
        assert_eq!(tracker.sweep().await, vec![(conversation, user)]);
        assert!(tracker.sweep().await.is_empty());
    }
}
