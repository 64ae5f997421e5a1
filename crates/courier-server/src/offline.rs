//! Bounded, expiring per-user queues for events that could not be delivered
//! live.
//!
//! Delivery is at-most-once by design: the queue is capped (oldest entries
//! are evicted first on overflow) and entries past their TTL are discarded,
//! never delivered.  The original system behaves the same way; we keep the
//! semantics and document them instead of upgrading to guaranteed delivery.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use courier_shared::{ServerFrame, UserId};

/// One undelivered event awaiting the user's next connection.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub id: Uuid,
    pub user_id: UserId,
    pub frame: ServerFrame,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Per-user offline event queues.
pub struct OfflineQueue {
    queues: RwLock<HashMap<UserId, VecDeque<QueuedEvent>>>,
    cap: usize,
    ttl: Duration,
}

impl OfflineQueue {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            cap,
            ttl,
        }
    }

    /// Enqueue an event for an offline user.  Returns `true` when an older
    /// entry was evicted to make room.
    pub async fn enqueue(&self, user_id: UserId, frame: ServerFrame) -> bool {
        let now = Utc::now();
        let event = QueuedEvent {
            id: Uuid::new_v4(),
            user_id,
            frame,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero()),
        };

        let mut queues = self.queues.write().await;
        let queue = queues.entry(user_id).or_default();
        let mut evicted = false;
        while queue.len() >= self.cap {
            queue.pop_front();
            evicted = true;
        }
        queue.push_back(event);
        if evicted {
            debug!(user = %user_id, cap = self.cap, "offline queue overflow, evicted oldest");
        }
        evicted
    }

    /// Take the full non-expired queue for a user, clearing it.  Expired
    /// entries are silently dropped.
    pub async fn drain(&self, user_id: UserId) -> Vec<ServerFrame> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.remove(&user_id) else {
            return Vec::new();
        };
        let now = Utc::now();
        queue
            .into_iter()
            .filter(|event| event.expires_at > now)
            .map(|event| event.frame)
            .collect()
    }

    /// Number of queued events for a user.
    pub async fn len(&self, user_id: UserId) -> usize {
        self.queues
            .read()
            .await
            .get(&user_id)
            .map_or(0, VecDeque::len)
    }

    pub async fn is_empty(&self, user_id: UserId) -> bool {
        self.len(user_id).await == 0
    }

    /// Discard expired entries across all queues.  Returns the number
    /// dropped.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut queues = self.queues.write().await;
        let mut dropped = 0;
        queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|event| event.expires_at > now);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> ServerFrame {
        ServerFrame::Error {
            message: text.to_string(),
        }
    }

    #[tokio::test]
    async fn drain_returns_fifo_and_clears() {
        let queue = OfflineQueue::new(10, Duration::from_secs(60));
        let user = UserId::new();

        queue.enqueue(user, frame("one")).await;
        queue.enqueue(user, frame("two")).await;
        assert_eq!(queue.len(user).await, 2);

        let drained = queue.drain(user).await;
        assert_eq!(drained, vec![frame("one"), frame("two")]);
        assert!(queue.is_empty(user).await);
        assert!(queue.drain(user).await.is_empty());
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_first() {
        let queue = OfflineQueue::new(3, Duration::from_secs(60));
        let user = UserId::new();

        for i in 0..5 {
            queue.enqueue(user, frame(&format!("m{i}"))).await;
        }
        assert_eq!(queue.len(user).await, 3);

        let drained = queue.drain(user).await;
        assert_eq!(drained, vec![frame("m2"), frame("m3"), frame("m4")]);
    }

    #[tokio::test]
    async fn expired_entries_are_never_delivered() {
        let queue = OfflineQueue::new(10, Duration::from_secs(0));
        let user = UserId::new();

        queue.enqueue(user, frame("late")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.drain(user).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_drops_expired() {
        let queue = OfflineQueue::new(10, Duration::from_secs(0));
        let user = UserId::new();

        queue.enqueue(user, frame("stale")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.sweep().await, 1);
        assert!(queue.is_empty(user).await);
    }

    #[tokio::test]
    async fn queues_are_isolated_per_user() {
        let queue = OfflineQueue::new(2, Duration::from_secs(60));
        let a = UserId::new();
        let b = UserId::new();

        queue.enqueue(a, frame("for a")).await;
        queue.enqueue(b, frame("for b")).await;

        assert_eq!(queue.drain(a).await, vec![frame("for a")]);
        assert_eq!(queue.len(b).await, 1);
    }
}
