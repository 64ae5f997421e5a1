//! Ephemeral per-user presence with a TTL.
//!
//! Presence is never persisted: a record that is absent, or whose TTL has
//! elapsed without a heartbeat, reads as `offline`.  `away` is only ever set
//! by an explicit client signal; sweeps demote stale records to offline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use courier_shared::{PresenceStatus, UserId};

#[derive(Debug, Clone)]
struct PresenceRecord {
    status: PresenceStatus,
    refreshed: Instant,
    last_seen: DateTime<Utc>,
}

/// In-process presence store.
pub struct PresenceStore {
    records: RwLock<HashMap<UserId, PresenceRecord>>,
    ttl: Duration,
}

impl PresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Set an explicit status (connection open/close, client `presence`
    /// frame).
    pub async fn set_status(&self, user_id: UserId, status: PresenceStatus) {
        let mut records = self.records.write().await;
        records.insert(
            user_id,
            PresenceRecord {
                status,
                refreshed: Instant::now(),
                last_seen: Utc::now(),
            },
        );
    }

    /// Refresh the TTL window without changing the status.  A heartbeat from
    /// a user with no record marks them online.
    pub async fn heartbeat(&self, user_id: UserId) {
        let mut records = self.records.write().await;
        match records.get_mut(&user_id) {
            Some(record) => {
                record.refreshed = Instant::now();
                record.last_seen = Utc::now();
            }
            None => {
                records.insert(
                    user_id,
                    PresenceRecord {
                        status: PresenceStatus::Online,
                        refreshed: Instant::now(),
                        last_seen: Utc::now(),
                    },
                );
            }
        }
    }

    /// Current status for a user.  Stale or missing records read as offline.
    pub async fn get(&self, user_id: UserId) -> (PresenceStatus, Option<DateTime<Utc>>) {
        let records = self.records.read().await;
        match records.get(&user_id) {
            Some(record) if record.refreshed.elapsed() <= self.ttl => {
                (record.status, Some(record.last_seen))
            }
            Some(record) => (PresenceStatus::Offline, Some(record.last_seen)),
            None => (PresenceStatus::Offline, None),
        }
    }

    /// Demote stale online/away records to offline.  Returns the users whose
    /// visible status changed so the caller can republish.
    pub async fn sweep(&self) -> Vec<UserId> {
        let mut records = self.records.write().await;
        let mut demoted = Vec::new();
        for (user_id, record) in records.iter_mut() {
            if record.status != PresenceStatus::Offline && record.refreshed.elapsed() > self.ttl {
                record.status = PresenceStatus::Offline;
                demoted.push(*user_id);
            }
        }
        demoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_record_reads_offline() {
        let store = PresenceStore::new(Duration::from_secs(60));
        let (status, last_seen) = store.get(UserId::new()).await;
        assert_eq!(status, PresenceStatus::Offline);
        assert!(last_seen.is_none());
    }

    #[tokio::test]
    async fn stale_record_reads_offline_and_sweep_demotes() {
        let store = PresenceStore::new(Duration::from_millis(0));
        let user = UserId::new();
        store.set_status(user, PresenceStatus::Online).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let (status, last_seen) = store.get(user).await;
        assert_eq!(status, PresenceStatus::Offline);
        assert!(last_seen.is_some());

        assert_eq!(store.sweep().await, vec![user]);
        // Second sweep reports nothing new.
        assert!(store.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_keeps_away_status() {
        let store = PresenceStore::new(Duration::from_secs(60));
        let user = UserId::new();
        store.set_status(user, PresenceStatus::Away).await;
        store.heartbeat(user).await;

        let (status, _) = store.get(user).await;
        assert_eq!(status, PresenceStatus::Away);
    }
}
