//! Delivery broadcaster: fans one logical event out to every live connection
//! of every conversation participant, with offline fallback.
//!
//! Persistence has already succeeded by the time an event reaches this
//! layer, so delivery failures are never surfaced to the sender: a dead
//! connection or unreachable participant is treated as offline and the event
//! goes to their queue (or is dropped, for ephemeral frames).

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use courier_shared::{ConversationId, MessageId, PresenceStatus, ServerFrame, UserId};
use courier_store::Database;

use crate::bus::{Bus, BusEvent};
use crate::offline::OfflineQueue;
use crate::registry::ConnectionRegistry;

/// Outbound event for the email/push notification collaborators, emitted
/// when a message had to be queued for an offline participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryNotification {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

pub struct Broadcaster {
    store: Arc<Mutex<Database>>,
    registry: Arc<ConnectionRegistry>,
    offline: Arc<OfflineQueue>,
    bus: Arc<dyn Bus>,
    instance_id: String,
    notifications: mpsc::UnboundedSender<DeliveryNotification>,
}

impl Broadcaster {
    pub fn new(
        store: Arc<Mutex<Database>>,
        registry: Arc<ConnectionRegistry>,
        offline: Arc<OfflineQueue>,
        bus: Arc<dyn Bus>,
        instance_id: String,
        notifications: mpsc::UnboundedSender<DeliveryNotification>,
    ) -> Self {
        Self {
            store,
            registry,
            offline,
            bus,
            instance_id,
            notifications,
        }
    }

    /// Fan a frame out to every active participant of a conversation except
    /// the excluded users.  Live connections get it immediately; everyone
    /// else gets an offline-queue entry (unless the frame is ephemeral).
    /// The frame is republished on the bus for sibling instances either way.
    pub async fn broadcast(
        &self,
        conversation_id: ConversationId,
        frame: &ServerFrame,
        exclude: &[UserId],
    ) {
        let participants = {
            let store = self.store.lock().await;
            match store.get_participants(conversation_id, true) {
                Ok(participants) => participants,
                Err(e) => {
                    warn!(conversation = %conversation_id, error = %e, "participant resolution failed, skipping broadcast");
                    return;
                }
            }
        };

        let mut recipients = Vec::new();
        for participant in &participants {
            if exclude.contains(&participant.user_id) {
                continue;
            }
            recipients.push(participant.user_id);
            self.deliver(participant.user_id, conversation_id, frame).await;
        }

        self.bus.publish(BusEvent {
            origin: self.instance_id.clone(),
            topic: conversation_id.to_topic(),
            recipients,
            frame: frame.clone(),
        });
    }

    /// Deliver one frame to one user: live connections first, offline queue
    /// as the fallback for durable frames.
    async fn deliver(&self, user_id: UserId, conversation_id: ConversationId, frame: &ServerFrame) {
        if is_ephemeral(frame) {
            // Typing follows the original join/leave subscription semantics
            // and is never queued.
            self.registry
                .send_to_user_joined(user_id, conversation_id, frame)
                .await;
            return;
        }

        let delivered = self.registry.send_to_user(user_id, frame).await;
        if delivered > 0 {
            if let ServerFrame::Message(view) = frame {
                let store = self.store.lock().await;
                if let Err(e) = store.upsert_delivery_receipt(view.id, user_id) {
                    warn!(message = %view.id, user = %user_id, error = %e, "delivery receipt write failed");
                }
            }
            return;
        }

        self.offline.enqueue(user_id, frame.clone()).await;
        debug!(user = %user_id, conversation = %conversation_id, "participant offline, event queued");

        if let ServerFrame::Message(view) = frame {
            // Notification port for email/push collaborators; a closed
            // receiver just means nobody subscribed.
            let _ = self.notifications.send(DeliveryNotification {
                user_id,
                conversation_id,
                message_id: view.id,
            });
        }
    }

    /// Flush the non-expired offline queue to a user's new connections.
    /// Returns the number of frames delivered.
    pub async fn flush_offline(&self, user_id: UserId) -> usize {
        let frames = self.offline.drain(user_id).await;
        let mut flushed = 0;
        for frame in &frames {
            if self.registry.send_to_user(user_id, frame).await > 0 {
                flushed += 1;
                if let ServerFrame::Message(view) = frame {
                    let store = self.store.lock().await;
                    if let Err(e) = store.upsert_delivery_receipt(view.id, user_id) {
                        warn!(message = %view.id, user = %user_id, error = %e, "delivery receipt write failed");
                    }
                }
            }
        }
        if flushed > 0 {
            debug!(user = %user_id, count = flushed, "offline queue flushed");
        }
        flushed
    }

    /// Announce a presence change to every user sharing a conversation with
    /// the subject, and to sibling instances.  Presence is ephemeral: live
    /// connections only.
    pub async fn broadcast_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        last_seen: chrono::DateTime<chrono::Utc>,
    ) {
        let partners = {
            let store = self.store.lock().await;
            match store.co_participants(user_id) {
                Ok(partners) => partners,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "partner resolution failed, skipping presence broadcast");
                    return;
                }
            }
        };

        let frame = ServerFrame::Presence {
            user_id,
            status,
            last_seen,
        };
        for partner in &partners {
            self.registry.send_to_user(*partner, &frame).await;
        }

        self.bus.publish(BusEvent {
            origin: self.instance_id.clone(),
            topic: "presence".to_string(),
            recipients: partners,
            frame,
        });
    }

    /// Deliver frames published by sibling instances to locally-owned
    /// connections.  No offline fallback and no re-publish: the originating
    /// instance already handled both.
    pub async fn deliver_from_bus(&self, event: &BusEvent) {
        if event.origin == self.instance_id {
            return;
        }
        // Typing keeps its join-subscription semantics across instances.
        let joined_scope = match &event.frame {
            ServerFrame::Typing {
                conversation_id, ..
            }
            | ServerFrame::TypingUsers {
                conversation_id, ..
            } => Some(*conversation_id),
            _ => None,
        };
        for user_id in &event.recipients {
            match joined_scope {
                Some(conversation_id) => {
                    self.registry
                        .send_to_user_joined(*user_id, conversation_id, &event.frame)
                        .await;
                }
                None => {
                    self.registry.send_to_user(*user_id, &event.frame).await;
                }
            }
        }
    }
}

/// Frames that are only meaningful in the moment: never queued offline.
fn is_ephemeral(frame: &ServerFrame) -> bool {
    matches!(
        frame,
        ServerFrame::Typing { .. } | ServerFrame::TypingUsers { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use courier_shared::envelope::MessageView;
    use courier_shared::{ConnectionId, MessageKind, MessagePriority};
    use courier_store::NewMessage;
    use std::time::Duration;

    struct Fixture {
        broadcaster: Broadcaster,
        registry: Arc<ConnectionRegistry>,
        offline: Arc<OfflineQueue>,
        store: Arc<Mutex<Database>>,
        notifications: mpsc::UnboundedReceiver<DeliveryNotification>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let registry = Arc::new(ConnectionRegistry::new());
        let offline = Arc::new(OfflineQueue::new(10, Duration::from_secs(60)));
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let broadcaster = Broadcaster::new(
            store.clone(),
            registry.clone(),
            offline.clone(),
            bus,
            "test-node".into(),
            tx,
        );
        Fixture {
            broadcaster,
            registry,
            offline,
            store,
            notifications: rx,
        }
    }

    async fn direct_conversation(
        store: &Arc<Mutex<Database>>,
        a: UserId,
        b: UserId,
    ) -> ConversationId {
        store.lock().await.find_or_create_direct(a, b, None).unwrap().0.id
    }

    async fn persisted_view(
        store: &Arc<Mutex<Database>>,
        conversation_id: ConversationId,
        sender: UserId,
        content: &str,
    ) -> MessageView {
        let message = store
            .lock()
            .await
            .insert_message(&NewMessage {
                id: MessageId::new(),
                conversation_id,
                sender_id: sender,
                recipient_id: None,
                parent_id: None,
                content: content.into(),
                kind: MessageKind::Text,
                priority: MessagePriority::Normal,
                expires_at: None,
                metadata: None,
            })
            .unwrap();
        MessageView {
            id: message.id,
            conversation_id,
            sender_id: sender,
            recipient_id: None,
            parent_id: None,
            content: message.content,
            kind: message.kind,
            priority: message.priority,
            is_edited: false,
            edited_at: None,
            sent_at: message.sent_at,
            attachments: Vec::new(),
            reactions: Vec::new(),
            read: false,
        }
    }

    #[tokio::test]
    async fn offline_participant_gets_exactly_one_queued_event() {
        let mut fx = fixture();
        let a = UserId::new();
        let b = UserId::new();
        let conversation_id = direct_conversation(&fx.store, a, b).await;

        let view = persisted_view(&fx.store, conversation_id, a, "hello").await;
        fx.broadcaster
            .broadcast(conversation_id, &ServerFrame::Message(view.clone()), &[a])
            .await;

        assert_eq!(fx.offline.len(b).await, 1);
        assert!(fx.offline.is_empty(a).await);

        // The notification port saw the offline delivery.
        let notification = fx.notifications.recv().await.unwrap();
        assert_eq!(notification.user_id, b);
        assert_eq!(notification.message_id, view.id);
    }

    #[tokio::test]
    async fn reconnect_flush_delivers_once_and_clears() {
        let mut fx = fixture();
        let a = UserId::new();
        let b = UserId::new();
        let conversation_id = direct_conversation(&fx.store, a, b).await;

        let view = persisted_view(&fx.store, conversation_id, a, "hello").await;
        fx.broadcaster
            .broadcast(conversation_id, &ServerFrame::Message(view.clone()), &[a])
            .await;

        // B connects later.
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.registry.register(ConnectionId::new(), b, tx).await;
        assert_eq!(fx.broadcaster.flush_offline(b).await, 1);

        match rx.recv().await.unwrap() {
            ServerFrame::Message(delivered) => assert_eq!(delivered.content, "hello"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(fx.offline.is_empty(b).await);
        assert_eq!(fx.broadcaster.flush_offline(b).await, 0);

        // Delivery receipt recorded on flush.
        let receipt = fx.store.lock().await.get_receipt(view.id, b).unwrap();
        assert!(receipt.read_at.is_none());
        let _ = fx.notifications.try_recv();
    }

    #[tokio::test]
    async fn typing_is_not_queued_offline() {
        let fx = fixture();
        let a = UserId::new();
        let b = UserId::new();
        let conversation_id = direct_conversation(&fx.store, a, b).await;

        fx.broadcaster
            .broadcast(
                conversation_id,
                &ServerFrame::Typing {
                    conversation_id,
                    user_id: a,
                    is_typing: true,
                },
                &[a],
            )
            .await;

        assert!(fx.offline.is_empty(b).await);
    }

    #[tokio::test]
    async fn live_participant_is_not_queued() {
        let fx = fixture();
        let a = UserId::new();
        let b = UserId::new();
        let conversation_id = direct_conversation(&fx.store, a, b).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.registry.register(ConnectionId::new(), b, tx).await;

        let view = persisted_view(&fx.store, conversation_id, a, "live").await;
        fx.broadcaster
            .broadcast(conversation_id, &ServerFrame::Message(view), &[a])
            .await;

        assert!(fx.offline.is_empty(b).await);
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::Message(_)));
    }

    #[tokio::test]
    async fn bus_events_from_self_are_ignored() {
        let fx = fixture();
        let b = UserId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.registry.register(ConnectionId::new(), b, tx).await;

        let event = BusEvent {
            origin: "test-node".into(),
            topic: "presence".into(),
            recipients: vec![b],
            frame: ServerFrame::Heartbeat {
                timestamp: chrono::Utc::now(),
            },
        };
        fx.broadcaster.deliver_from_bus(&event).await;
        assert!(rx.try_recv().is_err());

        let sibling = BusEvent {
            origin: "other-node".into(),
            ..event
        };
        fx.broadcaster.deliver_from_bus(&sibling).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn bus_typing_respects_join_subscription() {
        let fx = fixture();
        let a = UserId::new();
        let b = UserId::new();
        let conversation_id = direct_conversation(&fx.store, a, b).await;

        let connection_id = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.registry.register(connection_id, b, tx).await;

        let event = BusEvent {
            origin: "other-node".into(),
            topic: conversation_id.to_topic(),
            recipients: vec![b],
            frame: ServerFrame::Typing {
                conversation_id,
                user_id: a,
                is_typing: true,
            },
        };

        // Connected but not joined: typing from a sibling instance stays
        // invisible, same as local typing.
        fx.broadcaster.deliver_from_bus(&event).await;
        assert!(rx.try_recv().is_err());

        fx.registry.join_conversation(connection_id, conversation_id).await;
        fx.broadcaster.deliver_from_bus(&event).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerFrame::Typing { is_typing: true, .. }
        ));
    }
}
