//! Conversation service: the operation layer behind both the WebSocket
//! handler and the REST surface.
//!
//! Every operation authorizes against the participant table first and fails
//! closed: a user who is not an active participant gets `AccessDenied`, never
//! a partial result.  Persistence happens before any fan-out, so a sender's
//! acknowledgement always refers to a durable row.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use courier_shared::envelope::{AttachmentView, MessageView, SendMessage};
use courier_shared::{
    ConversationId, MessageId, ParticipantRole, PresenceStatus, ReactionOp, ServerFrame, UserId,
};
use courier_store::{
    Attachment, Conversation, ConversationFilter, ConversationSetting, Database, Message,
    MessageFilter, NewMessage, Participant, StoreError,
};

use crate::broadcast::Broadcaster;
use crate::error::ServerError;
use crate::presence::PresenceStore;
use crate::typing::TypingTracker;

const MAX_CONTENT_LEN: usize = 16 * 1024;

/// One entry in a user's conversation listing, enriched beyond the raw row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: i64,
    pub last_message: Option<MessageView>,
    pub is_archived: bool,
    pub is_muted: bool,
    /// The other user of a direct conversation, with live presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerPresence>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerPresence {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
    pub is_archived: bool,
    pub is_muted: bool,
    pub unread_count: i64,
}

/// One page of reverse-chronological history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    pub has_more: bool,
    /// Cursor for the next page; pass back as `before_seq`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before_seq: Option<i64>,
}

pub struct ConversationService {
    store: Arc<Mutex<Database>>,
    broadcaster: Arc<Broadcaster>,
    typing: Arc<TypingTracker>,
    presence: Arc<PresenceStore>,
}

impl ConversationService {
    pub fn new(
        store: Arc<Mutex<Database>>,
        broadcaster: Arc<Broadcaster>,
        typing: Arc<TypingTracker>,
        presence: Arc<PresenceStore>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            typing,
            presence,
        }
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Find or create the direct conversation between two users.  Repeated
    /// and concurrent calls converge on the same conversation.
    pub async fn open_direct_conversation(
        &self,
        creator_id: UserId,
        other_id: UserId,
        project_id: Option<Uuid>,
    ) -> Result<(Conversation, bool), ServerError> {
        if creator_id == other_id {
            return Err(ServerError::Validation(
                "cannot open a direct conversation with yourself".into(),
            ));
        }
        let store = self.store.lock().await;
        if store.is_blocked(other_id, creator_id)? {
            return Err(ServerError::Blocked { user_id: other_id });
        }
        Ok(store.find_or_create_direct(creator_id, other_id, project_id)?)
    }

    pub async fn create_group_conversation(
        &self,
        creator_id: UserId,
        title: Option<&str>,
        project_id: Option<Uuid>,
        members: &[UserId],
    ) -> Result<Conversation, ServerError> {
        if members.is_empty() {
            return Err(ServerError::Validation(
                "a group conversation needs at least one other member".into(),
            ));
        }
        let store = self.store.lock().await;
        Ok(store.create_group_conversation(title, creator_id, project_id, members)?)
    }

    /// A user's conversations, most recently active first, enriched with
    /// unread counts, the last message, and live peer presence for directs.
    pub async fn list_conversations(
        &self,
        user_id: UserId,
        filter: &ConversationFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, ServerError> {
        // Collect everything that needs the store in one pass, then enrich
        // with presence after the lock is released.
        let mut entries = Vec::new();
        {
            let store = self.store.lock().await;
            let conversations = store.list_conversations_for_user(user_id, filter, limit, offset)?;
            for conversation in conversations {
                let unread_count = store.unread_count(conversation.id, user_id)?;
                let setting = store.get_conversation_setting(conversation.id, user_id)?;
                let last_message = match conversation.last_message_id {
                    Some(message_id) => match store.get_message(message_id) {
                        Ok(message) => Some(build_view(&store, &message, Some(user_id))?),
                        Err(StoreError::NotFound) => None,
                        Err(e) => return Err(e.into()),
                    },
                    None => None,
                };
                let peer_id = if conversation.is_group {
                    None
                } else {
                    store
                        .get_participants(conversation.id, true)?
                        .into_iter()
                        .map(|p| p.user_id)
                        .find(|id| *id != user_id)
                };
                entries.push((conversation, unread_count, setting, last_message, peer_id));
            }
        }

        let mut summaries = Vec::with_capacity(entries.len());
        for (conversation, unread_count, setting, last_message, peer_id) in entries {
            let peer = match peer_id {
                Some(peer_id) => {
                    let (status, last_seen) = self.presence.get(peer_id).await;
                    Some(PeerPresence {
                        user_id: peer_id,
                        status,
                        last_seen,
                    })
                }
                None => None,
            };
            summaries.push(ConversationSummary {
                conversation,
                unread_count,
                last_message,
                is_archived: setting.is_archived,
                is_muted: setting.is_muted,
                peer,
            });
        }
        Ok(summaries)
    }

    pub async fn conversation_detail(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationDetail, ServerError> {
        let store = self.store.lock().await;
        require_participant(&store, conversation_id, user_id)?;
        let conversation = store.get_conversation(conversation_id)?;
        let participants = store.get_participants(conversation_id, true)?;
        let setting = store.get_conversation_setting(conversation_id, user_id)?;
        let unread_count = store.unread_count(conversation_id, user_id)?;
        Ok(ConversationDetail {
            conversation,
            participants,
            is_archived: setting.is_archived,
            is_muted: setting.is_muted,
            unread_count,
        })
    }

    /// Update the caller's archive/mute toggles.  `None` leaves a toggle
    /// untouched.
    pub async fn set_conversation_settings(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        archived: Option<bool>,
        muted: Option<bool>,
    ) -> Result<ConversationSetting, ServerError> {
        let store = self.store.lock().await;
        require_participant(&store, conversation_id, user_id)?;
        Ok(store.set_conversation_setting(conversation_id, user_id, archived, muted)?)
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    /// Add a member to a group conversation.  Only admins may add.
    pub async fn add_participant(
        &self,
        actor_id: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
        role: ParticipantRole,
    ) -> Result<Participant, ServerError> {
        let participant = {
            let store = self.store.lock().await;
            let conversation = store.get_conversation(conversation_id)?;
            if !conversation.is_group {
                return Err(ServerError::Validation(
                    "cannot add participants to a direct conversation".into(),
                ));
            }
            require_admin(&store, conversation_id, actor_id)?;
            store.add_participant(conversation_id, user_id, role)?
        };

        self.broadcaster
            .broadcast(
                conversation_id,
                &ServerFrame::ConversationJoined {
                    conversation_id,
                    user_id,
                },
                &[],
            )
            .await;
        Ok(participant)
    }

    /// Remove a member.  A user may remove themself; removing anyone else
    /// requires admin.  History stays intact.
    pub async fn remove_participant(
        &self,
        actor_id: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ServerError> {
        let removed = {
            let store = self.store.lock().await;
            let conversation = store.get_conversation(conversation_id)?;
            // A direct conversation always has exactly two active
            // participants; archive it instead of leaving.
            if !conversation.is_group {
                return Err(ServerError::Validation(
                    "cannot remove participants from a direct conversation".into(),
                ));
            }
            if actor_id != user_id {
                require_admin(&store, conversation_id, actor_id)?;
            } else {
                require_participant(&store, conversation_id, actor_id)?;
            }
            store.remove_participant(conversation_id, user_id)?
        };
        if !removed {
            return Err(ServerError::NotFound("participant".into()));
        }

        self.broadcaster
            .broadcast(
                conversation_id,
                &ServerFrame::ConversationLeft {
                    conversation_id,
                    user_id,
                },
                &[],
            )
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Persist and fan out a message.  Returns the sender's view for the
    /// acknowledgement frame.  Fan-out failures are not surfaced: once the
    /// row is durable the send has succeeded.
    pub async fn send_message(
        &self,
        sender_id: UserId,
        send: &SendMessage,
    ) -> Result<MessageView, ServerError> {
        let content = send.content.trim();
        if content.is_empty() {
            return Err(ServerError::Validation("message content is empty".into()));
        }
        if content.len() > MAX_CONTENT_LEN {
            return Err(ServerError::Validation("message content too long".into()));
        }

        let conversation_id = send.conversation_id;
        let view = {
            let store = self.store.lock().await;
            require_participant(&store, conversation_id, sender_id)?;

            let conversation = store.get_conversation(conversation_id)?;
            let recipient_id = if conversation.is_group {
                None
            } else {
                let recipient = store
                    .get_participants(conversation_id, true)?
                    .into_iter()
                    .map(|p| p.user_id)
                    .find(|id| *id != sender_id);
                if let Some(recipient) = recipient {
                    if store.is_blocked(recipient, sender_id)? {
                        return Err(ServerError::Blocked { user_id: recipient });
                    }
                }
                recipient
            };

            if let Some(parent_id) = send.parent_id {
                let parent = store.get_message(parent_id)?;
                if parent.conversation_id != conversation_id {
                    return Err(ServerError::Validation(
                        "parent message belongs to another conversation".into(),
                    ));
                }
            }

            let message = store.insert_message(&NewMessage {
                id: MessageId::new(),
                conversation_id,
                sender_id,
                recipient_id,
                parent_id: send.parent_id,
                content: content.to_string(),
                kind: send.kind,
                priority: send.priority,
                expires_at: None,
                metadata: None,
            })?;
            store.update_last_message(conversation_id, message.id, message.sent_at)?;
            // The sender has read their own message by definition.
            store.mark_read(message.id, sender_id)?;
            build_view(&store, &message, None)?
        };

        // Sending a message implies the sender stopped typing.
        if self.typing.set_typing(conversation_id, sender_id, false).await {
            self.broadcast_typing(conversation_id, sender_id, false).await;
        }

        self.broadcaster
            .broadcast(
                conversation_id,
                &ServerFrame::Message(view.clone()),
                &[sender_id],
            )
            .await;
        Ok(view)
    }

    /// Paginated reverse-chronological history, enriched per message.
    pub async fn list_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        filter: &MessageFilter,
        limit: u32,
    ) -> Result<MessagePage, ServerError> {
        let limit = limit.clamp(1, 200);
        let store = self.store.lock().await;
        require_participant(&store, conversation_id, user_id)?;

        // Fetch one extra row to learn whether another page exists.
        let mut rows = store.list_messages(conversation_id, filter, limit + 1)?;
        let has_more = rows.len() as u32 > limit;
        rows.truncate(limit as usize);

        let next_before_seq = if has_more {
            rows.last().map(|m| m.seq)
        } else {
            None
        };
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            messages.push(build_view(&store, row, Some(user_id))?);
        }
        Ok(MessagePage {
            messages,
            has_more,
            next_before_seq,
        })
    }

    /// Edit a message's content.  Only the sender may edit; `sent_at` and
    /// the message's position are preserved.
    pub async fn edit_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessageView, ServerError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ServerError::Validation("message content is empty".into()));
        }

        let view = {
            let store = self.store.lock().await;
            let message = store.get_message(message_id)?;
            if message.sender_id != user_id {
                return Err(ServerError::AccessDenied(
                    "only the sender may edit a message".into(),
                ));
            }
            let edited = store.edit_message(message_id, content)?;
            build_view(&store, &edited, None)?
        };

        self.broadcaster
            .broadcast(
                view.conversation_id,
                &ServerFrame::MessageUpdated(view.clone()),
                &[],
            )
            .await;
        Ok(view)
    }

    /// Soft-delete a message.  The sender or a conversation admin may
    /// retract; the row stays for audit.
    pub async fn delete_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<(), ServerError> {
        let conversation_id = {
            let store = self.store.lock().await;
            let message = store.get_message(message_id)?;
            if message.sender_id != user_id {
                require_admin(&store, message.conversation_id, user_id)?;
            }
            if !store.soft_delete_message(message_id)? {
                return Err(ServerError::NotFound("message".into()));
            }
            message.conversation_id
        };

        self.broadcaster
            .broadcast(
                conversation_id,
                &ServerFrame::MessageRetracted {
                    conversation_id,
                    message_id,
                },
                &[],
            )
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    /// Add or remove an emoji reaction.  Duplicates and removals of absent
    /// reactions are silent no-ops; only visible changes are broadcast.
    pub async fn react(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: &str,
        op: ReactionOp,
    ) -> Result<(), ServerError> {
        if emoji.is_empty() {
            return Err(ServerError::Validation("emoji is empty".into()));
        }

        let changed_counts = {
            let store = self.store.lock().await;
            require_participant(&store, conversation_id, user_id)?;
            let message = store.get_message(message_id)?;
            if message.conversation_id != conversation_id {
                return Err(ServerError::Validation(
                    "message belongs to another conversation".into(),
                ));
            }
            let changed = match op {
                ReactionOp::Add => store.add_reaction(message_id, user_id, emoji)?,
                ReactionOp::Remove => store.remove_reaction(message_id, user_id, emoji)?,
            };
            if changed {
                Some(store.reaction_counts(message_id)?)
            } else {
                None
            }
        };

        if let Some(counts) = changed_counts {
            self.broadcaster
                .broadcast(
                    conversation_id,
                    &ServerFrame::Reaction {
                        conversation_id,
                        message_id,
                        user_id,
                        emoji: emoji.to_string(),
                        op,
                        counts,
                    },
                    &[],
                )
                .await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Mark messages read for a user and advance their last-read watermark.
    /// Re-marking is harmless.  Other participants see one receipt frame.
    pub async fn mark_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), ServerError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        {
            let store = self.store.lock().await;
            require_participant(&store, conversation_id, user_id)?;
            for message_id in message_ids {
                let message = store.get_message(*message_id)?;
                if message.conversation_id != conversation_id {
                    return Err(ServerError::Validation(
                        "message belongs to another conversation".into(),
                    ));
                }
            }
            for message_id in message_ids {
                store.mark_read(*message_id, user_id)?;
            }
            store.set_last_read(conversation_id, user_id, Utc::now())?;
        }

        self.broadcaster
            .broadcast(
                conversation_id,
                &ServerFrame::ReadReceipt {
                    conversation_id,
                    user_id,
                    message_ids: message_ids.to_vec(),
                },
                &[user_id],
            )
            .await;
        Ok(())
    }

    /// Participation check for callers that manage their own side effects
    /// (e.g. the WebSocket join subscription).  Fails closed.
    pub async fn ensure_participant(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<(), ServerError> {
        let store = self.store.lock().await;
        require_participant(&store, conversation_id, user_id)
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Record a typing start/stop and broadcast it when the visible state
    /// changed.
    pub async fn set_typing(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), ServerError> {
        {
            let store = self.store.lock().await;
            require_participant(&store, conversation_id, user_id)?;
        }
        if self.typing.set_typing(conversation_id, user_id, is_typing).await {
            self.broadcast_typing(conversation_id, user_id, is_typing).await;
        }
        Ok(())
    }

    async fn broadcast_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    ) {
        self.broadcaster
            .broadcast(
                conversation_id,
                &ServerFrame::Typing {
                    conversation_id,
                    user_id,
                    is_typing,
                },
                &[user_id],
            )
            .await;
    }

    pub async fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.typing.typing_users(conversation_id).await
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Explicit presence change (connection transitions, client `away`).
    pub async fn set_presence(&self, user_id: UserId, status: PresenceStatus) {
        self.presence.set_status(user_id, status).await;
        self.broadcaster
            .broadcast_presence(user_id, status, Utc::now())
            .await;
    }

    pub async fn presence_of(
        &self,
        user_id: UserId,
    ) -> (PresenceStatus, Option<chrono::DateTime<chrono::Utc>>) {
        self.presence.get(user_id).await
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    /// Register attachment metadata on a message.  Only the message's sender
    /// may attach; the bytes live in the external blob store.
    pub async fn register_attachment(
        &self,
        user_id: UserId,
        message_id: MessageId,
        file_name: &str,
        mime_type: &str,
        size_bytes: i64,
        storage_key: &str,
        thumbnail: Option<&str>,
    ) -> Result<Attachment, ServerError> {
        if file_name.is_empty() || storage_key.is_empty() {
            return Err(ServerError::Validation(
                "attachment needs a file name and storage key".into(),
            ));
        }
        let store = self.store.lock().await;
        let message = store.get_message(message_id)?;
        if message.sender_id != user_id {
            return Err(ServerError::AccessDenied(
                "only the sender may attach files".into(),
            ));
        }
        Ok(store.insert_attachment(
            message_id,
            file_name,
            mime_type,
            size_bytes,
            storage_key,
            thumbnail,
        )?)
    }

    /// Download handle for an attachment: metadata plus the opaque storage
    /// key.  Participants only.
    pub async fn attachment_handle(
        &self,
        user_id: UserId,
        attachment_id: Uuid,
    ) -> Result<Attachment, ServerError> {
        let store = self.store.lock().await;
        let attachment = store.get_attachment(attachment_id)?;
        let message = store.get_message(attachment.message_id)?;
        require_participant(&store, message.conversation_id, user_id)?;
        Ok(attachment)
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub async fn block_user(&self, blocker_id: UserId, blocked_id: UserId) -> Result<(), ServerError> {
        if blocker_id == blocked_id {
            return Err(ServerError::Validation("cannot block yourself".into()));
        }
        let store = self.store.lock().await;
        store.block_user(blocker_id, blocked_id)?;
        Ok(())
    }

    pub async fn unblock_user(
        &self,
        blocker_id: UserId,
        blocked_id: UserId,
    ) -> Result<(), ServerError> {
        let store = self.store.lock().await;
        store.unblock_user(blocker_id, blocked_id)?;
        Ok(())
    }
}

fn require_participant(
    store: &Database,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ServerError> {
    if store.is_active_participant(conversation_id, user_id)? {
        Ok(())
    } else {
        Err(ServerError::AccessDenied(
            "not an active participant of this conversation".into(),
        ))
    }
}

fn require_admin(
    store: &Database,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ServerError> {
    let participant = store
        .get_participant(conversation_id, user_id)
        .map_err(|e| match e {
            StoreError::NotFound => {
                ServerError::AccessDenied("not a participant of this conversation".into())
            }
            other => ServerError::Store(other),
        })?;
    if participant.is_active && participant.role == ParticipantRole::Admin {
        Ok(())
    } else {
        Err(ServerError::AccessDenied("admin role required".into()))
    }
}

/// Enrich a raw message row with attachments, reaction counts, and the
/// viewer's read state.
fn build_view(
    store: &Database,
    message: &Message,
    viewer: Option<UserId>,
) -> Result<MessageView, StoreError> {
    let attachments = store
        .get_attachments_for_message(message.id)?
        .into_iter()
        .map(|a| AttachmentView {
            id: a.id,
            file_name: a.file_name,
            mime_type: a.mime_type,
            size_bytes: a.size_bytes,
            thumbnail: a.thumbnail,
        })
        .collect();
    let reactions = store.reaction_counts(message.id)?;
    let read = match viewer {
        Some(viewer) => store.has_read(message.id, viewer)?,
        None => false,
    };

    Ok(MessageView {
        id: message.id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        recipient_id: message.recipient_id,
        parent_id: message.parent_id,
        content: message.content.clone(),
        kind: message.kind,
        priority: message.priority,
        is_edited: message.is_edited,
        edited_at: message.edited_at,
        sent_at: message.sent_at,
        attachments,
        reactions,
        read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, MemoryBus};
    use crate::offline::OfflineQueue;
    use crate::registry::ConnectionRegistry;
    use courier_shared::{ConnectionId, MessageKind, MessagePriority};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn service() -> (ConversationService, Arc<ConnectionRegistry>, Arc<OfflineQueue>) {
        let store = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let registry = Arc::new(ConnectionRegistry::new());
        let offline = Arc::new(OfflineQueue::new(100, Duration::from_secs(60)));
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::default());
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(Broadcaster::new(
            store.clone(),
            registry.clone(),
            offline.clone(),
            bus,
            "test-node".into(),
            notify_tx,
        ));
        let typing = Arc::new(TypingTracker::new(Duration::from_secs(5)));
        let presence = Arc::new(PresenceStore::new(Duration::from_secs(60)));
        (
            ConversationService::new(store, broadcaster, typing, presence),
            registry,
            offline,
        )
    }

    fn send_frame(conversation_id: ConversationId, content: &str) -> SendMessage {
        SendMessage {
            conversation_id,
            content: content.into(),
            recipient_id: None,
            parent_id: None,
            kind: MessageKind::Text,
            priority: MessagePriority::Normal,
        }
    }

    #[tokio::test]
    async fn non_participant_cannot_send() {
        let (service, _, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let outsider = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();

        let err = service
            .send_message(outsider, &send_frame(conversation.id, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn blocked_sender_is_rejected_with_recipient() {
        let (service, _, offline) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();

        service.block_user(b, a).await.unwrap();
        let err = service
            .send_message(a, &send_frame(conversation.id, "hello?"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Blocked { user_id } if user_id == b));
        // Nothing was queued for the recipient.
        assert!(offline.is_empty(b).await);

        // The block is directional: b can still message a.
        service
            .send_message(b, &send_frame(conversation.id, "fine"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_delivers_live_and_queues_offline() {
        let (service, registry, offline) = service();
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();
        let conversation = service
            .create_group_conversation(a, Some("team"), None, &[b, c])
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(ConnectionId::new(), b, tx).await;

        let view = service
            .send_message(a, &send_frame(conversation.id, "standup in 5"))
            .await
            .unwrap();
        assert_eq!(view.content, "standup in 5");

        match rx.recv().await.unwrap() {
            ServerFrame::Message(delivered) => assert_eq!(delivered.id, view.id),
            other => panic!("unexpected frame: {other:?}"),
        }
        // C was offline; exactly one queued event, sender gets nothing.
        assert_eq!(offline.len(c).await, 1);
        assert!(offline.is_empty(a).await);
    }

    #[tokio::test]
    async fn edit_is_sender_only_and_preserves_sent_at() {
        let (service, _, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();

        let sent = service
            .send_message(a, &send_frame(conversation.id, "helo"))
            .await
            .unwrap();

        let err = service.edit_message(b, sent.id, "gotcha").await.unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));

        let edited = service.edit_message(a, sent.id, "hello").await.unwrap();
        assert_eq!(edited.content, "hello");
        assert!(edited.is_edited);
        assert_eq!(edited.sent_at, sent.sent_at);
    }

    #[tokio::test]
    async fn delete_requires_sender_or_admin() {
        let (service, _, _) = service();
        let admin = UserId::new();
        let member = UserId::new();
        let other = UserId::new();
        let conversation = service
            .create_group_conversation(admin, None, None, &[member, other])
            .await
            .unwrap();

        let sent = service
            .send_message(member, &send_frame(conversation.id, "oops"))
            .await
            .unwrap();

        let err = service.delete_message(other, sent.id).await.unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));

        // Admin may retract another user's message.
        service.delete_message(admin, sent.id).await.unwrap();
        let page = service
            .list_messages(admin, conversation.id, &MessageFilter::default(), 50)
            .await
            .unwrap();
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn duplicate_reaction_broadcasts_once() {
        let (service, registry, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();
        let sent = service
            .send_message(a, &send_frame(conversation.id, "hi"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(ConnectionId::new(), a, tx).await;

        service
            .react(b, conversation.id, sent.id, "👍", ReactionOp::Add)
            .await
            .unwrap();
        service
            .react(b, conversation.id, sent.id, "👍", ReactionOp::Add)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ServerFrame::Reaction { counts, .. } => {
                assert_eq!(counts.len(), 1);
                assert_eq!(counts[0].count, 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        // The duplicate add produced no second frame.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sender_receipt_exists_at_send_time() {
        let (service, _, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();

        service
            .send_message(a, &send_frame(conversation.id, "from me"))
            .await
            .unwrap();

        // The sender's own history shows the message as read without any
        // explicit mark-read call.
        let page = service
            .list_messages(a, conversation.id, &MessageFilter::default(), 10)
            .await
            .unwrap();
        assert!(page.messages[0].read);

        // The recipient still sees it unread.
        let page = service
            .list_messages(b, conversation.id, &MessageFilter::default(), 10)
            .await
            .unwrap();
        assert!(!page.messages[0].read);
    }

    #[tokio::test]
    async fn mark_read_rejects_foreign_message_ids() {
        let (service, _, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();
        let d = UserId::new();
        let (private, _) = service.open_direct_conversation(a, b, None).await.unwrap();
        let (other, _) = service.open_direct_conversation(c, d, None).await.unwrap();

        let sent = service
            .send_message(a, &send_frame(private.id, "for b only"))
            .await
            .unwrap();

        // C is a participant of their own conversation but must not be able
        // to attach receipts to messages outside it.
        let err = service
            .mark_read(c, other.id, &[sent.id])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));

        // B's unread count is untouched and B can still mark it properly.
        let summaries = service
            .list_conversations(b, &ConversationFilter::default(), 50, 0)
            .await
            .unwrap();
        assert_eq!(summaries[0].unread_count, 1);
        service.mark_read(b, private.id, &[sent.id]).await.unwrap();
    }

    #[tokio::test]
    async fn direct_conversations_keep_both_participants() {
        let (service, _, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();

        // Neither self-removal nor removal of the other side is allowed.
        let err = service
            .remove_participant(a, conversation.id, a)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
        let err = service
            .remove_participant(a, conversation.id, b)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));

        let detail = service.conversation_detail(a, conversation.id).await.unwrap();
        assert_eq!(detail.participants.len(), 2);

        // Reopening the pair still resolves to the intact conversation.
        let (reopened, created) = service.open_direct_conversation(b, a, None).await.unwrap();
        assert!(!created);
        assert_eq!(reopened.id, conversation.id);
    }

    #[tokio::test]
    async fn mark_read_updates_unread_and_notifies_others() {
        let (service, registry, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();
        let sent = service
            .send_message(a, &send_frame(conversation.id, "read me"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(ConnectionId::new(), a, tx).await;

        service
            .mark_read(b, conversation.id, &[sent.id])
            .await
            .unwrap();
        // Idempotent.
        service
            .mark_read(b, conversation.id, &[sent.id])
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ServerFrame::ReadReceipt {
                user_id,
                message_ids,
                ..
            } => {
                assert_eq!(user_id, b);
                assert_eq!(message_ids, vec![sent.id]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let summaries = service
            .list_conversations(b, &ConversationFilter::default(), 50, 0)
            .await
            .unwrap();
        assert_eq!(summaries[0].unread_count, 0);
        assert!(summaries[0].last_message.as_ref().unwrap().read);
    }

    #[tokio::test]
    async fn listing_enriches_with_unread_and_peer() {
        let (service, _, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();
        service
            .send_message(a, &send_frame(conversation.id, "one"))
            .await
            .unwrap();
        service
            .send_message(a, &send_frame(conversation.id, "two"))
            .await
            .unwrap();
        service.set_presence(a, PresenceStatus::Online).await;

        let summaries = service
            .list_conversations(b, &ConversationFilter::default(), 50, 0)
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.unread_count, 2);
        assert_eq!(summary.last_message.as_ref().unwrap().content, "two");
        let peer = summary.peer.as_ref().unwrap();
        assert_eq!(peer.user_id, a);
        assert_eq!(peer.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn pagination_reports_has_more_and_cursor() {
        let (service, _, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();
        for i in 0..7 {
            service
                .send_message(a, &send_frame(conversation.id, &format!("m{i}")))
                .await
                .unwrap();
        }

        let first = service
            .list_messages(b, conversation.id, &MessageFilter::default(), 5)
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 5);
        assert!(first.has_more);

        let rest = service
            .list_messages(
                b,
                conversation.id,
                &MessageFilter {
                    before_seq: first.next_before_seq,
                    ..Default::default()
                },
                5,
            )
            .await
            .unwrap();
        assert_eq!(rest.messages.len(), 2);
        assert!(!rest.has_more);
        assert!(rest.next_before_seq.is_none());
    }

    #[tokio::test]
    async fn participant_management_is_admin_gated() {
        let (service, _, _) = service();
        let admin = UserId::new();
        let member = UserId::new();
        let newcomer = UserId::new();
        let conversation = service
            .create_group_conversation(admin, Some("ops"), None, &[member])
            .await
            .unwrap();

        let err = service
            .add_participant(member, conversation.id, newcomer, ParticipantRole::Member)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));

        service
            .add_participant(admin, conversation.id, newcomer, ParticipantRole::Member)
            .await
            .unwrap();

        // Members may leave on their own.
        service
            .remove_participant(newcomer, conversation.id, newcomer)
            .await
            .unwrap();
        // But not remove others.
        let err = service
            .remove_participant(member, conversation.id, admin)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn attachment_handle_is_participant_gated() {
        let (service, _, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let outsider = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();
        let sent = service
            .send_message(a, &send_frame(conversation.id, "see attached"))
            .await
            .unwrap();

        let err = service
            .register_attachment(b, sent.id, "x.png", "image/png", 10, "blob/x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));

        let attachment = service
            .register_attachment(a, sent.id, "x.png", "image/png", 10, "blob/x", None)
            .await
            .unwrap();

        let handle = service.attachment_handle(b, attachment.id).await.unwrap();
        assert_eq!(handle.storage_key, "blob/x");

        let err = service
            .attachment_handle(outsider, attachment.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn typing_change_is_broadcast_to_joined_connections() {
        let (service, registry, _) = service();
        let a = UserId::new();
        let b = UserId::new();
        let (conversation, _) = service.open_direct_conversation(a, b, None).await.unwrap();

        let connection_id = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(connection_id, b, tx).await;
        registry.join_conversation(connection_id, conversation.id).await;

        service.set_typing(a, conversation.id, true).await.unwrap();
        match rx.recv().await.unwrap() {
            ServerFrame::Typing {
                user_id, is_typing, ..
            } => {
                assert_eq!(user_id, a);
                assert!(is_typing);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // A refresh is not a visible change.
        service.set_typing(a, conversation.id, true).await.unwrap();
        assert!(rx.try_recv().is_err());

        // Sending a message implies stop-typing.
        service
            .send_message(a, &send_frame(conversation.id, "done"))
            .await
            .unwrap();
        let mut saw_stop = false;
        while let Ok(frame) = rx.try_recv() {
            if let ServerFrame::Typing { is_typing, .. } = frame {
                assert!(!is_typing);
                saw_stop = true;
            }
        }
        assert!(saw_stop);
    }
}
