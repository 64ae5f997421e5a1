//! # courier-server
//!
//! Real-time messaging and presence delivery core.
//!
//! This binary provides:
//! - **WebSocket endpoint** carrying the tagged JSON frame protocol
//!   (messages, typing, read receipts, reactions, presence)
//! - **REST API** (axum) mirroring every conversation operation for
//!   non-realtime callers
//! - **SQLite persistence** of conversations, messages, receipts, and
//!   reactions via `courier-store`
//! - **Offline queues** so disconnected participants catch up on reconnect
//! - **Cross-instance bus** so sibling instances converge on one delivery
//!   and presence view

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use courier_shared::{PresenceStatus, ServerFrame};
use courier_store::Database;

use courier_server::api::{self, AppState};
use courier_server::broadcast::{Broadcaster, DeliveryNotification};
use courier_server::bus::{Bus, MemoryBus};
use courier_server::config::ServerConfig;
use courier_server::offline::OfflineQueue;
use courier_server::presence::PresenceStore;
use courier_server::registry::ConnectionRegistry;
use courier_server::service::ConversationService;
use courier_server::typing::TypingTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and open the store
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let database = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database ready");
    let store = Arc::new(Mutex::new(database));

    // -----------------------------------------------------------------------
    // 3. Build the realtime subsystems
    // -----------------------------------------------------------------------
    let registry = Arc::new(ConnectionRegistry::new());
    let presence = Arc::new(PresenceStore::new(config.presence_ttl));
    let typing = Arc::new(TypingTracker::new(config.typing_ttl));
    let offline = Arc::new(OfflineQueue::new(
        config.offline_queue_cap,
        config.offline_queue_ttl,
    ));
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::default());

    // Notification port: the email/push collaborators subscribe here.  With
    // none attached we only log the events.
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<DeliveryNotification>();
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            debug!(
                user = %notification.user_id,
                conversation = %notification.conversation_id,
                message = %notification.message_id,
                "offline delivery notification"
            );
        }
    });

    let broadcaster = Arc::new(Broadcaster::new(
        store.clone(),
        registry.clone(),
        offline.clone(),
        bus.clone(),
        config.instance_id.clone(),
        notify_tx,
    ));
    let service = Arc::new(ConversationService::new(
        store.clone(),
        broadcaster.clone(),
        typing.clone(),
        presence.clone(),
    ));

    let app_state = AppState {
        config: Arc::new(config.clone()),
        service: service.clone(),
        registry: registry.clone(),
        broadcaster: broadcaster.clone(),
        presence: presence.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Background tasks: sibling delivery and periodic sweeps
    // -----------------------------------------------------------------------
    {
        let broadcaster = broadcaster.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => broadcaster.deliver_from_bus(&event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus receiver lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    {
        let registry = registry.clone();
        let presence = presence.clone();
        let typing = typing.clone();
        let offline = offline.clone();
        let broadcaster = broadcaster.clone();
        let service = service.clone();
        let sweep_interval = config.sweep_interval;
        let connection_timeout = config.connection_timeout;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;

                // Connections silent beyond the timeout are gone; their
                // users may have just gone offline.
                for (connection_id, user_id, last) in
                    registry.sweep_stale(connection_timeout).await
                {
                    debug!(connection = %connection_id, user = %user_id, "evicted stale connection");
                    if last {
                        service.set_presence(user_id, PresenceStatus::Offline).await;
                    }
                }

                for user_id in presence.sweep().await {
                    broadcaster
                        .broadcast_presence(user_id, PresenceStatus::Offline, chrono::Utc::now())
                        .await;
                }

                for (conversation_id, user_id) in typing.sweep().await {
                    broadcaster
                        .broadcast(
                            conversation_id,
                            &ServerFrame::Typing {
                                conversation_id,
                                user_id,
                                is_typing: false,
                            },
                            &[user_id],
                        )
                        .await;
                }

                let dropped = offline.sweep().await;
                if dropped > 0 {
                    debug!(dropped, "expired offline queue entries discarded");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
