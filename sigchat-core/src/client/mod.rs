//! Chat client runtime
//!
//! [`ChatClient::start`] wires the pieces together:
//!
//! ```text
//!   ClientConnection ──ConnectionEvent──► pump ──► Coordinator ──► ConversationCache
//!          ▲                                          │
//!          └──────────── ClientFrame (Outbox) ────────┘
//! ```

pub mod connection;
pub mod conversation;
pub mod coordinator;
pub mod error;

pub use connection::{ClientConnection, ConnectionEvent, ConnectionOptions, ConnectionState, Outbox};
pub use conversation::{
    conversation_key, ConversationCache, ConversationMessage, ConversationRecord,
    ConversationStorage, FileStorage, MemoryStorage, MessageKind, VerificationStatus,
};
pub use coordinator::{
    AckKind, Coordinator, CoordinatorEvent, CoordinatorHandle, CoordinatorParts, ViewUpdate,
};
pub use error::{ClientError, ConversationError, TransportError};

use crate::config::ClientConfig;
use crate::crypto::{HttpKeySource, PublicKeyCache, SigningSession, Verifier};
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Forward connection events into the coordinator until either side stops
pub fn pump(mut events: mpsc::Receiver<ConnectionEvent>, handle: CoordinatorHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if handle.connection_event(event).await.is_err() {
                break;
            }
        }
        debug!("Event pump stopped");
    })
}

/// A logged-in user with a live connection and coordinator
pub struct ChatClient {
    connection: ClientConnection,
    coordinator: CoordinatorHandle,
    conversations: ConversationCache,
    username: String,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatClient {
    /// Derive keys for `(username, passphrase)` and start connecting
    pub fn start(
        config: &ClientConfig,
        username: &str,
        passphrase: &str,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Result<Self, ClientError> {
        let mut session = SigningSession::new();
        session.login(username, passphrase)?;

        let conversations = match &config.conversation_dir {
            Some(dir) => ConversationCache::new(Arc::new(FileStorage::new(dir)?)),
            None => ConversationCache::in_memory(),
        };
        let verifier = Verifier::new(
            Arc::new(HttpKeySource::new(config.api_url.clone())),
            Arc::new(PublicKeyCache::new(config.key_cache_ttl)),
        );

        let options = ConnectionOptions::new(config.server_url.clone(), username)
            .reconnect_delay(config.reconnect_delay);
        let (connection, events, connection_task) = ClientConnection::spawn(options, shutdown);

        let (coordinator, coordinator_task) = Coordinator::spawn(CoordinatorParts {
            session,
            verifier,
            conversations: conversations.clone(),
            outbox: Arc::new(connection.clone()),
        })?;
        let pump_task = pump(events, coordinator.clone());

        Ok(Self {
            connection,
            coordinator,
            conversations,
            username: username.to_string(),
            tasks: vec![connection_task, pump_task, coordinator_task],
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Users with a stored conversation
    pub fn partners(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.conversations.conversation_partners(&self.username)?)
    }

    /// Wait for the background tasks after the shutdown coordinator fired
    pub async fn join(self) {
        let ChatClient { coordinator, tasks, .. } = self;
        drop(coordinator);
        for task in tasks {
            let _ = task.await;
        }
    }
}
