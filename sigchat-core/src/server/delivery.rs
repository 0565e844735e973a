/*
   DeliveryService

   Processes one client frame for one connection, to completion, before the
   connection's reader loop accepts the next frame.

   identify      -> bind username in the registry, then flush that user's
                    PENDING messages in creation order
   signed_chat   -> persist as PENDING, forward if the recipient is online,
                    ack the sender with delivered / pending / saved
   read_receipt  -> advance to READ, tell the original sender

   identify holds the user's route lock from register until the queue flush
   ends. signed_chat holds the recipient's route lock from create_message
   until the forward is queued. Frames for other connections go through
   try_send: a full queue leaves the message PENDING and the sender gets
   `saved`.

        sender conn                 DeliveryService                 recipient conn
            │  signed_chat             │                                 │
            │────────────────────────► │ create_message (PENDING)        │
            │                          │───────────── signed_chat ──────►│
            │                          │ CAS PENDING -> DELIVERED        │
            │ ◄──────── delivered ─────│                                 │
*/

use super::error::DeliveryError;
use super::registry::{ConnectionHandle, ConnectionRegistry};
use crate::crypto::SignedEnvelope;
use crate::identity::{IdentityDirectory, UserId};
use crate::metrics;
use crate::protocol::{ClientFrame, MessageStatus, ServerFrame};
use crate::store::{MessageStore, NewMessage, StatusChange};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a sender waits for a recipient's queue flush to finish
const ROUTE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection state owned by that connection's reader loop
#[derive(Debug)]
pub struct Session {
    handle: ConnectionHandle,
    identity: Option<(String, UserId)>,
}

impl Session {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self { handle, identity: None }
    }

    pub fn username(&self) -> Option<&str> {
        self.identity.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn is_identified(&self) -> bool {
        self.identity.is_some()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    async fn reply(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        self.handle.send(frame).await
    }
}

#[derive(Clone)]
pub struct DeliveryService {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn IdentityDirectory>,
    store: Arc<dyn MessageStore>,
}

impl DeliveryService {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn IdentityDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self { registry, directory, store }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Parse and process one text frame. Never fails: problems are logged and
    /// reported back to the connection as `error` frames.
    pub async fn handle_text(&self, session: &mut Session, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_frame("malformed");
                warn!(conn_id = session.handle.conn_id(), error = %e, "Dropping malformed frame");
                let _ = session.reply(ServerFrame::error(format!("Invalid message: {}", e))).await;
                return;
            }
        };

        metrics::record_frame(frame.kind());
        let kind = frame.kind();
        if let Err(e) = self.handle_frame(session, frame).await {
            warn!(
                conn_id = session.handle.conn_id(),
                user = session.username().unwrap_or("-"),
                frame = kind,
                error = %e,
                "Frame rejected"
            );
            let _ = session.reply(ServerFrame::error(e.to_string())).await;
        }
    }

    pub async fn handle_frame(&self, session: &mut Session, frame: ClientFrame) -> Result<(), DeliveryError> {
        match frame {
            ClientFrame::Identify { username } => self.identify(session, username).await,
            ClientFrame::SignedChat { message } => self.signed_chat(session, message).await,
            ClientFrame::ReadReceipt { message_id, from, .. } => {
                self.read_receipt(session, &message_id, &from).await
            }
        }
    }

    async fn identify(&self, session: &mut Session, username: String) -> Result<(), DeliveryError> {
        if let Some(current) = session.username() {
            if current == username {
                return session.reply(ServerFrame::system(format!("Connected as {}", username))).await;
            }
            return Err(DeliveryError::Protocol(format!(
                "connection already identified as {}",
                current
            )));
        }

        let user_id = self
            .directory
            .resolve_user_id(&username)
            .await
            .map_err(DeliveryError::for_identify)?;

        let _route = self.registry.route_lock(&username).await;
        self.registry.register(&username, session.handle.clone()).await?;
        session.identity = Some((username.clone(), user_id.clone()));
        session.reply(ServerFrame::system(format!("Connected as {}", username))).await?;

        self.deliver_pending(session, &username, &user_id).await
    }

    /// Flush queued messages to a freshly identified recipient, oldest first
    async fn deliver_pending(&self, session: &Session, username: &str, user_id: &UserId) -> Result<(), DeliveryError> {
        let pending = self.store.list_pending(user_id).await?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(username, count = pending.len(), "Delivering queued messages");

        for message in pending {
            session
                .reply(ServerFrame::SignedChat {
                    from: message.envelope.sender_username.clone(),
                    message: message.envelope.clone(),
                    message_id: Some(message.id.clone()),
                })
                .await?;

            if self
                .store
                .update_status(&message.id, MessageStatus::Pending, MessageStatus::Delivered)
                .await?
            {
                self.notify_status(
                    &message.envelope.sender_username,
                    &message.id,
                    MessageStatus::Delivered,
                    username,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn signed_chat(&self, session: &mut Session, envelope: SignedEnvelope) -> Result<(), DeliveryError> {
        let (username, sender_id) = session
            .identity
            .clone()
            .ok_or(DeliveryError::NotIdentified)?;

        if envelope.sender_username != username {
            return Err(DeliveryError::Protocol(format!(
                "envelope sender {} does not match connection user {}",
                envelope.sender_username, username
            )));
        }

        let recipient = envelope.receiver_username.clone();
        let receiver_id = self
            .directory
            .resolve_user_id(&recipient)
            .await
            .map_err(DeliveryError::for_recipient)?;

        let route = tokio::time::timeout(ROUTE_LOCK_TIMEOUT, self.registry.route_lock(&recipient))
            .await
            .map_err(|_| DeliveryError::Backpressure(format!("{} is still receiving queued messages", recipient)))?;

        let content = envelope.plaintext_message.clone();
        let message_hash = envelope.message_hash.clone();
        let message_id = self
            .store
            .create_message(NewMessage {
                sender_id,
                receiver_id,
                envelope: envelope.clone(),
            })
            .await?;
        metrics::record_queued();
        debug!(from = %username, to = %recipient, %message_id, "Stored message");

        let ack = match self.registry.lookup(&recipient).await {
            Some(target) => {
                let forwarded = target.try_send(ServerFrame::SignedChat {
                    from: username.clone(),
                    message: envelope,
                    message_id: Some(message_id.clone()),
                });
                match forwarded {
                    Ok(()) => {
                        if let Err(e) = self
                            .store
                            .update_status(&message_id, MessageStatus::Pending, MessageStatus::Delivered)
                            .await
                        {
                            warn!(%message_id, error = %e, "Delivered but status update failed");
                        }
                        ServerFrame::Delivered {
                            to: recipient,
                            content,
                            message_id: Some(message_id),
                            message_hash: Some(message_hash),
                        }
                    }
                    Err(e) => {
                        warn!(%message_id, to = %recipient, error = %e, "Live forward failed, message stays queued");
                        ServerFrame::Saved {
                            to: recipient,
                            content,
                            message_id: Some(message_id),
                            message_hash: Some(message_hash),
                        }
                    }
                }
            }
            None => ServerFrame::Pending {
                to: recipient,
                content,
                message_id: Some(message_id),
                message_hash: Some(message_hash),
            },
        };
        drop(route);

        session.reply(ack).await
    }

    async fn read_receipt(&self, session: &mut Session, message_id: &str, from: &str) -> Result<(), DeliveryError> {
        let username = session.username().ok_or(DeliveryError::NotIdentified)?.to_string();
        if from != username {
            return Err(DeliveryError::Protocol(format!(
                "read receipt from {} sent on connection of {}",
                from, username
            )));
        }

        let message = self
            .store
            .get(message_id)
            .await?
            .ok_or_else(|| DeliveryError::Protocol(format!("unknown message {}", message_id)))?;
        if message.envelope.receiver_username != username {
            return Err(DeliveryError::Protocol(format!(
                "message {} was not sent to {}",
                message_id, username
            )));
        }

        match self.store.advance_status(message_id, MessageStatus::Read).await? {
            StatusChange::Advanced { .. } => {
                self.notify_status(
                    &message.envelope.sender_username,
                    message_id,
                    MessageStatus::Read,
                    &username,
                )
                .await;
            }
            StatusChange::Unchanged(status) => {
                debug!(%message_id, %status, "Read receipt ignored");
            }
        }
        Ok(())
    }

    /// Best effort; an offline sender simply misses the notification
    async fn notify_status(&self, sender: &str, message_id: &str, status: MessageStatus, recipient: &str) {
        if let Some(handle) = self.registry.lookup(sender).await {
            let frame = ServerFrame::StatusUpdate {
                message_id: message_id.to_string(),
                status,
                from: None,
                to: Some(recipient.to_string()),
            };
            if let Err(e) = handle.try_send(frame) {
                debug!(sender, message_id, error = %e, "Status update dropped");
            }
        }
    }

    /// Release the session's registry entry
    pub async fn disconnect(&self, session: &Session) {
        if let Some(username) = session.username() {
            self.registry.unregister(username, session.handle.conn_id()).await;
        }
    }
}
