//! Verification state coordinator
//!
//! A single task owns every conversation and applies [`CoordinatorEvent`]s one
//! at a time. Verification runs in spawned tasks, but those tasks never touch
//! conversation state: they report back through the same event channel as
//! `VerificationProgress`.
//!
//! ```text
//!   inbound signed_chat ──► push (pending) ──► invalidate sender key
//!                                                   │
//!                          spawn verify(force_refresh) ─► Verifying ─► Verified | Failed
//! ```

use super::connection::{ConnectionEvent, Outbox};
use super::conversation::{
    ConversationCache, ConversationMessage, MessageKind, VerificationStatus,
};
use super::error::ClientError;
use crate::crypto::{SignedEnvelope, SigningSession, Verifier};
use crate::protocol::{ClientFrame, MessageStatus, ServerFrame};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;
const UPDATE_BUFFER: usize = 256;

/// Which acknowledgment the server sent for one of our messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Delivered,
    Pending,
    Saved,
}

impl AckKind {
    fn status(self) -> MessageStatus {
        match self {
            AckKind::Delivered => MessageStatus::Delivered,
            AckKind::Pending | AckKind::Saved => MessageStatus::Pending,
        }
    }
}

#[derive(Debug)]
pub enum CoordinatorEvent {
    Inbound {
        envelope: SignedEnvelope,
        server_id: Option<String>,
    },
    Outbound {
        receiver: String,
        plaintext: String,
        reply: oneshot::Sender<Result<String, ClientError>>,
    },
    Ack {
        kind: AckKind,
        to: String,
        content: String,
        message_hash: Option<String>,
        server_id: Option<String>,
    },
    StatusUpdate {
        server_id: String,
        status: MessageStatus,
    },
    Reverify {
        local_id: String,
    },
    Reload {
        peer: String,
        reply: oneshot::Sender<usize>,
    },
    VerificationProgress {
        peer: String,
        local_id: String,
        generation: u64,
        status: VerificationStatus,
    },
    Connected,
    SystemNotice {
        kind: MessageKind,
        text: String,
    },
    MarkRead {
        peer: String,
        reply: oneshot::Sender<Result<usize, ClientError>>,
    },
    Snapshot {
        peer: String,
        reply: oneshot::Sender<Vec<ConversationMessage>>,
    },
}

impl CoordinatorEvent {
    /// Translate a server frame; every frame type maps to some event
    pub fn from_frame(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::SignedChat { message, message_id, .. } => CoordinatorEvent::Inbound {
                envelope: message,
                server_id: message_id,
            },
            ServerFrame::Delivered { to, content, message_id, message_hash } => Self::ack(AckKind::Delivered, to, content, message_id, message_hash),
            ServerFrame::Pending { to, content, message_id, message_hash } => Self::ack(AckKind::Pending, to, content, message_id, message_hash),
            ServerFrame::Saved { to, content, message_id, message_hash } => Self::ack(AckKind::Saved, to, content, message_id, message_hash),
            ServerFrame::StatusUpdate { message_id, status, .. } => CoordinatorEvent::StatusUpdate {
                server_id: message_id,
                status,
            },
            ServerFrame::System { message } => CoordinatorEvent::SystemNotice {
                kind: MessageKind::System,
                text: message,
            },
            ServerFrame::Error { message } => CoordinatorEvent::SystemNotice {
                kind: MessageKind::Error,
                text: message,
            },
        }
    }

    fn ack(
        kind: AckKind,
        to: String,
        content: String,
        server_id: Option<String>,
        message_hash: Option<String>,
    ) -> Self {
        CoordinatorEvent::Ack { kind, to, content, message_hash, server_id }
    }
}

/// A conversation entry changed. `peer` is `None` for notices outside any conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewUpdate {
    pub peer: Option<String>,
    pub message: ConversationMessage,
}

pub struct CoordinatorParts {
    pub session: SigningSession,
    pub verifier: Verifier,
    pub conversations: ConversationCache,
    pub outbox: Arc<dyn Outbox>,
}

/// Cheap handle for feeding events to the coordinator task
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<CoordinatorEvent>,
    updates: broadcast::Sender<ViewUpdate>,
}

impl CoordinatorHandle {
    pub async fn dispatch(&self, event: CoordinatorEvent) -> Result<(), ClientError> {
        self.events.send(event).await.map_err(|_| ClientError::Stopped)
    }

    pub async fn connection_event(&self, event: ConnectionEvent) -> Result<(), ClientError> {
        match event {
            ConnectionEvent::Connected => self.dispatch(CoordinatorEvent::Connected).await,
            ConnectionEvent::Frame(frame) => self.dispatch(CoordinatorEvent::from_frame(frame)).await,
            ConnectionEvent::Disconnected { reason } => {
                debug!(%reason, "Transport down; waiting for reconnect");
                Ok(())
            }
        }
    }

    /// Sign and send; returns the local message id
    pub async fn send_message(&self, receiver: &str, plaintext: &str) -> Result<String, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(CoordinatorEvent::Outbound {
            receiver: receiver.to_string(),
            plaintext: plaintext.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub async fn reverify(&self, local_id: &str) -> Result<(), ClientError> {
        self.dispatch(CoordinatorEvent::Reverify { local_id: local_id.to_string() }).await
    }

    /// Reload a conversation from storage; returns how many messages were re-queued for verification
    pub async fn reload(&self, peer: &str) -> Result<usize, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(CoordinatorEvent::Reload { peer: peer.to_string(), reply }).await?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Send read receipts for everything received from `peer`
    pub async fn mark_read(&self, peer: &str) -> Result<usize, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(CoordinatorEvent::MarkRead { peer: peer.to_string(), reply }).await?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub async fn messages(&self, peer: &str) -> Result<Vec<ConversationMessage>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(CoordinatorEvent::Snapshot { peer: peer.to_string(), reply }).await?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewUpdate> {
        self.updates.subscribe()
    }
}

pub struct Coordinator {
    me: String,
    session: SigningSession,
    verifier: Verifier,
    cache: ConversationCache,
    outbox: Arc<dyn Outbox>,
    conversations: HashMap<String, Vec<ConversationMessage>>,
    notices: Vec<ConversationMessage>,
    last_peer: Option<String>,
    generations: HashMap<String, u64>,
    events: mpsc::WeakSender<CoordinatorEvent>,
    updates: broadcast::Sender<ViewUpdate>,
}

impl Coordinator {
    /// Start the coordinator task. The session must be logged in.
    ///
    /// The task ends once every [`CoordinatorHandle`] is dropped.
    pub fn spawn(parts: CoordinatorParts) -> Result<(CoordinatorHandle, JoinHandle<()>), ClientError> {
        let me = parts
            .session
            .username()
            .ok_or_else(|| {
                crate::crypto::CryptoError::KeyUnavailable("session is not logged in".to_string())
            })?
            .to_string();

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let coordinator = Coordinator {
            me,
            session: parts.session,
            verifier: parts.verifier,
            cache: parts.conversations,
            outbox: parts.outbox,
            conversations: HashMap::new(),
            notices: Vec::new(),
            last_peer: None,
            generations: HashMap::new(),
            events: event_tx.downgrade(),
            updates: updates.clone(),
        };
        let task = tokio::spawn(coordinator.run(event_rx));

        Ok((CoordinatorHandle { events: event_tx, updates }, task))
    }

    async fn run(mut self, mut events: mpsc::Receiver<CoordinatorEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!(user = %self.me, "Coordinator stopped");
    }

    async fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Inbound { envelope, server_id } => self.on_inbound(envelope, server_id),
            CoordinatorEvent::Outbound { receiver, plaintext, reply } => {
                let result = self.on_outbound(&receiver, &plaintext).await;
                let _ = reply.send(result);
            }
            CoordinatorEvent::Ack { kind, to, content, message_hash, server_id } => {
                self.on_ack(kind, &to, &content, message_hash.as_deref(), server_id)
            }
            CoordinatorEvent::StatusUpdate { server_id, status } => self.on_status_update(&server_id, status),
            CoordinatorEvent::Reverify { local_id } => self.on_reverify(&local_id),
            CoordinatorEvent::Reload { peer, reply } => {
                let requeued = self.reload(&peer);
                let _ = reply.send(requeued);
            }
            CoordinatorEvent::VerificationProgress { peer, local_id, generation, status } => {
                self.on_progress(&peer, &local_id, generation, status)
            }
            CoordinatorEvent::Connected => {
                self.verifier.cache().invalidate_all();
                info!(user = %self.me, "Connected; public key cache cleared");
            }
            CoordinatorEvent::SystemNotice { kind, text } => self.on_notice(kind, text),
            CoordinatorEvent::MarkRead { peer, reply } => {
                let result = self.on_mark_read(&peer).await;
                let _ = reply.send(result);
            }
            CoordinatorEvent::Snapshot { peer, reply } => {
                let messages = self.conversation(&peer).clone();
                let _ = reply.send(messages);
            }
        }
    }

    fn on_inbound(&mut self, envelope: SignedEnvelope, server_id: Option<String>) {
        if envelope.receiver_username != self.me {
            warn!(to = %envelope.receiver_username, "Dropping message addressed to another user");
            return;
        }
        let peer = envelope.sender_username.clone();
        if let Some(id) = &server_id {
            if self.conversation(&peer).iter().any(|m| m.server_id.as_ref() == Some(id)) {
                debug!(server_id = %id, "Ignoring duplicate delivery");
                return;
            }
        }

        self.verifier.cache().invalidate(&peer);
        let message = ConversationMessage::received(envelope.clone(), server_id);
        let local_id = message.id.clone();
        self.conversation(&peer).push(message);
        self.changed(&peer, &local_id);
        self.spawn_verification(&peer, &local_id, envelope);
    }

    async fn on_outbound(&mut self, receiver: &str, plaintext: &str) -> Result<String, ClientError> {
        let envelope = self.session.sign(receiver, plaintext)?;
        let message = ConversationMessage::sent(envelope.clone());
        let local_id = message.id.clone();
        self.last_peer = Some(receiver.to_string());
        self.conversation(receiver).push(message);
        self.changed(receiver, &local_id);

        if let Err(e) = self.outbox.send_frame(ClientFrame::SignedChat { message: envelope }).await {
            warn!(to = receiver, error = %e, "Message not sent");
            let notice = ConversationMessage::notice(MessageKind::Error, format!("Message not sent: {}", e));
            let notice_id = notice.id.clone();
            self.conversation(receiver).push(notice);
            self.changed(receiver, &notice_id);
            return Err(e.into());
        }
        Ok(local_id)
    }

    fn on_ack(
        &mut self,
        kind: AckKind,
        to: &str,
        content: &str,
        message_hash: Option<&str>,
        server_id: Option<String>,
    ) {
        let conversation = self.conversation(to);
        let found = conversation.iter_mut().rev().find(|m| {
            m.kind == MessageKind::Sent
                && match message_hash {
                    Some(hash) => m
                        .signed_message
                        .as_ref()
                        .is_some_and(|env| env.message_hash == hash),
                    None => m.server_id.is_none() && m.content == content,
                }
        });
        let Some(message) = found else {
            debug!(to, ?kind, "Acknowledgment for unknown message");
            return;
        };
        if message.server_id.is_none() {
            message.server_id = server_id;
        }
        message.advance_status(kind.status());
        let local_id = message.id.clone();
        self.changed(to, &local_id);
    }

    fn on_status_update(&mut self, server_id: &str, status: MessageStatus) {
        let mut hit = None;
        for (peer, messages) in self.conversations.iter_mut() {
            if let Some(message) = messages
                .iter_mut()
                .find(|m| m.server_id.as_deref() == Some(server_id))
            {
                if message.advance_status(status) {
                    hit = Some((peer.clone(), message.id.clone()));
                }
                break;
            }
        }
        match hit {
            Some((peer, local_id)) => self.changed(&peer, &local_id),
            None => debug!(server_id, %status, "Status update ignored"),
        }
    }

    fn on_reverify(&mut self, local_id: &str) {
        let target = self.conversations.iter_mut().find_map(|(peer, messages)| {
            messages
                .iter_mut()
                .find(|m| m.id == local_id && m.is_verifiable())
                .map(|m| (peer.clone(), m))
        });
        let Some((peer, message)) = target else {
            debug!(local_id, "Nothing to re-verify");
            return;
        };
        let Some(envelope) = message.signed_message.clone() else {
            return;
        };
        message.verification_status = VerificationStatus::Pending;
        self.verifier.cache().invalidate(&envelope.sender_username);
        self.changed(&peer, local_id);
        self.spawn_verification(&peer, local_id, envelope);
    }

    /// Replace the in-memory conversation with the stored one and queue
    /// every received signed message for verification
    fn reload(&mut self, peer: &str) -> usize {
        let messages = match self.cache.load_messages(&self.me, peer) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(peer, error = %e, "Failed to load conversation");
                Vec::new()
            }
        };
        let pending: Vec<(String, SignedEnvelope)> = messages
            .iter()
            .filter(|m| m.is_verifiable())
            .filter_map(|m| m.signed_message.clone().map(|env| (m.id.clone(), env)))
            .collect();
        self.conversations.insert(peer.to_string(), messages);

        let senders: HashSet<&str> = pending.iter().map(|(_, env)| env.sender_username.as_str()).collect();
        for sender in senders {
            self.verifier.cache().invalidate(sender);
        }
        for (local_id, envelope) in &pending {
            self.spawn_verification(peer, local_id, envelope.clone());
        }
        debug!(peer, requeued = pending.len(), "Conversation reloaded");
        pending.len()
    }

    fn on_progress(&mut self, peer: &str, local_id: &str, generation: u64, status: VerificationStatus) {
        if self.generations.get(local_id) != Some(&generation) {
            debug!(local_id, "Ignoring superseded verification result");
            return;
        }
        if matches!(status, VerificationStatus::Verified | VerificationStatus::Failed) {
            self.generations.remove(local_id);
        }
        let Some(message) = self
            .conversations
            .get_mut(peer)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == local_id))
        else {
            return;
        };
        message.verification_status = status;
        self.changed(peer, local_id);
    }

    fn on_notice(&mut self, kind: MessageKind, text: String) {
        let notice = ConversationMessage::notice(kind, text);
        // Errors belong to the conversation the user is typing into
        match (kind, self.last_peer.clone()) {
            (MessageKind::Error, Some(peer)) => {
                let id = notice.id.clone();
                self.conversation(&peer).push(notice);
                self.changed(&peer, &id);
            }
            _ => {
                let _ = self.updates.send(ViewUpdate { peer: None, message: notice.clone() });
                self.notices.push(notice);
            }
        }
    }

    async fn on_mark_read(&mut self, peer: &str) -> Result<usize, ClientError> {
        let unread: Vec<(String, String)> = self
            .conversation(peer)
            .iter()
            .filter(|m| m.kind == MessageKind::Received && m.status != Some(MessageStatus::Read))
            .filter_map(|m| m.server_id.clone().map(|sid| (m.id.clone(), sid)))
            .collect();

        let mut marked = 0;
        for (local_id, server_id) in unread {
            self.outbox
                .send_frame(ClientFrame::ReadReceipt {
                    message_id: server_id,
                    from: self.me.clone(),
                    to: peer.to_string(),
                })
                .await?;
            if let Some(message) = self.conversation(peer).iter_mut().find(|m| m.id == local_id) {
                message.advance_status(MessageStatus::Read);
            }
            self.changed(peer, &local_id);
            marked += 1;
        }
        Ok(marked)
    }

    /// In-memory conversation with `peer`, loaded from storage on first use
    fn conversation(&mut self, peer: &str) -> &mut Vec<ConversationMessage> {
        if !self.conversations.contains_key(peer) {
            self.reload(peer);
        }
        self.conversations.entry(peer.to_string()).or_default()
    }

    fn spawn_verification(&mut self, peer: &str, local_id: &str, envelope: SignedEnvelope) {
        let Some(events) = self.events.upgrade() else {
            return;
        };
        let generation = {
            let slot = self.generations.entry(local_id.to_string()).or_insert(0);
            *slot += 1;
            *slot
        };
        let verifier = self.verifier.clone();
        let peer = peer.to_string();
        let local_id = local_id.to_string();

        tokio::spawn(async move {
            let progress = |status| CoordinatorEvent::VerificationProgress {
                peer: peer.clone(),
                local_id: local_id.clone(),
                generation,
                status,
            };
            let _ = events.send(progress(VerificationStatus::Verifying)).await;
            let status = if verifier.verify(&envelope, true).await {
                VerificationStatus::Verified
            } else {
                VerificationStatus::Failed
            };
            let _ = events.send(progress(status)).await;
        });
    }

    /// Persist the conversation and tell subscribers about one changed entry
    fn changed(&mut self, peer: &str, local_id: &str) {
        let Some(messages) = self.conversations.get(peer) else {
            return;
        };
        if let Err(e) = self.cache.save_messages(&self.me, peer, messages) {
            warn!(peer, error = %e, "Failed to save conversation");
        }
        if let Some(message) = messages.iter().find(|m| m.id == local_id) {
            let _ = self.updates.send(ViewUpdate {
                peer: Some(peer.to_string()),
                message: message.clone(),
            });
        }
    }
}
