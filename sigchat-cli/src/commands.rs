//! Subcommand implementations

use anyhow::{bail, Context, Result};
use serde_json::json;
use sigchat_core::client::{ChatClient, ConversationMessage, MessageKind, VerificationStatus};
use sigchat_core::config::Config;
use sigchat_core::crypto::{
    derive_key_pair, verify_with_key, EcJwk, HttpKeySource, PublicKeyCache, SignedEnvelope,
    SigningSession, Verifier,
};
use sigchat_core::db;
use sigchat_core::identity::{IdentityDirectory, SqlIdentityDirectory};
use sigchat_core::server::{AppState, SigchatServer};
use sigchat_core::shutdown::{install_signal_handlers, ShutdownCoordinator};
use sigchat_core::store::{MessageStore, SqlMessageStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub async fn serve(config: Config) -> Result<()> {
    sigchat_core::metrics::init_metrics();

    let pool = match &config.store.database_path {
        Some(path) => db::open_pool(path)
            .with_context(|| format!("opening database {}", path.display()))?,
        None => db::memory_pool()?,
    };
    let directory: Arc<dyn IdentityDirectory> = Arc::new(SqlIdentityDirectory::new(pool.clone()));
    let store: Arc<dyn MessageStore> = Arc::new(SqlMessageStore::new(pool));

    let shutdown = Arc::new(ShutdownCoordinator::new(config.server.shutdown_timeout));
    install_signal_handlers(shutdown.clone());

    let state = AppState::new(directory, store, shutdown.clone(), &config.server);
    let server = SigchatServer::bind(&config.server.bind_address.to_string(), state).await?;
    info!(addr = %server.local_addr()?, "sigchat server ready");

    server.run().await?;
    if !shutdown.drain().await {
        warn!(remaining = shutdown.active_tasks(), "Connections still open at exit");
    }
    Ok(())
}

pub async fn register(database: &Path, username: &str, passphrase: &str) -> Result<()> {
    let key_pair = derive_key_pair(username, passphrase)?;
    let pool = db::open_pool(database)
        .with_context(|| format!("opening database {}", database.display()))?;
    let directory = SqlIdentityDirectory::new(pool);

    let user_id = directory.register_user(username, &key_pair.public_key).await?;
    println!("Registered {} ({})", username, user_id);
    println!("Key fingerprint: {}", key_pair.public_key.fingerprint()?);
    Ok(())
}

pub fn derive(username: &str, passphrase: &str, show_private: bool) -> Result<()> {
    let key_pair = derive_key_pair(username, passphrase)?;
    let hex = key_pair.hex()?;

    let mut out = json!({
        "username": username,
        "publicKey": key_pair.public_key,
        "fingerprint": key_pair.public_key.fingerprint()?,
        "publicKeyHex": hex.public_key,
        "publicKeyUncompressedHex": hex.public_key_uncompressed,
    });
    if show_private {
        out["privateKey"] = json!(key_pair.private_key);
        out["privateKeyHex"] = json!(hex.private_key);
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub fn sign(username: &str, passphrase: &str, to: &str, message: &str) -> Result<()> {
    let mut session = SigningSession::new();
    session.login(username, passphrase)?;
    let envelope = session.sign(to, message)?;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

pub async fn verify(envelope: Option<&Path>, public_key: Option<&Path>, api_url: &str) -> Result<()> {
    let text = match envelope {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    let envelope: SignedEnvelope =
        serde_json::from_str(text.trim()).context("input is not a signed envelope")?;

    let result = match public_key {
        Some(path) => {
            let jwk = EcJwk::from_json(&std::fs::read_to_string(path)?)?;
            verify_with_key(&envelope, &jwk.public_only())
        }
        None => {
            let verifier = Verifier::new(
                Arc::new(HttpKeySource::new(api_url)),
                Arc::new(PublicKeyCache::default()),
            );
            verifier.verify_detailed(&envelope, true).await
        }
    };

    match result {
        Ok(()) => {
            println!(
                "verified: {} -> {} at {}",
                envelope.sender_username, envelope.receiver_username, envelope.timestamp
            );
            Ok(())
        }
        Err(e) => bail!("verification failed: {}", e),
    }
}

fn render(message: &ConversationMessage) -> String {
    let short_id = message.id.get(..12).unwrap_or(&message.id);
    match message.kind {
        MessageKind::Sent => {
            let status = message.status.map(|s| s.to_string()).unwrap_or_else(|| "SENDING".to_string());
            format!("[{}] you: {} ({})", short_id, message.content, status)
        }
        MessageKind::Received => {
            let mark = match message.verification_status {
                VerificationStatus::Verified => "verified",
                VerificationStatus::Failed => "SIGNATURE FAILED",
                VerificationStatus::Verifying => "verifying",
                VerificationStatus::Pending | VerificationStatus::NotApplicable => "pending",
            };
            let from = message.from.as_deref().unwrap_or("?");
            format!("[{}] {}: {} ({})", short_id, from, message.content, mark)
        }
        MessageKind::System => format!("* {}", message.content),
        MessageKind::Error => format!("! {}", message.content),
    }
}

pub async fn chat(config: Config, username: &str, passphrase: &str, peer: &str) -> Result<()> {
    let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(2)));
    install_signal_handlers(shutdown.clone());

    let client = ChatClient::start(&config.client, username, passphrase, shutdown.clone())?;
    let handle = client.coordinator().clone();
    let mut updates = handle.subscribe();

    handle.reload(peer).await?;
    for message in handle.messages(peer).await? {
        println!("{}", render(&message));
    }
    println!("* Type a message, or /read, /reload, /verify <id>, /partners, /quit");

    let watched = peer.to_string();
    let printer = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if update.peer.as_deref().map_or(true, |p| p == watched) {
                        println!("{}", render(&update.message));
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Display fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.wait_for_shutdown() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        let outcome = match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => Ok(()),
            ("/quit", _) => break,
            ("/read", _) => handle.mark_read(peer).await.map(|n| println!("* {} marked read", n)),
            ("/reload", _) => handle.reload(peer).await.map(|n| println!("* re-verifying {} messages", n)),
            ("/verify", prefix) => {
                let prefix = prefix.trim();
                match handle
                    .messages(peer)
                    .await?
                    .into_iter()
                    .find(|m| !prefix.is_empty() && m.id.starts_with(prefix))
                {
                    Some(message) => handle.reverify(&message.id).await,
                    None => {
                        println!("! no message with id {}", prefix);
                        Ok(())
                    }
                }
            }
            ("/partners", _) => client.partners().map(|p| println!("* {}", p.join(", "))),
            _ => handle.send_message(peer, line).await.map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "Command failed");
        }
    }

    if !shutdown.is_shutting_down().await {
        shutdown.shutdown().await;
    }
    printer.abort();
    client.join().await;
    Ok(())
}
