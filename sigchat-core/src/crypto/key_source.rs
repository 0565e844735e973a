//! Where verifiers get public keys from

use super::error::KeyResolutionError;
use super::jwk::EcJwk;
use crate::identity::{IdentityDirectory, IdentityError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Async lookup of a user's active public key
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch_public_key(&self, username: &str) -> Result<EcJwk, KeyResolutionError>;
}

#[async_trait]
impl<T: KeySource + ?Sized> KeySource for Arc<T> {
    async fn fetch_public_key(&self, username: &str) -> Result<EcJwk, KeyResolutionError> {
        (**self).fetch_public_key(username).await
    }
}

/// `{ username, publicKey }` as served by `GET /api/users/{username}/publickey`.
///
/// `publicKey` arrives either as a JSON object or as a string holding JSON.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyResponse {
    #[allow(dead_code)]
    username: Option<String>,
    public_key: Value,
}

fn parse_public_key(value: Value) -> Result<EcJwk, KeyResolutionError> {
    let jwk = match value {
        Value::String(text) => EcJwk::from_json(&text)
            .map_err(|e| KeyResolutionError::InvalidResponse(e.to_string()))?,
        other => serde_json::from_value::<EcJwk>(other)
            .map_err(|e| KeyResolutionError::InvalidResponse(e.to_string()))?,
    };
    jwk.to_public_key()
        .map_err(|e| KeyResolutionError::InvalidResponse(e.to_string()))?;
    Ok(jwk.public_only())
}

/// Fetches keys from the server's HTTP API
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    client: reqwest::Client,
    api_url: String,
}

impl HttpKeySource {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_timeout(api_url, Duration::from_secs(10))
    }

    pub fn with_timeout(api_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn key_url(&self, username: &str) -> String {
        format!("{}/api/users/{}/publickey", self.api_url, username)
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch_public_key(&self, username: &str) -> Result<EcJwk, KeyResolutionError> {
        let url = self.key_url(username);
        debug!(%url, "Fetching public key");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KeyResolutionError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(KeyResolutionError::NotFound(username.to_string()));
        }
        if !response.status().is_success() {
            return Err(KeyResolutionError::Network(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let body: PublicKeyResponse = response
            .json()
            .await
            .map_err(|e| KeyResolutionError::InvalidResponse(e.to_string()))?;
        parse_public_key(body.public_key)
    }
}

/// Reads keys straight from an identity directory (server-side and tests)
#[derive(Clone)]
pub struct DirectoryKeySource {
    directory: Arc<dyn IdentityDirectory>,
}

impl DirectoryKeySource {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl KeySource for DirectoryKeySource {
    async fn fetch_public_key(&self, username: &str) -> Result<EcJwk, KeyResolutionError> {
        match self.directory.resolve_public_key(username).await {
            Ok(jwk) => Ok(jwk),
            Err(IdentityError::UnknownUser(_)) | Err(IdentityError::NoActiveKey(_)) => {
                Err(KeyResolutionError::NotFound(username.to_string()))
            }
            Err(e) => Err(KeyResolutionError::Network(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key_pair;
    use crate::identity::MemoryDirectory;

    #[test]
    fn test_parse_key_as_object_and_string() {
        let kp = derive_key_pair("alice", "pw").unwrap();
        let as_object = serde_json::to_value(&kp.public_key).unwrap();
        let as_string = Value::String(kp.public_key.to_json());

        assert_eq!(parse_public_key(as_object).unwrap(), kp.public_key);
        assert_eq!(parse_public_key(as_string).unwrap(), kp.public_key);
    }

    #[test]
    fn test_parse_strips_private_scalar() {
        let kp = derive_key_pair("alice", "pw").unwrap();
        let parsed = parse_public_key(serde_json::to_value(&kp.private_key).unwrap()).unwrap();
        assert!(!parsed.is_private());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_public_key(Value::String("not json".to_string())),
            Err(KeyResolutionError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_key_url() {
        let source = HttpKeySource::new("http://localhost:3001/");
        assert_eq!(
            source.key_url("bob"),
            "http://localhost:3001/api/users/bob/publickey"
        );
    }

    #[tokio::test]
    async fn test_directory_source() {
        let kp = derive_key_pair("alice", "pw").unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        directory.register_user("alice", &kp.public_key).await.unwrap();

        let source = DirectoryKeySource::new(directory);
        assert_eq!(source.fetch_public_key("alice").await.unwrap(), kp.public_key);
        assert_eq!(
            source.fetch_public_key("nobody").await,
            Err(KeyResolutionError::NotFound("nobody".to_string()))
        );
    }
}
