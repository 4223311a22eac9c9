// src/credentials.rs
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Map, Value};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::fs;

use crate::error::{RealtimeError, Result};

/// Key under which the session token is stored.
pub const CREDENTIAL_KEY: &str = "token";

/// Read-only source of the session credential.
///
/// Consulted each time a transport connection is established; `None` means
/// the authentication handshake is skipped for that connection.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Option<String>;
}

/// A credential fixed at construction time.
#[derive(Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.as_ref().map(|_| "<redacted>");
        f.debug_tuple("StaticCredential").field(&shown).finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Persistent key-value store backed by a JSON object on disk, the
/// client-side equivalent of the browser's local storage.
///
/// The file is re-read on every lookup so a token written by the login flow
/// is picked up at the next reconnect. The store is never written here.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
    key: String,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_key(path, CREDENTIAL_KEY)
    }

    pub fn with_key(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the credential, distinguishing "not stored" from "unreadable".
    pub async fn load(&self) -> Result<Option<String>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.store_error(e)),
        };

        let entries: Map<String, Value> =
            serde_json::from_str(&raw).map_err(|e| self.store_error(e))?;

        Ok(match entries.get(&self.key) {
            Some(Value::String(token)) if !token.trim().is_empty() => Some(token.clone()),
            Some(Value::String(_)) | Some(Value::Null) | None => None,
            Some(other) => {
                warn!(
                    "Ignoring non-string value under '{}' in {}: {}",
                    self.key,
                    self.path.display(),
                    other
                );
                None
            }
        })
    }

    fn store_error(&self, e: impl fmt::Display) -> RealtimeError {
        RealtimeError::CredentialStore {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialStore {
    async fn credential(&self) -> Option<String> {
        match self.load().await {
            Ok(token) => {
                if token.is_none() {
                    debug!("No credential stored in {}", self.path.display());
                }
                token
            }
            Err(e) => {
                warn!("{}; continuing unauthenticated", e);
                None
            }
        }
    }
}
