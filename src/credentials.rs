// Session credentials: the bearer token and identity used to open a connection
//
// The messaging client never caches a token itself. It asks its
// `CredentialProvider` on every connection attempt, so a refreshed token is
// picked up by the next reconnect.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::config::get_config_dir;

pub trait CredentialProvider: Send + Sync {
    fn auth_token(&self) -> Option<String>;
    fn user_id(&self) -> Option<i64>;
    fn username(&self) -> Option<String>;
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Credentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>, // base64 on disk
    pub user_id: Option<i64>,
    pub username: Option<String>,
}

impl Credentials {
    pub fn new(token: &str, user_id: i64, username: &str) -> Self {
        Credentials {
            token: Some(BASE64.encode(token)),
            user_id: Some(user_id),
            username: Some(username.to_string()),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        let encoded = self.token.as_ref()?;
        match BASE64.decode(encoded) {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            Err(e) => {
                warn!("Stored token is not valid base64: {}", e);
                None
            }
        }
    }
}

/// In-memory session store, optionally backed by a JSON file
#[derive(Debug, Default)]
pub struct SessionCredentials {
    inner: RwLock<Credentials>,
    path: Option<PathBuf>,
}

impl SessionCredentials {
    pub fn new(token: &str, user_id: i64, username: &str) -> Self {
        Self {
            inner: RwLock::new(Credentials::new(token, user_id, username)),
            path: None,
        }
    }

    /// Load from `path` if it exists; later updates are written back there
    pub fn load_from(path: &Path) -> Result<Self> {
        let credentials = if path.exists() {
            let file = File::open(path)?;
            let credentials: Credentials = serde_json::from_reader(file)?;
            info!(
                "Loaded credentials for {} from {}",
                credentials.username.as_deref().unwrap_or("<unknown>"),
                path.display()
            );
            credentials
        } else {
            Credentials::default()
        };
        Ok(Self {
            inner: RwLock::new(credentials),
            path: Some(path.to_path_buf()),
        })
    }

    /// Load from `credentials.json` in the config directory
    pub fn load_default() -> Result<Self> {
        Self::load_from(&get_config_dir()?.join("credentials.json"))
    }

    pub fn is_complete(&self) -> bool {
        self.auth_token().is_some() && self.user_id().is_some()
    }

    pub fn set(&self, token: &str, user_id: i64, username: &str) -> Result<()> {
        *self.write()? = Credentials::new(token, user_id, username);
        self.persist()
    }

    /// Replace the token only, e.g. after a refresh
    pub fn set_token(&self, token: &str) -> Result<()> {
        info!("Saving auth token: {}", redact(token));
        self.write()?.token = Some(BASE64.encode(token));
        self.persist()
    }

    pub fn clear(&self) -> Result<()> {
        *self.write()? = Credentials::default();
        self.persist()
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Credentials>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("Credential store lock poisoned"))
    }

    fn snapshot(&self) -> Credentials {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let credentials = self.snapshot();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &credentials)?;
        info!(
            "Credentials saved for {}",
            credentials.username.as_deref().unwrap_or("<unknown>")
        );
        Ok(())
    }
}

impl CredentialProvider for SessionCredentials {
    fn auth_token(&self) -> Option<String> {
        self.snapshot().get_token()
    }

    fn user_id(&self) -> Option<i64> {
        self.snapshot().user_id
    }

    fn username(&self) -> Option<String> {
        self.snapshot().username
    }
}

/// Shorten a token for log output
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(10).collect();
    format!("{}...", prefix)
}
