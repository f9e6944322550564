//! User store: nickname -> salted password hash
//!
//! The session layer only sees the `UserStore` trait. `FileUserStore` keeps
//! accounts in a JSON file; `MemoryUserStore` is for tests and throwaway
//! servers.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{LanshareError, Result};

/// Outcome of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    AlreadyExists,
}

/// Account storage consulted on login and register.
///
/// Implementations must make `register` atomic: two concurrent attempts for
/// the same nickname yield exactly one `Created`.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Check credentials. Unknown nicknames are `Ok(false)`.
    async fn authenticate(&self, nickname: &str, password: &str) -> Result<bool>;

    /// Create an account
    async fn register(&self, nickname: &str, password: &str) -> Result<Registration>;
}

const SALT_LEN: usize = 16;

/// Hash a password with a fresh random salt as `salt_hex$hash_hex`
pub fn hash_password(password: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let hash = salted_hash(&salt, password);
    format!("{}${}", hex::encode(salt), hash.to_hex())
}

/// Check `password` against a value produced by `hash_password`
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = blake3::Hash::from_hex(hash_hex) else {
        return false;
    };
    // blake3::Hash equality is constant time
    salted_hash(&salt, password) == expected
}

fn salted_hash(salt: &[u8], password: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize()
}

fn check_credentials_shape(nickname: &str, password: &str) -> Result<()> {
    if nickname.trim().is_empty() || password.is_empty() {
        return Err(LanshareError::Auth("nickname and password must not be empty".to_string()));
    }
    Ok(())
}

/// Accounts persisted as a JSON object in a single file
pub struct FileUserStore {
    path: PathBuf,
    users: Mutex<HashMap<String, String>>,
}

impl FileUserStore {
    /// Load the store from `path`; a missing file is an empty store
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| LanshareError::UserStore(format!("failed to parse {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(path = %path.display(), "User store loaded");
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    async fn persist(&self, users: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(users)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for FileUserStore {
    async fn authenticate(&self, nickname: &str, password: &str) -> Result<bool> {
        let users = self.users.lock().await;
        match users.get(nickname) {
            Some(stored) => {
                let ok = verify_password(password, stored);
                tracing::info!(nickname = %nickname, success = ok, "Authentication attempt");
                Ok(ok)
            }
            None => {
                tracing::warn!(nickname = %nickname, "Authentication attempt for unknown user");
                Ok(false)
            }
        }
    }

    async fn register(&self, nickname: &str, password: &str) -> Result<Registration> {
        check_credentials_shape(nickname, password)?;

        let mut users = self.users.lock().await;
        if users.contains_key(nickname) {
            tracing::warn!(nickname = %nickname, "Registration attempt for existing user");
            return Ok(Registration::AlreadyExists);
        }

        users.insert(nickname.to_string(), hash_password(password));
        if let Err(e) = self.persist(&users).await {
            users.remove(nickname);
            return Err(LanshareError::UserStore(format!("failed to save user store: {e}")));
        }

        tracing::info!(nickname = %nickname, "User registered");
        Ok(Registration::Created)
    }
}

/// Non-persistent store
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn authenticate(&self, nickname: &str, password: &str) -> Result<bool> {
        let users = self.users.lock().await;
        Ok(users.get(nickname).is_some_and(|stored| verify_password(password, stored)))
    }

    async fn register(&self, nickname: &str, password: &str) -> Result<Registration> {
        check_credentials_shape(nickname, password)?;

        let mut users = self.users.lock().await;
        if users.contains_key(nickname) {
            return Ok(Registration::AlreadyExists);
        }
        users.insert(nickname.to_string(), hash_password(password));
        Ok(Registration::Created)
    }
}
