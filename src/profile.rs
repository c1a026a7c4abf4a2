// src/profile.rs - Auth and profile-store collaborators
use crate::error::StoreError;
use crate::measurement::SizeClass;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One saved measurement per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub height_cm: u32,
    pub shoulder_width_cm: u32,
    pub size_class: SizeClass,
    pub updated_at: DateTime<Utc>,
}

/// Who is signed in, if anyone.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_user(&self) -> Option<UserId>;
}

/// Upserts profiles keyed by user; saving twice for a user keeps one row.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn upsert(&self, profile: UserProfile) -> Result<(), StoreError>;
    async fn get(&self, user: &UserId) -> Result<Option<UserProfile>, StoreError>;
}

/// Fixed identity, for single-user tools and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<UserId>,
}

impl StaticIdentity {
    pub fn signed_in(user: UserId) -> Self {
        Self { user: Some(user) }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

#[async_trait]
impl AuthProvider for StaticIdentity {
    async fn current_user(&self) -> Option<UserId> {
        self.user.clone()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    rows: Mutex<BTreeMap<UserId, UserProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn upsert(&self, profile: UserProfile) -> Result<(), StoreError> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.user_id.clone(), profile);
        Ok(())
    }

    async fn get(&self, user: &UserId) -> Result<Option<UserProfile>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned())
    }
}

/// Profiles kept in a single JSON file, keyed by user id.
pub struct JsonProfileStore {
    path: PathBuf,
    write_lock: AsyncMutex<()>,
}

impl JsonProfileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: AsyncMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<UserId, UserProfile>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProfileStore for JsonProfileStore {
    async fn upsert(&self, profile: UserProfile) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut rows = self.read_all().await?;
        let user = profile.user_id.clone();
        rows.insert(user.clone(), profile);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&rows)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!("Saved profile for {} to {}", user, self.path.display());
        Ok(())
    }

    async fn get(&self, user: &UserId) -> Result<Option<UserProfile>, StoreError> {
        let mut rows = self.read_all().await?;
        debug!("Loaded {} profiles from {}", rows.len(), self.path.display());
        Ok(rows.remove(user))
    }
}
