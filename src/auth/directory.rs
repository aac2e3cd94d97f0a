//! Role and profile lookup.
//!
//! Records are JSON documents in the store:
//!
//! | Key | Document |
//! |-----|----------|
//! | `permissions:{uid}` | `{"roles": ["admin", ...]}` |
//! | `users:{uid}` | `{"role": "admin" \| ["a", "b"], "blocked": bool}` |

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::store::{ResilientStore, StoreError};

/// Dedicated permissions record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionsRecord {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Profile `role` field: a single role or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RoleField {
    One(String),
    Many(Vec<String>),
}

impl RoleField {
    pub fn into_roles(self) -> Vec<String> {
        match self {
            RoleField::One(role) => vec![role],
            RoleField::Many(roles) => roles,
        }
    }
}

/// User profile record; only the fields the gatekeeper reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub role: Option<RoleField>,
    #[serde(default, alias = "isBlocked")]
    pub blocked: bool,
}

/// Lookup of authorization data by subject id.
///
/// `Ok(None)` means the record does not exist; `Err` means the lookup itself
/// failed.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn permissions(&self, subject_id: &str) -> Result<Option<PermissionsRecord>, StoreError>;

    async fn profile(&self, subject_id: &str) -> Result<Option<UserProfile>, StoreError>;
}

/// [`ProfileDirectory`] over the resilient store.
pub struct StoreProfileDirectory {
    store: Arc<ResilientStore>,
}

impl StoreProfileDirectory {
    pub fn new(store: Arc<ResilientStore>) -> Self {
        Self { store }
    }

    pub fn permissions_key(subject_id: &str) -> String {
        format!("permissions:{subject_id}")
    }

    pub fn profile_key(subject_id: &str) -> String {
        format!("users:{subject_id}")
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Decode(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProfileDirectory for StoreProfileDirectory {
    async fn permissions(&self, subject_id: &str) -> Result<Option<PermissionsRecord>, StoreError> {
        self.read_json(&Self::permissions_key(subject_id)).await
    }

    async fn profile(&self, subject_id: &str) -> Result<Option<UserProfile>, StoreError> {
        self.read_json(&Self::profile_key(subject_id)).await
    }
}
