//! Local resource storage used by sync passes.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::resource::{LocalResource, ResourceKind, Scope};

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with an existing resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The resource or the operation on it is not acceptable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Backend failure.
    #[error("io: {0}")]
    Io(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence for one resource type.
///
/// Each call is atomic on its own; a sync pass holds the scope lock so no
/// other pass interleaves with it.
#[async_trait]
pub trait LocalStore<F: ResourceKind>: Send + Sync {
    /// All resources of a scope, in stable order.
    async fn query(&self, scope: &Scope) -> Result<Vec<LocalResource<F>>>;

    /// Fails with `Validation` when the resource may not be deleted.
    async fn validate_delete(&self, resource: &LocalResource<F>) -> Result<()>;

    async fn insert(&self, resource: LocalResource<F>) -> Result<LocalResource<F>>;

    /// Stores the fields, external id and description of `resource` and
    /// stamps the sync time. Metadata is left alone.
    async fn update(&self, resource: &LocalResource<F>) -> Result<LocalResource<F>>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    async fn name_exists(&self, scope: &Scope, name: &str) -> Result<bool>;

    /// Merges cloud tags into the resource metadata.
    async fn sync_metadata(&self, id: Uuid, tags: &BTreeMap<String, String>) -> Result<()>;
}

/// In-memory store with fault injection, used by tests and the diagnostic
/// binary.
pub struct MemoryStore<F> {
    rows: RwLock<Vec<LocalResource<F>>>,
    blocked: RwLock<HashMap<Uuid, String>>,
    failing: RwLock<HashSet<String>>,
}

impl<F: ResourceKind> Default for MemoryStore<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ResourceKind> MemoryStore<F> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            blocked: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_resources(resources: Vec<LocalResource<F>>) -> Self {
        Self {
            rows: RwLock::new(resources),
            ..Self::new()
        }
    }

    /// Makes `validate_delete` refuse the resource.
    pub async fn block_delete(&self, id: Uuid, reason: impl Into<String>) {
        self.blocked.write().await.insert(id, reason.into());
    }

    /// Makes every write touching a resource with this name fail with `Io`.
    pub async fn fail_writes_for(&self, name: impl Into<String>) {
        self.failing.write().await.insert(name.into());
    }

    pub async fn get(&self, id: Uuid) -> Option<LocalResource<F>> {
        self.rows.read().await.iter().find(|r| r.id == id).cloned()
    }

    pub async fn all(&self) -> Vec<LocalResource<F>> {
        self.rows.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    async fn check_writable(&self, name: &str) -> Result<()> {
        if self.failing.read().await.contains(name) {
            return Err(StoreError::Io(format!("write to {} failed", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl<F: ResourceKind> LocalStore<F> for MemoryStore<F> {
    async fn query(&self, scope: &Scope) -> Result<Vec<LocalResource<F>>> {
        let key = scope.lock_key();
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|r| r.scope_id == key)
            .cloned()
            .collect())
    }

    async fn validate_delete(&self, resource: &LocalResource<F>) -> Result<()> {
        if let Some(reason) = self.blocked.read().await.get(&resource.id) {
            return Err(StoreError::Validation(format!(
                "{} {} is in use: {}",
                F::KIND,
                resource.name,
                reason
            )));
        }
        Ok(())
    }

    async fn insert(&self, resource: LocalResource<F>) -> Result<LocalResource<F>> {
        self.check_writable(&resource.name).await?;
        let mut rows = self.rows.write().await;
        if rows
            .iter()
            .any(|r| r.scope_id == resource.scope_id && r.name == resource.name)
        {
            return Err(StoreError::Conflict(format!(
                "{} {} already exists",
                F::KIND,
                resource.name
            )));
        }
        rows.push(resource.clone());
        Ok(resource)
    }

    async fn update(&self, resource: &LocalResource<F>) -> Result<LocalResource<F>> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == resource.id)
            .ok_or_else(|| StoreError::NotFound(resource.id.to_string()))?;
        if self.failing.read().await.contains(&row.name) {
            return Err(StoreError::Io(format!("write to {} failed", row.name)));
        }
        row.fields = resource.fields.clone();
        row.external_id = resource.external_id.clone();
        row.description = resource.description.clone();
        row.synced_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut rows = self.rows.write().await;
        let pos = rows
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if self.failing.read().await.contains(&rows[pos].name) {
            return Err(StoreError::Io(format!("write to {} failed", rows[pos].name)));
        }
        rows.remove(pos);
        Ok(())
    }

    async fn name_exists(&self, scope: &Scope, name: &str) -> Result<bool> {
        let key = scope.lock_key();
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .any(|r| r.scope_id == key && r.name == name))
    }

    async fn sync_metadata(&self, id: Uuid, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.metadata
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
