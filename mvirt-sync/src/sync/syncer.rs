//! Reconciliation pass for one resource type in one scope.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lock::{LockError, ScopeGuard, ScopeLocks};
use super::naming::generate_name;
use super::result::{ItemError, SyncReport, SyncResult};
use crate::audit::{AuditLogger, SyncAction};
use crate::compare::{CompareError, SetDiff, compare_sets_by};
use crate::config::{KeyStrategy, SyncConfig};
use crate::provider::{ProviderError, ResourceFetcher};
use crate::resource::{LocalResource, RemoteResource, ResourceKind, Scope, field_diff, signature};
use crate::secrules::RuleError;
use crate::store::{LocalStore, StoreError};

/// Errors that abort a whole pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync of {0} cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to fetch remote state: {0}")]
    Fetch(#[source] ProviderError),

    #[error("failed to query local state: {0}")]
    Query(#[source] StoreError),

    #[error(transparent)]
    Compare(#[from] CompareError),

    #[error(transparent)]
    Rules(#[from] RuleError),

    #[error("failed to apply rule changes: {0}")]
    Apply(#[source] ProviderError),
}

/// Per-request context of a pass.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub cancel: CancellationToken,
    /// Recorded in audit events.
    pub actor: String,
}

impl SyncContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            actor: actor.into(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self, scope: &Scope) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled(scope.to_string()));
        }
        Ok(())
    }
}

/// Runs reconciliation passes. Cheap to share behind an `Arc`.
pub struct Syncer {
    locks: Arc<ScopeLocks>,
    audit: Arc<AuditLogger>,
    config: SyncConfig,
}

impl Syncer {
    pub fn new(config: SyncConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            locks: Arc::new(ScopeLocks::new()),
            audit,
            config,
        }
    }

    /// Share locks with other syncers working on the same scopes.
    pub fn with_locks(mut self, locks: Arc<ScopeLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &Arc<ScopeLocks> {
        &self.locks
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Takes the scope lock unless the pass is cancelled first.
    pub(crate) async fn acquire(
        &self,
        ctx: &SyncContext,
        scope: &Scope,
    ) -> Result<ScopeGuard, SyncError> {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                self.locks.forget_idle(scope);
                Err(SyncError::Cancelled(scope.to_string()))
            }
            guard = self.locks.lock_timeout(scope, self.config.lock_timeout()) => Ok(guard?),
        }
    }

    /// Converges the local resources of `scope` to the cloud state.
    ///
    /// Deletes run first, then updates, then inserts. Per-item failures are
    /// recorded in the result and never stop the pass.
    pub async fn sync<F, S, R>(
        &self,
        ctx: &SyncContext,
        scope: &Scope,
        store: &S,
        fetcher: &R,
    ) -> Result<SyncReport<F>, SyncError>
    where
        F: ResourceKind,
        S: LocalStore<F> + ?Sized,
        R: ResourceFetcher<F> + ?Sized,
    {
        info!(scope = %scope, kind = F::KIND, "Starting sync");
        let report = self.run(ctx, scope, store, fetcher).await;
        match &report {
            Ok(report) => info!(scope = %scope, kind = F::KIND, result = %report.result, "Sync finished"),
            Err(e) => error!(scope = %scope, kind = F::KIND, error = %e, "Sync aborted"),
        }
        report
    }

    async fn run<F, S, R>(
        &self,
        ctx: &SyncContext,
        scope: &Scope,
        store: &S,
        fetcher: &R,
    ) -> Result<SyncReport<F>, SyncError>
    where
        F: ResourceKind,
        S: LocalStore<F> + ?Sized,
        R: ResourceFetcher<F> + ?Sized,
    {
        let _guard = self.acquire(ctx, scope).await?;

        let remote = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(SyncError::Cancelled(scope.to_string())),
            remote = fetcher.fetch_remote_resources(scope) => remote.map_err(SyncError::Fetch)?,
        };
        let local = store.query(scope).await.map_err(SyncError::Query)?;
        debug!(scope = %scope, local = local.len(), remote = remote.len(), "Fetched state");

        let diff = self.compare(local, remote)?;

        // Last point a pass may stop; the apply loop always runs to the end
        ctx.check_cancelled(scope)?;

        let mut result = SyncResult::default();
        let mut synced = Vec::new();

        for resource in &diff.removed {
            match self.remove(store, resource).await {
                Ok(()) => {
                    result.deleted += 1;
                    let snapshot = serde_json::to_value(&resource.fields).unwrap_or_default();
                    self.audit
                        .log_sync_event(scope, &ctx.actor, resource, SyncAction::Delete, snapshot);
                }
                Err(e) => {
                    warn!(scope = %scope, resource = %resource.name, error = %e, "Failed to delete");
                    result.delete_errors.push(ItemError::new(&resource.name, &e));
                }
            }
        }

        for (resource, remote) in diff.common() {
            match self.update(ctx, scope, store, resource, remote).await {
                Ok(Some(updated)) => {
                    result.updated += 1;
                    synced.push(updated);
                }
                Ok(None) => {
                    result.unchanged += 1;
                    synced.push(resource.clone());
                }
                Err(e) => {
                    warn!(scope = %scope, resource = %resource.name, error = %e, "Failed to update");
                    result.update_errors.push(ItemError::new(&resource.name, &e));
                }
            }
        }

        for remote in &diff.added {
            match self.insert(ctx, scope, store, remote).await {
                Ok(inserted) => {
                    result.added += 1;
                    synced.push(inserted);
                }
                Err(e) => {
                    warn!(scope = %scope, remote_id = %remote.global_id, error = %e, "Failed to insert");
                    result.add_errors.push(ItemError::new(&remote.global_id, &e));
                }
            }
        }

        Ok(SyncReport { result, synced })
    }

    fn compare<F: ResourceKind>(
        &self,
        local: Vec<LocalResource<F>>,
        remote: Vec<RemoteResource<F>>,
    ) -> Result<SetDiff<LocalResource<F>, RemoteResource<F>>, CompareError> {
        match self.config.key_strategy {
            KeyStrategy::ExternalId => {
                // Never-synced resources have nothing to be matched against
                let (linked, unlinked): (Vec<_>, Vec<_>) =
                    local.into_iter().partition(|r| r.external_id.is_some());
                if !unlinked.is_empty() {
                    debug!(count = unlinked.len(), "Skipping resources without external id");
                }
                compare_sets_by(
                    linked,
                    remote,
                    |l| l.external_id.clone().unwrap_or_default(),
                    |r| r.global_id.clone(),
                )
            }
            KeyStrategy::Signature => compare_sets_by(
                local,
                remote,
                |l| signature(&l.fields),
                |r| {
                    let mut fields = r.fields.clone();
                    fields.canonicalize();
                    signature(&fields)
                },
            ),
        }
    }

    async fn remove<F, S>(&self, store: &S, resource: &LocalResource<F>) -> Result<(), StoreError>
    where
        F: ResourceKind,
        S: LocalStore<F> + ?Sized,
    {
        store.validate_delete(resource).await?;
        store.delete(resource.id).await?;
        debug!(resource = %resource.name, "Deleted");
        Ok(())
    }

    /// `None` when the local resource already matches.
    async fn update<F, S>(
        &self,
        ctx: &SyncContext,
        scope: &Scope,
        store: &S,
        resource: &LocalResource<F>,
        remote: &RemoteResource<F>,
    ) -> Result<Option<LocalResource<F>>, StoreError>
    where
        F: ResourceKind,
        S: LocalStore<F> + ?Sized,
    {
        let mut fields = remote.fields.clone();
        fields.canonicalize();

        let external_id = Some(remote.global_id.clone());
        if fields == resource.fields
            && external_id == resource.external_id
            && remote.description == resource.description
        {
            return Ok(None);
        }

        let changes = field_diff(&resource.fields, &fields);
        let desired = LocalResource {
            fields,
            external_id,
            description: remote.description.clone(),
            ..resource.clone()
        };
        let mut updated = store.update(&desired).await?;
        debug!(resource = %updated.name, changes = changes.len(), "Updated");

        let changes = serde_json::to_value(&changes).unwrap_or_default();
        self.audit
            .log_sync_event(scope, &ctx.actor, &updated, SyncAction::Update, changes);
        self.sync_metadata(store, &mut updated, remote).await;
        Ok(Some(updated))
    }

    async fn insert<F, S>(
        &self,
        ctx: &SyncContext,
        scope: &Scope,
        store: &S,
        remote: &RemoteResource<F>,
    ) -> Result<LocalResource<F>, StoreError>
    where
        F: ResourceKind,
        S: LocalStore<F> + ?Sized,
    {
        let mut fields = remote.fields.clone();
        fields.canonicalize();

        let base = F::basename(&remote.name, scope);
        let name = generate_name(store, scope, &base, &self.config).await?;
        let resource = LocalResource {
            fields,
            ..LocalResource::from_remote(remote, name, scope)
        };
        let mut inserted = store.insert(resource).await?;
        debug!(resource = %inserted.name, remote_id = %remote.global_id, "Inserted");

        let snapshot = serde_json::to_value(&inserted.fields).unwrap_or_default();
        self.audit
            .log_sync_event(scope, &ctx.actor, &inserted, SyncAction::Create, snapshot);
        self.sync_metadata(store, &mut inserted, remote).await;
        Ok(inserted)
    }

    /// Copies cloud tags into local metadata. Failures are only logged.
    async fn sync_metadata<F, S>(
        &self,
        store: &S,
        resource: &mut LocalResource<F>,
        remote: &RemoteResource<F>,
    ) where
        F: ResourceKind,
        S: LocalStore<F> + ?Sized,
    {
        if remote.tags.is_empty() {
            return;
        }
        match store.sync_metadata(resource.id, &remote.tags).await {
            Ok(()) => {
                resource
                    .metadata
                    .extend(remote.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
                resource.synced_at = Some(Utc::now());
            }
            Err(e) => {
                warn!(resource = %resource.name, error = %e, "Failed to sync metadata");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SnapshotFetcher;
    use crate::route_table::{Route, RouteTable, RouteTableKind};
    use crate::store::MemoryStore;

    fn table(cidr: &str) -> RouteTable {
        RouteTable::new(
            RouteTableKind::Custom,
            vec![Route::new(cidr, "instance", "i-1")],
        )
    }

    fn syncer() -> Syncer {
        Syncer::new(SyncConfig::default(), Arc::new(AuditLogger::new_noop()))
    }

    #[tokio::test]
    async fn test_unchanged_is_not_written() {
        let scope = Scope::new("vpc", "v1");
        let local = LocalResource::new("a", &scope, table("10.0.0.0/8")).with_external_id("ext-a");
        let store = MemoryStore::with_resources(vec![local.clone()]);
        let fetcher = SnapshotFetcher::new(vec![RemoteResource::new("ext-a", "a", table("10.0.0.0/8"))]);

        let report = syncer()
            .sync(&SyncContext::new("test"), &scope, &store, &fetcher)
            .await
            .unwrap();
        assert_eq!(report.result.unchanged, 1);
        assert_eq!(report.result.updated, 0);
        assert_eq!(store.get(local.id).await.unwrap().synced_at, None);
    }

    #[tokio::test]
    async fn test_update_normalizes_remote_fields() {
        let scope = Scope::new("vpc", "v1");
        let local = LocalResource::new("a", &scope, table("10.0.0.0/8")).with_external_id("ext-a");
        let store = MemoryStore::with_resources(vec![local.clone()]);
        let fetcher = SnapshotFetcher::new(vec![
            RemoteResource::new("ext-a", "a", table("192.168.1.3/24")).with_tag("env", "prod"),
        ]);

        let report = syncer()
            .sync(&SyncContext::new("test"), &scope, &store, &fetcher)
            .await
            .unwrap();
        assert_eq!(report.result.updated, 1);
        let stored = store.get(local.id).await.unwrap();
        assert_eq!(stored.fields.routes[0].cidr, "192.168.1.0/24");
        assert_eq!(stored.metadata["env"], "prod");
        assert_eq!(report.synced[0].metadata["env"], "prod");
    }

    #[tokio::test]
    async fn test_remote_duplicates_are_mirrored() {
        let scope = Scope::new("vpc", "v1");
        let store: MemoryStore<RouteTable> = MemoryStore::new();
        let mut dup = table("10.0.0.0/8");
        dup.routes.push(Route::new("10.1.0.0/8", "vpn", "v-1"));
        dup.routes.push(Route::new("not-an-address", "vpn", "v-2"));
        let fetcher = SnapshotFetcher::new(vec![RemoteResource::new("ext-dup", "dup", dup)]);

        let report = syncer()
            .sync(&SyncContext::new("test"), &scope, &store, &fetcher)
            .await
            .unwrap();
        assert_eq!(report.result.added, 1);
        assert!(report.result.is_clean());

        let stored = &store.all().await[0];
        let cidrs: Vec<&str> = stored.fields.routes.iter().map(|r| r.cidr.as_str()).collect();
        assert_eq!(cidrs, vec!["10.0.0.0/8", "10.0.0.0/8", "not-an-address"]);
    }

    #[tokio::test]
    async fn test_unlinked_local_is_left_alone() {
        let scope = Scope::new("vpc", "v1");
        let manual = LocalResource::new("manual", &scope, table("10.0.0.0/8"));
        let store = MemoryStore::with_resources(vec![manual.clone()]);
        let fetcher: SnapshotFetcher<RouteTable> = SnapshotFetcher::new(Vec::new());

        let report = syncer()
            .sync(&SyncContext::new("test"), &scope, &store, &fetcher)
            .await
            .unwrap();
        assert_eq!(report.result, SyncResult::default());
        assert!(store.get(manual.id).await.is_some());
    }

    #[tokio::test]
    async fn test_signature_strategy_links_by_content() {
        let scope = Scope::new("vpc", "v1");
        let manual = LocalResource::new("manual", &scope, table("10.0.0.0/8"));
        let store = MemoryStore::with_resources(vec![manual.clone()]);
        let fetcher = SnapshotFetcher::new(vec![RemoteResource::new("ext-1", "x", table("10.0.0.0/8"))]);
        let config = SyncConfig {
            key_strategy: KeyStrategy::Signature,
            ..Default::default()
        };
        let syncer = Syncer::new(config, Arc::new(AuditLogger::new_noop()));

        let report = syncer
            .sync(&SyncContext::new("test"), &scope, &store, &fetcher)
            .await
            .unwrap();
        // Same content, so the local row is only linked to the remote id
        assert_eq!(report.result.updated, 1);
        assert_eq!(
            store.get(manual.id).await.unwrap().external_id.as_deref(),
            Some("ext-1")
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts() {
        let scope = Scope::new("vpc", "v1");
        let store: MemoryStore<RouteTable> = MemoryStore::new();
        let fetcher: SnapshotFetcher<RouteTable> = SnapshotFetcher::new(Vec::new());
        fetcher.fail_with("connection refused").await;

        let err = syncer()
            .sync(&SyncContext::new("test"), &scope, &store, &fetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch(ProviderError::Io(_))));
    }
}
