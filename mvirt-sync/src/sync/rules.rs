//! Security group rule pass: pushes a desired rule set to a provider.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::result::SyncResult;
use super::syncer::{SyncContext, SyncError, Syncer};
use crate::audit::{AuditEvent, SyncAction};
use crate::provider::RuleDriver;
use crate::resource::Scope;
use crate::secrules::{RuleDiff, RuleSet, compare_rules};

const RULE_KIND: &str = "security_group_rule";

#[derive(Debug, Clone, Serialize)]
pub struct RuleSyncReport {
    /// Changes pushed to the provider (empty when already in sync).
    pub diff: RuleDiff,
    pub result: SyncResult,
}

impl Syncer {
    /// Makes the provider rules of the security group `scope` behave like
    /// `desired`.
    ///
    /// Unlike resource passes, comparator and driver failures abort the pass;
    /// the driver applies a diff as a whole.
    pub async fn sync_security_group_rules(
        &self,
        ctx: &SyncContext,
        scope: &Scope,
        desired: &RuleSet,
        driver: &dyn RuleDriver,
        include_in: bool,
        include_out: bool,
    ) -> Result<RuleSyncReport, SyncError> {
        let _guard = self.acquire(ctx, scope).await?;

        let remote = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(SyncError::Cancelled(scope.to_string())),
            remote = driver.fetch_remote_rules(scope) => remote.map_err(SyncError::Fetch)?,
        };

        let caps = driver.capabilities();
        let diff = compare_rules(&caps, desired, &remote, include_in, include_out)?;
        for limitation in &diff.limitations {
            warn!(
                scope = %scope,
                provider = %driver.provider(),
                deny = %limitation.deny,
                allow = ?limitation.allow,
                reason = ?limitation.reason,
                "Deny rule only approximated on allow-only provider"
            );
        }

        if ctx.cancel.is_cancelled() {
            return Err(SyncError::Cancelled(scope.to_string()));
        }

        let mut result = SyncResult {
            unchanged: diff.common.len(),
            ..Default::default()
        };
        if diff.is_empty() {
            info!(scope = %scope, provider = %driver.provider(), "Rules already in sync");
            return Ok(RuleSyncReport { diff, result });
        }

        driver
            .apply_rule_changes(scope, &diff)
            .await
            .map_err(SyncError::Apply)?;
        result.added = diff.add_count();
        result.deleted = diff.del_count();

        self.audit().log(AuditEvent {
            timestamp: Utc::now(),
            kind: RULE_KIND.to_string(),
            resource_id: scope.id.clone(),
            resource_name: scope.name.clone().unwrap_or_else(|| scope.id.clone()),
            scope: scope.to_string(),
            action: SyncAction::RulesApplied,
            actor: ctx.actor.clone(),
            diff: json!({
                "in_adds": diff.in_adds,
                "out_adds": diff.out_adds,
                "in_dels": diff.in_dels,
                "out_dels": diff.out_dels,
            }),
        });
        info!(
            scope = %scope,
            provider = %driver.provider(),
            adds = result.added,
            dels = result.deleted,
            "Applied rule changes"
        );

        Ok(RuleSyncReport { diff, result })
    }
}
