//! Unique names for resources inserted from the cloud.

use crate::config::SyncConfig;
use crate::resource::{ResourceKind, Scope};
use crate::store::{LocalStore, Result, StoreError};

/// `base` if free in `scope`, else the first free `base{sep}N` for N from 1.
pub async fn generate_name<F, S>(
    store: &S,
    scope: &Scope,
    base: &str,
    config: &SyncConfig,
) -> Result<String>
where
    F: ResourceKind,
    S: LocalStore<F> + ?Sized,
{
    if !store.name_exists(scope, base).await? {
        return Ok(base.to_string());
    }
    for n in 1..=config.max_name_attempts {
        let candidate = format!("{}{}{}", base, config.name_separator, n);
        if !store.name_exists(scope, &candidate).await? {
            return Ok(candidate);
        }
    }
    Err(StoreError::Conflict(format!(
        "no free {} name for {} in {}",
        F::KIND,
        base,
        scope
    )))
}
