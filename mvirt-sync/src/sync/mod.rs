//! Reconciliation passes.
//!
//! A pass locks its scope, fetches the remote state once, compares it with
//! the local state, and applies deletes, updates and inserts in that order.

mod lock;
mod naming;
mod result;
mod rules;
mod syncer;

pub use lock::{LockError, ScopeGuard, ScopeLocks};
pub use naming::generate_name;
pub use result::{ItemError, ItemErrorKind, SyncReport, SyncResult};
pub use rules::RuleSyncReport;
pub use syncer::{SyncContext, SyncError, Syncer};
