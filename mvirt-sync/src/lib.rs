//! mvirt-sync: reconciles locally stored resources with cloud providers.
//!
//! - [`compare`]: key-based diff of local and remote collections
//! - [`secrules`]: security rule normalization and provider comparison
//! - [`sync`]: locked reconciliation passes over a [`store::LocalStore`]

pub mod audit;
pub mod compare;
pub mod config;
pub mod provider;
pub mod resource;
pub mod route_table;
pub mod secrules;
pub mod store;
pub mod sync;

pub use audit::{AuditEvent, AuditLogger, AuditSink, MemoryAuditSink, SyncAction};
pub use compare::{CompareError, Keyed, SetDiff, Side, compare_sets, compare_sets_by};
pub use config::{ConfigError, KeyStrategy, SyncConfig};
pub use provider::{DriverRegistry, ProviderError, ResourceFetcher, RuleDriver};
pub use resource::{LocalResource, RemoteResource, ResourceKind, Scope};
pub use route_table::{Route, RouteTable, RouteTableKind};
pub use store::{LocalStore, MemoryStore, StoreError};
pub use sync::{SyncContext, SyncError, SyncReport, SyncResult, Syncer};
