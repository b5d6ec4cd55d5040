//! Audit trail of sync side effects.
//!
//! Non-blocking and fault-tolerant: events are always logged locally via
//! tracing and queued for the sink. A full queue or a failing sink loses
//! the event, never the sync pass.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::resource::{LocalResource, ResourceKind, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
    RulesApplied,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
            SyncAction::RulesApplied => "rules_applied",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub resource_id: String,
    pub resource_name: String,
    pub scope: String,
    pub action: SyncAction,
    pub actor: String,
    /// Changed fields for updates, the resource for creates and deletes.
    pub diff: Value,
}

/// Destination of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn record(&self, event: AuditEvent) -> Result<(), String>;
}

enum AuditMessage {
    Event(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Queue in front of an [`AuditSink`], drained by a background task.
pub struct AuditLogger {
    tx: Option<mpsc::Sender<AuditMessage>>,
}

impl AuditLogger {
    /// Create a logger draining into `sink`. Must be called inside a tokio
    /// runtime.
    pub fn new(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    AuditMessage::Event(event) => {
                        if let Err(e) = sink.record(event).await {
                            warn!(error = %e, "Failed to record audit event");
                        }
                    }
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Audit queue closed");
        });
        Self { tx: Some(tx) }
    }

    /// Create a noop audit logger (for testing). Events only go to tracing.
    pub fn new_noop() -> Self {
        Self { tx: None }
    }

    /// Log a sync side effect on `resource`.
    pub fn log_sync_event<F: ResourceKind>(
        &self,
        scope: &Scope,
        actor: &str,
        resource: &LocalResource<F>,
        action: SyncAction,
        diff: Value,
    ) {
        self.log(AuditEvent {
            timestamp: Utc::now(),
            kind: F::KIND.to_string(),
            resource_id: resource.id.to_string(),
            resource_name: resource.name.clone(),
            scope: scope.to_string(),
            action,
            actor: actor.to_string(),
            diff,
        });
    }

    /// Log an event. Never blocks.
    pub fn log(&self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            kind = %event.kind,
            resource = %event.resource_name,
            scope = %event.scope,
            actor = %event.actor,
            "{} {}",
            event.action,
            event.resource_id
        );

        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(AuditMessage::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Audit queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Audit queue closed, dropping event");
            }
        }
    }

    /// Wait until every event queued so far reached the sink.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(AuditMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Sink collecting events in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: Mutex<bool>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), String> {
        if *self.failing.lock().await {
            return Err("audit backend unavailable".to_string());
        }
        self.events.lock().await.push(event);
        Ok(())
    }
}
