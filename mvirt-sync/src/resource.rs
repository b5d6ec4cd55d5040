//! Resources participating in a sync pass.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The container a sync pass works on, e.g. one VPC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Scope {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Key under which passes over this scope are serialized.
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// The comparable payload of a synced resource type.
pub trait ResourceKind:
    Clone + PartialEq + fmt::Debug + Serialize + Send + Sync + 'static
{
    /// Resource type name used in logs and audit events.
    const KIND: &'static str;
    /// Name used when neither the remote nor the scope provides one.
    const NAME_PREFIX: &'static str;

    /// Base name for a resource inserted from the cloud.
    fn basename(remote_name: &str, scope: &Scope) -> String {
        if !remote_name.is_empty() {
            return remote_name.to_string();
        }
        match scope.name.as_deref() {
            Some(name) if !name.is_empty() => format!("{}-{}", Self::NAME_PREFIX, name),
            _ => Self::NAME_PREFIX.to_string(),
        }
    }

    /// Brings fields mirrored from a cloud into canonical form. Never
    /// rejects: remote state is stored as the cloud reports it.
    fn canonicalize(&mut self) {}

    /// Checks fields supplied by a user before they are stored.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// A locally stored resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalResource<F> {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    /// Lock key of the owning scope, `kind/id`.
    #[serde(default)]
    pub scope_id: String,
    /// Cloud-side id; `None` until the resource was synced once.
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub fields: F,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl<F: ResourceKind> LocalResource<F> {
    pub fn new(name: impl Into<String>, scope: &Scope, fields: F) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            scope_id: scope.lock_key(),
            external_id: None,
            description: None,
            fields,
            metadata: BTreeMap::new(),
            synced_at: None,
        }
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    /// A new local resource mirroring `remote`.
    pub fn from_remote(remote: &RemoteResource<F>, name: String, scope: &Scope) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            scope_id: scope.lock_key(),
            external_id: Some(remote.global_id.clone()),
            description: remote.description.clone(),
            fields: remote.fields.clone(),
            metadata: BTreeMap::new(),
            synced_at: Some(Utc::now()),
        }
    }
}

/// A resource as reported by a cloud provider. Read-only, lives for one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource<F> {
    pub global_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub fields: F,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl<F> RemoteResource<F> {
    pub fn new(global_id: impl Into<String>, name: impl Into<String>, fields: F) -> Self {
        Self {
            global_id: global_id.into(),
            name: name.into(),
            description: None,
            fields,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Content signature of comparable fields, used as join key before
/// resources carry an external id.
pub fn signature<F: Serialize>(fields: &F) -> String {
    serde_json::to_string(fields).unwrap_or_default()
}

/// One changed field of an update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

/// Top-level fields that differ between `old` and `new`.
pub fn field_diff<F: Serialize>(old: &F, new: &F) -> Vec<FieldChange> {
    let old = serde_json::to_value(old).unwrap_or(Value::Null);
    let new = serde_json::to_value(new).unwrap_or(Value::Null);

    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut fields: Vec<&String> = old.keys().chain(new.keys()).collect();
            fields.sort();
            fields.dedup();
            fields
                .into_iter()
                .filter_map(|field| {
                    let before = old.get(field).cloned().unwrap_or(Value::Null);
                    let after = new.get(field).cloned().unwrap_or(Value::Null);
                    (before != after).then(|| FieldChange {
                        field: field.clone(),
                        old: before,
                        new: after,
                    })
                })
                .collect()
        }
        (old, new) if old != new => vec![FieldChange {
            field: String::new(),
            old,
            new,
        }],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Disk {
        size: u64,
        kind: String,
    }

    impl ResourceKind for Disk {
        const KIND: &'static str = "disk";
        const NAME_PREFIX: &'static str = "disk";
    }

    #[test]
    fn test_basename() {
        let scope = Scope::new("vpc", "v1");
        assert_eq!(Disk::basename("data", &scope), "data");
        assert_eq!(Disk::basename("", &scope), "disk");
        assert_eq!(Disk::basename("", &scope.clone().with_name("prod")), "disk-prod");
    }

    #[test]
    fn test_field_diff() {
        let a = Disk {
            size: 10,
            kind: "ssd".into(),
        };
        let b = Disk {
            size: 20,
            kind: "ssd".into(),
        };
        let diff = field_diff(&a, &b);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].field, "size");
        assert_eq!(diff[0].new, serde_json::json!(20));
        assert!(field_diff(&a, &a).is_empty());
    }

    #[test]
    fn test_from_remote() {
        let scope = Scope::new("vpc", "v1");
        let remote = RemoteResource::new(
            "ext-1",
            "",
            Disk {
                size: 1,
                kind: "hdd".into(),
            },
        );
        let local = LocalResource::from_remote(&remote, "disk".into(), &scope);
        assert_eq!(local.external_id.as_deref(), Some("ext-1"));
        assert_eq!(local.scope_id, "vpc/v1");
        assert!(local.synced_at.is_some());
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(Scope::new("vpc", "v1").with_name("x").lock_key(), "vpc/v1");
    }
}
