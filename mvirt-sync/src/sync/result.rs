//! Outcome of a sync pass.

use std::fmt;

use serde::Serialize;

use crate::resource::LocalResource;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    Validation,
    Conflict,
    NotFound,
    Io,
}

impl From<&StoreError> for ItemErrorKind {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::Validation(_) => ItemErrorKind::Validation,
            StoreError::Conflict(_) => ItemErrorKind::Conflict,
            StoreError::NotFound(_) => ItemErrorKind::NotFound,
            StoreError::Io(_) => ItemErrorKind::Io,
        }
    }
}

/// Failure of a single item; the pass carries on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub resource: String,
    pub kind: ItemErrorKind,
    pub cause: String,
}

impl ItemError {
    pub fn new(resource: impl Into<String>, err: &StoreError) -> Self {
        Self {
            resource: resource.into(),
            kind: err.into(),
            cause: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub add_errors: Vec<ItemError>,
    pub update_errors: Vec<ItemError>,
    pub delete_errors: Vec<ItemError>,
}

impl SyncResult {
    pub fn error_count(&self) -> usize {
        self.add_errors.len() + self.update_errors.len() + self.delete_errors.len()
    }

    pub fn is_clean(&self) -> bool {
        self.error_count() == 0
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added {} updated {} deleted {} unchanged {}",
            self.added, self.updated, self.deleted, self.unchanged
        )?;
        if !self.is_clean() {
            write!(
                f,
                " (errors: add {} update {} delete {})",
                self.add_errors.len(),
                self.update_errors.len(),
                self.delete_errors.len()
            )?;
        }
        Ok(())
    }
}

/// Result of a pass plus the local resources in sync with the cloud
/// afterwards (updated, unchanged and inserted).
#[derive(Debug, Clone)]
pub struct SyncReport<F> {
    pub result: SyncResult,
    pub synced: Vec<LocalResource<F>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let mut result = SyncResult {
            added: 1,
            deleted: 4,
            ..Default::default()
        };
        assert_eq!(result.to_string(), "added 1 updated 0 deleted 4 unchanged 0");

        result
            .delete_errors
            .push(ItemError::new("rtbl", &StoreError::Validation("in use".into())));
        assert_eq!(
            result.to_string(),
            "added 1 updated 0 deleted 4 unchanged 0 (errors: add 0 update 0 delete 1)"
        );
        assert_eq!(result.delete_errors[0].kind, ItemErrorKind::Validation);
    }
}
