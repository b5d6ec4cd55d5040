//! Key-based diff of a local and a remote collection.
//!
//! Every element of both inputs lands in exactly one bucket: local-only
//! elements are `removed`, remote-only elements are `added`, and elements
//! present on both sides are paired up in `common_local`/`common_remote`.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::Serialize;
use thiserror::Error;

/// Which input a key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompareError {
    /// Two elements on one side share a key.
    #[error("ambiguous {side} key: {key}")]
    AmbiguousKey { side: Side, key: String },
}

/// Types that carry their own comparison key.
pub trait Keyed {
    type Key: Eq + Hash + fmt::Debug;

    fn key(&self) -> Self::Key;
}

/// Result of a set comparison.
///
/// `common_local[i]` and `common_remote[i]` share a key. Pairs follow the
/// local order, `removed` keeps the local order and `added` the remote one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<L, R> {
    pub removed: Vec<L>,
    pub common_local: Vec<L>,
    pub common_remote: Vec<R>,
    pub added: Vec<R>,
}

impl<L, R> SetDiff<L, R> {
    pub fn is_converged(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    /// Paired elements.
    pub fn common(&self) -> impl Iterator<Item = (&L, &R)> {
        self.common_local.iter().zip(self.common_remote.iter())
    }
}

/// Compares two collections of [`Keyed`] elements sharing a key type.
pub fn compare_sets<L, R, K>(local: Vec<L>, remote: Vec<R>) -> Result<SetDiff<L, R>, CompareError>
where
    L: Keyed<Key = K>,
    R: Keyed<Key = K>,
    K: Eq + Hash + fmt::Debug,
{
    compare_sets_by(local, remote, L::key, R::key)
}

/// Compares two collections using a key function per side.
pub fn compare_sets_by<L, R, K>(
    local: Vec<L>,
    remote: Vec<R>,
    local_key: impl Fn(&L) -> K,
    remote_key: impl Fn(&R) -> K,
) -> Result<SetDiff<L, R>, CompareError>
where
    K: Eq + Hash + fmt::Debug,
{
    let local_keys = index_keys(&local, Side::Local, &local_key)?;
    let remote_keys = index_keys(&remote, Side::Remote, &remote_key)?;

    // Remote slot -> local slot for every shared key
    let mut paired: Vec<Option<usize>> = vec![None; remote.len()];
    let mut local_match: Vec<Option<usize>> = vec![None; local.len()];
    for (key, &li) in &local_keys {
        if let Some(&ri) = remote_keys.get(key) {
            paired[ri] = Some(li);
            local_match[li] = Some(ri);
        }
    }

    let mut remote_slots: Vec<Option<R>> = remote.into_iter().map(Some).collect();

    let mut removed = Vec::new();
    let mut common_local = Vec::new();
    let mut common_remote = Vec::new();
    for (li, item) in local.into_iter().enumerate() {
        match local_match[li].and_then(|ri| remote_slots[ri].take()) {
            Some(remote_item) => {
                common_local.push(item);
                common_remote.push(remote_item);
            }
            None => removed.push(item),
        }
    }

    let added = remote_slots
        .into_iter()
        .zip(paired)
        .filter_map(|(item, pair)| if pair.is_none() { item } else { None })
        .collect();

    Ok(SetDiff {
        removed,
        common_local,
        common_remote,
        added,
    })
}

fn index_keys<T, K>(
    items: &[T],
    side: Side,
    key_fn: &impl Fn(&T) -> K,
) -> Result<HashMap<K, usize>, CompareError>
where
    K: Eq + Hash + fmt::Debug,
{
    let mut keys = HashMap::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let key = key_fn(item);
        if keys.contains_key(&key) {
            return Err(CompareError::AmbiguousKey {
                side,
                key: format!("{:?}", key),
            });
        }
        keys.insert(key, idx);
    }
    Ok(keys)
}
