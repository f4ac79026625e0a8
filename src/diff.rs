/// Row-level diffing.
///
/// [`rows_diff`] compares two ordered row sequences by key and reports what
/// was added, changed, removed and whether the surviving rows were reordered.
/// Equality is supplied by the caller; the live query engine compares cached
/// rows by content hash through [`snapshot_diff`].
use crate::types::{CachedRow, Row, RowKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A row that can be identified by a key column.
pub trait DiffRow {
    /// The row's key under `key_field`.
    fn diff_key(&self, key_field: &str) -> RowKey;
}

impl DiffRow for Row {
    fn diff_key(&self, key_field: &str) -> RowKey {
        self.key(key_field)
    }
}

impl<T: DiffRow + ?Sized> DiffRow for Arc<T> {
    fn diff_key(&self, key_field: &str) -> RowKey {
        (**self).diff_key(key_field)
    }
}

impl DiffRow for CachedRow {
    fn diff_key(&self, _key_field: &str) -> RowKey {
        self.key.clone()
    }
}

/// How rows are compared.
pub struct DiffOptions<'a, R> {
    /// Column that uniquely identifies a row.
    pub key_field: &'a str,
    /// Content equality for two rows with the same key.
    pub equal: &'a dyn Fn(&R, &R) -> bool,
}

/// A row whose content changed under the same key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedRow<R> {
    /// The previous version.
    pub old: R,
    /// The current version.
    pub new: R,
}

/// Difference between two row sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsDiff<R = Arc<Row>> {
    /// Rows present only in the new sequence, in new order.
    pub added: Vec<R>,
    /// Rows present in both with different content, in new order.
    pub changed: Vec<ChangedRow<R>>,
    /// Keys present only in the old sequence, in old order.
    pub removed: Vec<RowKey>,
    /// Full key order of the new sequence. Set only when dropping removed
    /// rows, updating changed rows in place and appending added rows would
    /// not reproduce it.
    pub order: Option<Vec<RowKey>>,
}

impl<R> RowsDiff<R> {
    /// Whether the diff carries no change at all.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.order.is_none()
    }

    /// Convert every row in the diff.
    pub fn map<U>(self, mut f: impl FnMut(R) -> U) -> RowsDiff<U> {
        RowsDiff {
            added: self.added.into_iter().map(&mut f).collect(),
            changed: self
                .changed
                .into_iter()
                .map(|c| ChangedRow {
                    old: f(c.old),
                    new: f(c.new),
                })
                .collect(),
            removed: self.removed,
            order: self.order,
        }
    }
}

impl<R: DiffRow + Clone> RowsDiff<R> {
    /// Apply the diff to `old`, producing the new sequence.
    pub fn apply(&self, old: &[R], key_field: &str) -> Vec<R> {
        let removed: HashSet<&RowKey> = self.removed.iter().collect();
        let changed: HashMap<RowKey, &R> = self
            .changed
            .iter()
            .map(|c| (c.new.diff_key(key_field), &c.new))
            .collect();

        let mut rows: Vec<(RowKey, R)> = old
            .iter()
            .map(|row| (row.diff_key(key_field), row))
            .filter(|(key, _)| !removed.contains(key))
            .map(|(key, row)| {
                let row = changed.get(&key).map_or_else(|| row.clone(), |r| (*r).clone());
                (key, row)
            })
            .collect();
        rows.extend(
            self.added
                .iter()
                .map(|row| (row.diff_key(key_field), row.clone())),
        );

        match &self.order {
            None => rows.into_iter().map(|(_, row)| row).collect(),
            Some(order) => {
                let mut by_key: HashMap<RowKey, R> = rows.into_iter().collect();
                order.iter().filter_map(|key| by_key.remove(key)).collect()
            }
        }
    }
}

/// Compare two ordered row sequences.
///
/// Returns `None` when the sequences hold the same keys, in the same order,
/// with equal content.
pub fn rows_diff<R: DiffRow + Clone>(
    old: &[R],
    new: &[R],
    options: &DiffOptions<'_, R>,
) -> Option<RowsDiff<R>> {
    let old_keys: Vec<RowKey> = old.iter().map(|r| r.diff_key(options.key_field)).collect();
    let new_keys: Vec<RowKey> = new.iter().map(|r| r.diff_key(options.key_field)).collect();

    let old_by_key: HashMap<&RowKey, &R> = old_keys.iter().zip(old.iter()).collect();
    let new_set: HashSet<&RowKey> = new_keys.iter().collect();

    let mut added = Vec::new();
    let mut added_keys = Vec::new();
    let mut changed = Vec::new();

    for (key, row) in new_keys.iter().zip(new.iter()) {
        match old_by_key.get(key) {
            None => {
                added.push(row.clone());
                added_keys.push(key.clone());
            }
            Some(old_row) => {
                if !(options.equal)(old_row, row) {
                    changed.push(ChangedRow {
                        old: (*old_row).clone(),
                        new: row.clone(),
                    });
                }
            }
        }
    }

    let removed: Vec<RowKey> = old_keys
        .iter()
        .filter(|key| !new_set.contains(key))
        .cloned()
        .collect();

    // Order the naive application would produce.
    let mut naive: Vec<&RowKey> = old_keys.iter().filter(|k| new_set.contains(k)).collect();
    naive.extend(added_keys.iter());
    let reordered = naive.len() != new_keys.len() || naive.iter().zip(&new_keys).any(|(a, b)| *a != b);

    let diff = RowsDiff {
        added,
        changed,
        removed,
        order: reordered.then_some(new_keys),
    };

    if diff.is_empty() { None } else { Some(diff) }
}

/// Cached rows are equal when they are the same allocation or carry the
/// same content hash.
pub(crate) fn hash_equal(old: &Arc<CachedRow>, new: &Arc<CachedRow>) -> bool {
    Arc::ptr_eq(old, new) || old.hash == new.hash
}

/// Diff two cached snapshots and expose only public rows.
pub(crate) fn snapshot_diff(
    old: &[Arc<CachedRow>],
    new: &[Arc<CachedRow>],
    key_field: &str,
) -> Option<RowsDiff> {
    let equal = hash_equal;
    let options = DiffOptions {
        key_field,
        equal: &equal,
    };
    rows_diff(old, new, &options).map(|diff| diff.map(|cached| Arc::clone(&cached.row)))
}
