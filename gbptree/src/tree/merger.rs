//! Resolution of writes to keys that already exist.

/// What to do with an existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome<V> {
    /// Keep the stored value.
    Unchanged,
    /// Store this value instead.
    Replaced(V),
    /// Remove the entry.
    Removed,
}

/// Decides how a put combines with an existing value for the same key.
///
/// Any `Fn(&K, &V, &V) -> MergeOutcome<V>` closure is a merger, receiving
/// the key, the existing value and the new value.
pub trait ValueMerger<K, V> {
    fn merge(&self, key: &K, existing: &V, new: &V) -> MergeOutcome<V>;
}

/// Replace the existing value. The default for `put`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overwrite;

impl<K, V: Clone> ValueMerger<K, V> for Overwrite {
    fn merge(&self, _key: &K, _existing: &V, new: &V) -> MergeOutcome<V> {
        MergeOutcome::Replaced(new.clone())
    }
}

/// Keep the existing value; only absent keys are inserted.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepExisting;

impl<K, V> ValueMerger<K, V> for KeepExisting {
    fn merge(&self, _key: &K, _existing: &V, _new: &V) -> MergeOutcome<V> {
        MergeOutcome::Unchanged
    }
}

impl<K, V, F> ValueMerger<K, V> for F
where
    F: Fn(&K, &V, &V) -> MergeOutcome<V>,
{
    fn merge(&self, key: &K, existing: &V, new: &V) -> MergeOutcome<V> {
        self(key, existing, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_mergers() {
        assert_eq!(Overwrite.merge(&1u64, &10u64, &20u64), MergeOutcome::Replaced(20));
        assert_eq!(KeepExisting.merge(&1u64, &10u64, &20u64), MergeOutcome::Unchanged);
    }

    #[test]
    fn test_closure_merger() {
        let add = |_key: &u64, existing: &u64, new: &u64| {
            if existing + new == 0 {
                MergeOutcome::Removed
            } else {
                MergeOutcome::Replaced(existing + new)
            }
        };
        assert_eq!(add.merge(&1, &2, &3), MergeOutcome::Replaced(5));
        assert_eq!(add.merge(&1, &0, &0), MergeOutcome::Removed);
    }
}
