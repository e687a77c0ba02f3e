//! Generic in-memory SCD2 table.
//!
//! Each key owns a `Vec` of immutable versions. A commit swaps the current
//! version for its closed copy and appends new versions under a single write
//! lock, guarded by a compare-and-swap on the current version's surrogate key.
//! Readers holding the read lock therefore see a key's history either entirely
//! before or entirely after a commit, never with a half-closed interval.

use starling_core::{
    StarlingError, StarlingResult, StorageError, SurrogateKey, Timestamp, Versioned,
};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Changes to one key's history, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryCommit<V> {
    /// Surrogate key of the current version the change was computed against.
    /// `None` means the key must not exist yet.
    pub expected_current: Option<SurrogateKey>,
    /// Closed copy of the current version, when the change supersedes it.
    pub close_current: Option<V>,
    /// New versions in ascending `valid_from`; the last one is current.
    pub append: Vec<V>,
}

impl<V> HistoryCommit<V> {
    pub fn is_noop(&self) -> bool {
        self.close_current.is_none() && self.append.is_empty()
    }
}

/// In-memory SCD2 table keyed by the version's natural key.
#[derive(Debug)]
pub struct Scd2Store<V: Versioned> {
    rows: RwLock<BTreeMap<V::Key, Vec<V>>>,
}

impl<V: Versioned> Default for Scd2Store<V> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V: Versioned> Scd2Store<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full history of a key, ordered by `valid_from`.
    pub fn history(&self, key: &V::Key) -> StarlingResult<Vec<V>> {
        let rows = self.read()?;
        Ok(rows.get(key).cloned().unwrap_or_default())
    }

    pub fn as_of(&self, key: &V::Key, at: Timestamp) -> StarlingResult<Option<V>> {
        let rows = self.read()?;
        Ok(rows
            .get(key)
            .and_then(|history| starling_core::version_as_of(history, at))
            .cloned())
    }

    pub fn commit(&self, key: &V::Key, commit: HistoryCommit<V>) -> StarlingResult<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))?;

        let actual = rows
            .get(key)
            .and_then(|history| history.iter().find(|v| v.is_current()))
            .map(|v| v.surrogate_key());

        if actual != commit.expected_current {
            tracing::debug!(
                table = %V::TABLE,
                key = %key,
                expected = ?commit.expected_current,
                actual = ?actual,
                "Commit rejected: current version moved"
            );
            return Err(StarlingError::Storage(StorageError::ConcurrentModification {
                table: V::TABLE,
                key: key.to_string(),
            }));
        }

        if commit.is_noop() {
            return Ok(());
        }

        if let Some(closed) = &commit.close_current {
            if Some(closed.surrogate_key()) != actual {
                return Err(StarlingError::Storage(StorageError::InsertFailed {
                    table: V::TABLE.to_string(),
                    reason: format!(
                        "closed version {} does not match current version of {}",
                        closed.surrogate_key(),
                        key
                    ),
                }));
            }
        }

        let history = rows.entry(key.clone()).or_default();

        if let Some(closed) = commit.close_current {
            if let Some(slot) = history
                .iter_mut()
                .find(|v| v.surrogate_key() == closed.surrogate_key())
            {
                *slot = closed;
            }
        }

        history.extend(commit.append);
        Ok(())
    }

    /// Clone of every key's history.
    pub fn export(&self) -> StarlingResult<BTreeMap<V::Key, Vec<V>>> {
        Ok(self.read()?.clone())
    }

    pub fn key_count(&self) -> StarlingResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn row_count(&self) -> StarlingResult<usize> {
        Ok(self.read()?.values().map(Vec::len).sum())
    }

    pub fn clear(&self) -> StarlingResult<()> {
        self.rows
            .write()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))?
            .clear();
        Ok(())
    }

    fn read(&self) -> StarlingResult<std::sync::RwLockReadGuard<'_, BTreeMap<V::Key, Vec<V>>>> {
        self.rows
            .read()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use starling_core::{new_batch_id, CanonicalUserId, IdentityMapVersion, LoginUserId, NaturalKey};

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn key() -> NaturalKey {
        NaturalKey::Login(LoginUserId::new("L1"))
    }

    fn version(sk: u64, canonical: &str, from: i64) -> IdentityMapVersion {
        IdentityMapVersion::open(
            SurrogateKey(sk),
            key(),
            CanonicalUserId::new(canonical),
            t(from),
            new_batch_id(),
        )
    }

    #[test]
    fn test_first_commit_requires_absent_key() {
        let table: Scd2Store<IdentityMapVersion> = Scd2Store::new();
        table
            .commit(
                &key(),
                HistoryCommit {
                    expected_current: None,
                    close_current: None,
                    append: vec![version(1, "U1", 0)],
                },
            )
            .unwrap();

        let again = table.commit(
            &key(),
            HistoryCommit {
                expected_current: None,
                close_current: None,
                append: vec![version(2, "U1", 0)],
            },
        );
        assert!(matches!(
            again,
            Err(StarlingError::Storage(StorageError::ConcurrentModification { .. }))
        ));
        assert_eq!(table.row_count().unwrap(), 1);
    }

    #[test]
    fn test_close_and_append() {
        let table: Scd2Store<IdentityMapVersion> = Scd2Store::new();
        let first = version(1, "U1", 0);
        table
            .commit(
                &key(),
                HistoryCommit {
                    expected_current: None,
                    close_current: None,
                    append: vec![first.clone()],
                },
            )
            .unwrap();
        table
            .commit(
                &key(),
                HistoryCommit {
                    expected_current: Some(SurrogateKey(1)),
                    close_current: Some(first.closed_at(t(10))),
                    append: vec![version(2, "U2", 10)],
                },
            )
            .unwrap();

        let history = table.history(&key()).unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_current);
        assert_eq!(history[0].valid_to, Some(t(10)));
        assert!(history[1].is_current);
        assert!(starling_core::verify_history(&key(), &history).is_ok());

        assert_eq!(
            table.as_of(&key(), t(5)).unwrap().unwrap().canonical_user_id,
            CanonicalUserId::new("U1")
        );
        assert_eq!(
            table.as_of(&key(), t(50)).unwrap().unwrap().canonical_user_id,
            CanonicalUserId::new("U2")
        );
    }

    #[test]
    fn test_stale_expected_current_rejected() {
        let table: Scd2Store<IdentityMapVersion> = Scd2Store::new();
        let first = version(1, "U1", 0);
        table
            .commit(
                &key(),
                HistoryCommit {
                    expected_current: None,
                    close_current: None,
                    append: vec![first.clone()],
                },
            )
            .unwrap();

        let stale = table.commit(
            &key(),
            HistoryCommit {
                expected_current: Some(SurrogateKey(99)),
                close_current: None,
                append: vec![version(2, "U2", 10)],
            },
        );
        assert!(stale.is_err());
        assert_eq!(table.history(&key()).unwrap(), vec![first]);
    }

    #[test]
    fn test_mismatched_close_rejected() {
        let table: Scd2Store<IdentityMapVersion> = Scd2Store::new();
        table
            .commit(
                &key(),
                HistoryCommit {
                    expected_current: None,
                    close_current: None,
                    append: vec![version(1, "U1", 0)],
                },
            )
            .unwrap();

        let result = table.commit(
            &key(),
            HistoryCommit {
                expected_current: Some(SurrogateKey(1)),
                close_current: Some(version(7, "U1", 0).closed_at(t(10))),
                append: vec![version(2, "U2", 10)],
            },
        );
        assert!(matches!(
            result,
            Err(StarlingError::Storage(StorageError::InsertFailed { .. }))
        ));
        assert_eq!(table.row_count().unwrap(), 1);
    }

    #[test]
    fn test_noop_commit_on_missing_key_creates_nothing() {
        let table: Scd2Store<IdentityMapVersion> = Scd2Store::new();
        table
            .commit(
                &key(),
                HistoryCommit {
                    expected_current: None,
                    close_current: None,
                    append: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(table.key_count().unwrap(), 0);
    }
}
