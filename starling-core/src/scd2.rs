//! SCD2 version rows and their interval bookkeeping.
//!
//! A version is an immutable value. Closing a version produces a new value
//! with `valid_to` set and `is_current` cleared; history is never rewritten
//! in place and never physically deleted.
//!
//! Invariants for the history of one key (checked by [`verify_history`]):
//! - every interval `[valid_from, valid_to)` is non-empty
//! - intervals are pairwise non-overlapping
//! - exactly one version is current, it is the latest, and it is open-ended
//! - every non-current version is closed

use crate::error::IntegrityError;
use crate::identity::{
    BatchId, CanonicalUserId, ChangeHash, ChangeHasher, NaturalKey, SurrogateKey, Timestamp,
};
use crate::records::UserAttributes;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp exports use in place of an open `valid_to`.
pub fn open_ended() -> Timestamp {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}

/// Serde adapter for a row's `valid_to`: an open interval is written as
/// [`open_ended`] and read back as `None`.
mod valid_to_export {
    use super::open_ended;
    use crate::identity::Timestamp;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        valid_to: &Option<Timestamp>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        valid_to.unwrap_or_else(open_ended).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Timestamp>, D::Error> {
        let at = Timestamp::deserialize(deserializer)?;
        Ok((at != open_ended()).then_some(at))
    }
}

/// Half-open validity window. `valid_to == None` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityInterval {
    pub valid_from: Timestamp,
    pub valid_to: Option<Timestamp>,
}

impl ValidityInterval {
    pub fn contains(&self, at: Timestamp) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |to| at < to)
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.valid_to.is_some_and(|to| to <= self.valid_from)
    }

    pub fn overlaps(&self, other: &ValidityInterval) -> bool {
        let self_before_other = self.valid_to.is_some_and(|to| to <= other.valid_from);
        let other_before_self = other.valid_to.is_some_and(|to| to <= self.valid_from);
        !(self_before_other || other_before_self)
    }
}

/// The two SCD2 tables the engine owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scd2Table {
    UserIdentityMap,
    DimUser,
}

impl Scd2Table {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Scd2Table::UserIdentityMap => "user_identity_map",
            Scd2Table::DimUser => "dim_user",
        }
    }
}

impl fmt::Display for Scd2Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Common view over SCD2 version rows.
pub trait Versioned: Clone + fmt::Debug + Send + Sync {
    type Key: Clone + Ord + fmt::Display + fmt::Debug + Send + Sync;

    const TABLE: Scd2Table;

    fn key(&self) -> &Self::Key;
    fn surrogate_key(&self) -> SurrogateKey;
    fn interval(&self) -> ValidityInterval;
    fn change_hash(&self) -> ChangeHash;
    fn is_current(&self) -> bool;

    /// A copy of this version with its interval closed at `at`.
    fn closed_at(&self, at: Timestamp) -> Self;
}

// ============================================================================
// USER IDENTITY MAP
// ============================================================================

/// One row of `user_identity_map`: which canonical user a login or device id
/// belonged to over an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapVersion {
    pub surrogate_key: SurrogateKey,
    pub natural_key: NaturalKey,
    pub canonical_user_id: CanonicalUserId,
    pub valid_from: Timestamp,
    #[serde(with = "valid_to_export")]
    pub valid_to: Option<Timestamp>,
    pub is_current: bool,
    pub change_hash: ChangeHash,
    pub source_batch_id: BatchId,
}

impl IdentityMapVersion {
    /// Open a new current version.
    pub fn open(
        surrogate_key: SurrogateKey,
        natural_key: NaturalKey,
        canonical_user_id: CanonicalUserId,
        valid_from: Timestamp,
        source_batch_id: BatchId,
    ) -> Self {
        let change_hash = Self::hash_of(&canonical_user_id);
        Self {
            surrogate_key,
            natural_key,
            canonical_user_id,
            valid_from,
            valid_to: None,
            is_current: true,
            change_hash,
            source_batch_id,
        }
    }

    /// The identity map tracks only the canonical id for change.
    pub fn hash_of(canonical_user_id: &CanonicalUserId) -> ChangeHash {
        ChangeHasher::new()
            .field(Some(canonical_user_id.as_str()))
            .finish()
    }
}

impl Versioned for IdentityMapVersion {
    type Key = NaturalKey;

    const TABLE: Scd2Table = Scd2Table::UserIdentityMap;

    fn key(&self) -> &NaturalKey {
        &self.natural_key
    }

    fn surrogate_key(&self) -> SurrogateKey {
        self.surrogate_key
    }

    fn interval(&self) -> ValidityInterval {
        ValidityInterval {
            valid_from: self.valid_from,
            valid_to: self.valid_to,
        }
    }

    fn change_hash(&self) -> ChangeHash {
        self.change_hash
    }

    fn is_current(&self) -> bool {
        self.is_current
    }

    fn closed_at(&self, at: Timestamp) -> Self {
        Self {
            valid_to: Some(at),
            is_current: false,
            ..self.clone()
        }
    }
}

// ============================================================================
// DIM USER
// ============================================================================

/// One row of `dim_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDimVersion {
    pub surrogate_key: SurrogateKey,
    pub canonical_user_id: CanonicalUserId,
    pub attributes: UserAttributes,
    pub valid_from: Timestamp,
    #[serde(with = "valid_to_export")]
    pub valid_to: Option<Timestamp>,
    pub is_current: bool,
    pub change_hash: ChangeHash,
    pub source_batch_id: BatchId,
}

impl UserDimVersion {
    pub fn open(
        surrogate_key: SurrogateKey,
        canonical_user_id: CanonicalUserId,
        attributes: UserAttributes,
        valid_from: Timestamp,
        source_batch_id: BatchId,
    ) -> Self {
        let change_hash = attributes.change_hash();
        Self {
            surrogate_key,
            canonical_user_id,
            attributes,
            valid_from,
            valid_to: None,
            is_current: true,
            change_hash,
            source_batch_id,
        }
    }
}

impl Versioned for UserDimVersion {
    type Key = CanonicalUserId;

    const TABLE: Scd2Table = Scd2Table::DimUser;

    fn key(&self) -> &CanonicalUserId {
        &self.canonical_user_id
    }

    fn surrogate_key(&self) -> SurrogateKey {
        self.surrogate_key
    }

    fn interval(&self) -> ValidityInterval {
        ValidityInterval {
            valid_from: self.valid_from,
            valid_to: self.valid_to,
        }
    }

    fn change_hash(&self) -> ChangeHash {
        self.change_hash
    }

    fn is_current(&self) -> bool {
        self.is_current
    }

    fn closed_at(&self, at: Timestamp) -> Self {
        Self {
            valid_to: Some(at),
            is_current: false,
            ..self.clone()
        }
    }
}

// ============================================================================
// INTERVAL INTEGRITY
// ============================================================================

/// What is wrong with a key's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum IntervalViolationKind {
    NoVersions,
    EmptyInterval { surrogate_key: SurrogateKey },
    Overlap { earlier: SurrogateKey, later: SurrogateKey },
    NoCurrentVersion,
    MultipleCurrentVersions { count: usize },
    CurrentNotOpen { surrogate_key: SurrogateKey },
    CurrentNotLatest { surrogate_key: SurrogateKey },
    ClosedVersionOpen { surrogate_key: SurrogateKey },
}

impl fmt::Display for IntervalViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalViolationKind::NoVersions => write!(f, "history has no versions"),
            IntervalViolationKind::EmptyInterval { surrogate_key } => {
                write!(f, "version {} has an empty interval", surrogate_key)
            }
            IntervalViolationKind::Overlap { earlier, later } => {
                write!(f, "versions {} and {} overlap", earlier, later)
            }
            IntervalViolationKind::NoCurrentVersion => write!(f, "no current version"),
            IntervalViolationKind::MultipleCurrentVersions { count } => {
                write!(f, "{} current versions", count)
            }
            IntervalViolationKind::CurrentNotOpen { surrogate_key } => {
                write!(f, "current version {} is closed", surrogate_key)
            }
            IntervalViolationKind::CurrentNotLatest { surrogate_key } => {
                write!(f, "current version {} is not the latest", surrogate_key)
            }
            IntervalViolationKind::ClosedVersionOpen { surrogate_key } => {
                write!(f, "non-current version {} is open-ended", surrogate_key)
            }
        }
    }
}

/// Every interval violation in one key's history.
pub fn history_violations<V: Versioned>(history: &[V]) -> Vec<IntervalViolationKind> {
    if history.is_empty() {
        return vec![IntervalViolationKind::NoVersions];
    }

    let mut ordered: Vec<&V> = history.iter().collect();
    ordered.sort_by_key(|v| (v.interval().valid_from, v.surrogate_key()));

    let mut violations = Vec::new();

    for v in &ordered {
        if v.interval().is_empty() {
            violations.push(IntervalViolationKind::EmptyInterval {
                surrogate_key: v.surrogate_key(),
            });
        }
        if !v.is_current() && v.interval().is_open() {
            violations.push(IntervalViolationKind::ClosedVersionOpen {
                surrogate_key: v.surrogate_key(),
            });
        }
    }

    for (i, earlier) in ordered.iter().enumerate() {
        for later in &ordered[i + 1..] {
            if earlier.interval().overlaps(&later.interval()) {
                violations.push(IntervalViolationKind::Overlap {
                    earlier: earlier.surrogate_key(),
                    later: later.surrogate_key(),
                });
            }
        }
    }

    let current: Vec<&&V> = ordered.iter().filter(|v| v.is_current()).collect();
    match current.len() {
        0 => violations.push(IntervalViolationKind::NoCurrentVersion),
        1 => {
            let cur = current[0];
            if !cur.interval().is_open() {
                violations.push(IntervalViolationKind::CurrentNotOpen {
                    surrogate_key: cur.surrogate_key(),
                });
            }
            let latest = ordered[ordered.len() - 1];
            if latest.surrogate_key() != cur.surrogate_key() {
                violations.push(IntervalViolationKind::CurrentNotLatest {
                    surrogate_key: cur.surrogate_key(),
                });
            }
        }
        count => violations.push(IntervalViolationKind::MultipleCurrentVersions { count }),
    }

    violations
}

/// The version whose interval contains `at`, if any.
pub fn version_as_of<V: Versioned>(history: &[V], at: Timestamp) -> Option<&V> {
    history.iter().find(|v| v.interval().contains(at))
}

/// Post-condition check run before a key's new history is committed.
pub fn verify_history<V: Versioned>(key: &V::Key, history: &[V]) -> Result<(), IntegrityError> {
    match history_violations(history).into_iter().next() {
        None => Ok(()),
        Some(violation) => Err(IntegrityError::IntervalViolation {
            table: V::TABLE,
            key: key.to_string(),
            violation,
        }),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{new_batch_id, LoginUserId};
    use chrono::Duration;

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
    fn test_interval_contains_is_half_open() {
        let i = ValidityInterval {
            valid_from: t(0),
            valid_to: Some(t(10)),
        };
        assert!(i.contains(t(0)));
        assert!(i.contains(t(9)));
        assert!(!i.contains(t(10)));
        assert!(!i.contains(t(-1)));
    }

    #[test]
    fn test_open_interval_contains_future() {
        let i = ValidityInterval {
            valid_from: t(0),
            valid_to: None,
        };
        assert!(i.contains(t(0) + Duration::days(36500)));
    }

    #[test]
    fn test_adjacent_intervals_do_not_overlap() {
        let a = ValidityInterval {
            valid_from: t(0),
            valid_to: Some(t(10)),
        };
        let b = ValidityInterval {
            valid_from: t(10),
            valid_to: None,
        };
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn test_nested_intervals_overlap() {
        let a = ValidityInterval {
            valid_from: t(0),
            valid_to: None,
        };
        let b = ValidityInterval {
            valid_from: t(5),
            valid_to: Some(t(6)),
        };
        assert!(a.overlaps(&b));
    }

    #[test]
    fn test_closed_at_does_not_touch_original() {
        let v = version(1, "U1", 0);
        let closed = v.closed_at(t(10));
        assert!(v.is_current);
        assert_eq!(v.valid_to, None);
        assert!(!closed.is_current);
        assert_eq!(closed.valid_to, Some(t(10)));
        assert_eq!(closed.change_hash, v.change_hash);
    }

    #[test]
    fn test_verify_history_accepts_well_formed_chain() {
        let first = version(1, "U1", 0).closed_at(t(10));
        let second = version(2, "U2", 10).closed_at(t(20));
        let third = version(3, "U3", 20);
        assert!(verify_history(&key(), &[first, second, third]).is_ok());
    }

    #[test]
    fn test_verify_history_rejects_two_current() {
        let history = [version(1, "U1", 0), version(2, "U2", 10)];
        let violations = history_violations(&history);
        assert!(violations.contains(&IntervalViolationKind::MultipleCurrentVersions { count: 2 }));
        assert!(violations.contains(&IntervalViolationKind::Overlap {
            earlier: SurrogateKey(1),
            later: SurrogateKey(2),
        }));
        assert!(verify_history(&key(), &history).is_err());
    }

    #[test]
    fn test_verify_history_rejects_overlap() {
        let first = version(1, "U1", 0).closed_at(t(15));
        let second = version(2, "U2", 10);
        let violations = history_violations(&[first, second]);
        assert_eq!(
            violations,
            vec![IntervalViolationKind::Overlap {
                earlier: SurrogateKey(1),
                later: SurrogateKey(2),
            }]
        );
    }

    #[test]
    fn test_verify_history_rejects_empty_interval() {
        let first = version(1, "U1", 10).closed_at(t(10));
        let second = version(2, "U2", 10);
        let violations = history_violations(&[first, second]);
        assert!(violations.contains(&IntervalViolationKind::EmptyInterval {
            surrogate_key: SurrogateKey(1)
        }));
    }

    #[test]
    fn test_verify_history_rejects_no_current() {
        let only = version(1, "U1", 0).closed_at(t(10));
        assert_eq!(
            history_violations(&[only]),
            vec![IntervalViolationKind::NoCurrentVersion]
        );
    }

    #[test]
    fn test_verify_history_rejects_empty() {
        let history: Vec<IdentityMapVersion> = Vec::new();
        let err = verify_history(&key(), &history).unwrap_err();
        assert!(err.to_string().contains("user_identity_map"));
        assert!(err.to_string().contains("login:L1"));
    }

    #[test]
    fn test_version_as_of_picks_containing_interval() {
        let history = [
            version(1, "U1", 0).closed_at(t(10)),
            version(2, "U2", 10),
        ];
        assert!(version_as_of(&history, t(-1)).is_none());
        assert_eq!(version_as_of(&history, t(0)).unwrap().surrogate_key, SurrogateKey(1));
        assert_eq!(version_as_of(&history, t(9)).unwrap().surrogate_key, SurrogateKey(1));
        assert_eq!(version_as_of(&history, t(10)).unwrap().surrogate_key, SurrogateKey(2));
    }

    #[test]
    fn test_open_ended_sentinel() {
        assert_eq!(open_ended().to_rfc3339(), "9999-12-31T23:59:59+00:00");
    }

    #[test]
    fn test_open_valid_to_exported_as_sentinel() {
        let current = version(1, "U1", 0);
        let json = serde_json::to_value(&current).unwrap();
        assert_eq!(json["valid_to"], "9999-12-31T23:59:59Z");

        let parsed: IdentityMapVersion = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.valid_to, None);
        assert_eq!(parsed, current);

        let closed = current.closed_at(t(10));
        let json = serde_json::to_value(&closed).unwrap();
        assert_eq!(json["valid_to"], serde_json::to_value(t(10)).unwrap());
        let parsed: IdentityMapVersion = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.valid_to, Some(t(10)));
    }

    #[test]
    fn test_identity_hash_tracks_canonical_only() {
        let a = version(1, "U1", 0);
        let b = version(2, "U1", 50);
        let c = version(3, "U2", 0);
        assert_eq!(a.change_hash, b.change_hash);
        assert_ne!(a.change_hash, c.change_hash);
    }
}
