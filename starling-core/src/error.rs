//! Error types for Starling operations

use crate::identity::Timestamp;
use crate::records::RecordRef;
use crate::scd2::{IntervalViolationKind, Scd2Table};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Per-record errors. These never abort a batch: the record is skipped and
/// returned to the caller alongside the partial commit.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordError {
    #[error("Malformed input in {record}: {reason}")]
    MalformedInput { record: RecordRef, reason: String },

    #[error(
        "Late-arriving fact for {natural_key} observed at {observed_at} precedes committed history starting {committed_from}"
    )]
    LateArrivingConflict {
        natural_key: String,
        observed_at: Timestamp,
        committed_from: Timestamp,
    },

    #[error("Unresolved identity for {record}: no login or device id present")]
    UnresolvedIdentity { record: RecordRef },
}

impl RecordError {
    /// `key` is a natural key for `user_identity_map` or a canonical id for
    /// `dim_user`.
    pub fn late_arriving(
        key: &impl fmt::Display,
        observed_at: Timestamp,
        committed_from: Timestamp,
    ) -> Self {
        RecordError::LateArrivingConflict {
            natural_key: key.to_string(),
            observed_at,
            committed_from,
        }
    }
}

/// SCD2 post-condition failures. These indicate an engine bug rather than
/// bad data; the affected key's update is never committed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityError {
    #[error("Interval integrity violation in {table} for {key}: {violation}")]
    IntervalViolation {
        table: Scd2Table,
        key: String,
        violation: IntervalViolationKind,
    },
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    #[error("Concurrent modification of {table} key {key}")]
    ConcurrentModification { table: Scd2Table, key: String },

    #[error("Insert failed for {table}: {reason}")]
    InsertFailed { table: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all Starling errors.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum StarlingError {
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Starling operations.
pub type StarlingResult<T> = Result<T, StarlingError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LoginUserId, NaturalKey, PaymentId, SurrogateKey};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_malformed_input_display() {
        let err = RecordError::MalformedInput {
            record: RecordRef::Payment {
                payment_id: PaymentId::new("P1"),
            },
            reason: "negative amount".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("payment P1"));
        assert!(msg.contains("negative amount"));
    }

    #[test]
    fn test_late_arriving_display() {
        let err = RecordError::late_arriving(
            &NaturalKey::Login(LoginUserId::new("L1")),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        );
        let msg = err.to_string();
        assert!(msg.contains("Late-arriving"));
        assert!(msg.contains("login:L1"));
        assert!(msg.contains("2024-02-01"));
    }

    #[test]
    fn test_integrity_error_display() {
        let err = IntegrityError::IntervalViolation {
            table: Scd2Table::DimUser,
            key: "U1".to_string(),
            violation: IntervalViolationKind::Overlap {
                earlier: SurrogateKey(1),
                later: SurrogateKey(2),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("dim_user"));
        assert!(msg.contains("U1"));
        assert!(msg.contains("overlap"));
    }

    #[test]
    fn test_starling_error_from_variants() {
        let storage = StarlingError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, StarlingError::Storage(_)));

        let record = StarlingError::from(RecordError::UnresolvedIdentity {
            record: RecordRef::Session {
                session_id: "S1".into(),
            },
        });
        assert!(matches!(record, StarlingError::Record(_)));

        let config = StarlingError::from(ConfigError::IncompatibleOptions {
            option_a: "a".to_string(),
            option_b: "b".to_string(),
        });
        assert!(matches!(config, StarlingError::Config(_)));
    }

    #[test]
    fn test_storage_error_display_lock_poisoned() {
        let msg = StorageError::LockPoisoned.to_string();
        assert!(msg.contains("lock poisoned"));
    }
}
