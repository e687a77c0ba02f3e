//! Starling Core - Record and Dimension Types
//!
//! Pure data structures shared by every Starling crate: identifiers, staging
//! records, SCD2 version rows, fact rows, the error taxonomy, and engine
//! configuration. Merge, resolution, and netting logic lives in
//! `starling-engine`; dimension state lives behind `starling-storage`.

pub mod config;
pub mod error;
pub mod facts;
pub mod identity;
pub mod records;
pub mod scd2;

pub use config::EngineConfig;
pub use error::{
    ConfigError, IntegrityError, RecordError, StarlingError, StarlingResult, StorageError,
};
pub use facts::{DimInsurancePlan, DimProvider, FactAppointment, FactPayment, FactSession};
pub use identity::{
    digest_hex, new_batch_id, AppointmentId, BatchId, CanonicalUserId, ChangeHash, ChangeHasher,
    DeviceId, InsurancePlanId, LoginUserId, NaturalKey, PaymentId, ProviderId, SessionId,
    SurrogateKey, Timestamp,
};
pub use records::{
    AppointmentRecord, AppointmentStatus, IdentityFact, InsurancePlanRecord, PaymentRecord,
    PaymentStatus, ProviderRecord, RecordRef, SessionRecord, StatusParseError, UserAttributes,
};
pub use scd2::{
    history_violations, open_ended, verify_history, version_as_of, IdentityMapVersion,
    IntervalViolationKind, Scd2Table, UserDimVersion, ValidityInterval, Versioned,
};
