//! Typed staging records consumed by the engine.
//!
//! These arrive already cleaned by the staging normalizer. They are inputs
//! only: the engine never mutates a record after ingestion.

use crate::identity::{
    AppointmentId, BatchId, CanonicalUserId, ChangeHash, ChangeHasher, DeviceId,
    InsurancePlanId, LoginUserId, NaturalKey, PaymentId, ProviderId, SessionId, Timestamp,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// IDENTITY FACTS
// ============================================================================

/// Descriptive attributes tracked by `dim_user`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAttributes {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub home_region: Option<String>,
}

impl UserAttributes {
    pub fn change_hash(&self) -> ChangeHash {
        ChangeHasher::new()
            .field(self.display_name.as_deref())
            .field(self.email.as_deref())
            .field(self.home_region.as_deref())
            .finish()
    }
}

/// One observed identity mapping event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityFact {
    pub login_user_id: Option<LoginUserId>,
    pub device_id: Option<DeviceId>,
    pub canonical_user_id_hint: Option<CanonicalUserId>,
    #[serde(default)]
    pub attributes: Option<UserAttributes>,
    pub observed_at: Timestamp,
    pub source_batch_id: BatchId,
}

impl IdentityFact {
    /// Present, non-blank login id.
    pub fn login(&self) -> Option<&LoginUserId> {
        self.login_user_id.as_ref().filter(|id| !id.is_blank())
    }

    /// Present, non-blank device id.
    pub fn device(&self) -> Option<&DeviceId> {
        self.device_id.as_ref().filter(|id| !id.is_blank())
    }

    pub fn hint(&self) -> Option<&CanonicalUserId> {
        self.canonical_user_id_hint
            .as_ref()
            .filter(|id| !id.is_blank())
    }

    /// Natural keys this fact contributes to, login first.
    pub fn natural_keys(&self) -> Vec<NaturalKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(login) = self.login() {
            keys.push(NaturalKey::Login(login.clone()));
        }
        if let Some(device) = self.device() {
            keys.push(NaturalKey::Device(device.clone()));
        }
        keys
    }
}

// ============================================================================
// SESSIONS & APPOINTMENTS
// ============================================================================

/// Browsing session row. Sessions are re-emitted as they progress, so the
/// same `session_id` appears many times with increasing `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub login_user_id: Option<LoginUserId>,
    pub device_id: Option<DeviceId>,
    pub channel: String,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
    pub page_views: u32,
}

/// Lifecycle status of an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Booked,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, StatusParseError> {
        match s.trim().to_lowercase().as_str() {
            "booked" | "scheduled" => Ok(AppointmentStatus::Booked),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            "no_show" | "noshow" => Ok(AppointmentStatus::NoShow),
            _ => Err(StatusParseError {
                kind: "appointment status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRecord {
    pub appointment_id: AppointmentId,
    pub login_user_id: Option<LoginUserId>,
    pub device_id: Option<DeviceId>,
    pub provider_id: Option<ProviderId>,
    pub insurance_plan_id: Option<InsurancePlanId>,
    pub status: AppointmentStatus,
    pub booked_at: Timestamp,
    pub updated_at: Timestamp,
}

// ============================================================================
// PAYMENTS
// ============================================================================

/// Payment event status. Reversals carry a positive amount that nets negative.
///
/// Declaration order is lifecycle order; deduplication relies on it to pick
/// the later state of a payment when two rows share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Refunded,
    Chargeback,
}

impl PaymentStatus {
    /// Refunds and chargebacks subtract from the net.
    pub fn is_reversal(&self) -> bool {
        matches!(self, PaymentStatus::Refunded | PaymentStatus::Chargeback)
    }

    pub fn signed(&self, amount: Decimal) -> Decimal {
        if self.is_reversal() {
            -amount
        } else {
            amount
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Chargeback => "chargeback",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, StatusParseError> {
        match s.trim().to_lowercase().as_str() {
            "paid" | "captured" | "settled" => Ok(PaymentStatus::Paid),
            "refunded" | "refund" => Ok(PaymentStatus::Refunded),
            "chargeback" | "charged_back" => Ok(PaymentStatus::Chargeback),
            _ => Err(StatusParseError {
                kind: "payment status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: PaymentId,
    pub appointment_id: AppointmentId,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub event_at: Timestamp,
}

impl PaymentRecord {
    pub fn signed_amount(&self) -> Decimal {
        self.status.signed(self.amount)
    }
}

/// Error when parsing a status string from staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for StatusParseError {}

// ============================================================================
// TYPE-1 DIMENSION SOURCES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub provider_id: ProviderId,
    pub name: String,
    pub specialty: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsurancePlanRecord {
    pub insurance_plan_id: InsurancePlanId,
    pub payer_name: String,
    pub plan_type: Option<String>,
}

// ============================================================================
// RECORD REFERENCES
// ============================================================================

/// Points back at the input record an error is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum RecordRef {
    IdentityFact { batch_id: BatchId, index: usize },
    Session { session_id: SessionId },
    Appointment { appointment_id: AppointmentId },
    Payment { payment_id: PaymentId },
    Provider { provider_id: ProviderId },
    InsurancePlan { insurance_plan_id: InsurancePlanId },
    /// A direct resolver call not tied to a staging record.
    Lookup { as_of: Timestamp },
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRef::IdentityFact { batch_id, index } => {
                write!(f, "identity fact #{} of batch {}", index, batch_id)
            }
            RecordRef::Session { session_id } => write!(f, "session {}", session_id),
            RecordRef::Appointment { appointment_id } => {
                write!(f, "appointment {}", appointment_id)
            }
            RecordRef::Payment { payment_id } => write!(f, "payment {}", payment_id),
            RecordRef::Provider { provider_id } => write!(f, "provider {}", provider_id),
            RecordRef::InsurancePlan { insurance_plan_id } => {
                write!(f, "insurance plan {}", insurance_plan_id)
            }
            RecordRef::Lookup { as_of } => write!(f, "lookup as of {}", as_of),
        }
    }
}
