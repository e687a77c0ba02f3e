//! Star schema output rows: type-1 dimensions and fact tables.
//!
//! Facts are derived data. They can always be rebuilt from staging records
//! plus dimension state, so none of these rows is a source of truth.

use crate::identity::{
    AppointmentId, CanonicalUserId, InsurancePlanId, PaymentId, ProviderId, SessionId,
    SurrogateKey, Timestamp,
};
use crate::records::{AppointmentStatus, PaymentStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// `dim_provider` row (type 1: overwritten in place, key stable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimProvider {
    pub provider_key: SurrogateKey,
    pub provider_id: ProviderId,
    pub name: String,
    pub specialty: Option<String>,
}

/// `dim_insurance_plan` row (type 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimInsurancePlan {
    pub insurance_plan_key: SurrogateKey,
    pub insurance_plan_id: InsurancePlanId,
    pub payer_name: String,
    pub plan_type: Option<String>,
}

/// `fact_session` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSession {
    pub session_id: SessionId,
    pub canonical_user_id: CanonicalUserId,
    /// `dim_user` version valid when the session was last updated.
    pub user_key: Option<SurrogateKey>,
    pub channel: String,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
    pub page_views: u32,
}

/// `fact_appointment` row. Unique per `appointment_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactAppointment {
    pub appointment_id: AppointmentId,
    pub canonical_user_id: CanonicalUserId,
    pub user_key: Option<SurrogateKey>,
    pub provider_id: Option<ProviderId>,
    pub provider_key: Option<SurrogateKey>,
    pub insurance_plan_id: Option<InsurancePlanId>,
    pub insurance_plan_key: Option<SurrogateKey>,
    pub status: AppointmentStatus,
    pub booked_at: Timestamp,
    pub gross_paid: Decimal,
    pub gross_reversed: Decimal,
    pub net_amount: Decimal,
    pub payment_count: usize,
}

/// `fact_payment` row, one per distinct `payment_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactPayment {
    pub payment_id: PaymentId,
    pub appointment_id: AppointmentId,
    /// Inherited from the appointment; `None` when the appointment is unknown.
    pub canonical_user_id: Option<CanonicalUserId>,
    pub user_key: Option<SurrogateKey>,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub signed_amount: Decimal,
    pub event_at: Timestamp,
}
