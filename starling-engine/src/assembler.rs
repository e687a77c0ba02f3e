//! Fact assembly.
//!
//! Joins deduplicated staging records to resolved identities, netted payments
//! and dimension surrogate keys. Everything here is read from one
//! [`DimensionSnapshot`], so a run never mixes dimension states.

use crate::dedupe::{dedupe_appointments, dedupe_sessions};
use crate::netting::{NetPosition, NettingLedger};
use crate::resolver::IdentityResolver;
use serde::{Deserialize, Serialize};
use starling_core::{
    AppointmentId, AppointmentRecord, CanonicalUserId, EngineConfig, FactAppointment,
    FactPayment, FactSession, PaymentRecord, RecordError, RecordRef, SessionRecord,
    StarlingError, StarlingResult, SurrogateKey,
};
use starling_storage::DimensionSnapshot;
use std::collections::BTreeMap;

/// Fact rows produced by one assembly run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSet {
    pub fact_session: Vec<FactSession>,
    pub fact_appointment: Vec<FactAppointment>,
    pub fact_payment: Vec<FactPayment>,
    /// Records that produced no fact row.
    pub rejected: Vec<RecordError>,
}

/// Build fact rows from staging records against `snapshot`.
///
/// Sessions resolve identity at `updated_at`, appointments at `booked_at`, and
/// payments inherit their appointment's identity. Payments whose appointment
/// has no fact row are kept without a user so the orphan check can report
/// them.
pub fn assemble(
    snapshot: &DimensionSnapshot,
    config: &EngineConfig,
    sessions: &[SessionRecord],
    appointments: &[AppointmentRecord],
    payments: &[PaymentRecord],
) -> StarlingResult<FactSet> {
    let resolver = IdentityResolver::new(snapshot, config);
    let mut facts = FactSet::default();

    // === Sessions ===
    for session in dedupe_sessions(sessions.iter().cloned()) {
        let record = RecordRef::Session {
            session_id: session.session_id.clone(),
        };
        if session.session_id.is_blank() {
            facts.rejected.push(malformed(record, "blank session_id"));
            continue;
        }
        let Some(canonical) = recover(
            resolver.resolve_for(
                record,
                session.login_user_id.as_ref(),
                session.device_id.as_ref(),
                session.updated_at,
            ),
            &mut facts.rejected,
        )?
        else {
            continue;
        };
        let user_key = resolver.resolve_user_key(&canonical, session.updated_at)?;

        facts.fact_session.push(FactSession {
            session_id: session.session_id,
            canonical_user_id: canonical,
            user_key,
            channel: session.channel,
            started_at: session.started_at,
            updated_at: session.updated_at,
            page_views: session.page_views,
        });
    }

    // === Payments ===
    let mut ledger = NettingLedger::new();
    facts
        .rejected
        .extend(ledger.absorb(payments.iter().cloned()));
    let positions = ledger.positions();

    // === Appointments ===
    let mut owners: BTreeMap<AppointmentId, (CanonicalUserId, Option<SurrogateKey>)> =
        BTreeMap::new();

    for appointment in dedupe_appointments(appointments.iter().cloned()) {
        let record = RecordRef::Appointment {
            appointment_id: appointment.appointment_id.clone(),
        };
        if appointment.appointment_id.is_blank() {
            facts.rejected.push(malformed(record, "blank appointment_id"));
            continue;
        }
        let Some(canonical) = recover(
            resolver.resolve_for(
                record,
                appointment.login_user_id.as_ref(),
                appointment.device_id.as_ref(),
                appointment.booked_at,
            ),
            &mut facts.rejected,
        )?
        else {
            continue;
        };
        let user_key = resolver.resolve_user_key(&canonical, appointment.booked_at)?;

        let provider_id = appointment.provider_id.filter(|id| !id.is_blank());
        let provider_key = provider_id
            .as_ref()
            .and_then(|id| snapshot.provider(id))
            .map(|p| p.provider_key);
        let insurance_plan_id = appointment.insurance_plan_id.filter(|id| !id.is_blank());
        let insurance_plan_key = insurance_plan_id
            .as_ref()
            .and_then(|id| snapshot.insurance_plan(id))
            .map(|p| p.insurance_plan_key);

        let position: NetPosition = positions
            .get(&appointment.appointment_id)
            .copied()
            .unwrap_or_default();

        owners.insert(
            appointment.appointment_id.clone(),
            (canonical.clone(), user_key),
        );
        facts.fact_appointment.push(FactAppointment {
            appointment_id: appointment.appointment_id,
            canonical_user_id: canonical,
            user_key,
            provider_id,
            provider_key,
            insurance_plan_id,
            insurance_plan_key,
            status: appointment.status,
            booked_at: appointment.booked_at,
            gross_paid: position.gross_paid,
            gross_reversed: position.gross_reversed,
            net_amount: position.net_amount,
            payment_count: position.payment_count,
        });
    }

    for payment in ledger.payments() {
        let owner = owners.get(&payment.appointment_id);
        facts.fact_payment.push(FactPayment {
            payment_id: payment.payment_id.clone(),
            appointment_id: payment.appointment_id.clone(),
            canonical_user_id: owner.map(|(canonical, _)| canonical.clone()),
            user_key: owner.and_then(|(_, key)| *key),
            status: payment.status,
            amount: payment.amount,
            signed_amount: payment.signed_amount(),
            event_at: payment.event_at,
        });
    }

    tracing::info!(
        sessions = facts.fact_session.len(),
        appointments = facts.fact_appointment.len(),
        payments = facts.fact_payment.len(),
        rejected = facts.rejected.len(),
        "Facts assembled"
    );

    Ok(facts)
}

fn malformed(record: RecordRef, reason: &str) -> RecordError {
    tracing::warn!(record = %record, reason, "Record rejected");
    RecordError::MalformedInput {
        record,
        reason: reason.to_string(),
    }
}

/// Turn a per-record resolution failure into a rejection; storage failures
/// still propagate.
fn recover<T>(
    result: StarlingResult<T>,
    rejected: &mut Vec<RecordError>,
) -> StarlingResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StarlingError::Record(error)) => {
            tracing::warn!(error = %error, "Record rejected");
            rejected.push(error);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// TESTS
// ============================================================================
