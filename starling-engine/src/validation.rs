//! Validation self-checks.
//!
//! Three result sets the engine can produce on demand from a dimension
//! snapshot and the fact rows assembled against it: SCD2 interval violations,
//! orphaned fact-to-dimension references, and netting discrepancies. A clean
//! run produces three empty sets.

use crate::assembler::FactSet;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use starling_core::{
    history_violations, AppointmentId, EngineConfig, IntervalViolationKind, RecordRef,
    Scd2Table, SurrogateKey, Versioned,
};
use starling_storage::DimensionSnapshot;
use std::collections::{BTreeMap, HashSet};

// ============================================================================
// INTERVAL VIOLATIONS
// ============================================================================

/// One broken SCD2 history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalViolation {
    pub table: Scd2Table,
    pub key: String,
    pub violation: IntervalViolationKind,
}

/// Overlap, current-version and open-end violations across both SCD2 tables.
pub fn interval_violations(snapshot: &DimensionSnapshot) -> Vec<IntervalViolation> {
    let mut found = Vec::new();
    collect_violations(&snapshot.identity_map, &mut found);
    collect_violations(&snapshot.dim_user, &mut found);
    found
}

fn collect_violations<V: Versioned>(
    table: &BTreeMap<V::Key, Vec<V>>,
    found: &mut Vec<IntervalViolation>,
) {
    for (key, history) in table {
        for violation in history_violations(history) {
            found.push(IntervalViolation {
                table: V::TABLE,
                key: key.to_string(),
                violation,
            });
        }
    }
}

// ============================================================================
// ORPHANED REFERENCES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactTable {
    FactSession,
    FactAppointment,
    FactPayment,
}

/// What a fact row points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceTarget {
    DimUser,
    DimProvider,
    DimInsurancePlan,
    FactAppointment,
}

/// A fact row referencing something that is not there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedReference {
    pub fact_table: FactTable,
    pub record: RecordRef,
    pub target: ReferenceTarget,
    /// The dangling key or id, rendered.
    pub reference: String,
}

/// Fact rows whose dimension keys are missing from `snapshot`, and payment
/// facts whose appointment has no fact row.
///
/// A `None` user key is not an orphan: it marks a user with no `dim_user`
/// version at the event time. A natural provider or plan id without a
/// surrogate key is, since the dimension never saw that id.
pub fn orphaned_references(
    snapshot: &DimensionSnapshot,
    facts: &FactSet,
) -> Vec<OrphanedReference> {
    let user_keys = snapshot.user_keys();
    let provider_keys = snapshot.provider_keys();
    let plan_keys = snapshot.insurance_plan_keys();
    let appointments: HashSet<&AppointmentId> = facts
        .fact_appointment
        .iter()
        .map(|a| &a.appointment_id)
        .collect();

    let mut orphans = Vec::new();

    for session in &facts.fact_session {
        let record = RecordRef::Session {
            session_id: session.session_id.clone(),
        };
        if let Some(key) = dangling(session.user_key, &user_keys) {
            orphans.push(OrphanedReference {
                fact_table: FactTable::FactSession,
                record,
                target: ReferenceTarget::DimUser,
                reference: key.to_string(),
            });
        }
    }

    for appointment in &facts.fact_appointment {
        let record = || RecordRef::Appointment {
            appointment_id: appointment.appointment_id.clone(),
        };
        let mut orphan = |target, reference: String| {
            orphans.push(OrphanedReference {
                fact_table: FactTable::FactAppointment,
                record: record(),
                target,
                reference,
            })
        };

        if let Some(key) = dangling(appointment.user_key, &user_keys) {
            orphan(ReferenceTarget::DimUser, key.to_string());
        }
        match (&appointment.provider_id, appointment.provider_key) {
            (_, Some(key)) if !provider_keys.contains(&key) => {
                orphan(ReferenceTarget::DimProvider, key.to_string())
            }
            (Some(id), None) => orphan(ReferenceTarget::DimProvider, id.to_string()),
            _ => {}
        }
        match (&appointment.insurance_plan_id, appointment.insurance_plan_key) {
            (_, Some(key)) if !plan_keys.contains(&key) => {
                orphan(ReferenceTarget::DimInsurancePlan, key.to_string())
            }
            (Some(id), None) => orphan(ReferenceTarget::DimInsurancePlan, id.to_string()),
            _ => {}
        }
    }

    for payment in &facts.fact_payment {
        let record = || RecordRef::Payment {
            payment_id: payment.payment_id.clone(),
        };
        if !appointments.contains(&payment.appointment_id) {
            orphans.push(OrphanedReference {
                fact_table: FactTable::FactPayment,
                record: record(),
                target: ReferenceTarget::FactAppointment,
                reference: payment.appointment_id.to_string(),
            });
        }
        if let Some(key) = dangling(payment.user_key, &user_keys) {
            orphans.push(OrphanedReference {
                fact_table: FactTable::FactPayment,
                record: record(),
                target: ReferenceTarget::DimUser,
                reference: key.to_string(),
            });
        }
    }

    orphans
}

fn dangling(key: Option<SurrogateKey>, known: &HashSet<SurrogateKey>) -> Option<SurrogateKey> {
    key.filter(|k| !known.contains(k))
}

// ============================================================================
// NETTING DISCREPANCIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Recorded net differs from the sum of signed payment facts.
    NetMismatch,
    /// `gross_paid - gross_reversed` differs from the recorded net.
    GrossMismatch,
    /// More was reversed than paid.
    OverRefunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NettingDiscrepancy {
    pub appointment_id: AppointmentId,
    pub kind: DiscrepancyKind,
    pub recorded_net: Decimal,
    /// The value `recorded_net` was checked against.
    pub expected: Decimal,
}

/// Appointments whose netted amounts do not reconcile within `tolerance`.
pub fn netting_discrepancies(facts: &FactSet, tolerance: Decimal) -> Vec<NettingDiscrepancy> {
    let payment_sums: BTreeMap<&AppointmentId, Decimal> =
        facts
            .fact_payment
            .iter()
            .fold(BTreeMap::new(), |mut sums, payment| {
                *sums.entry(&payment.appointment_id).or_default() += payment.signed_amount;
                sums
            });

    let mut found = Vec::new();
    for appointment in &facts.fact_appointment {
        let recorded_net = appointment.net_amount;
        let mut flag = |kind, expected: Decimal| {
            found.push(NettingDiscrepancy {
                appointment_id: appointment.appointment_id.clone(),
                kind,
                recorded_net,
                expected,
            })
        };

        let payment_sum = payment_sums
            .get(&appointment.appointment_id)
            .copied()
            .unwrap_or_default();
        if (recorded_net - payment_sum).abs() > tolerance {
            flag(DiscrepancyKind::NetMismatch, payment_sum);
        }

        let gross_net = appointment.gross_paid - appointment.gross_reversed;
        if (recorded_net - gross_net).abs() > tolerance {
            flag(DiscrepancyKind::GrossMismatch, gross_net);
        }

        if recorded_net < -tolerance {
            flag(DiscrepancyKind::OverRefunded, Decimal::ZERO);
        }
    }
    found
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub interval_violations: Vec<IntervalViolation>,
    pub orphaned_references: Vec<OrphanedReference>,
    pub netting_discrepancies: Vec<NettingDiscrepancy>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.interval_violations.is_empty()
            && self.orphaned_references.is_empty()
            && self.netting_discrepancies.is_empty()
    }
}

/// Run all three self-checks.
pub fn validate(
    snapshot: &DimensionSnapshot,
    facts: &FactSet,
    config: &EngineConfig,
) -> ValidationReport {
    let report = ValidationReport {
        interval_violations: interval_violations(snapshot),
        orphaned_references: orphaned_references(snapshot, facts),
        netting_discrepancies: netting_discrepancies(facts, config.netting_tolerance),
    };

    if report.is_clean() {
        tracing::info!("Validation clean");
    } else {
        for violation in &report.interval_violations {
            tracing::error!(
                table = %violation.table,
                key = %violation.key,
                violation = %violation.violation,
                "SCD2 interval violation"
            );
        }
        tracing::warn!(
            interval_violations = report.interval_violations.len(),
            orphaned_references = report.orphaned_references.len(),
            netting_discrepancies = report.netting_discrepancies.len(),
            "Validation found problems"
        );
    }

    report
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use starling_core::{
        new_batch_id, CanonicalUserId, DimProvider, FactAppointment, FactPayment,
        FactSession, IdentityMapVersion, LoginUserId, NaturalKey, PaymentId, PaymentStatus,
        ProviderId, SessionId,
    };
    use starling_test_utils::{at, dec};

    fn appointment_fact(id: &str, paid: i64, reversed: i64) -> FactAppointment {
        FactAppointment {
            appointment_id: AppointmentId::new(id),
            canonical_user_id: CanonicalUserId::new("U1"),
            user_key: None,
            provider_id: None,
            provider_key: None,
            insurance_plan_id: None,
            insurance_plan_key: None,
            status: starling_core::AppointmentStatus::Completed,
            booked_at: at(0),
            gross_paid: dec(paid),
            gross_reversed: dec(reversed),
            net_amount: dec(paid - reversed),
            payment_count: 0,
        }
    }

    fn payment_fact(id: &str, appointment: &str, amount: i64, status: PaymentStatus) -> FactPayment {
        FactPayment {
            payment_id: PaymentId::new(id),
            appointment_id: AppointmentId::new(appointment),
            canonical_user_id: Some(CanonicalUserId::new("U1")),
            user_key: None,
            status,
            amount: dec(amount),
            signed_amount: status.signed(dec(amount)),
            event_at: at(0),
        }
    }

    #[test]
    fn test_clean_report() {
        let facts = FactSet {
            fact_appointment: vec![appointment_fact("A1", 50, 50)],
            fact_payment: vec![
                payment_fact("P1", "A1", 50, PaymentStatus::Paid),
                payment_fact("P2", "A1", 50, PaymentStatus::Refunded),
            ],
            ..FactSet::default()
        };
        let report = validate(
            &DimensionSnapshot::default(),
            &facts,
            &EngineConfig::default(),
        );
        assert!(report.is_clean(), "{:?}", report);
    }

    #[test]
    fn test_overlapping_versions_reported() {
        let key = NaturalKey::Login(LoginUserId::new("L1"));
        let mut first = IdentityMapVersion::open(
            SurrogateKey(1),
            key.clone(),
            CanonicalUserId::new("U1"),
            at(0),
            new_batch_id(),
        );
        first.is_current = false;
        first.valid_to = Some(at(20));
        let second = IdentityMapVersion::open(
            SurrogateKey(2),
            key.clone(),
            CanonicalUserId::new("U2"),
            at(10),
            new_batch_id(),
        );

        let mut snapshot = DimensionSnapshot::default();
        snapshot.identity_map.insert(key, vec![first, second]);

        let violations = interval_violations(&snapshot);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].table, Scd2Table::UserIdentityMap);
        assert_eq!(violations[0].key, "login:L1");
        assert!(matches!(
            violations[0].violation,
            IntervalViolationKind::Overlap { .. }
        ));
    }

    #[test]
    fn test_orphaned_references_reported() {
        let mut snapshot = DimensionSnapshot::default();
        snapshot.providers.insert(
            ProviderId::new("PRV1"),
            DimProvider {
                provider_key: SurrogateKey(7),
                provider_id: ProviderId::new("PRV1"),
                name: "Dr. A".to_string(),
                specialty: None,
            },
        );

        let mut known_provider = appointment_fact("A1", 0, 0);
        known_provider.provider_id = Some(ProviderId::new("PRV1"));
        known_provider.provider_key = Some(SurrogateKey(7));

        let mut unknown_provider = appointment_fact("A2", 0, 0);
        unknown_provider.provider_id = Some(ProviderId::new("PRV9"));

        let facts = FactSet {
            fact_session: vec![FactSession {
                session_id: SessionId::new("S1"),
                canonical_user_id: CanonicalUserId::new("U1"),
                user_key: Some(SurrogateKey(99)),
                channel: "web".to_string(),
                started_at: at(0),
                updated_at: at(0),
                page_views: 1,
            }],
            fact_appointment: vec![known_provider, unknown_provider],
            fact_payment: vec![payment_fact("P1", "A404", 0, PaymentStatus::Paid)],
            ..FactSet::default()
        };

        let orphans = orphaned_references(&snapshot, &facts);
        let targets: Vec<(FactTable, ReferenceTarget, &str)> = orphans
            .iter()
            .map(|o| (o.fact_table, o.target, o.reference.as_str()))
            .collect();
        assert_eq!(
            targets,
            vec![
                (FactTable::FactSession, ReferenceTarget::DimUser, "99"),
                (FactTable::FactAppointment, ReferenceTarget::DimProvider, "PRV9"),
                (FactTable::FactPayment, ReferenceTarget::FactAppointment, "A404"),
            ]
        );
    }

    #[test]
    fn test_net_mismatch_and_over_refund() {
        let mut tampered = appointment_fact("A1", 50, 0);
        tampered.net_amount = dec(40);
        let over = appointment_fact("A2", 10, 30);

        let facts = FactSet {
            fact_appointment: vec![tampered, over],
            fact_payment: vec![
                payment_fact("P1", "A1", 50, PaymentStatus::Paid),
                payment_fact("P2", "A2", 10, PaymentStatus::Paid),
                payment_fact("P3", "A2", 30, PaymentStatus::Chargeback),
            ],
            ..FactSet::default()
        };

        let found = netting_discrepancies(&facts, Decimal::ZERO);
        let kinds: Vec<(&str, DiscrepancyKind)> = found
            .iter()
            .map(|d| (d.appointment_id.as_str(), d.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("A1", DiscrepancyKind::NetMismatch),
                ("A1", DiscrepancyKind::GrossMismatch),
                ("A2", DiscrepancyKind::OverRefunded),
            ]
        );
        assert_eq!(found[0].expected, dec(50));
    }

    #[test]
    fn test_report_serializes_for_export() {
        let report = ValidationReport {
            netting_discrepancies: vec![NettingDiscrepancy {
                appointment_id: AppointmentId::new("A1"),
                kind: DiscrepancyKind::OverRefunded,
                recorded_net: dec(-20),
                expected: Decimal::ZERO,
            }],
            ..ValidationReport::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["netting_discrepancies"][0]["kind"], "over_refunded");
        assert_eq!(json["netting_discrepancies"][0]["appointment_id"], "A1");
        assert!(json["interval_violations"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_tolerance_absorbs_small_differences() {
        let mut off_by_cent = appointment_fact("A1", 50, 0);
        off_by_cent.net_amount = Decimal::new(5001, 2);
        off_by_cent.gross_paid = Decimal::new(5001, 2);
        let facts = FactSet {
            fact_appointment: vec![off_by_cent],
            fact_payment: vec![payment_fact("P1", "A1", 50, PaymentStatus::Paid)],
            ..FactSet::default()
        };

        assert_eq!(netting_discrepancies(&facts, Decimal::ZERO).len(), 1);
        assert!(netting_discrepancies(&facts, Decimal::new(1, 2)).is_empty());
    }
}
