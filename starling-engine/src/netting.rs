//! Payment netting.
//!
//! Payments are deduplicated by `payment_id` before summing, so feeding the
//! same payment twice (or a superset of what was already netted) never
//! double-counts it. Sums use exact decimal arithmetic and do not depend on
//! input order.

use crate::dedupe::{dedupe, payment_order};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use starling_core::{AppointmentId, PaymentId, PaymentRecord, RecordError, RecordRef};
use std::collections::BTreeMap;

/// Netted payment totals for one appointment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetPosition {
    pub gross_paid: Decimal,
    pub gross_reversed: Decimal,
    pub net_amount: Decimal,
    pub payment_count: usize,
}

impl NetPosition {
    fn add(mut self, payment: &PaymentRecord) -> Self {
        if payment.status.is_reversal() {
            self.gross_reversed += payment.amount;
        } else {
            self.gross_paid += payment.amount;
        }
        self.net_amount += payment.signed_amount();
        self.payment_count += 1;
        self
    }
}

/// Result of [`net`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Netting {
    pub positions: BTreeMap<AppointmentId, NetPosition>,
    /// Payments excluded from the sums.
    pub rejected: Vec<RecordError>,
}

/// Net every appointment's payments.
pub fn net(payments: &[PaymentRecord]) -> Netting {
    let mut ledger = NettingLedger::new();
    let rejected = ledger.absorb(payments.iter().cloned());
    Netting {
        positions: ledger.positions(),
        rejected,
    }
}

/// Incremental netting state.
///
/// Absorbing batches one at a time gives the same positions as netting their
/// union in one call.
#[derive(Debug, Clone, Default)]
pub struct NettingLedger {
    payments: BTreeMap<PaymentId, PaymentRecord>,
}

impl NettingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a batch into the ledger, returning the payments rejected as
    /// malformed.
    pub fn absorb(
        &mut self,
        batch: impl IntoIterator<Item = PaymentRecord>,
    ) -> Vec<RecordError> {
        let mut rejected = Vec::new();
        let valid: Vec<PaymentRecord> = batch
            .into_iter()
            .filter(|p| match malformed(p) {
                Some(reason) => {
                    tracing::warn!(payment_id = %p.payment_id, reason, "Payment rejected");
                    rejected.push(RecordError::MalformedInput {
                        record: RecordRef::Payment {
                            payment_id: p.payment_id.clone(),
                        },
                        reason: reason.to_string(),
                    });
                    false
                }
                None => true,
            })
            .collect();

        let survivors = dedupe(
            std::mem::take(&mut self.payments).into_values().chain(valid),
            |p| p.payment_id.clone(),
            payment_order,
        );
        self.payments = survivors
            .into_iter()
            .map(|p| (p.payment_id.clone(), p))
            .collect();
        rejected
    }

    /// Distinct payments absorbed so far, ordered by `payment_id`.
    pub fn payments(&self) -> impl Iterator<Item = &PaymentRecord> {
        self.payments.values()
    }

    pub fn positions(&self) -> BTreeMap<AppointmentId, NetPosition> {
        self.payments
            .values()
            .fold(BTreeMap::new(), |mut positions, payment| {
                let slot: &mut NetPosition =
                    positions.entry(payment.appointment_id.clone()).or_default();
                *slot = slot.add(payment);
                positions
            })
    }
}

fn malformed(payment: &PaymentRecord) -> Option<&'static str> {
    if payment.payment_id.is_blank() {
        Some("blank payment_id")
    } else if payment.appointment_id.is_blank() {
        Some("blank appointment_id")
    } else if payment.amount.is_sign_negative() && !payment.amount.is_zero() {
        Some("negative amount")
    } else {
        None
    }
}

// ============================================================================
// TESTS
// ============================================================================
