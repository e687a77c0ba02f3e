//! Latest-wins deduplication.
//!
//! Every dedupe is a single fold into a `key -> best candidate` map. The
//! result is sorted by key, and for a given input multiset it never depends on
//! the physical order of the input beyond the documented tie-break.

use rust_decimal::Decimal;
use starling_core::{
    AppointmentId, AppointmentRecord, PaymentRecord, PaymentStatus, SessionRecord, Timestamp,
};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Keep one record per `key`: the one with the greatest `order`.
///
/// Ties on `order` go to the record that appears later in the input.
pub fn dedupe<R, K, O>(
    records: impl IntoIterator<Item = R>,
    key: impl Fn(&R) -> K,
    order: impl Fn(&R) -> O,
) -> Vec<R>
where
    K: Ord,
    O: Ord,
{
    records
        .into_iter()
        .fold(BTreeMap::<K, (O, R)>::new(), |mut best, record| {
            let rank = order(&record);
            match best.entry(key(&record)) {
                Entry::Vacant(slot) => {
                    slot.insert((rank, record));
                }
                Entry::Occupied(mut slot) => {
                    if rank >= slot.get().0 {
                        slot.insert((rank, record));
                    }
                }
            }
            best
        })
        .into_values()
        .map(|(_, record)| record)
        .collect()
}

/// One row per `session_id`, the latest `updated_at`.
pub fn dedupe_sessions(records: impl IntoIterator<Item = SessionRecord>) -> Vec<SessionRecord> {
    dedupe(records, |s| s.session_id.clone(), |s| s.updated_at)
}

/// One row per `appointment_id`, the latest `updated_at`.
pub fn dedupe_appointments(
    records: impl IntoIterator<Item = AppointmentRecord>,
) -> Vec<AppointmentRecord> {
    dedupe(records, |a| a.appointment_id.clone(), |a| a.updated_at)
}

/// Rank of a payment row among rows sharing its `payment_id`.
///
/// A total order over every field besides the key, so replaying the same rows
/// in any order keeps the same survivor.
pub fn payment_order(p: &PaymentRecord) -> (Timestamp, PaymentStatus, Decimal, AppointmentId) {
    (p.event_at, p.status, p.amount, p.appointment_id.clone())
}

/// One row per `payment_id`.
pub fn dedupe_payments(records: impl IntoIterator<Item = PaymentRecord>) -> Vec<PaymentRecord> {
    dedupe(records, |p| p.payment_id.clone(), payment_order)
}

// ============================================================================
// TESTS
// ============================================================================
