//! Starling Test Utilities
//!
//! Centralized test infrastructure for the Starling workspace:
//! - Proptest generators for staging records
//! - Test fixtures for common scenarios
//! - Custom assertions for SCD2 and error validation

// Re-export the in-memory store from its source crate
pub use starling_storage::{DimensionSnapshot, DimensionStore, InMemoryDimensionStore};

// Re-export core types for convenience
pub use starling_core::{
    new_batch_id, AppointmentId, AppointmentRecord, AppointmentStatus, BatchId, CanonicalUserId,
    DeviceId, EngineConfig, IdentityFact, InsurancePlanId, InsurancePlanRecord, LoginUserId,
    NaturalKey, PaymentId, PaymentRecord, PaymentStatus, ProviderId, ProviderRecord, RecordError,
    SessionId, SessionRecord, StarlingError, StarlingResult, StorageError, Timestamp,
    UserAttributes, Versioned,
};

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;

/// Fixed origin for test timestamps: 2024-01-01T00:00:00Z.
pub const BASE_EPOCH_SECS: i64 = 1_704_067_200;

/// `BASE_EPOCH_SECS + secs` as a timestamp.
pub fn at(secs: i64) -> Timestamp {
    Utc.timestamp_opt(BASE_EPOCH_SECS + secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Whole-unit decimal amount.
pub fn dec(units: i64) -> Decimal {
    Decimal::from(units)
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Starling staging records.
    //!
    //! Identifier and timestamp pools are deliberately small so generated
    //! batches collide on keys and instants, which is where the merge and
    //! dedupe rules do their work.

    use super::*;
    use proptest::prelude::*;

    // === Identity Generators ===

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0i64..200).prop_map(|s| at(s * 60))
    }

    pub fn arb_login_user_id() -> impl Strategy<Value = LoginUserId> {
        (0u8..5).prop_map(|n| LoginUserId::new(format!("L{}", n)))
    }

    pub fn arb_device_id() -> impl Strategy<Value = DeviceId> {
        (0u8..5).prop_map(|n| DeviceId::new(format!("D{}", n)))
    }

    pub fn arb_canonical_user_id() -> impl Strategy<Value = CanonicalUserId> {
        (0u8..4).prop_map(|n| CanonicalUserId::new(format!("U{}", n)))
    }

    pub fn arb_user_attributes() -> impl Strategy<Value = UserAttributes> {
        (
            proptest::option::of(prop_oneof![Just("Ada"), Just("Grace"), Just("Edsger")]),
            proptest::option::of(prop_oneof![Just("a@example.com"), Just("b@example.com")]),
            proptest::option::of(prop_oneof![Just("EU"), Just("US")]),
        )
            .prop_map(|(name, email, region)| UserAttributes {
                display_name: name.map(str::to_string),
                email: email.map(str::to_string),
                home_region: region.map(str::to_string),
            })
    }

    /// Identity fact with at least one identifier present.
    pub fn arb_identity_fact(batch_id: BatchId) -> impl Strategy<Value = IdentityFact> {
        (
            proptest::option::of(arb_login_user_id()),
            proptest::option::of(arb_device_id()),
            proptest::option::weighted(0.3, arb_canonical_user_id()),
            proptest::option::weighted(0.5, arb_user_attributes()),
            arb_timestamp(),
        )
            .prop_filter("needs an identifier", |(login, device, ..)| {
                login.is_some() || device.is_some()
            })
            .prop_map(move |(login, device, hint, attributes, observed_at)| IdentityFact {
                login_user_id: login,
                device_id: device,
                canonical_user_id_hint: hint,
                attributes,
                observed_at,
                source_batch_id: batch_id,
            })
    }

    /// Identity fact that may also lack both identifiers.
    pub fn arb_any_identity_fact(batch_id: BatchId) -> impl Strategy<Value = IdentityFact> {
        prop_oneof![
            9 => arb_identity_fact(batch_id),
            1 => arb_timestamp().prop_map(move |observed_at| IdentityFact {
                login_user_id: None,
                device_id: None,
                canonical_user_id_hint: None,
                attributes: None,
                observed_at,
                source_batch_id: batch_id,
            }),
        ]
    }

    pub fn arb_identity_batch(max_len: usize) -> impl Strategy<Value = Vec<IdentityFact>> {
        arb_uuid_v7().prop_flat_map(move |batch_id| {
            prop::collection::vec(arb_any_identity_fact(batch_id), 0..max_len)
        })
    }

    pub fn arb_uuid_v7() -> impl Strategy<Value = BatchId> {
        Just(()).prop_map(|_| new_batch_id())
    }

    // === Session & Appointment Generators ===

    pub fn arb_session_record() -> impl Strategy<Value = SessionRecord> {
        (
            (0u8..6).prop_map(|n| SessionId::new(format!("S{}", n))),
            proptest::option::of(arb_login_user_id()),
            proptest::option::of(arb_device_id()),
            prop_oneof![Just("web"), Just("ios"), Just("android")],
            arb_timestamp(),
            0i64..3600,
            0u32..50,
        )
            .prop_map(
                |(session_id, login, device, channel, started_at, dur, page_views)| SessionRecord {
                    session_id,
                    login_user_id: login,
                    device_id: device,
                    channel: channel.to_string(),
                    started_at,
                    updated_at: started_at + chrono::Duration::seconds(dur),
                    page_views,
                },
            )
    }

    pub fn arb_appointment_status() -> impl Strategy<Value = AppointmentStatus> {
        prop_oneof![
            Just(AppointmentStatus::Booked),
            Just(AppointmentStatus::Completed),
            Just(AppointmentStatus::Cancelled),
            Just(AppointmentStatus::NoShow),
        ]
    }

    pub fn arb_appointment_record() -> impl Strategy<Value = AppointmentRecord> {
        (
            (0u8..6).prop_map(|n| AppointmentId::new(format!("A{}", n))),
            proptest::option::of(arb_login_user_id()),
            arb_device_id(),
            arb_appointment_status(),
            arb_timestamp(),
            0i64..86_400,
        )
            .prop_map(|(appointment_id, login, device, status, booked_at, later)| {
                AppointmentRecord {
                    appointment_id,
                    login_user_id: login,
                    device_id: Some(device),
                    provider_id: Some(ProviderId::new("PRV1")),
                    insurance_plan_id: None,
                    status,
                    booked_at,
                    updated_at: booked_at + chrono::Duration::seconds(later),
                }
            })
    }

    // === Payment Generators ===

    pub fn arb_payment_status() -> impl Strategy<Value = PaymentStatus> {
        prop_oneof![
            3 => Just(PaymentStatus::Paid),
            1 => Just(PaymentStatus::Refunded),
            1 => Just(PaymentStatus::Chargeback),
        ]
    }

    /// Non-negative amounts in cents.
    pub fn arb_amount() -> impl Strategy<Value = Decimal> {
        (0i64..100_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    pub fn arb_payment_record() -> impl Strategy<Value = PaymentRecord> {
        (
            (0u8..12).prop_map(|n| PaymentId::new(format!("P{}", n))),
            (0u8..6).prop_map(|n| AppointmentId::new(format!("A{}", n))),
            arb_amount(),
            arb_payment_status(),
            arb_timestamp(),
        )
            .prop_map(|(payment_id, appointment_id, amount, status, event_at)| PaymentRecord {
                payment_id,
                appointment_id,
                amount,
                status,
                event_at,
            })
    }

    /// Configuration that passes `EngineConfig::validate`.
    pub fn arb_valid_config() -> impl Strategy<Value = EngineConfig> {
        (
            prop_oneof![Just("ANON-"), Just("anon:"), Just("GUEST-")],
            prop_oneof![Just("U-"), Just("user:"), Just("CUST-")],
            (0i64..100).prop_map(|cents| Decimal::new(cents, 2)),
            1u32..8,
            any::<bool>(),
        )
            .prop_map(
                |(anonymous_prefix, canonical_prefix, tolerance, retries, verify)| EngineConfig {
                    anonymous_prefix: anonymous_prefix.to_string(),
                    canonical_prefix: canonical_prefix.to_string(),
                    netting_tolerance: tolerance,
                    max_commit_retries: retries,
                    verify_after_merge: verify,
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records for common testing scenarios.

    use super::*;

    /// Identity fact for `login`/`device` observed `secs` after the base time.
    pub fn identity_fact(login: Option<&str>, device: Option<&str>, secs: i64) -> IdentityFact {
        IdentityFact {
            login_user_id: login.map(LoginUserId::from),
            device_id: device.map(DeviceId::from),
            canonical_user_id_hint: None,
            attributes: None,
            observed_at: at(secs),
            source_batch_id: new_batch_id(),
        }
    }

    /// Identity fact carrying a canonical id hint.
    pub fn hinted_fact(
        login: Option<&str>,
        device: Option<&str>,
        canonical: &str,
        secs: i64,
    ) -> IdentityFact {
        IdentityFact {
            canonical_user_id_hint: Some(CanonicalUserId::new(canonical)),
            ..identity_fact(login, device, secs)
        }
    }

    pub fn attributes(display_name: &str, region: &str) -> UserAttributes {
        UserAttributes {
            display_name: Some(display_name.to_string()),
            email: None,
            home_region: Some(region.to_string()),
        }
    }

    pub fn session(
        session_id: &str,
        login: Option<&str>,
        device: Option<&str>,
        updated_secs: i64,
    ) -> SessionRecord {
        SessionRecord {
            session_id: SessionId::new(session_id),
            login_user_id: login.map(LoginUserId::from),
            device_id: device.map(DeviceId::from),
            channel: "web".to_string(),
            started_at: at(0),
            updated_at: at(updated_secs),
            page_views: 1,
        }
    }

    pub fn appointment(
        appointment_id: &str,
        login: Option<&str>,
        device: Option<&str>,
        booked_secs: i64,
    ) -> AppointmentRecord {
        AppointmentRecord {
            appointment_id: AppointmentId::new(appointment_id),
            login_user_id: login.map(LoginUserId::from),
            device_id: device.map(DeviceId::from),
            provider_id: None,
            insurance_plan_id: None,
            status: AppointmentStatus::Booked,
            booked_at: at(booked_secs),
            updated_at: at(booked_secs),
        }
    }

    pub fn payment(
        payment_id: &str,
        appointment_id: &str,
        amount: i64,
        status: PaymentStatus,
        secs: i64,
    ) -> PaymentRecord {
        PaymentRecord {
            payment_id: PaymentId::new(payment_id),
            appointment_id: AppointmentId::new(appointment_id),
            amount: dec(amount),
            status,
            event_at: at(secs),
        }
    }

    pub fn provider(provider_id: &str, name: &str) -> ProviderRecord {
        ProviderRecord {
            provider_id: ProviderId::new(provider_id),
            name: name.to_string(),
            specialty: None,
        }
    }

    pub fn insurance_plan(insurance_plan_id: &str, payer_name: &str) -> InsurancePlanRecord {
        InsurancePlanRecord {
            insurance_plan_id: InsurancePlanId::new(insurance_plan_id),
            payer_name: payer_name.to_string(),
            plan_type: None,
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for Starling-specific validation.

    use super::*;
    use starling_core::verify_history;

    /// Assert that a StarlingResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &StarlingResult<T>) {
        match result {
            Err(StarlingError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a StarlingResult is a ConcurrentModification storage error.
    #[track_caller]
    pub fn assert_concurrent_modification<T: std::fmt::Debug>(result: &StarlingResult<T>) {
        match result {
            Err(StarlingError::Storage(StorageError::ConcurrentModification { .. })) => {}
            other => panic!("Expected ConcurrentModification, got: {:?}", other),
        }
    }

    /// Assert that a record error is a late-arriving conflict for `natural_key`.
    #[track_caller]
    pub fn assert_late_arriving(error: &RecordError, natural_key: &str) {
        match error {
            RecordError::LateArrivingConflict {
                natural_key: key, ..
            } => assert_eq!(key, natural_key, "Wrong key in LateArrivingConflict"),
            other => panic!("Expected LateArrivingConflict, got: {:?}", other),
        }
    }

    /// Assert that one key's history satisfies every SCD2 interval invariant.
    #[track_caller]
    pub fn assert_history_valid<V: Versioned>(key: &V::Key, history: &[V]) {
        if let Err(e) = verify_history(key, history) {
            panic!("{}\nhistory: {:#?}", e, history);
        }
    }

    /// Assert that every key in both SCD2 tables is well formed.
    #[track_caller]
    pub fn assert_snapshot_valid(snapshot: &DimensionSnapshot) {
        for (key, history) in &snapshot.identity_map {
            assert_history_valid(key, history);
        }
        for (key, history) in &snapshot.dim_user {
            assert_history_valid(key, history);
        }
    }

    /// Assert that the store's current state is well formed.
    #[track_caller]
    pub fn assert_store_valid<S: DimensionStore + ?Sized>(store: &S) {
        match store.snapshot() {
            Ok(snapshot) => assert_snapshot_valid(&snapshot),
            Err(e) => panic!("snapshot failed: {}", e),
        }
    }
}
