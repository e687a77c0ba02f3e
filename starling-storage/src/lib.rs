//! Starling Storage - Dimension Store Trait and In-Memory Implementation
//!
//! Defines the dimension state the merge engine writes and the resolver reads.
//! State is always passed to the engine explicitly as a store value, never
//! held globally, so every test can build an isolated instance.

pub mod snapshot;
pub mod table;

pub use snapshot::DimensionSnapshot;
pub use table::{HistoryCommit, Scd2Store};

use starling_core::{
    CanonicalUserId, DimInsurancePlan, DimProvider, IdentityMapVersion, InsurancePlanRecord,
    NaturalKey, ProviderRecord, StarlingError, StarlingResult, StorageError, SurrogateKey,
    Timestamp, UserDimVersion,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

// ============================================================================
// LOOKUP TRAIT
// ============================================================================

/// Point-in-time reads over the SCD2 tables.
pub trait IdentityLookup {
    /// The identity map version for `key` whose interval contains `at`.
    fn identity_as_of(
        &self,
        key: &NaturalKey,
        at: Timestamp,
    ) -> StarlingResult<Option<IdentityMapVersion>>;

    /// The `dim_user` version for `id` whose interval contains `at`.
    fn user_as_of(
        &self,
        id: &CanonicalUserId,
        at: Timestamp,
    ) -> StarlingResult<Option<UserDimVersion>>;
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Storage trait for dimension state.
///
/// Commits are per key and compare-and-swap on the current version, so
/// writers touching disjoint keys never contend and writers racing on the
/// same key are serialized: the loser gets `StorageError::ConcurrentModification`
/// and must recompute against fresh history.
pub trait DimensionStore: IdentityLookup + Send + Sync {
    // === user_identity_map ===

    /// Full history of a natural key, ordered by `valid_from`.
    fn identity_history(&self, key: &NaturalKey) -> StarlingResult<Vec<IdentityMapVersion>>;

    fn identity_commit(
        &self,
        key: &NaturalKey,
        commit: HistoryCommit<IdentityMapVersion>,
    ) -> StarlingResult<()>;

    // === dim_user ===

    fn user_history(&self, id: &CanonicalUserId) -> StarlingResult<Vec<UserDimVersion>>;

    fn user_commit(
        &self,
        id: &CanonicalUserId,
        commit: HistoryCommit<UserDimVersion>,
    ) -> StarlingResult<()>;

    // === Type-1 dimensions ===

    /// Insert or overwrite a provider. The surrogate key is assigned on first
    /// sight and never changes.
    fn provider_upsert(&self, record: &ProviderRecord) -> StarlingResult<DimProvider>;

    fn insurance_plan_upsert(
        &self,
        record: &InsurancePlanRecord,
    ) -> StarlingResult<DimInsurancePlan>;

    // === Keys & export ===

    /// Allocate a fresh surrogate key. Keys are unique across all tables.
    fn next_surrogate_key(&self) -> SurrogateKey;

    /// Consistent copy of every dimension table.
    fn snapshot(&self) -> StarlingResult<DimensionSnapshot>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// In-memory dimension store.
#[derive(Debug)]
pub struct InMemoryDimensionStore {
    identity_map: Scd2Store<IdentityMapVersion>,
    dim_user: Scd2Store<UserDimVersion>,
    providers: RwLock<BTreeMap<starling_core::ProviderId, DimProvider>>,
    insurance_plans: RwLock<BTreeMap<starling_core::InsurancePlanId, DimInsurancePlan>>,
    next_key: AtomicU64,
    // Commits hold this shared; snapshots hold it exclusively so they never
    // straddle a commit.
    snapshot_gate: RwLock<()>,
}

impl Default for InMemoryDimensionStore {
    fn default() -> Self {
        Self {
            identity_map: Scd2Store::new(),
            dim_user: Scd2Store::new(),
            providers: RwLock::new(BTreeMap::new()),
            insurance_plans: RwLock::new(BTreeMap::new()),
            next_key: AtomicU64::new(1),
            snapshot_gate: RwLock::new(()),
        }
    }
}

impl InMemoryDimensionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `user_identity_map` rows.
    pub fn identity_row_count(&self) -> StarlingResult<usize> {
        self.identity_map.row_count()
    }

    /// Number of `dim_user` rows.
    pub fn user_row_count(&self) -> StarlingResult<usize> {
        self.dim_user.row_count()
    }

    /// Clear all stored data. Surrogate keys keep counting up.
    pub fn clear(&self) -> StarlingResult<()> {
        let _gate = self.gate_exclusive()?;
        self.identity_map.clear()?;
        self.dim_user.clear()?;
        self.providers
            .write()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))?
            .clear();
        self.insurance_plans
            .write()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))?
            .clear();
        Ok(())
    }

    fn gate_shared(&self) -> StarlingResult<std::sync::RwLockReadGuard<'_, ()>> {
        self.snapshot_gate
            .read()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))
    }

    fn gate_exclusive(&self) -> StarlingResult<std::sync::RwLockWriteGuard<'_, ()>> {
        self.snapshot_gate
            .write()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))
    }
}

impl IdentityLookup for InMemoryDimensionStore {
    fn identity_as_of(
        &self,
        key: &NaturalKey,
        at: Timestamp,
    ) -> StarlingResult<Option<IdentityMapVersion>> {
        self.identity_map.as_of(key, at)
    }

    fn user_as_of(
        &self,
        id: &CanonicalUserId,
        at: Timestamp,
    ) -> StarlingResult<Option<UserDimVersion>> {
        self.dim_user.as_of(id, at)
    }
}

impl DimensionStore for InMemoryDimensionStore {
    fn identity_history(&self, key: &NaturalKey) -> StarlingResult<Vec<IdentityMapVersion>> {
        self.identity_map.history(key)
    }

    fn identity_commit(
        &self,
        key: &NaturalKey,
        commit: HistoryCommit<IdentityMapVersion>,
    ) -> StarlingResult<()> {
        let _gate = self.gate_shared()?;
        self.identity_map.commit(key, commit)
    }

    fn user_history(&self, id: &CanonicalUserId) -> StarlingResult<Vec<UserDimVersion>> {
        self.dim_user.history(id)
    }

    fn user_commit(
        &self,
        id: &CanonicalUserId,
        commit: HistoryCommit<UserDimVersion>,
    ) -> StarlingResult<()> {
        let _gate = self.gate_shared()?;
        self.dim_user.commit(id, commit)
    }

    fn provider_upsert(&self, record: &ProviderRecord) -> StarlingResult<DimProvider> {
        if record.provider_id.is_blank() {
            return Err(StarlingError::Storage(StorageError::InsertFailed {
                table: "dim_provider".to_string(),
                reason: "blank provider_id".to_string(),
            }));
        }
        let _gate = self.gate_shared()?;
        let mut providers = self
            .providers
            .write()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))?;

        let provider_key = match providers.get(&record.provider_id) {
            Some(existing) => existing.provider_key,
            None => self.next_surrogate_key(),
        };
        let row = DimProvider {
            provider_key,
            provider_id: record.provider_id.clone(),
            name: record.name.clone(),
            specialty: record.specialty.clone(),
        };
        providers.insert(record.provider_id.clone(), row.clone());
        Ok(row)
    }

    fn insurance_plan_upsert(
        &self,
        record: &InsurancePlanRecord,
    ) -> StarlingResult<DimInsurancePlan> {
        if record.insurance_plan_id.is_blank() {
            return Err(StarlingError::Storage(StorageError::InsertFailed {
                table: "dim_insurance_plan".to_string(),
                reason: "blank insurance_plan_id".to_string(),
            }));
        }
        let _gate = self.gate_shared()?;
        let mut plans = self
            .insurance_plans
            .write()
            .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))?;

        let insurance_plan_key = match plans.get(&record.insurance_plan_id) {
            Some(existing) => existing.insurance_plan_key,
            None => self.next_surrogate_key(),
        };
        let row = DimInsurancePlan {
            insurance_plan_key,
            insurance_plan_id: record.insurance_plan_id.clone(),
            payer_name: record.payer_name.clone(),
            plan_type: record.plan_type.clone(),
        };
        plans.insert(record.insurance_plan_id.clone(), row.clone());
        Ok(row)
    }

    fn next_surrogate_key(&self) -> SurrogateKey {
        SurrogateKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn snapshot(&self) -> StarlingResult<DimensionSnapshot> {
        let _gate = self.gate_exclusive()?;
        Ok(DimensionSnapshot {
            identity_map: self.identity_map.export()?,
            dim_user: self.dim_user.export()?,
            providers: self
                .providers
                .read()
                .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))?
                .clone(),
            insurance_plans: self
                .insurance_plans
                .read()
                .map_err(|_| StarlingError::Storage(StorageError::LockPoisoned))?
                .clone(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use starling_core::{
        new_batch_id, DeviceId, InsurancePlanId, LoginUserId, ProviderId, UserAttributes,
    };

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn open_identity(
        store: &InMemoryDimensionStore,
        key: NaturalKey,
        canonical: &str,
        from: i64,
    ) -> IdentityMapVersion {
        let version = IdentityMapVersion::open(
            store.next_surrogate_key(),
            key.clone(),
            CanonicalUserId::new(canonical),
            t(from),
            new_batch_id(),
        );
        store
            .identity_commit(
                &key,
                HistoryCommit {
                    expected_current: None,
                    close_current: None,
                    append: vec![version.clone()],
                },
            )
            .unwrap();
        version
    }

    #[test]
    fn test_surrogate_keys_are_unique() {
        let store = InMemoryDimensionStore::new();
        let a = store.next_surrogate_key();
        let b = store.next_surrogate_key();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_identity_spaces_are_independent() {
        let store = InMemoryDimensionStore::new();
        open_identity(&store, NaturalKey::Login(LoginUserId::new("x")), "U1", 0);
        open_identity(&store, NaturalKey::Device(DeviceId::new("x")), "ANON-x", 0);

        let login = store
            .identity_as_of(&NaturalKey::Login(LoginUserId::new("x")), t(1))
            .unwrap()
            .unwrap();
        let device = store
            .identity_as_of(&NaturalKey::Device(DeviceId::new("x")), t(1))
            .unwrap()
            .unwrap();
        assert_eq!(login.canonical_user_id.as_str(), "U1");
        assert_eq!(device.canonical_user_id.as_str(), "ANON-x");
    }

    #[test]
    fn test_as_of_before_first_version_is_none() {
        let store = InMemoryDimensionStore::new();
        let key = NaturalKey::Login(LoginUserId::new("L1"));
        open_identity(&store, key.clone(), "U1", 100);
        assert!(store.identity_as_of(&key, t(99)).unwrap().is_none());
        assert!(store.identity_as_of(&key, t(100)).unwrap().is_some());
    }

    #[test]
    fn test_user_commit_and_history() {
        let store = InMemoryDimensionStore::new();
        let id = CanonicalUserId::new("U1");
        let version = UserDimVersion::open(
            store.next_surrogate_key(),
            id.clone(),
            UserAttributes::default(),
            t(0),
            new_batch_id(),
        );
        store
            .user_commit(
                &id,
                HistoryCommit {
                    expected_current: None,
                    close_current: None,
                    append: vec![version.clone()],
                },
            )
            .unwrap();
        assert_eq!(store.user_history(&id).unwrap(), vec![version]);
        assert_eq!(store.user_row_count().unwrap(), 1);
    }

    #[test]
    fn test_provider_upsert_keeps_key() {
        let store = InMemoryDimensionStore::new();
        let first = store
            .provider_upsert(&ProviderRecord {
                provider_id: ProviderId::new("P1"),
                name: "Dr. A".to_string(),
                specialty: None,
            })
            .unwrap();
        let second = store
            .provider_upsert(&ProviderRecord {
                provider_id: ProviderId::new("P1"),
                name: "Dr. A. Smith".to_string(),
                specialty: Some("dermatology".to_string()),
            })
            .unwrap();
        assert_eq!(first.provider_key, second.provider_key);

        let snapshot = store.snapshot().unwrap();
        let stored = snapshot.provider(&ProviderId::new("P1")).unwrap();
        assert_eq!(stored.name, "Dr. A. Smith");
        assert_eq!(snapshot.providers.len(), 1);
    }

    #[test]
    fn test_blank_insurance_plan_rejected() {
        let store = InMemoryDimensionStore::new();
        let result = store.insurance_plan_upsert(&InsurancePlanRecord {
            insurance_plan_id: InsurancePlanId::new(""),
            payer_name: "Acme".to_string(),
            plan_type: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let store = InMemoryDimensionStore::new();
        let key = NaturalKey::Login(LoginUserId::new("L1"));
        let first = open_identity(&store, key.clone(), "U1", 0);
        let snapshot = store.snapshot().unwrap();

        store
            .identity_commit(
                &key,
                HistoryCommit {
                    expected_current: Some(first.surrogate_key),
                    close_current: Some(starling_core::Versioned::closed_at(&first, t(10))),
                    append: vec![IdentityMapVersion::open(
                        store.next_surrogate_key(),
                        key.clone(),
                        CanonicalUserId::new("U2"),
                        t(10),
                        new_batch_id(),
                    )],
                },
            )
            .unwrap();

        assert_eq!(snapshot.identity_rows().count(), 1);
        assert_eq!(
            snapshot.identity_as_of(&key, t(20)).unwrap().unwrap().canonical_user_id,
            CanonicalUserId::new("U1")
        );
        assert_eq!(
            store.identity_as_of(&key, t(20)).unwrap().unwrap().canonical_user_id,
            CanonicalUserId::new("U2")
        );
    }

    #[test]
    fn test_clear() {
        let store = InMemoryDimensionStore::new();
        open_identity(&store, NaturalKey::Login(LoginUserId::new("L1")), "U1", 0);
        store.clear().unwrap();
        assert_eq!(store.identity_row_count().unwrap(), 0);
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
