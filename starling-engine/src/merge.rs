//! Identity merge engine.
//!
//! Applies a batch of identity facts to the two SCD2 tables. A batch runs in
//! two phases:
//!
//! 1. **Resolution.** Facts are visited in `(observed_at, input index)` order
//!    and each gets a canonical id: the hint, else the login's mapping, else an
//!    id minted from the login, else the device's mapping, else an anonymous id
//!    for the device. Mappings are read as they stood just before
//!    `observed_at`, from committed history and from assignments made at
//!    earlier instants of the same batch. Facts sharing an instant never see
//!    each other, so a replay resolves every fact exactly as the first run did.
//! 2. **Per-key fold.** Facts are grouped per natural key (and per canonical id
//!    for `dim_user`) and folded in ascending `observed_at` over the key's
//!    committed history. The folded history is checked and committed with a
//!    compare-and-swap on the current version; a lost race recomputes the key.
//!
//! Commits are per key. A failure on one key never undoes another key's
//! commit, and re-running the batch is a no-op for keys already applied.

use crate::resolver::{anonymous_for_device, mint_canonical};
use serde::{Deserialize, Serialize};
use starling_core::{
    verify_history, version_as_of, BatchId, CanonicalUserId, ChangeHash, EngineConfig,
    IdentityFact, IdentityMapVersion, NaturalKey, RecordError, RecordRef, Scd2Table,
    StarlingError, StarlingResult, StorageError, SurrogateKey, Timestamp, UserAttributes,
    UserDimVersion, Versioned,
};
use starling_storage::{DimensionStore, HistoryCommit};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

/// In-batch assignments per natural key, in ascending time.
type Assignments = BTreeMap<NaturalKey, Vec<(Timestamp, CanonicalUserId)>>;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Version bookkeeping for one SCD2 table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub versions_opened: usize,
    pub versions_closed: usize,
    /// Facts already reflected by committed history.
    pub unchanged: usize,
    /// Facts overridden by a later fact for the same key and instant.
    pub superseded: usize,
}

impl MergeCounts {
    fn absorb(&mut self, other: MergeCounts) {
        self.versions_opened += other.versions_opened;
        self.versions_closed += other.versions_closed;
        self.unchanged += other.unchanged;
        self.superseded += other.superseded;
    }
}

/// A fact that was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedFact {
    pub record: RecordRef,
    pub error: RecordError,
}

/// A key whose update was not committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortedKey {
    pub table: Scd2Table,
    pub key: String,
    pub error: StarlingError,
}

/// Outcome of [`IdentityMergeEngine::apply_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub identity_map: MergeCounts,
    pub dim_user: MergeCounts,
    pub rejected: Vec<RejectedFact>,
    pub aborted: Vec<AbortedKey>,
}

impl MergeResult {
    pub fn versions_opened(&self) -> usize {
        self.identity_map.versions_opened + self.dim_user.versions_opened
    }

    pub fn versions_closed(&self) -> usize {
        self.identity_map.versions_closed + self.dim_user.versions_closed
    }

    pub fn unchanged(&self) -> usize {
        self.identity_map.unchanged + self.dim_user.unchanged
    }

    pub fn superseded(&self) -> usize {
        self.identity_map.superseded + self.dim_user.superseded
    }

    /// Nothing rejected and nothing aborted.
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.aborted.is_empty()
    }
}

// ============================================================================
// MERGE TARGETS
// ============================================================================

/// One fact's contribution to one key.
#[derive(Debug, Clone)]
struct Candidate<P> {
    index: usize,
    observed_at: Timestamp,
    batch_id: BatchId,
    payload: P,
}

impl<P> Candidate<P> {
    fn record(&self) -> RecordRef {
        RecordRef::IdentityFact {
            batch_id: self.batch_id,
            index: self.index,
        }
    }
}

/// An SCD2 table the fold can write to.
trait MergeTarget {
    type Version: Versioned;
    type Payload: Clone;

    /// Hash of the value the payload asserts. `None` means the payload asserts
    /// nothing and can only seed a key's first version.
    fn payload_hash(payload: &Self::Payload) -> Option<ChangeHash>;

    fn open(
        &self,
        key: &<Self::Version as Versioned>::Key,
        candidate: &Candidate<Self::Payload>,
    ) -> Self::Version;

    fn history(
        &self,
        key: &<Self::Version as Versioned>::Key,
    ) -> StarlingResult<Vec<Self::Version>>;

    fn commit(
        &self,
        key: &<Self::Version as Versioned>::Key,
        commit: HistoryCommit<Self::Version>,
    ) -> StarlingResult<()>;
}

struct IdentityMapTarget<'s, S: ?Sized> {
    store: &'s S,
}

impl<S: DimensionStore + ?Sized> MergeTarget for IdentityMapTarget<'_, S> {
    type Version = IdentityMapVersion;
    type Payload = CanonicalUserId;

    fn payload_hash(payload: &CanonicalUserId) -> Option<ChangeHash> {
        Some(IdentityMapVersion::hash_of(payload))
    }

    fn open(
        &self,
        key: &NaturalKey,
        candidate: &Candidate<CanonicalUserId>,
    ) -> IdentityMapVersion {
        IdentityMapVersion::open(
            self.store.next_surrogate_key(),
            key.clone(),
            candidate.payload.clone(),
            candidate.observed_at,
            candidate.batch_id,
        )
    }

    fn history(&self, key: &NaturalKey) -> StarlingResult<Vec<IdentityMapVersion>> {
        self.store.identity_history(key)
    }

    fn commit(
        &self,
        key: &NaturalKey,
        commit: HistoryCommit<IdentityMapVersion>,
    ) -> StarlingResult<()> {
        self.store.identity_commit(key, commit)
    }
}

struct UserDimTarget<'s, S: ?Sized> {
    store: &'s S,
}

impl<S: DimensionStore + ?Sized> MergeTarget for UserDimTarget<'_, S> {
    type Version = UserDimVersion;
    type Payload = Option<UserAttributes>;

    fn payload_hash(payload: &Option<UserAttributes>) -> Option<ChangeHash> {
        payload.as_ref().map(UserAttributes::change_hash)
    }

    fn open(
        &self,
        key: &CanonicalUserId,
        candidate: &Candidate<Option<UserAttributes>>,
    ) -> UserDimVersion {
        UserDimVersion::open(
            self.store.next_surrogate_key(),
            key.clone(),
            candidate.payload.clone().unwrap_or_default(),
            candidate.observed_at,
            candidate.batch_id,
        )
    }

    fn history(&self, key: &CanonicalUserId) -> StarlingResult<Vec<UserDimVersion>> {
        self.store.user_history(key)
    }

    fn commit(
        &self,
        key: &CanonicalUserId,
        commit: HistoryCommit<UserDimVersion>,
    ) -> StarlingResult<()> {
        self.store.user_commit(key, commit)
    }
}

// ============================================================================
// PER-KEY FOLD
// ============================================================================

/// Order candidates and collapse each instant to one survivor: the last one in
/// input order that asserts a value, else the last one.
fn collapse_instants<T: MergeTarget>(
    mut candidates: Vec<Candidate<T::Payload>>,
) -> (Vec<Candidate<T::Payload>>, usize) {
    candidates.sort_by_key(|c| (c.observed_at, c.index));

    let mut superseded = 0;
    let collapsed = candidates
        .into_iter()
        .fold(Vec::<Candidate<T::Payload>>::new(), |mut out, candidate| {
            match out.last_mut() {
                Some(last) if last.observed_at == candidate.observed_at => {
                    superseded += 1;
                    if T::payload_hash(&candidate.payload).is_some()
                        || T::payload_hash(&last.payload).is_none()
                    {
                        *last = candidate;
                    }
                }
                _ => out.push(candidate),
            }
            out
        });
    (collapsed, superseded)
}

/// Folded history of one key plus the commit that produces it.
struct KeyPlan<V> {
    commit: HistoryCommit<V>,
    history: Vec<V>,
    counts: MergeCounts,
    rejected: Vec<RejectedFact>,
}

fn plan_key<T: MergeTarget>(
    target: &T,
    key: &<T::Version as Versioned>::Key,
    stored: Vec<T::Version>,
    candidates: &[Candidate<T::Payload>],
) -> KeyPlan<T::Version> {
    let table = <T::Version as Versioned>::TABLE;
    let mut counts = MergeCounts::default();
    let mut rejected = Vec::new();

    let history = candidates.iter().fold(stored.clone(), |mut working, candidate| {
        let asserted = T::payload_hash(&candidate.payload);
        let current = working.iter().position(|v| v.is_current());

        let Some(current) = current else {
            working.push(target.open(key, candidate));
            counts.versions_opened += 1;
            return working;
        };

        let Some(hash) = asserted else {
            counts.unchanged += 1;
            return working;
        };

        let reflected = version_as_of(&working, candidate.observed_at)
            .is_some_and(|v| v.change_hash() == hash);
        let current_from = working[current].interval().valid_from;

        if reflected {
            counts.unchanged += 1;
        } else if candidate.observed_at > current_from {
            working[current] = working[current].closed_at(candidate.observed_at);
            working.push(target.open(key, candidate));
            counts.versions_closed += 1;
            counts.versions_opened += 1;
        } else {
            tracing::warn!(
                table = %table,
                key = %key,
                observed_at = %candidate.observed_at,
                committed_from = %current_from,
                "Late-arriving fact rejected"
            );
            rejected.push(RejectedFact {
                record: candidate.record(),
                error: RecordError::late_arriving(key, candidate.observed_at, current_from),
            });
        }
        working
    });

    let stored_current = stored.iter().find(|v| v.is_current());
    let stored_keys: HashSet<SurrogateKey> = stored.iter().map(|v| v.surrogate_key()).collect();

    let commit = HistoryCommit {
        expected_current: stored_current.map(|v| v.surrogate_key()),
        close_current: stored_current.and_then(|cur| {
            history
                .iter()
                .find(|v| v.surrogate_key() == cur.surrogate_key() && !v.is_current())
                .cloned()
        }),
        append: history
            .iter()
            .filter(|v| !stored_keys.contains(&v.surrogate_key()))
            .cloned()
            .collect(),
    };

    KeyPlan {
        commit,
        history,
        counts,
        rejected,
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Sole writer of `user_identity_map` and `dim_user`.
pub struct IdentityMergeEngine<'a, S: DimensionStore + ?Sized> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: DimensionStore + ?Sized> IdentityMergeEngine<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    /// Apply one batch of identity facts.
    ///
    /// Per-record problems land in [`MergeResult::rejected`] and per-key
    /// commit failures in [`MergeResult::aborted`]; neither stops the batch.
    /// `Err` is reserved for storage failures, after which keys already
    /// committed stay committed and the batch is safe to re-run.
    pub fn apply_batch(&self, facts: &[IdentityFact]) -> StarlingResult<MergeResult> {
        let mut result = MergeResult::default();

        let mut order: Vec<usize> = (0..facts.len()).collect();
        order.sort_by_key(|&i| (facts[i].observed_at, i));

        let mut assigned = Assignments::new();
        let mut committed: BTreeMap<NaturalKey, Vec<IdentityMapVersion>> = BTreeMap::new();
        let mut identity_candidates: BTreeMap<NaturalKey, Vec<Candidate<CanonicalUserId>>> =
            BTreeMap::new();
        let mut user_facts: Vec<(CanonicalUserId, Candidate<Option<UserAttributes>>)> = Vec::new();

        for index in order {
            let fact = &facts[index];
            let record = RecordRef::IdentityFact {
                batch_id: fact.source_batch_id,
                index,
            };

            let Some(canonical) = self.resolve_fact(fact, &assigned)? else {
                tracing::warn!(record = %record, "Identity fact has no login or device id");
                result.rejected.push(RejectedFact {
                    record: record.clone(),
                    error: RecordError::MalformedInput {
                        record,
                        reason: "neither login_user_id nor device_id is present".to_string(),
                    },
                });
                continue;
            };

            let candidate = Candidate {
                index,
                observed_at: fact.observed_at,
                batch_id: fact.source_batch_id,
                payload: canonical.clone(),
            };

            let keys = fact.natural_keys();
            let mut late = Vec::new();
            for key in &keys {
                if self.arrives_late(key, fact.observed_at, &canonical, &mut committed)? {
                    late.push(key.clone());
                }
            }

            // A late fact only reaches the fold of the keys it conflicts with,
            // where it is rejected; it is never applied anywhere else.
            if !late.is_empty() {
                for key in late {
                    identity_candidates
                        .entry(key)
                        .or_default()
                        .push(candidate.clone());
                }
                continue;
            }

            for key in keys {
                assigned
                    .entry(key.clone())
                    .or_default()
                    .push((fact.observed_at, canonical.clone()));
                identity_candidates
                    .entry(key)
                    .or_default()
                    .push(candidate.clone());
            }
            user_facts.push((
                canonical,
                Candidate {
                    index,
                    observed_at: fact.observed_at,
                    batch_id: fact.source_batch_id,
                    payload: fact.attributes.clone(),
                },
            ));
        }

        let identity_target = IdentityMapTarget { store: self.store };
        for (key, candidates) in identity_candidates {
            let counts = self.merge_key(&identity_target, &key, candidates, &mut result)?;
            result.identity_map.absorb(counts);
        }

        let rejected: HashSet<usize> = result
            .rejected
            .iter()
            .filter_map(|r| match r.record {
                RecordRef::IdentityFact { index, .. } => Some(index),
                _ => None,
            })
            .collect();

        let mut user_candidates: BTreeMap<CanonicalUserId, Vec<Candidate<Option<UserAttributes>>>> =
            BTreeMap::new();
        for (canonical, candidate) in user_facts {
            if !rejected.contains(&candidate.index) {
                user_candidates.entry(canonical).or_default().push(candidate);
            }
        }

        let user_target = UserDimTarget { store: self.store };
        for (key, candidates) in user_candidates {
            let counts = self.merge_key(&user_target, &key, candidates, &mut result)?;
            result.dim_user.absorb(counts);
        }

        tracing::info!(
            facts = facts.len(),
            opened = result.versions_opened(),
            closed = result.versions_closed(),
            unchanged = result.unchanged(),
            superseded = result.superseded(),
            rejected = result.rejected.len(),
            aborted = result.aborted.len(),
            "Identity batch applied"
        );

        Ok(result)
    }

    /// Canonical id for a fact, or `None` when it carries no identifier.
    fn resolve_fact(
        &self,
        fact: &IdentityFact,
        assigned: &Assignments,
    ) -> StarlingResult<Option<CanonicalUserId>> {
        if fact.natural_keys().is_empty() {
            return Ok(None);
        }
        if let Some(hint) = fact.hint() {
            return Ok(Some(hint.clone()));
        }

        if let Some(login) = fact.login() {
            let key = NaturalKey::Login(login.clone());
            let mapped = self.mapped(&key, fact.observed_at, assigned)?;
            return Ok(Some(
                mapped.unwrap_or_else(|| mint_canonical(self.config, login)),
            ));
        }

        if let Some(device) = fact.device() {
            let key = NaturalKey::Device(device.clone());
            let mapped = self.mapped(&key, fact.observed_at, assigned)?;
            return Ok(Some(
                mapped.unwrap_or_else(|| anonymous_for_device(self.config, device)),
            ));
        }

        Ok(None)
    }

    /// Whether asserting `canonical` for `key` at `at` conflicts with a
    /// committed current version that starts at or after `at`.
    fn arrives_late(
        &self,
        key: &NaturalKey,
        at: Timestamp,
        canonical: &CanonicalUserId,
        committed: &mut BTreeMap<NaturalKey, Vec<IdentityMapVersion>>,
    ) -> StarlingResult<bool> {
        let history: &[IdentityMapVersion] = match committed.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.store.identity_history(key)?),
        };
        let Some(current) = history.iter().find(|v| v.is_current()) else {
            return Ok(false);
        };
        let hash = IdentityMapVersion::hash_of(canonical);
        let reflected = version_as_of(history, at).is_some_and(|v| v.change_hash() == hash);
        Ok(!reflected && at <= current.valid_from)
    }

    /// Mapping of `key` in effect just before `at`. An assignment made earlier
    /// in this batch wins unless committed history has a newer version.
    fn mapped(
        &self,
        key: &NaturalKey,
        at: Timestamp,
        assigned: &Assignments,
    ) -> StarlingResult<Option<CanonicalUserId>> {
        let committed = match at.checked_sub_signed(chrono::Duration::nanoseconds(1)) {
            Some(before) => self.store.identity_as_of(key, before)?,
            None => None,
        };
        let in_batch = assigned
            .get(key)
            .and_then(|history| history.iter().rev().find(|(ts, _)| *ts < at));

        Ok(match (committed, in_batch) {
            (Some(version), Some((assigned_at, canonical))) => {
                if *assigned_at >= version.valid_from {
                    Some(canonical.clone())
                } else {
                    Some(version.canonical_user_id)
                }
            }
            (Some(version), None) => Some(version.canonical_user_id),
            (None, Some((_, canonical))) => Some(canonical.clone()),
            (None, None) => None,
        })
    }

    /// Fold, check, and commit one key, retrying lost commit races.
    fn merge_key<T: MergeTarget>(
        &self,
        target: &T,
        key: &<T::Version as Versioned>::Key,
        candidates: Vec<Candidate<T::Payload>>,
        result: &mut MergeResult,
    ) -> StarlingResult<MergeCounts> {
        let table = <T::Version as Versioned>::TABLE;
        let (candidates, superseded) = collapse_instants::<T>(candidates);
        let mut attempt = 0;

        loop {
            let stored = target.history(key)?;
            let plan = plan_key(target, key, stored, &candidates);

            if plan.commit.is_noop() {
                tracing::debug!(table = %table, key = %key, "Key unchanged");
                result.rejected.extend(plan.rejected);
                return Ok(MergeCounts {
                    superseded,
                    ..plan.counts
                });
            }

            if self.config.verify_after_merge {
                if let Err(e) = verify_history(key, &plan.history) {
                    tracing::error!(
                        table = %table,
                        key = %key,
                        error = %e,
                        "Merged history failed integrity check, key not committed"
                    );
                    result.aborted.push(AbortedKey {
                        table,
                        key: key.to_string(),
                        error: e.into(),
                    });
                    return Ok(MergeCounts {
                        superseded,
                        ..MergeCounts::default()
                    });
                }
            }

            match target.commit(key, plan.commit) {
                Ok(()) => {
                    tracing::debug!(
                        table = %table,
                        key = %key,
                        opened = plan.counts.versions_opened,
                        closed = plan.counts.versions_closed,
                        "Key committed"
                    );
                    result.rejected.extend(plan.rejected);
                    return Ok(MergeCounts {
                        superseded,
                        ..plan.counts
                    });
                }
                Err(StarlingError::Storage(StorageError::ConcurrentModification { .. }))
                    if attempt < self.config.max_commit_retries =>
                {
                    attempt += 1;
                    tracing::debug!(
                        table = %table,
                        key = %key,
                        attempt,
                        "Commit race lost, recomputing key"
                    );
                }
                Err(e @ StarlingError::Storage(StorageError::ConcurrentModification { .. })) => {
                    tracing::warn!(
                        table = %table,
                        key = %key,
                        attempts = attempt + 1,
                        "Commit retries exhausted, key not committed"
                    );
                    result.aborted.push(AbortedKey {
                        table,
                        key: key.to_string(),
                        error: e,
                    });
                    return Ok(MergeCounts {
                        superseded,
                        ..MergeCounts::default()
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
