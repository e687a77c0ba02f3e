//! Frozen, owned copy of dimension state.
//!
//! Fact assembly and validation run against a snapshot so that every lookup in
//! one run sees the same dimension state, however many batches commit meanwhile.

use crate::IdentityLookup;
use starling_core::{
    version_as_of, CanonicalUserId, DimInsurancePlan, DimProvider, IdentityMapVersion,
    InsurancePlanId, NaturalKey, ProviderId, StarlingResult, SurrogateKey, Timestamp,
    UserDimVersion,
};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DimensionSnapshot {
    pub identity_map: BTreeMap<NaturalKey, Vec<IdentityMapVersion>>,
    pub dim_user: BTreeMap<CanonicalUserId, Vec<UserDimVersion>>,
    pub providers: BTreeMap<ProviderId, DimProvider>,
    pub insurance_plans: BTreeMap<InsurancePlanId, DimInsurancePlan>,
}

impl DimensionSnapshot {
    /// `user_identity_map` rows, ordered by natural key then `valid_from`.
    pub fn identity_rows(&self) -> impl Iterator<Item = &IdentityMapVersion> {
        self.identity_map.values().flatten()
    }

    /// `dim_user` rows, ordered by canonical id then `valid_from`.
    pub fn user_rows(&self) -> impl Iterator<Item = &UserDimVersion> {
        self.dim_user.values().flatten()
    }

    pub fn provider(&self, id: &ProviderId) -> Option<&DimProvider> {
        self.providers.get(id)
    }

    pub fn insurance_plan(&self, id: &InsurancePlanId) -> Option<&DimInsurancePlan> {
        self.insurance_plans.get(id)
    }

    pub fn user_keys(&self) -> HashSet<SurrogateKey> {
        self.user_rows().map(|v| v.surrogate_key).collect()
    }

    pub fn provider_keys(&self) -> HashSet<SurrogateKey> {
        self.providers.values().map(|p| p.provider_key).collect()
    }

    pub fn insurance_plan_keys(&self) -> HashSet<SurrogateKey> {
        self.insurance_plans
            .values()
            .map(|p| p.insurance_plan_key)
            .collect()
    }
}

impl IdentityLookup for DimensionSnapshot {
    fn identity_as_of(
        &self,
        key: &NaturalKey,
        at: Timestamp,
    ) -> StarlingResult<Option<IdentityMapVersion>> {
        Ok(self
            .identity_map
            .get(key)
            .and_then(|history| version_as_of(history, at))
            .cloned())
    }

    fn user_as_of(
        &self,
        id: &CanonicalUserId,
        at: Timestamp,
    ) -> StarlingResult<Option<UserDimVersion>> {
        Ok(self
            .dim_user
            .get(id)
            .and_then(|history| version_as_of(history, at))
            .cloned())
    }
}
