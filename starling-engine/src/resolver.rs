//! Point-in-time identity resolution.
//!
//! A fact row resolves to the canonical user valid *when the event happened*,
//! not the latest one, so rebuilding facts from staging after later identity
//! merges reproduces the same historical attribution.

use starling_core::{
    digest_hex, CanonicalUserId, DeviceId, EngineConfig, LoginUserId, NaturalKey, RecordError,
    RecordRef, StarlingResult, SurrogateKey, Timestamp,
};
use starling_storage::IdentityLookup;

/// Hex digits of the login digest kept in a minted canonical id.
const MINTED_DIGEST_LEN: usize = 16;

/// Canonical id minted for a login that has never been mapped.
pub fn mint_canonical(config: &EngineConfig, login: &LoginUserId) -> CanonicalUserId {
    let digest = digest_hex(login.as_str());
    let short = digest.get(..MINTED_DIGEST_LEN).unwrap_or(&digest);
    CanonicalUserId::new(format!("{}{}", config.canonical_prefix, short))
}

/// Anonymous canonical id for an unmapped device.
pub fn anonymous_for_device(config: &EngineConfig, device: &DeviceId) -> CanonicalUserId {
    CanonicalUserId::new(format!("{}{}", config.anonymous_prefix, device))
}

/// Anonymous canonical id for an unmapped login seen without a device.
pub fn anonymous_for_login(config: &EngineConfig, login: &LoginUserId) -> CanonicalUserId {
    CanonicalUserId::new(format!("{}LOGIN-{}", config.anonymous_prefix, login))
}

/// Read-only resolver over any identity lookup: the live store or a frozen
/// snapshot.
pub struct IdentityResolver<'a, L: IdentityLookup + ?Sized> {
    lookup: &'a L,
    config: &'a EngineConfig,
}

impl<'a, L: IdentityLookup + ?Sized> IdentityResolver<'a, L> {
    pub fn new(lookup: &'a L, config: &'a EngineConfig) -> Self {
        Self { lookup, config }
    }

    /// Canonical id valid at `as_of`.
    ///
    /// Login mapping first, then device mapping, then a synthesized anonymous
    /// id. Blank identifiers count as absent.
    pub fn resolve(
        &self,
        login: Option<&LoginUserId>,
        device: Option<&DeviceId>,
        as_of: Timestamp,
    ) -> StarlingResult<CanonicalUserId> {
        self.resolve_for(RecordRef::Lookup { as_of }, login, device, as_of)
    }

    /// [`resolve`](Self::resolve), attributing a failure to `record`.
    pub fn resolve_for(
        &self,
        record: RecordRef,
        login: Option<&LoginUserId>,
        device: Option<&DeviceId>,
        as_of: Timestamp,
    ) -> StarlingResult<CanonicalUserId> {
        let login = login.filter(|id| !id.is_blank());
        let device = device.filter(|id| !id.is_blank());

        if let Some(login) = login {
            let key = NaturalKey::Login(login.clone());
            if let Some(version) = self.lookup.identity_as_of(&key, as_of)? {
                return Ok(version.canonical_user_id);
            }
        }

        if let Some(device) = device {
            let key = NaturalKey::Device(device.clone());
            if let Some(version) = self.lookup.identity_as_of(&key, as_of)? {
                return Ok(version.canonical_user_id);
            }
            return Ok(anonymous_for_device(self.config, device));
        }

        match login {
            Some(login) => Ok(anonymous_for_login(self.config, login)),
            None => Err(RecordError::UnresolvedIdentity { record }.into()),
        }
    }

    /// Surrogate key of the `dim_user` version valid at `as_of`.
    pub fn resolve_user_key(
        &self,
        canonical: &CanonicalUserId,
        as_of: Timestamp,
    ) -> StarlingResult<Option<SurrogateKey>> {
        Ok(self
            .lookup
            .user_as_of(canonical, as_of)?
            .map(|version| version.surrogate_key))
    }
}

// ============================================================================
// TESTS
// ============================================================================
