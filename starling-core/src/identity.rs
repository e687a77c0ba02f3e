//! Identity types for Starling records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of the staging batch a record arrived in.
/// UUIDv7 so batch ids sort by creation time.
pub type BatchId = Uuid;

/// Generate a new UUIDv7 BatchId (timestamp-sortable).
pub fn new_batch_id() -> BatchId {
    Uuid::now_v7()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Blank identifiers carry no identity and are treated as absent.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier a user logs in with. Strongest identity signal.
    LoginUserId
);
string_id!(
    /// Transient device/browser identifier.
    DeviceId
);
string_id!(
    /// The single stable identifier a person's login and device ids resolve to.
    CanonicalUserId
);
string_id!(SessionId);
string_id!(PaymentId);
string_id!(AppointmentId);
string_id!(ProviderId);
string_id!(InsurancePlanId);

/// Warehouse surrogate key assigned to every dimension row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateKey(pub u64);

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Natural key of the identity map. Login ids and device ids are independent
/// mapping spaces: `Login("x")` and `Device("x")` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NaturalKey {
    Login(LoginUserId),
    Device(DeviceId),
}

impl NaturalKey {
    pub fn as_str(&self) -> &str {
        match self {
            NaturalKey::Login(id) => id.as_str(),
            NaturalKey::Device(id) => id.as_str(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NaturalKey::Login(_) => "login",
            NaturalKey::Device(_) => "device",
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.as_str())
    }
}

impl From<LoginUserId> for NaturalKey {
    fn from(id: LoginUserId) -> Self {
        NaturalKey::Login(id)
    }
}

impl From<DeviceId> for NaturalKey {
    fn from(id: DeviceId) -> Self {
        NaturalKey::Device(id)
    }
}

/// SHA-256 fingerprint over the attributes an SCD2 table tracks for change.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeHash([u8; 32]);

impl ChangeHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChangeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeHash({})", &self.to_hex()[..12])
    }
}

/// Incremental builder for a [`ChangeHash`].
///
/// Every field is length-prefixed and absent fields get their own tag, so
/// `("ab", "c")` and `("a", "bc")` hash differently, as do `None` and `Some("")`.
#[derive(Debug, Clone, Default)]
pub struct ChangeHasher {
    hasher: Sha256,
}

impl ChangeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, value: Option<&str>) -> Self {
        match value {
            None => self.hasher.update([0u8]),
            Some(v) => {
                self.hasher.update([1u8]);
                self.hasher.update((v.len() as u64).to_le_bytes());
                self.hasher.update(v.as_bytes());
            }
        }
        self
    }

    pub fn finish(self) -> ChangeHash {
        let result = self.hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        ChangeHash(hash)
    }
}

/// Hex SHA-256 of an arbitrary string, used for deterministic id minting.
pub fn digest_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
