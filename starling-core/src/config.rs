//! Engine configuration

use crate::error::{ConfigError, StarlingError, StarlingResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prefix of canonical ids synthesized for identities with no login.
    pub anonymous_prefix: String,
    /// Prefix of canonical ids minted from a login id.
    pub canonical_prefix: String,
    /// Largest gross-vs-net difference the netting check tolerates.
    pub netting_tolerance: Decimal,
    /// How many times a key is recomputed after losing a commit race.
    pub max_commit_retries: u32,
    /// Check SCD2 interval invariants on every key before committing it.
    pub verify_after_merge: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            anonymous_prefix: "ANON-".to_string(),
            canonical_prefix: "U-".to_string(),
            netting_tolerance: Decimal::ZERO,
            max_commit_retries: 3,
            verify_after_merge: true,
        }
    }
}

impl EngineConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `STARLING_ANONYMOUS_PREFIX` (default: `ANON-`)
    /// - `STARLING_CANONICAL_PREFIX` (default: `U-`)
    /// - `STARLING_NETTING_TOLERANCE` (default: `0`)
    /// - `STARLING_MAX_COMMIT_RETRIES` (default: 3)
    /// - `STARLING_VERIFY_AFTER_MERGE` (default: true)
    ///
    /// Unparseable values fall back to the default; call [`validate`](Self::validate)
    /// on the result before use.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            anonymous_prefix: std::env::var("STARLING_ANONYMOUS_PREFIX")
                .unwrap_or(defaults.anonymous_prefix),
            canonical_prefix: std::env::var("STARLING_CANONICAL_PREFIX")
                .unwrap_or(defaults.canonical_prefix),
            netting_tolerance: std::env::var("STARLING_NETTING_TOLERANCE")
                .ok()
                .and_then(|s| Decimal::from_str(s.trim()).ok())
                .unwrap_or(defaults.netting_tolerance),
            max_commit_retries: std::env::var("STARLING_MAX_COMMIT_RETRIES")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.max_commit_retries),
            verify_after_merge: std::env::var("STARLING_VERIFY_AFTER_MERGE")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.verify_after_merge),
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - both prefixes are non-empty and distinct
    /// - neither prefix is a prefix of the other, so minted and anonymous ids never collide
    /// - netting_tolerance >= 0
    /// - max_commit_retries >= 1
    pub fn validate(&self) -> StarlingResult<()> {
        if self.anonymous_prefix.trim().is_empty() {
            return Err(invalid(
                "anonymous_prefix",
                &self.anonymous_prefix,
                "anonymous_prefix must not be empty",
            ));
        }

        if self.canonical_prefix.trim().is_empty() {
            return Err(invalid(
                "canonical_prefix",
                &self.canonical_prefix,
                "canonical_prefix must not be empty",
            ));
        }

        if self.anonymous_prefix.starts_with(&self.canonical_prefix)
            || self.canonical_prefix.starts_with(&self.anonymous_prefix)
        {
            return Err(StarlingError::Config(ConfigError::IncompatibleOptions {
                option_a: format!("anonymous_prefix={}", self.anonymous_prefix),
                option_b: format!("canonical_prefix={}", self.canonical_prefix),
            }));
        }

        if self.netting_tolerance.is_sign_negative() {
            return Err(invalid(
                "netting_tolerance",
                &self.netting_tolerance.to_string(),
                "netting_tolerance must be non-negative",
            ));
        }

        if self.max_commit_retries == 0 {
            return Err(invalid(
                "max_commit_retries",
                "0",
                "max_commit_retries must be at least 1",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> StarlingError {
    StarlingError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_anonymous_prefix_rejected() {
        let config = EngineConfig {
            anonymous_prefix: " ".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("anonymous_prefix"));
    }

    #[test]
    fn test_overlapping_prefixes_rejected() {
        let config = EngineConfig {
            anonymous_prefix: "U-ANON-".to_string(),
            canonical_prefix: "U-".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StarlingError::Config(ConfigError::IncompatibleOptions { .. }))
        ));
    }

    #[test]
    fn test_negative_tolerance_rejected() {
        let config = EngineConfig {
            netting_tolerance: Decimal::new(-1, 2),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("netting_tolerance"));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let config = EngineConfig {
            max_commit_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_shape() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["anonymous_prefix"], "ANON-");
        assert_eq!(json["max_commit_retries"], 3);
    }
}
