//! Engine policy: thresholds the engine enforces or warns about.
//!
//! Every field has a default, so an empty JSON object is a valid policy.

use serde::{Deserialize, Serialize};

use crate::error::BtcError;

/// Tunable thresholds for transaction building and PSBT review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnginePolicy {
    /// Smallest output value, in satoshis, the engine will create or accept.
    #[serde(default = "default_dust_limit")]
    pub dust_limit_sat: u64,

    /// Floor applied to every fee, in sat/vB.
    #[serde(default = "default_min_relay_fee_rate")]
    pub min_relay_fee_rate: f64,

    /// Fee / total output value above which an imported PSBT is flagged.
    #[serde(default = "default_excessive_fee_ratio")]
    pub excessive_fee_ratio: f64,

    /// Turn security warnings into hard errors.
    #[serde(default)]
    pub escalate_warnings: bool,

    /// Warn when key origins in a PSBT point at another network's coin type.
    #[serde(default = "default_true")]
    pub warn_on_network_mismatch: bool,

    /// Maximum characters of PSBT payload per transport chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Lifetime of a pending multisig transaction, in seconds.
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,

    /// Unused addresses kept ahead of the last used one.
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            dust_limit_sat: default_dust_limit(),
            min_relay_fee_rate: default_min_relay_fee_rate(),
            excessive_fee_ratio: default_excessive_fee_ratio(),
            escalate_warnings: false,
            warn_on_network_mismatch: default_true(),
            chunk_size: default_chunk_size(),
            pending_ttl_secs: default_pending_ttl(),
            gap_limit: default_gap_limit(),
        }
    }
}

impl EnginePolicy {
    /// Parse a policy from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self, BtcError> {
        let policy: EnginePolicy = serde_json::from_str(json)
            .map_err(|e| BtcError::Validation(format!("invalid engine policy: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), BtcError> {
        if !self.min_relay_fee_rate.is_finite() || self.min_relay_fee_rate < 0.0 {
            return Err(BtcError::Validation(format!(
                "min_relay_fee_rate must be a non-negative number, got {}",
                self.min_relay_fee_rate
            )));
        }
        if !self.excessive_fee_ratio.is_finite() || self.excessive_fee_ratio <= 0.0 {
            return Err(BtcError::Validation(format!(
                "excessive_fee_ratio must be positive, got {}",
                self.excessive_fee_ratio
            )));
        }
        if self.chunk_size == 0 {
            return Err(BtcError::Validation("chunk_size must be at least 1".into()));
        }
        if self.gap_limit == 0 {
            return Err(BtcError::Validation("gap_limit must be at least 1".into()));
        }
        if self.pending_ttl_secs == 0 {
            return Err(BtcError::Validation("pending_ttl_secs must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_dust_limit() -> u64 {
    546
}

fn default_min_relay_fee_rate() -> f64 {
    1.0
}

fn default_excessive_fee_ratio() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    2500
}

fn default_pending_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_gap_limit() -> u32 {
    20
}
