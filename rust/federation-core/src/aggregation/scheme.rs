// rust/federation-core/src/aggregation/scheme.rs

//! Encryption capabilities and the configured aggregation scheme.
//!
//! Schemes form a closed set selected by configuration. Each one exposes the
//! same three operations the coordinator relies on: `verify` an update's
//! integrity tag, `combine` it into a running aggregate, and
//! `calibrate_noise` for the privacy mechanism applied to the decrypted result.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::masking::IntegrityVerifier;
use crate::config::AggregationConfig;
use crate::error::{FederationError, Result};
use crate::privacy::{NoiseCalibration, NoiseMechanism};
use crate::registry::NodeId;

/// Homomorphic scheme identifier carried by every update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SchemeKind {
    /// One-time-pad masking over Z/2^64 with fixed-point lanes.
    #[default]
    MaskedAdditive,
}

impl fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaskedAdditive => write!(f, "masked_additive"),
        }
    }
}

impl FromStr for SchemeKind {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "masked_additive" | "masked-additive" => Ok(Self::MaskedAdditive),
            other => Err(FederationError::config(format!(
                "unknown aggregation scheme '{}'",
                other
            ))),
        }
    }
}

/// Declared channel/key strength of a node, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionStrength {
    #[default]
    Aes128,
    Aes192,
    Aes256,
}

impl fmt::Display for EncryptionStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aes128 => "aes128",
            Self::Aes192 => "aes192",
            Self::Aes256 => "aes256",
        };
        f.write_str(name)
    }
}

impl FromStr for EncryptionStrength {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes128" => Ok(Self::Aes128),
            "aes192" => Ok(Self::Aes192),
            "aes256" => Ok(Self::Aes256),
            other => Err(FederationError::config(format!(
                "unknown encryption strength '{}'",
                other
            ))),
        }
    }
}

/// Encryption capability declared by a node at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionCapability {
    pub scheme: SchemeKind,
    pub strength: EncryptionStrength,
}

impl EncryptionCapability {
    pub fn new(scheme: SchemeKind, strength: EncryptionStrength) -> Self {
        Self { scheme, strength }
    }
}

impl fmt::Display for EncryptionCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scheme, self.strength)
    }
}

/// An encrypted model update as submitted by a node.
///
/// The ciphertext is a sequence of little-endian `u64` lanes. The weight is
/// the node's local sample count and travels in the clear; the tag binds it
/// to the ciphertext, the round and the submitting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedUpdate {
    pub scheme: SchemeKind,
    pub key_id: Uuid,
    pub ciphertext: Bytes,
    pub weight: u64,
    pub tag: [u8; 32],
}

impl EncryptedUpdate {
    /// Number of lanes, or `None` if the ciphertext is not lane-aligned.
    pub fn lane_count(&self) -> Option<usize> {
        if self.ciphertext.is_empty() || self.ciphertext.len() % 8 != 0 {
            return None;
        }
        Some(self.ciphertext.len() / 8)
    }

    pub(crate) fn lanes(&self) -> impl Iterator<Item = u64> + '_ {
        self.ciphertext.chunks_exact(8).map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            u64::from_le_bytes(buf)
        })
    }
}

/// Decoded lanes are signed; sums must stay below this in magnitude.
const SIGNED_LANE_RANGE: u128 = 1 << 63;

/// The aggregation scheme in force for a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationScheme {
    MaskedAdditive {
        /// Fixed-point precision of each lane.
        fractional_bits: u32,
    },
}

impl Default for AggregationScheme {
    fn default() -> Self {
        Self::MaskedAdditive { fractional_bits: 16 }
    }
}

impl AggregationScheme {
    pub fn from_config(config: &AggregationConfig) -> Self {
        match config.scheme {
            SchemeKind::MaskedAdditive => Self::MaskedAdditive {
                fractional_bits: config.fractional_bits,
            },
        }
    }

    pub fn kind(&self) -> SchemeKind {
        match self {
            Self::MaskedAdditive { .. } => SchemeKind::MaskedAdditive,
        }
    }

    pub fn fractional_bits(&self) -> u32 {
        match self {
            Self::MaskedAdditive { fractional_bits } => *fractional_bits,
        }
    }

    /// Largest total weight for which a weighted sum of lanes bounded by
    /// `value_bound` in magnitude still decodes without wrapping.
    pub fn weight_capacity(&self, value_bound: f64) -> u64 {
        match self {
            Self::MaskedAdditive { fractional_bits } => {
                let per_weight = (value_bound.abs() * (1u64 << fractional_bits) as f64)
                    .ceil()
                    .max(1.0);
                if !per_weight.is_finite() || per_weight >= SIGNED_LANE_RANGE as f64 {
                    return 0;
                }
                let capacity = (SIGNED_LANE_RANGE - 1) / per_weight as u128;
                u64::try_from(capacity).unwrap_or(u64::MAX)
            }
        }
    }

    /// Check that an update is sealed under this scheme and the expected key.
    pub fn check_compatible(&self, update: &EncryptedUpdate, key_id: Uuid) -> Result<()> {
        if update.scheme != self.kind() {
            return Err(FederationError::incompatible_scheme(format!(
                "update uses {}, round uses {}",
                update.scheme,
                self.kind()
            )));
        }
        if update.key_id != key_id {
            return Err(FederationError::incompatible_scheme(format!(
                "update sealed for key {}, round key is {}",
                update.key_id, key_id
            )));
        }
        Ok(())
    }

    /// Verify the integrity tag of an update submitted by `node_id`.
    pub fn verify(
        &self,
        verifier: &IntegrityVerifier,
        node_id: &NodeId,
        update: &EncryptedUpdate,
    ) -> bool {
        match self {
            Self::MaskedAdditive { .. } => verifier.verify(node_id, update),
        }
    }

    /// Fold `weight × ciphertext` into the accumulator.
    ///
    /// Ring arithmetic wraps, so the fold is exactly commutative and
    /// associative; any input order yields identical lanes.
    pub fn combine(&self, accumulator: &mut [u64], update: &EncryptedUpdate) -> Result<()> {
        match self {
            Self::MaskedAdditive { .. } => {
                if update.lane_count() != Some(accumulator.len()) {
                    return Err(FederationError::incompatible_scheme(format!(
                        "update has {} bytes, expected {} lanes",
                        update.ciphertext.len(),
                        accumulator.len()
                    )));
                }
                for (acc, lane) in accumulator.iter_mut().zip(update.lanes()) {
                    *acc = acc.wrapping_add(lane.wrapping_mul(update.weight));
                }
                Ok(())
            }
        }
    }

    /// Calibrate the noise added to a decrypted aggregate.
    pub fn calibrate_noise(
        &self,
        mechanism: NoiseMechanism,
        epsilon: f64,
        delta: f64,
        sensitivity: f64,
    ) -> Result<NoiseCalibration> {
        match self {
            Self::MaskedAdditive { .. } => mechanism.calibrate(epsilon, delta, sensitivity),
        }
    }
}
