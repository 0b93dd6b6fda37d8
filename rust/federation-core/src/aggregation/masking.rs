// rust/federation-core/src/aggregation/masking.rs

//! Key custody, sealing and unmasking for the masked-additive scheme.
//!
//! ## Key hierarchy
//!
//! ```text
//! round secret (32 bytes, coordinator custody only)
//!   ├── mask root = HMAC(secret, "mask-root")
//!   │     └── node mask key = HMAC(mask root, "mask" || node id)
//!   └── tag root  = HMAC(secret, "tag-root")
//!         └── node tag key  = HMAC(tag root, "tag" || node id)
//! ```
//!
//! A node receives only its own mask and tag keys. The aggregator receives
//! only the tag root (through [`IntegrityVerifier`]), which lets it check
//! tags but derives no mask. Unmasking an aggregate requires the mask root,
//! which never leaves [`RoundKeys`].

use std::fmt;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use super::aggregator::AggregateResult;
use super::scheme::{AggregationScheme, EncryptedUpdate};
use crate::error::{FederationError, Result};
use crate::registry::NodeId;

type HmacSha256 = Hmac<Sha256>;

/// Largest magnitude a scaled lane may take before sealing.
const MAX_SCALED_MAGNITUDE: f64 = (1u64 << 52) as f64;

fn keyed(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key size")
}

fn derive(root: &[u8; 32], label: &[u8], node_id: &NodeId) -> [u8; 32] {
    let mut mac = keyed(root);
    mac.update(label);
    mac.update(node_id.as_str().as_bytes());
    mac.finalize().into_bytes().into()
}

/// Expand a mask key into `lanes` pseudo-random ring elements.
fn keystream(mask_key: &[u8; 32], lanes: usize) -> Vec<u64> {
    let mut out = Vec::with_capacity(lanes);
    let mut block = 0u64;
    while out.len() < lanes {
        let mut mac = keyed(mask_key);
        mac.update(b"lane");
        mac.update(&block.to_le_bytes());
        let bytes = mac.finalize().into_bytes();
        for chunk in bytes.chunks_exact(8) {
            if out.len() == lanes {
                break;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            out.push(u64::from_le_bytes(buf));
        }
        block += 1;
    }
    out
}

fn compute_tag(
    tag_key: &[u8; 32],
    round_id: u64,
    key_id: Uuid,
    node_id: &NodeId,
    weight: u64,
    ciphertext: &[u8],
) -> HmacSha256 {
    let mut mac = keyed(tag_key);
    mac.update(&round_id.to_le_bytes());
    mac.update(key_id.as_bytes());
    mac.update(&(node_id.as_str().len() as u64).to_le_bytes());
    mac.update(node_id.as_str().as_bytes());
    mac.update(&weight.to_le_bytes());
    mac.update(ciphertext);
    mac
}

/// Encode a real value as a fixed-point ring element.
pub fn encode_fixed(value: f64, fractional_bits: u32) -> Result<u64> {
    if !value.is_finite() {
        return Err(FederationError::serialization(format!(
            "cannot encode non-finite value {}",
            value
        )));
    }
    let scaled = (value * (1u64 << fractional_bits) as f64).round();
    if scaled.abs() >= MAX_SCALED_MAGNITUDE {
        return Err(FederationError::serialization(format!(
            "value {} exceeds fixed-point range at {} fractional bits",
            value, fractional_bits
        )));
    }
    Ok(scaled as i64 as u64)
}

/// Decode a ring element produced by [`encode_fixed`] (or a sum of them).
pub fn decode_fixed(lane: u64, fractional_bits: u32) -> f64 {
    lane as i64 as f64 / (1u64 << fractional_bits) as f64
}

/// Per-round key custody. Holding this is holding the aggregate-decryption key.
pub struct RoundKeys {
    round_id: u64,
    key_id: Uuid,
    mask_root: [u8; 32],
    tag_root: [u8; 32],
}

impl fmt::Debug for RoundKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundKeys")
            .field("round_id", &self.round_id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RoundKeys {
    /// Generate fresh keys for a round from the OS random source.
    pub fn generate(round_id: u64) -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret(round_id, Uuid::new_v4(), &secret)
    }

    /// Rebuild keys from a known secret. Used for replay and tests.
    pub fn from_secret(round_id: u64, key_id: Uuid, secret: &[u8; 32]) -> Self {
        let root = |label: &[u8]| -> [u8; 32] {
            let mut mac = keyed(secret);
            mac.update(label);
            mac.finalize().into_bytes().into()
        };
        Self {
            round_id,
            key_id,
            mask_root: root(b"mask-root"),
            tag_root: root(b"tag-root"),
        }
    }

    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    /// Sealing material for one cohort node.
    pub fn credentials(&self, node_id: &NodeId) -> NodeCredentials {
        NodeCredentials {
            round_id: self.round_id,
            key_id: self.key_id,
            node_id: node_id.clone(),
            mask_key: derive(&self.mask_root, b"mask", node_id),
            tag_key: derive(&self.tag_root, b"tag", node_id),
        }
    }

    /// Tag verifier handed to the aggregator.
    pub fn verifier(&self) -> IntegrityVerifier {
        IntegrityVerifier {
            round_id: self.round_id,
            key_id: self.key_id,
            tag_root: self.tag_root,
        }
    }

    /// Remove the masks of every contributor and return the weighted mean.
    pub fn decrypt(
        &self,
        scheme: &AggregationScheme,
        aggregate: &AggregateResult,
    ) -> Result<Vec<f64>> {
        if aggregate.key_id != self.key_id || aggregate.round_id != self.round_id {
            return Err(FederationError::incompatible_scheme(format!(
                "aggregate for round {} key {} cannot be opened with round {} key {}",
                aggregate.round_id, aggregate.key_id, self.round_id, self.key_id
            )));
        }
        if aggregate.total_weight == 0 {
            return Err(FederationError::insufficient_quorum(1, 0));
        }

        let lanes = aggregate.combined.len();
        let mut plain = aggregate.combined.clone();
        for (node_id, weight) in &aggregate.contributors {
            let mask_key = derive(&self.mask_root, b"mask", node_id);
            for (lane, mask) in plain.iter_mut().zip(keystream(&mask_key, lanes)) {
                *lane = lane.wrapping_sub(mask.wrapping_mul(*weight));
            }
        }

        let bits = scheme.fractional_bits();
        let total = aggregate.total_weight as f64;
        Ok(plain
            .into_iter()
            .map(|lane| decode_fixed(lane, bits) / total)
            .collect())
    }
}

/// Sealing keys for a single node in a single round.
#[derive(Clone)]
pub struct NodeCredentials {
    round_id: u64,
    key_id: Uuid,
    node_id: NodeId,
    mask_key: [u8; 32],
    tag_key: [u8; 32],
}

impl fmt::Debug for NodeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCredentials")
            .field("round_id", &self.round_id)
            .field("key_id", &self.key_id)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl NodeCredentials {
    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Encode, mask and tag a local update.
    ///
    /// Callers clip `values` to the configured norm first; the scheme does
    /// not clip.
    pub fn seal(
        &self,
        scheme: &AggregationScheme,
        values: &[f64],
        weight: u64,
    ) -> Result<EncryptedUpdate> {
        if values.is_empty() {
            return Err(FederationError::serialization("cannot seal an empty update"));
        }
        if weight == 0 {
            return Err(FederationError::serialization("update weight must be positive"));
        }

        let bits = scheme.fractional_bits();
        let masks = keystream(&self.mask_key, values.len());
        let mut ciphertext = Vec::with_capacity(values.len() * 8);
        for (value, mask) in values.iter().zip(masks) {
            let lane = encode_fixed(*value, bits)?.wrapping_add(mask);
            ciphertext.extend_from_slice(&lane.to_le_bytes());
        }

        let tag = compute_tag(
            &self.tag_key,
            self.round_id,
            self.key_id,
            &self.node_id,
            weight,
            &ciphertext,
        )
        .finalize()
        .into_bytes()
        .into();

        Ok(EncryptedUpdate {
            scheme: scheme.kind(),
            key_id: self.key_id,
            ciphertext: Bytes::from(ciphertext),
            weight,
            tag,
        })
    }
}

/// Checks integrity tags without the ability to unmask anything.
#[derive(Clone)]
pub struct IntegrityVerifier {
    round_id: u64,
    key_id: Uuid,
    tag_root: [u8; 32],
}

impl fmt::Debug for IntegrityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityVerifier")
            .field("round_id", &self.round_id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl IntegrityVerifier {
    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    /// Constant-time tag check bound to this round, key and node.
    pub fn verify(&self, node_id: &NodeId, update: &EncryptedUpdate) -> bool {
        if update.key_id != self.key_id {
            return false;
        }
        let tag_key = derive(&self.tag_root, b"tag", node_id);
        compute_tag(
            &tag_key,
            self.round_id,
            self.key_id,
            node_id,
            update.weight,
            &update.ciphertext,
        )
        .verify_slice(&update.tag)
        .is_ok()
    }
}
