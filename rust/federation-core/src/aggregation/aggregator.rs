// rust/federation-core/src/aggregation/aggregator.rs

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::masking::IntegrityVerifier;
use super::scheme::{AggregationScheme, EncryptedUpdate, SchemeKind};
use crate::error::{FederationError, Result};
use crate::registry::NodeId;

/// An accepted update paired with the node that submitted it.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub node_id: NodeId,
    pub update: EncryptedUpdate,
}

impl Contribution {
    pub fn new(node_id: NodeId, update: EncryptedUpdate) -> Self {
        Self { node_id, update }
    }
}

/// Why an update was left out of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionReason {
    IntegrityViolation,
    Malformed(String),
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntegrityViolation => write!(f, "integrity violation"),
            Self::Malformed(detail) => write!(f, "malformed update: {}", detail),
        }
    }
}

/// Combined ciphertext of a round. Opening it requires the round's key custody.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    pub round_id: u64,
    pub key_id: Uuid,
    pub scheme: SchemeKind,
    pub combined: Vec<u64>,
    pub total_weight: u64,
    pub contributors: BTreeMap<NodeId, u64>,
    pub excluded: BTreeMap<NodeId, ExclusionReason>,
    pub digest: [u8; 32],
}

impl AggregateResult {
    pub fn integrity_violations(&self) -> usize {
        self.excluded
            .values()
            .filter(|reason| **reason == ExclusionReason::IntegrityViolation)
            .count()
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn max_weight(&self) -> u64 {
        self.contributors.values().copied().max().unwrap_or(0)
    }
}

/// Deterministic fold of encrypted updates into a single aggregate.
#[derive(Debug, Clone)]
pub struct SecureAggregator {
    scheme: AggregationScheme,
    quorum_min: usize,
    dimension: usize,
    weight_limit: u64,
}

impl SecureAggregator {
    /// The weight limit defaults to the scheme's capacity for lanes in [-1, 1].
    pub fn new(scheme: AggregationScheme, quorum_min: usize, dimension: usize) -> Self {
        Self {
            scheme,
            quorum_min,
            dimension,
            weight_limit: scheme.weight_capacity(1.0),
        }
    }

    /// Cap the total weight of an aggregate.
    pub fn with_weight_limit(mut self, weight_limit: u64) -> Self {
        self.weight_limit = weight_limit;
        self
    }

    pub fn weight_limit(&self) -> u64 {
        self.weight_limit
    }

    pub fn scheme(&self) -> &AggregationScheme {
        &self.scheme
    }

    pub fn quorum_min(&self) -> usize {
        self.quorum_min
    }

    /// Verify, filter and combine a closed set of contributions.
    ///
    /// Updates failing integrity or shape checks are excluded individually.
    /// The call fails with `InsufficientQuorum` when fewer than `quorum_min`
    /// updates survive. The result does not depend on input order.
    pub fn aggregate(
        &self,
        contributions: &[Contribution],
        verifier: &IntegrityVerifier,
    ) -> Result<AggregateResult> {
        let round_id = verifier.round_id();
        let key_id = verifier.key_id();

        let mut occurrences: HashMap<&NodeId, usize> = HashMap::new();
        for contribution in contributions {
            *occurrences.entry(&contribution.node_id).or_default() += 1;
        }

        let mut excluded = BTreeMap::new();
        let mut accepted: Vec<&Contribution> = Vec::with_capacity(contributions.len());
        for contribution in contributions {
            let node_id = &contribution.node_id;
            if occurrences.get(node_id).copied().unwrap_or(0) > 1 {
                excluded.insert(
                    node_id.clone(),
                    ExclusionReason::Malformed("duplicate contribution".to_string()),
                );
                continue;
            }
            match self.screen(contribution, verifier, key_id) {
                Ok(()) => accepted.push(contribution),
                Err(reason) => {
                    if reason == ExclusionReason::IntegrityViolation {
                        tracing::warn!(
                            round_id,
                            node_id = %node_id,
                            "Integrity violation, excluding update"
                        );
                    } else {
                        tracing::warn!(
                            round_id,
                            node_id = %node_id,
                            reason = %reason,
                            "Excluding malformed update"
                        );
                    }
                    excluded.insert(node_id.clone(), reason);
                }
            }
        }

        if accepted.len() < self.quorum_min {
            return Err(FederationError::insufficient_quorum(
                self.quorum_min,
                accepted.len(),
            ));
        }

        let total_weight = accepted
            .iter()
            .try_fold(0u64, |acc, c| acc.checked_add(c.update.weight))
            .filter(|total| *total <= self.weight_limit)
            .ok_or_else(|| {
                FederationError::incompatible_scheme(format!(
                    "total weight exceeds fixed-point capacity of {}",
                    self.weight_limit
                ))
            })?;

        let mut combined = vec![0u64; self.dimension];
        let mut contributors = BTreeMap::new();
        for contribution in accepted {
            self.scheme.combine(&mut combined, &contribution.update)?;
            contributors.insert(contribution.node_id.clone(), contribution.update.weight);
        }

        let digest = digest(round_id, key_id, &combined, total_weight, &contributors);

        tracing::debug!(
            round_id,
            contributors = contributors.len(),
            excluded = excluded.len(),
            total_weight,
            "Aggregated round updates"
        );

        Ok(AggregateResult {
            round_id,
            key_id,
            scheme: self.scheme.kind(),
            combined,
            total_weight,
            contributors,
            excluded,
            digest,
        })
    }

    fn screen(
        &self,
        contribution: &Contribution,
        verifier: &IntegrityVerifier,
        key_id: Uuid,
    ) -> std::result::Result<(), ExclusionReason> {
        let update = &contribution.update;
        self.scheme
            .check_compatible(update, key_id)
            .map_err(|e| ExclusionReason::Malformed(e.to_string()))?;
        if update.lane_count() != Some(self.dimension) {
            return Err(ExclusionReason::Malformed(format!(
                "expected {} lanes, got {} bytes",
                self.dimension,
                update.ciphertext.len()
            )));
        }
        if update.weight == 0 {
            return Err(ExclusionReason::Malformed("zero weight".to_string()));
        }
        if !self.scheme.verify(verifier, &contribution.node_id, update) {
            return Err(ExclusionReason::IntegrityViolation);
        }
        Ok(())
    }
}

fn digest(
    round_id: u64,
    key_id: Uuid,
    combined: &[u64],
    total_weight: u64,
    contributors: &BTreeMap<NodeId, u64>,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(round_id.to_le_bytes());
    hasher.update(key_id.as_bytes());
    for lane in combined {
        hasher.update(lane.to_le_bytes());
    }
    hasher.update(total_weight.to_le_bytes());
    for (node_id, weight) in contributors {
        hasher.update((node_id.as_str().len() as u64).to_le_bytes());
        hasher.update(node_id.as_str().as_bytes());
        hasher.update(weight.to_le_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::masking::RoundKeys;
    use proptest::prelude::*;

    fn keys() -> RoundKeys {
        RoundKeys::from_secret(1, Uuid::from_u128(42), &[3u8; 32])
    }

    fn sealed(keys: &RoundKeys, node: &str, values: &[f64], weight: u64) -> Contribution {
        let node_id = NodeId::from(node);
        let update = keys
            .credentials(&node_id)
            .seal(&AggregationScheme::default(), values, weight)
            .unwrap();
        Contribution::new(node_id, update)
    }

    #[test]
    fn test_weighted_mean_after_decrypt() {
        let keys = keys();
        let aggregator = SecureAggregator::new(AggregationScheme::default(), 3, 2);
        let contributions = vec![
            sealed(&keys, "a", &[1.0, -1.0], 1),
            sealed(&keys, "b", &[2.0, 0.0], 2),
            sealed(&keys, "c", &[4.0, 1.0], 1),
        ];

        let result = aggregator.aggregate(&contributions, &keys.verifier()).unwrap();
        assert_eq!(result.total_weight, 4);
        assert_eq!(result.contributors.len(), 3);
        assert_eq!(result.max_weight(), 2);

        let mean = keys.decrypt(aggregator.scheme(), &result).unwrap();
        // (1*1 + 2*2 + 4*1) / 4 and (-1 + 0 + 1) / 4
        assert!((mean[0] - 2.25).abs() < 1e-4);
        assert!(mean[1].abs() < 1e-4);
    }

    #[test]
    fn test_combined_lanes_do_not_reveal_plaintext() {
        let keys = keys();
        let aggregator = SecureAggregator::new(AggregationScheme::default(), 2, 1);
        let contributions = vec![
            sealed(&keys, "a", &[0.0], 1),
            sealed(&keys, "b", &[0.0], 1),
        ];
        let result = aggregator.aggregate(&contributions, &keys.verifier()).unwrap();
        assert_ne!(result.combined[0], 0);
    }

    #[test]
    fn test_corrupted_tag_is_excluded() {
        let keys = keys();
        let aggregator = SecureAggregator::new(AggregationScheme::default(), 3, 1);
        let mut contributions = vec![
            sealed(&keys, "a", &[1.0], 1),
            sealed(&keys, "b", &[1.0], 1),
            sealed(&keys, "c", &[1.0], 1),
            sealed(&keys, "d", &[1.0], 1),
        ];
        contributions[1].update.tag[0] ^= 0xAA;

        let result = aggregator.aggregate(&contributions, &keys.verifier()).unwrap();
        assert_eq!(result.contributors.len(), 3);
        assert_eq!(result.integrity_violations(), 1);
        assert_eq!(
            result.excluded.get(&NodeId::from("b")),
            Some(&ExclusionReason::IntegrityViolation)
        );
    }

    #[test]
    fn test_exclusions_below_quorum_fail() {
        let keys = keys();
        let aggregator = SecureAggregator::new(AggregationScheme::default(), 3, 1);
        let mut contributions = vec![
            sealed(&keys, "a", &[1.0], 1),
            sealed(&keys, "b", &[1.0], 1),
            sealed(&keys, "c", &[1.0], 1),
        ];
        contributions[2].update.tag[5] ^= 0x01;

        let err = aggregator
            .aggregate(&contributions, &keys.verifier())
            .unwrap_err();
        assert!(matches!(
            err,
            FederationError::InsufficientQuorum {
                required: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn test_malformed_updates_are_excluded() {
        let keys = keys();
        let aggregator = SecureAggregator::new(AggregationScheme::default(), 1, 2);
        let good = sealed(&keys, "good", &[1.0, 1.0], 1);
        let short = sealed(&keys, "short", &[1.0], 1);
        let other_key = {
            let foreign = RoundKeys::from_secret(1, Uuid::from_u128(7), &[3u8; 32]);
            sealed(&foreign, "foreign", &[1.0, 1.0], 1)
        };
        let dup_a = sealed(&keys, "dup", &[1.0, 1.0], 1);
        let dup_b = sealed(&keys, "dup", &[2.0, 2.0], 1);

        let result = aggregator
            .aggregate(&[good, short, other_key, dup_a, dup_b], &keys.verifier())
            .unwrap();
        assert_eq!(result.contributors.keys().collect::<Vec<_>>(), vec![&NodeId::from("good")]);
        assert!(matches!(
            result.excluded.get(&NodeId::from("short")),
            Some(ExclusionReason::Malformed(_))
        ));
        assert!(matches!(
            result.excluded.get(&NodeId::from("foreign")),
            Some(ExclusionReason::Malformed(_))
        ));
        assert!(matches!(
            result.excluded.get(&NodeId::from("dup")),
            Some(ExclusionReason::Malformed(_))
        ));
        assert_eq!(result.integrity_violations(), 0);
    }

    #[test]
    fn test_decrypt_rejects_other_round_keys() {
        let keys = keys();
        let aggregator = SecureAggregator::new(AggregationScheme::default(), 1, 1);
        let result = aggregator
            .aggregate(&[sealed(&keys, "a", &[1.0], 1)], &keys.verifier())
            .unwrap();
        let other = RoundKeys::from_secret(2, Uuid::from_u128(42), &[3u8; 32]);
        assert!(other.decrypt(aggregator.scheme(), &result).is_err());
    }

    #[test]
    fn test_total_weight_beyond_capacity_is_rejected() {
        let keys = keys();
        let scheme = AggregationScheme::MaskedAdditive { fractional_bits: 32 };
        let aggregator = SecureAggregator::new(scheme, 3, 1);
        assert_eq!(aggregator.weight_limit(), (1u64 << 31) - 1);

        let seal = |node: &str, weight: u64| {
            let node_id = NodeId::from(node);
            let update = keys
                .credentials(&node_id)
                .seal(&scheme, &[1.0], weight)
                .unwrap();
            Contribution::new(node_id, update)
        };

        let oversized = vec![
            seal("a", 1_000_000_000),
            seal("b", 1_000_000_000),
            seal("c", 1_000_000_000),
        ];
        let err = aggregator.aggregate(&oversized, &keys.verifier()).unwrap_err();
        assert!(matches!(err, FederationError::IncompatibleScheme { .. }));

        // Exactly at capacity the sum still decodes.
        let aggregator = SecureAggregator::new(scheme, 2, 1);
        let at_limit = vec![seal("a", (1 << 30) - 1), seal("b", 1 << 30)];
        let result = aggregator.aggregate(&at_limit, &keys.verifier()).unwrap();
        assert_eq!(result.total_weight, aggregator.weight_limit());
        let mean = keys.decrypt(&scheme, &result).unwrap();
        assert!((mean[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_weight_limit() {
        let keys = keys();
        let aggregator = SecureAggregator::new(AggregationScheme::default(), 2, 1).with_weight_limit(5);
        let contributions = vec![sealed(&keys, "a", &[0.5], 3), sealed(&keys, "b", &[0.5], 3)];
        assert!(aggregator.aggregate(&contributions, &keys.verifier()).is_err());
        let contributions = vec![sealed(&keys, "a", &[0.5], 2), sealed(&keys, "b", &[0.5], 3)];
        assert!(aggregator.aggregate(&contributions, &keys.verifier()).is_ok());
    }

    fn inputs() -> impl Strategy<Value = (Vec<(Vec<f64>, u64)>, Vec<usize>)> {
        prop::collection::vec(
            (prop::collection::vec(-1.0f64..1.0, 3), 1u64..10_000),
            2..7,
        )
        .prop_flat_map(|updates| {
            let order: Vec<usize> = (0..updates.len()).collect();
            (Just(updates), Just(order).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn prop_aggregate_is_order_independent((updates, order) in inputs()) {
            let keys = keys();
            let aggregator = SecureAggregator::new(AggregationScheme::default(), 2, 3);
            let contributions: Vec<Contribution> = updates
                .iter()
                .enumerate()
                .map(|(i, (values, weight))| sealed(&keys, &format!("node-{}", i), values, *weight))
                .collect();
            let permuted: Vec<Contribution> =
                order.iter().map(|&i| contributions[i].clone()).collect();

            let a = aggregator.aggregate(&contributions, &keys.verifier()).unwrap();
            let b = aggregator.aggregate(&permuted, &keys.verifier()).unwrap();
            prop_assert_eq!(&a.combined, &b.combined);
            prop_assert_eq!(a.digest, b.digest);
            prop_assert_eq!(a.total_weight, b.total_weight);
        }
    }
}
