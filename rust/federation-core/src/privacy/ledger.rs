// rust/federation-core/src/privacy/ledger.rs

//! Cumulative differential-privacy accounting.
//!
//! All ledger state sits behind one mutex. Spending is two-phase:
//! [`PrivacyBudgetLedger::authorize`] checks caps and snapshots the version
//! of every touched balance, and [`PrivacyBudgetLedger::commit`] applies the
//! spend only if none of those versions moved in between. Two rounds racing
//! for the same node's remaining budget cannot both commit; the loser sees
//! [`CommitError::Conflict`] and re-authorizes against the new balances.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{FederationError, Result};
use crate::registry::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCaps {
    pub epsilon_per_node: f64,
    pub epsilon_global: f64,
    pub delta_per_node: f64,
    pub delta_global: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyCost {
    pub epsilon: f64,
    pub delta: f64,
}

impl PrivacyCost {
    pub fn new(epsilon: f64, delta: f64) -> Self {
        Self { epsilon, delta }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMetric {
    Epsilon,
    Delta,
}

impl fmt::Display for BudgetMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epsilon => write!(f, "epsilon"),
            Self::Delta => write!(f, "delta"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum BudgetExceeded {
    #[error("node '{node_id}' {metric} budget exceeded: spent {spent}, cost {cost}, cap {cap}")]
    Node {
        node_id: NodeId,
        metric: BudgetMetric,
        spent: f64,
        cost: f64,
        cap: f64,
    },
    #[error("global {metric} budget exceeded: spent {spent}, cost {cost}, cap {cap}")]
    Global {
        metric: BudgetMetric,
        spent: f64,
        cost: f64,
        cap: f64,
    },
    #[error("ledger contention persisted after {attempts} attempts")]
    Contention { attempts: u32 },
}

/// Proof that a spend fit within the caps at a given ledger version.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub round_id: u64,
    pub participants: Vec<NodeId>,
    pub cost: PrivacyCost,
    node_versions: BTreeMap<NodeId, u64>,
    global_version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerDecision {
    Authorized(Authorization),
    Denied(BudgetExceeded),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommitError {
    /// `node_id` is `None` when the global balance or the caps moved.
    #[error("ledger balance moved since authorization")]
    Conflict { node_id: Option<NodeId> },
    #[error("round {round_id} already spent its budget")]
    AlreadyCommitted { round_id: u64 },
}

/// One committed expenditure. History is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendRecord {
    pub round_id: u64,
    pub participants: Vec<NodeId>,
    pub epsilon: f64,
    pub delta: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Balance {
    epsilon: f64,
    delta: f64,
    version: u64,
}

#[derive(Debug)]
struct LedgerState {
    caps: BudgetCaps,
    nodes: HashMap<NodeId, Balance>,
    global: Balance,
    committed: HashSet<u64>,
    history: Vec<SpendRecord>,
}

impl LedgerState {
    fn node(&self, node_id: &NodeId) -> Balance {
        self.nodes.get(node_id).copied().unwrap_or_default()
    }

    fn check(&self, participants: &[NodeId], cost: PrivacyCost) -> Option<BudgetExceeded> {
        let caps = self.caps;
        for node_id in participants {
            let balance = self.node(node_id);
            if balance.epsilon + cost.epsilon > caps.epsilon_per_node {
                return Some(BudgetExceeded::Node {
                    node_id: node_id.clone(),
                    metric: BudgetMetric::Epsilon,
                    spent: balance.epsilon,
                    cost: cost.epsilon,
                    cap: caps.epsilon_per_node,
                });
            }
            if balance.delta + cost.delta > caps.delta_per_node {
                return Some(BudgetExceeded::Node {
                    node_id: node_id.clone(),
                    metric: BudgetMetric::Delta,
                    spent: balance.delta,
                    cost: cost.delta,
                    cap: caps.delta_per_node,
                });
            }
        }
        if self.global.epsilon + cost.epsilon > caps.epsilon_global {
            return Some(BudgetExceeded::Global {
                metric: BudgetMetric::Epsilon,
                spent: self.global.epsilon,
                cost: cost.epsilon,
                cap: caps.epsilon_global,
            });
        }
        if self.global.delta + cost.delta > caps.delta_global {
            return Some(BudgetExceeded::Global {
                metric: BudgetMetric::Delta,
                spent: self.global.delta,
                cost: cost.delta,
                cap: caps.delta_global,
            });
        }
        None
    }
}

#[derive(Debug)]
pub struct PrivacyBudgetLedger {
    state: Mutex<LedgerState>,
}

impl PrivacyBudgetLedger {
    pub fn new(caps: BudgetCaps) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                caps,
                nodes: HashMap::new(),
                global: Balance::default(),
                committed: HashSet::new(),
                history: Vec::new(),
            }),
        }
    }

    pub fn caps(&self) -> BudgetCaps {
        self.state.lock().caps
    }

    /// Replace the caps. Existing spend is untouched; lowering a cap below
    /// current spend simply denies further rounds for that balance.
    pub fn set_caps(&self, caps: BudgetCaps) {
        self.state.lock().caps = caps;
    }

    /// Check whether charging `cost` to every participant and to the global
    /// counter stays within caps. Nothing is spent until [`Self::commit`].
    pub fn authorize(
        &self,
        round_id: u64,
        participants: &[NodeId],
        cost: PrivacyCost,
    ) -> Result<LedgerDecision> {
        if !cost.epsilon.is_finite() || cost.epsilon < 0.0 {
            return Err(FederationError::privacy(format!(
                "epsilon cost must be non-negative, got {}",
                cost.epsilon
            )));
        }
        if !cost.delta.is_finite() || cost.delta < 0.0 {
            return Err(FederationError::privacy(format!(
                "delta cost must be non-negative, got {}",
                cost.delta
            )));
        }

        let mut participants = participants.to_vec();
        participants.sort();
        participants.dedup();

        let state = self.state.lock();
        if let Some(exceeded) = state.check(&participants, cost) {
            tracing::info!(round_id, reason = %exceeded, "Privacy budget denied");
            return Ok(LedgerDecision::Denied(exceeded));
        }

        let node_versions = participants
            .iter()
            .map(|id| (id.clone(), state.node(id).version))
            .collect();
        Ok(LedgerDecision::Authorized(Authorization {
            round_id,
            participants,
            cost,
            node_versions,
            global_version: state.global.version,
        }))
    }

    /// Apply an authorized spend if no touched balance moved since.
    pub fn commit(&self, authorization: &Authorization) -> std::result::Result<SpendRecord, CommitError> {
        let mut state = self.state.lock();

        if state.committed.contains(&authorization.round_id) {
            return Err(CommitError::AlreadyCommitted {
                round_id: authorization.round_id,
            });
        }
        for (node_id, version) in &authorization.node_versions {
            if state.node(node_id).version != *version {
                return Err(CommitError::Conflict {
                    node_id: Some(node_id.clone()),
                });
            }
        }
        if state.global.version != authorization.global_version {
            return Err(CommitError::Conflict { node_id: None });
        }
        // Caps may have been lowered since authorization.
        if state
            .check(&authorization.participants, authorization.cost)
            .is_some()
        {
            return Err(CommitError::Conflict { node_id: None });
        }

        let cost = authorization.cost;
        for node_id in &authorization.participants {
            let balance = state.nodes.entry(node_id.clone()).or_default();
            balance.epsilon += cost.epsilon;
            balance.delta += cost.delta;
            balance.version += 1;
        }
        state.global.epsilon += cost.epsilon;
        state.global.delta += cost.delta;
        state.global.version += 1;
        state.committed.insert(authorization.round_id);

        let record = SpendRecord {
            round_id: authorization.round_id,
            participants: authorization.participants.clone(),
            epsilon: cost.epsilon,
            delta: cost.delta,
            recorded_at: Utc::now(),
        };
        state.history.push(record.clone());
        Ok(record)
    }

    pub fn spent_for(&self, node_id: &NodeId) -> PrivacyCost {
        let balance = self.state.lock().node(node_id);
        PrivacyCost::new(balance.epsilon, balance.delta)
    }

    pub fn spent_global(&self) -> PrivacyCost {
        let global = self.state.lock().global;
        PrivacyCost::new(global.epsilon, global.delta)
    }

    pub fn remaining_for(&self, node_id: &NodeId) -> PrivacyCost {
        let state = self.state.lock();
        let balance = state.node(node_id);
        PrivacyCost::new(
            (state.caps.epsilon_per_node - balance.epsilon).max(0.0),
            (state.caps.delta_per_node - balance.delta).max(0.0),
        )
    }

    pub fn remaining_global(&self) -> PrivacyCost {
        let state = self.state.lock();
        PrivacyCost::new(
            (state.caps.epsilon_global - state.global.epsilon).max(0.0),
            (state.caps.delta_global - state.global.delta).max(0.0),
        )
    }

    pub fn history(&self) -> Vec<SpendRecord> {
        self.state.lock().history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn caps(per_node: f64, global: f64) -> BudgetCaps {
        BudgetCaps {
            epsilon_per_node: per_node,
            epsilon_global: global,
            delta_per_node: 1e-3,
            delta_global: 1e-2,
        }
    }

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn authorized(decision: LedgerDecision) -> Authorization {
        match decision {
            LedgerDecision::Authorized(auth) => auth,
            LedgerDecision::Denied(reason) => panic!("unexpected denial: {}", reason),
        }
    }

    #[test]
    fn test_authorize_then_commit_spends() {
        let ledger = PrivacyBudgetLedger::new(caps(1.0, 10.0));
        let nodes = ids(&["a", "b"]);
        let auth = authorized(
            ledger
                .authorize(1, &nodes, PrivacyCost::new(0.4, 1e-5))
                .unwrap(),
        );

        // Authorization alone spends nothing.
        assert_eq!(ledger.spent_global().epsilon, 0.0);

        let record = ledger.commit(&auth).unwrap();
        assert_eq!(record.round_id, 1);
        assert_eq!(ledger.spent_for(&NodeId::from("a")).epsilon, 0.4);
        assert_eq!(ledger.spent_global().epsilon, 0.4);
        assert!((ledger.remaining_for(&NodeId::from("b")).epsilon - 0.6).abs() < 1e-12);
        assert_eq!(ledger.history().len(), 1);
    }

    #[test]
    fn test_denies_over_node_cap() {
        let ledger = PrivacyBudgetLedger::new(caps(1.0, 10.0));
        let nodes = ids(&["a"]);
        let decision = ledger
            .authorize(1, &nodes, PrivacyCost::new(1.5, 0.0))
            .unwrap();
        assert!(matches!(
            decision,
            LedgerDecision::Denied(BudgetExceeded::Node {
                metric: BudgetMetric::Epsilon,
                ..
            })
        ));
    }

    #[test]
    fn test_denies_over_global_cap_and_delta() {
        let ledger = PrivacyBudgetLedger::new(caps(5.0, 1.0));
        let decision = ledger
            .authorize(1, &ids(&["a"]), PrivacyCost::new(2.0, 0.0))
            .unwrap();
        assert!(matches!(
            decision,
            LedgerDecision::Denied(BudgetExceeded::Global { .. })
        ));

        let decision = ledger
            .authorize(2, &ids(&["a"]), PrivacyCost::new(0.1, 0.5))
            .unwrap();
        assert!(matches!(
            decision,
            LedgerDecision::Denied(BudgetExceeded::Node {
                metric: BudgetMetric::Delta,
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_negative_cost() {
        let ledger = PrivacyBudgetLedger::new(caps(1.0, 1.0));
        assert!(ledger
            .authorize(1, &ids(&["a"]), PrivacyCost::new(-0.1, 0.0))
            .is_err());
    }

    #[test]
    fn test_overlapping_rounds_only_one_commits() {
        let ledger = PrivacyBudgetLedger::new(caps(1.0, 10.0));
        let cost = PrivacyCost::new(0.6, 0.0);

        let a = authorized(ledger.authorize(1, &ids(&["n1", "n2"]), cost).unwrap());
        let b = authorized(ledger.authorize(2, &ids(&["n2", "n3"]), cost).unwrap());

        ledger.commit(&a).unwrap();
        assert_eq!(
            ledger.commit(&b),
            Err(CommitError::Conflict {
                node_id: Some(NodeId::from("n2"))
            })
        );

        // Re-authorizing against the moved balance is denied.
        let retry = ledger.authorize(2, &ids(&["n2", "n3"]), cost).unwrap();
        assert!(matches!(
            retry,
            LedgerDecision::Denied(BudgetExceeded::Node { ref node_id, .. }) if node_id.as_str() == "n2"
        ));
        assert_eq!(ledger.spent_for(&NodeId::from("n3")).epsilon, 0.0);
    }

    #[test]
    fn test_double_commit_rejected() {
        let ledger = PrivacyBudgetLedger::new(caps(1.0, 10.0));
        let auth = authorized(
            ledger
                .authorize(1, &ids(&["a"]), PrivacyCost::new(0.1, 0.0))
                .unwrap(),
        );
        ledger.commit(&auth).unwrap();
        assert_eq!(
            ledger.commit(&auth),
            Err(CommitError::AlreadyCommitted { round_id: 1 })
        );
    }

    #[test]
    fn test_lowered_caps_block_pending_commit() {
        let ledger = PrivacyBudgetLedger::new(caps(1.0, 10.0));
        let auth = authorized(
            ledger
                .authorize(1, &ids(&["a"]), PrivacyCost::new(0.5, 0.0))
                .unwrap(),
        );
        ledger.set_caps(caps(0.2, 10.0));
        assert!(matches!(ledger.commit(&auth), Err(CommitError::Conflict { .. })));
        assert_eq!(ledger.spent_global().epsilon, 0.0);
    }

    #[test]
    fn test_concurrent_spends_respect_node_cap() {
        let ledger = PrivacyBudgetLedger::new(caps(1.0, 10.0));
        let cost = PrivacyCost::new(0.3, 0.0);
        let nodes = ids(&["n0", "n1", "n2"]);

        let committed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8u64)
                .map(|round_id| {
                    let ledger = &ledger;
                    let participants = vec![
                        nodes[round_id as usize % 3].clone(),
                        nodes[(round_id as usize + 1) % 3].clone(),
                    ];
                    scope.spawn(move || loop {
                        match ledger.authorize(round_id, &participants, cost).unwrap() {
                            LedgerDecision::Denied(_) => return 0,
                            LedgerDecision::Authorized(auth) => match ledger.commit(&auth) {
                                Ok(_) => return 1,
                                Err(CommitError::Conflict { .. }) => continue,
                                Err(e) => panic!("unexpected commit error: {}", e),
                            },
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert!(committed >= 1);
        assert_eq!(ledger.history().len(), committed);
        for node in &nodes {
            assert!(ledger.spent_for(node).epsilon <= 1.0 + 1e-12);
        }
        assert!((ledger.spent_global().epsilon - 0.3 * committed as f64).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_spend_never_exceeds_caps(
            rounds in prop::collection::vec(
                (prop::collection::btree_set(0usize..6, 1..4), 0.0f64..0.8),
                1..40,
            )
        ) {
            let ledger = PrivacyBudgetLedger::new(caps(2.0, 5.0));
            for (round_id, (members, epsilon)) in rounds.into_iter().enumerate() {
                let nodes: Vec<NodeId> = members
                    .into_iter()
                    .map(|i| NodeId::from(format!("n{}", i)))
                    .collect();
                let decision = ledger
                    .authorize(round_id as u64, &nodes, PrivacyCost::new(epsilon, 0.0))
                    .unwrap();
                if let LedgerDecision::Authorized(auth) = decision {
                    ledger.commit(&auth).unwrap();
                }
            }
            for i in 0..6 {
                let spent = ledger.spent_for(&NodeId::from(format!("n{}", i)));
                prop_assert!(spent.epsilon <= 2.0);
            }
            prop_assert!(ledger.spent_global().epsilon <= 5.0);
        }
    }
}
