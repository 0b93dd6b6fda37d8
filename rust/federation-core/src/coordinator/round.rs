// rust/federation-core/src/coordinator/round.rs

//! Per-round state: cohort, accepted updates and lifecycle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::aggregation::{AggregationScheme, Contribution, EncryptedUpdate, IntegrityVerifier};
use crate::compliance::AdmissionRejection;
use crate::config::RoundPolicy;
use crate::error::{FederationError, Result};
use crate::privacy::PrivacyCost;
use crate::registry::NodeId;

pub type RoundId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundState {
    Pending,
    Collecting,
    Aggregating,
    Committed,
    Aborted,
}

impl RoundState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    pub fn can_transition(self, to: RoundState) -> bool {
        use RoundState::*;
        matches!(
            (self, to),
            (Pending, Collecting)
                | (Pending, Aborted)
                | (Collecting, Aggregating)
                | (Collecting, Aborted)
                | (Aggregating, Committed)
                | (Aggregating, Aborted)
        )
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal reason of an aborted round.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AbortReason {
    #[error("insufficient quorum: {available} available, {required} required")]
    InsufficientQuorum { required: usize, available: usize },
    #[error("quorum lost: {remaining} nodes remain, {required} required")]
    QuorumLost { required: usize, remaining: usize },
    #[error("{violations} integrity violations exceed tolerance of {tolerance}")]
    IntegrityViolation { violations: usize, tolerance: usize },
    #[error("privacy budget exceeded: {detail}")]
    BudgetExceeded { detail: String },
    #[error("cancelled: {detail}")]
    Cancelled { detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SubmissionRejection {
    #[error("round is not collecting updates")]
    WrongRound,
    #[error("node is not in the round's cohort")]
    NotInCohort,
    #[error("node already submitted an update this round")]
    DuplicateSubmission,
    #[error("update failed integrity verification")]
    IntegrityViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted,
    Rejected(SubmissionRejection),
}

impl SubmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundOutcome {
    Committed { version: u64 },
    Aborted(AbortReason),
}

impl RoundOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Immutable record of a terminal round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_id: RoundId,
    pub state: RoundState,
    pub outcome: RoundOutcome,
    pub cohort: Vec<NodeId>,
    pub contributors: Vec<NodeId>,
    pub dropped: Vec<NodeId>,
    pub deferred: Vec<NodeId>,
    pub integrity_violations: usize,
    pub compliance_rate: f64,
    pub spend: Option<PrivacyCost>,
    pub aggregate_digest: Option<String>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Round {
    id: RoundId,
    key_id: Uuid,
    state: RoundState,
    policy: RoundPolicy,
    cohort: BTreeSet<NodeId>,
    /// Registered sample count of each cohort node when the round started.
    sample_counts: BTreeMap<NodeId, u64>,
    dropped: BTreeSet<NodeId>,
    deferred: Vec<NodeId>,
    rejected: Vec<(NodeId, AdmissionRejection)>,
    contributions: BTreeMap<NodeId, EncryptedUpdate>,
    integrity_violations: usize,
    violators: BTreeSet<NodeId>,
    compliance_rate: f64,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

impl Round {
    pub fn new(id: RoundId, key_id: Uuid, policy: RoundPolicy, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            key_id,
            state: RoundState::Pending,
            policy,
            cohort: BTreeSet::new(),
            sample_counts: BTreeMap::new(),
            dropped: BTreeSet::new(),
            deferred: Vec::new(),
            rejected: Vec::new(),
            contributions: BTreeMap::new(),
            integrity_violations: 0,
            violators: BTreeSet::new(),
            compliance_rate: 0.0,
            started_at,
            deadline: started_at,
        }
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn policy(&self) -> &RoundPolicy {
        &self.policy
    }

    pub fn cohort(&self) -> &BTreeSet<NodeId> {
        &self.cohort
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn compliance_rate(&self) -> f64 {
        self.compliance_rate
    }

    pub fn integrity_violations(&self) -> usize {
        self.integrity_violations
    }

    pub fn deferred(&self) -> &[NodeId] {
        &self.deferred
    }

    pub fn rejected(&self) -> &[(NodeId, AdmissionRejection)] {
        &self.rejected
    }

    /// Record the outcome of compliance screening and claim-based selection.
    pub fn record_screening(
        &mut self,
        compliance_rate: f64,
        rejected: Vec<(NodeId, AdmissionRejection)>,
        deferred: Vec<NodeId>,
    ) {
        self.compliance_rate = compliance_rate;
        self.rejected = rejected;
        self.deferred = deferred;
    }

    pub fn transition(&mut self, to: RoundState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(FederationError::invalid_transition(self.id, self.state, to));
        }
        tracing::debug!(round_id = self.id, from = %self.state, to = %to, "Round transition");
        self.state = to;
        Ok(())
    }

    /// Open collection for `cohort`, given as node ids with the sample count
    /// each node must submit as its aggregation weight.
    pub fn begin_collecting(
        &mut self,
        cohort: impl IntoIterator<Item = (NodeId, u64)>,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(RoundState::Collecting)?;
        self.sample_counts = cohort.into_iter().collect();
        self.cohort = self.sample_counts.keys().cloned().collect();
        self.deadline = deadline;
        Ok(())
    }

    pub fn sample_count(&self, node_id: &NodeId) -> Option<u64> {
        self.sample_counts.get(node_id).copied()
    }

    pub fn is_active_member(&self, node_id: &NodeId) -> bool {
        self.cohort.contains(node_id) && !self.dropped.contains(node_id)
    }

    /// Cohort members not dropped.
    pub fn active_count(&self) -> usize {
        self.cohort.len() - self.dropped.len()
    }

    pub fn accepted_count(&self) -> usize {
        self.contributions.len()
    }

    /// Active nodes whose only submissions failed integrity checks.
    pub fn filtered_count(&self) -> usize {
        self.violators
            .iter()
            .filter(|n| self.is_active_member(n) && !self.contributions.contains_key(*n))
            .count()
    }

    pub fn all_responded(&self) -> bool {
        self.active_count() > 0 && self.contributions.len() == self.active_count()
    }

    /// Accept one update from a cohort node.
    ///
    /// Structural or tag failures, and a weight other than the node's
    /// registered sample count, count as integrity violations. The node may
    /// resubmit a valid update afterwards.
    pub fn accept(
        &mut self,
        node_id: &NodeId,
        update: EncryptedUpdate,
        scheme: &AggregationScheme,
        verifier: &IntegrityVerifier,
        dimension: usize,
    ) -> std::result::Result<(), SubmissionRejection> {
        if self.state != RoundState::Collecting {
            return Err(SubmissionRejection::WrongRound);
        }
        if !self.is_active_member(node_id) {
            return Err(SubmissionRejection::NotInCohort);
        }
        if self.contributions.contains_key(node_id) {
            return Err(SubmissionRejection::DuplicateSubmission);
        }

        let well_formed = scheme.check_compatible(&update, self.key_id).is_ok()
            && update.lane_count() == Some(dimension)
            && update.weight > 0
            && self.sample_count(node_id) == Some(update.weight);
        if !well_formed || !scheme.verify(verifier, node_id, &update) {
            self.integrity_violations += 1;
            self.violators.insert(node_id.clone());
            return Err(SubmissionRejection::IntegrityViolation);
        }

        self.contributions.insert(node_id.clone(), update);
        Ok(())
    }

    /// Remove a node from the active cohort, discarding any update it sent.
    pub fn drop_node(&mut self, node_id: &NodeId) -> bool {
        if !self.is_active_member(node_id) {
            return false;
        }
        self.dropped.insert(node_id.clone());
        self.contributions.remove(node_id);
        true
    }

    /// Close the input set. Later calls return nothing.
    pub fn take_contributions(&mut self) -> Vec<Contribution> {
        std::mem::take(&mut self.contributions)
            .into_iter()
            .map(|(node_id, update)| Contribution::new(node_id, update))
            .collect()
    }

    pub fn contributor_ids(&self) -> Vec<NodeId> {
        self.contributions.keys().cloned().collect()
    }

    pub fn summary(
        &self,
        outcome: RoundOutcome,
        contributors: Vec<NodeId>,
        spend: Option<PrivacyCost>,
        aggregate_digest: Option<String>,
    ) -> RoundSummary {
        RoundSummary {
            round_id: self.id,
            state: self.state,
            outcome,
            cohort: self.cohort.iter().cloned().collect(),
            contributors,
            dropped: self.dropped.iter().cloned().collect(),
            deferred: self.deferred.clone(),
            integrity_violations: self.integrity_violations,
            compliance_rate: self.compliance_rate,
            spend,
            aggregate_digest,
            started_at: self.started_at,
            deadline: self.deadline,
            finished_at: Utc::now(),
        }
    }
}
