// rust/federation-core/src/coordinator/mod.rs

//! Round orchestration.
//!
//! A [`RoundCoordinator`] owns every in-flight [`Round`] behind one async
//! `RwLock`. The lifecycle of a round:
//!
//! 1. `start_round` screens Active nodes through the compliance gate,
//!    claims a cohort in the registry and arms the deadline timer.
//! 2. Nodes fetch their sealing keys with `credentials` and `submit`
//!    concurrently. Unreachable nodes are dropped from the cohort.
//! 3. On deadline or full response the input set is closed, re-checked
//!    against a fresh registry snapshot and aggregated.
//! 4. The round waits for all lower-numbered rounds to finish, then spends
//!    privacy budget and publishes the noisy update as the next model.
//!
//! Every failure ends in a terminal round; the current model is always
//! well defined.

pub mod round;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::aggregation::{
    AggregationScheme, EncryptedUpdate, NodeCredentials, RoundKeys, SecureAggregator,
};
use crate::audit::{AuditLog, AuditOutcome, AuditRecord};
use crate::compliance::{AdmissionRejection, ComplianceGate};
use crate::config::{FederationConfig, RoundPolicy};
use crate::error::{FederationError, Result};
use crate::model::{GlobalModel, ModelLog, ModelMetrics};
use crate::privacy::{
    l2_norm, BudgetExceeded, CommitError, LedgerDecision, NoiseInjector, PrivacyBudgetLedger,
    PrivacyCost,
};
use crate::registry::{Liveness, LivenessTransition, NodeId, NodeRegistry};
use crate::retry::{retry_async, RetryConfig, RetryResult};

pub use round::{
    AbortReason, Round, RoundId, RoundOutcome, RoundState, RoundSummary, SubmissionOutcome,
    SubmissionRejection,
};

/// Returned by `start_round`.
#[derive(Debug, Clone)]
pub struct RoundTicket {
    pub round_id: RoundId,
    pub key_id: Uuid,
    pub state: RoundState,
    pub cohort: Vec<NodeId>,
    pub deferred: Vec<NodeId>,
    pub rejected: Vec<(NodeId, AdmissionRejection)>,
    pub compliance_rate: f64,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseTrigger {
    Deadline,
    FullResponse,
}

struct SequencerState {
    next: RoundId,
    in_flight: BTreeSet<RoundId>,
}

/// Hands out round numbers and releases commits in that order.
struct CommitSequencer {
    state: Mutex<SequencerState>,
    notify: Notify,
}

impl CommitSequencer {
    fn new() -> Self {
        Self {
            state: Mutex::new(SequencerState {
                next: 1,
                in_flight: BTreeSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn open(&self) -> RoundId {
        let mut state = self.state.lock();
        let id = state.next;
        state.next += 1;
        state.in_flight.insert(id);
        id
    }

    fn finish(&self, id: RoundId) {
        self.state.lock().in_flight.remove(&id);
        self.notify.notify_waiters();
    }

    fn is_turn(&self, id: RoundId) -> bool {
        self.state.lock().in_flight.range(..id).next().is_none()
    }

    async fn wait_turn(&self, id: RoundId) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a finish in between is not missed.
            notified.as_mut().enable();
            if self.is_turn(id) {
                return;
            }
            notified.await;
        }
    }
}

struct RoundSlot {
    round: Round,
    keys: Arc<RoundKeys>,
    outcome: watch::Sender<Option<RoundOutcome>>,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct Finalization {
    contributors: Option<Vec<NodeId>>,
    spend: Option<PrivacyCost>,
    digest: Option<String>,
}

struct CommitPlan {
    participants: Vec<NodeId>,
    cost: PrivacyCost,
    update: Vec<f64>,
    metrics: ModelMetrics,
    digest: String,
}

enum CommitFailure {
    Denied(BudgetExceeded),
    Invalid(FederationError),
    NotAggregating,
}

struct Inner {
    config: FederationConfig,
    policy: parking_lot::RwLock<RoundPolicy>,
    registry: Arc<NodeRegistry>,
    ledger: Arc<PrivacyBudgetLedger>,
    gate: ComplianceGate,
    scheme: AggregationScheme,
    models: ModelLog,
    audit: AuditLog,
    rounds: RwLock<HashMap<RoundId, RoundSlot>>,
    history: parking_lot::RwLock<Vec<RoundSummary>>,
    sequencer: CommitSequencer,
    noise: Mutex<NoiseInjector>,
    retry: RetryConfig,
}

#[derive(Clone)]
pub struct RoundCoordinator {
    inner: Arc<Inner>,
}

impl RoundCoordinator {
    pub fn new(
        config: FederationConfig,
        registry: Arc<NodeRegistry>,
        genesis: GlobalModel,
    ) -> Result<Self> {
        config.validate()?;
        if genesis.parameters.len() != config.model.dimension {
            return Err(FederationError::config(format!(
                "genesis model has {} parameters, model.dimension is {}",
                genesis.parameters.len(),
                config.model.dimension
            )));
        }

        let audit = AuditLog::from_config(config.audit.path.as_deref())?;
        let policy = config.policy.clone();
        let scheme = AggregationScheme::from_config(&config.aggregation);
        let noise = match config.privacy.noise_seed {
            Some(seed) => NoiseInjector::seeded(seed),
            None => NoiseInjector::new(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                ledger: Arc::new(PrivacyBudgetLedger::new(policy.budget_caps())),
                policy: parking_lot::RwLock::new(policy),
                registry,
                gate: ComplianceGate::new(scheme.kind()),
                scheme,
                models: ModelLog::new(genesis),
                audit,
                rounds: RwLock::new(HashMap::new()),
                history: parking_lot::RwLock::new(Vec::new()),
                sequencer: CommitSequencer::new(),
                noise: Mutex::new(noise),
                retry: RetryConfig::from(&config.ledger),
                config,
            }),
        })
    }

    pub fn config(&self) -> &FederationConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.registry
    }

    pub fn ledger(&self) -> &Arc<PrivacyBudgetLedger> {
        &self.inner.ledger
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn scheme(&self) -> &AggregationScheme {
        &self.inner.scheme
    }

    pub fn models(&self) -> &ModelLog {
        &self.inner.models
    }

    pub fn current_model(&self) -> Arc<GlobalModel> {
        self.inner.models.current()
    }

    pub fn policy(&self) -> RoundPolicy {
        self.inner.policy.read().clone()
    }

    /// Replace the policy for rounds started from now on. Budget caps apply
    /// to the ledger immediately.
    pub fn set_policy(&self, policy: RoundPolicy) -> Result<()> {
        policy.validate()?;
        if let Some(max) = self.inner.config.aggregation.max_cohort_size {
            if max < policy.quorum_min {
                return Err(FederationError::config(
                    "policy.quorum_min exceeds aggregation.max_cohort_size",
                ));
            }
        }
        self.inner.ledger.set_caps(policy.budget_caps());
        *self.inner.policy.write() = policy;
        tracing::info!("Round policy replaced");
        Ok(())
    }

    /// Summaries of terminal rounds in the order they finished.
    pub fn history(&self) -> Vec<RoundSummary> {
        self.inner.history.read().clone()
    }

    pub async fn round_state(&self, round_id: RoundId) -> Option<RoundState> {
        if let Some(slot) = self.inner.rounds.read().await.get(&round_id) {
            return Some(slot.round.state());
        }
        self.inner
            .history
            .read()
            .iter()
            .find(|s| s.round_id == round_id)
            .map(|s| s.state)
    }

    /// Select a cohort and open collection.
    ///
    /// A round whose admissible, unclaimed cohort is below quorum is
    /// returned already Aborted with `InsufficientQuorum`.
    pub async fn start_round(&self) -> Result<RoundTicket> {
        let inner = &self.inner;
        let policy = self.policy();
        let deadline_in = policy.round_deadline();
        let deadline_span = chrono::Duration::from_std(deadline_in)
            .map_err(|e| FederationError::config_with_source("round deadline out of range", e))?;

        let round_id = inner.sequencer.open();
        let keys = Arc::new(RoundKeys::generate(round_id));
        let started_at = Utc::now();
        let mut round = Round::new(round_id, keys.key_id(), policy.clone(), started_at);

        let snapshot = inner.registry.snapshot();
        let screening = inner.gate.evaluate_cohort(snapshot.active(), &policy);
        let claim = inner.registry.try_claim(
            round_id,
            &screening.admitted,
            policy.quorum_min,
            inner.config.aggregation.max_cohort_size,
        );
        round.record_screening(
            screening.compliance_rate(),
            screening.rejected.clone(),
            claim.deferred.clone(),
        );

        let mut ticket = RoundTicket {
            round_id,
            key_id: keys.key_id(),
            state: RoundState::Collecting,
            cohort: claim.claimed.clone(),
            deferred: claim.deferred.clone(),
            rejected: screening.rejected.clone(),
            compliance_rate: screening.compliance_rate(),
            deadline: started_at + deadline_span,
        };

        let (outcome, _) = watch::channel(None);
        let mut rounds = inner.rounds.write().await;

        let opened = if claim.claimed.is_empty() {
            Err(AbortReason::InsufficientQuorum {
                required: policy.quorum_min,
                available: screening.admitted.len().saturating_sub(claim.deferred.len()),
            })
        } else {
            round
                .begin_collecting(
                    claim.claimed.iter().map(|id| {
                        let samples = snapshot.get(id).map(|n| n.sample_count).unwrap_or(0);
                        (id.clone(), samples)
                    }),
                    ticket.deadline,
                )
                .map_err(|e| AbortReason::Cancelled {
                    detail: e.to_string(),
                })
        };

        if let Err(reason) = opened {
            rounds.insert(
                round_id,
                RoundSlot {
                    round,
                    keys,
                    outcome,
                    timer: None,
                },
            );
            self.finalize_locked(
                &mut rounds,
                round_id,
                RoundOutcome::Aborted(reason),
                Finalization::default(),
            );
            ticket.state = RoundState::Aborted;
            ticket.cohort.clear();
            return Ok(ticket);
        }

        let timer = {
            let this = self.clone();
            let at = tokio::time::Instant::now() + deadline_in;
            tokio::spawn(async move {
                tokio::time::sleep_until(at).await;
                this.close_collection(round_id, CloseTrigger::Deadline).await;
            })
            .abort_handle()
        };
        rounds.insert(
            round_id,
            RoundSlot {
                round,
                keys,
                outcome,
                timer: Some(timer),
            },
        );

        tracing::info!(
            round_id,
            cohort = ticket.cohort.len(),
            deferred = ticket.deferred.len(),
            rejected = ticket.rejected.len(),
            compliance_rate = ticket.compliance_rate,
            "Round collecting"
        );
        Ok(ticket)
    }

    /// Per-round sealing keys for a cohort node.
    pub async fn credentials(&self, round_id: RoundId, node_id: &NodeId) -> Result<NodeCredentials> {
        let rounds = self.inner.rounds.read().await;
        let slot = rounds
            .get(&round_id)
            .ok_or_else(|| FederationError::unknown_round(round_id))?;
        if !slot.round.is_active_member(node_id) {
            return Err(FederationError::not_in_cohort(round_id, node_id.as_str()));
        }
        Ok(slot.keys.credentials(node_id))
    }

    pub async fn submit(
        &self,
        round_id: RoundId,
        node_id: &NodeId,
        update: EncryptedUpdate,
    ) -> SubmissionOutcome {
        let inner = &self.inner;
        let mut rounds = inner.rounds.write().await;
        let Some(slot) = rounds.get_mut(&round_id) else {
            tracing::warn!(round_id, node_id = %node_id, "Submission for unknown or finished round");
            return SubmissionOutcome::Rejected(SubmissionRejection::WrongRound);
        };

        let verifier = slot.keys.verifier();
        match slot
            .round
            .accept(node_id, update, &inner.scheme, &verifier, inner.config.model.dimension)
        {
            Ok(()) => {
                if let Err(e) = inner.registry.record_participation(node_id, round_id) {
                    tracing::debug!(round_id, node_id = %node_id, error = %e, "Participation not recorded");
                }
                tracing::debug!(round_id, node_id = %node_id, "Accepted update");
                if slot.round.all_responded() {
                    self.spawn_close(round_id, CloseTrigger::FullResponse);
                }
                SubmissionOutcome::Accepted
            }
            Err(reason) => {
                tracing::warn!(round_id, node_id = %node_id, %reason, "Rejected update");
                SubmissionOutcome::Rejected(reason)
            }
        }
    }

    /// Resolves once the round is Committed or Aborted.
    pub async fn wait_for_outcome(&self, round_id: RoundId) -> Result<RoundOutcome> {
        let mut rx = {
            let rounds = self.inner.rounds.read().await;
            match rounds.get(&round_id) {
                Some(slot) => slot.outcome.subscribe(),
                None => return self.finished_outcome(round_id),
            }
        };
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return Ok(outcome);
            }
            if rx.changed().await.is_err() {
                if let Some(outcome) = rx.borrow().clone() {
                    return Ok(outcome);
                }
                return self.finished_outcome(round_id);
            }
        }
    }

    fn finished_outcome(&self, round_id: RoundId) -> Result<RoundOutcome> {
        self.inner
            .history
            .read()
            .iter()
            .find(|s| s.round_id == round_id)
            .map(|s| s.outcome.clone())
            .ok_or_else(|| FederationError::unknown_round(round_id))
    }

    /// Abort a round that has not committed yet.
    pub async fn abort_round(&self, round_id: RoundId, detail: impl Into<String>) -> Result<RoundOutcome> {
        let mut rounds = self.inner.rounds.write().await;
        if !rounds.contains_key(&round_id) {
            let finished = self
                .inner
                .history
                .read()
                .iter()
                .find(|s| s.round_id == round_id)
                .map(|s| s.state);
            return Err(match finished {
                Some(state) => FederationError::invalid_transition(round_id, state, RoundState::Aborted),
                None => FederationError::unknown_round(round_id),
            });
        }
        let outcome = RoundOutcome::Aborted(AbortReason::Cancelled {
            detail: detail.into(),
        });
        self.finalize_locked(&mut rounds, round_id, outcome.clone(), Finalization::default());
        Ok(outcome)
    }

    /// Run a liveness sweep and drop newly Unreachable nodes from their rounds.
    pub async fn sweep_liveness(&self, now: DateTime<Utc>) -> Vec<LivenessTransition> {
        let transitions = self.inner.registry.sweep(now);
        for transition in &transitions {
            if transition.to != Liveness::Unreachable {
                continue;
            }
            if let Some(round_id) = self.inner.registry.claimed_by(&transition.node_id) {
                self.drop_from_round(round_id, &transition.node_id).await;
            }
        }
        transitions
    }

    /// Drop a node from whichever round holds it.
    pub async fn drop_node(&self, node_id: &NodeId) -> Option<RoundId> {
        let round_id = self.inner.registry.claimed_by(node_id)?;
        self.drop_from_round(round_id, node_id).await;
        Some(round_id)
    }

    /// Deregister a node. A round depending on it loses it as if it had
    /// become Unreachable.
    pub async fn deregister_node(&self, node_id: &NodeId) -> Result<()> {
        if let Some(round_id) = self.inner.registry.deregister(node_id)? {
            self.drop_from_round(round_id, node_id).await;
        }
        Ok(())
    }

    pub fn subscribe(&self) -> futures::stream::BoxStream<'static, Arc<GlobalModel>> {
        self.inner.models.subscribe()
    }

    pub fn subscribe_from(&self, version: u64) -> futures::stream::BoxStream<'static, Arc<GlobalModel>> {
        self.inner.models.subscribe_from(version)
    }

    /// Sweep liveness every `registry.sweep_interval_ms`.
    pub fn spawn_liveness_monitor(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = self.inner.config.registry.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                for transition in this.sweep_liveness(Utc::now()).await {
                    tracing::debug!(
                        node_id = %transition.node_id,
                        from = %transition.from,
                        to = %transition.to,
                        "Liveness changed"
                    );
                }
            }
        })
    }

    fn spawn_close(&self, round_id: RoundId, trigger: CloseTrigger) {
        let this = self.clone();
        tokio::spawn(async move {
            this.close_collection(round_id, trigger).await;
        });
    }

    async fn drop_from_round(&self, round_id: RoundId, node_id: &NodeId) {
        let mut rounds = self.inner.rounds.write().await;
        let Some(slot) = rounds.get_mut(&round_id) else {
            return;
        };
        if slot.round.state() != RoundState::Collecting || !slot.round.drop_node(node_id) {
            return;
        }
        self.inner.registry.release(node_id, round_id);
        tracing::warn!(round_id, node_id = %node_id, "Dropped node from cohort");

        let required = slot.round.policy().quorum_min;
        let remaining = slot.round.active_count();
        let all_responded = slot.round.all_responded();
        if remaining < required {
            self.finalize_locked(
                &mut rounds,
                round_id,
                RoundOutcome::Aborted(AbortReason::QuorumLost { required, remaining }),
                Finalization::default(),
            );
        } else if all_responded {
            self.spawn_close(round_id, CloseTrigger::FullResponse);
        }
    }

    async fn close_collection(&self, round_id: RoundId, trigger: CloseTrigger) {
        let inner = &self.inner;

        let (contributions, keys, policy, cohort_size, compliance_rate, prior_violations) = {
            let mut rounds = inner.rounds.write().await;
            let Some(slot) = rounds.get_mut(&round_id) else {
                return;
            };
            if slot.round.state() != RoundState::Collecting {
                return;
            }
            match trigger {
                // Running inside the timer task; just forget the handle.
                CloseTrigger::Deadline => slot.timer = None,
                CloseTrigger::FullResponse => {
                    if let Some(timer) = slot.timer.take() {
                        timer.abort();
                    }
                }
            }

            let required = slot.round.policy().quorum_min;
            let remaining = slot.round.active_count();
            let accepted = slot.round.accepted_count();
            let shortfall = if remaining < required {
                Some(AbortReason::QuorumLost { required, remaining })
            } else if accepted >= required {
                None
            } else if accepted + slot.round.filtered_count() >= required {
                // Integrity filtering is what cost the quorum.
                Some(AbortReason::InsufficientQuorum {
                    required,
                    available: accepted,
                })
            } else {
                Some(AbortReason::QuorumLost {
                    required,
                    remaining: accepted,
                })
            };
            if let Some(reason) = shortfall {
                self.finalize_locked(
                    &mut rounds,
                    round_id,
                    RoundOutcome::Aborted(reason),
                    Finalization::default(),
                );
                return;
            }
            if let Err(e) = slot.round.transition(RoundState::Aggregating) {
                tracing::error!(round_id, error = %e, "Cannot start aggregation");
                return;
            }
            tracing::info!(
                round_id,
                trigger = ?trigger,
                accepted = slot.round.accepted_count(),
                "Collection closed"
            );
            (
                slot.round.take_contributions(),
                slot.keys.clone(),
                slot.round.policy().clone(),
                slot.round.cohort().len(),
                slot.round.compliance_rate(),
                slot.round.integrity_violations(),
            )
        };

        // Authoritative liveness check on a fresh snapshot.
        let snapshot = inner.registry.snapshot();
        let (contributions, stale): (Vec<_>, Vec<_>) =
            contributions.into_iter().partition(|c| {
                snapshot
                    .get(&c.node_id)
                    .map(|n| n.liveness.is_reachable())
                    .unwrap_or(false)
            });
        for contribution in &stale {
            tracing::warn!(
                round_id,
                node_id = %contribution.node_id,
                "Discarding update from node no longer reachable"
            );
        }
        let accepted: Vec<NodeId> = contributions.iter().map(|c| c.node_id.clone()).collect();

        let aggregator =
            SecureAggregator::new(inner.scheme, policy.quorum_min, inner.config.model.dimension)
                .with_weight_limit(inner.config.aggregation.max_total_weight);
        let aggregate = match aggregator.aggregate(&contributions, &keys.verifier()) {
            Ok(aggregate) => aggregate,
            Err(FederationError::InsufficientQuorum { required, available }) => {
                self.abort_aggregating(
                    round_id,
                    AbortReason::InsufficientQuorum { required, available },
                    accepted,
                )
                .await;
                return;
            }
            Err(e) => {
                self.abort_aggregating(
                    round_id,
                    AbortReason::Cancelled {
                        detail: format!("aggregation failed: {}", e),
                    },
                    accepted,
                )
                .await;
                return;
            }
        };
        let contributors: Vec<NodeId> = aggregate.contributors.keys().cloned().collect();

        let tolerance = inner.config.aggregation.integrity_violation_tolerance;
        let violations = prior_violations + aggregate.integrity_violations();
        if violations > tolerance {
            self.abort_aggregating(
                round_id,
                AbortReason::IntegrityViolation {
                    violations,
                    tolerance,
                },
                contributors,
            )
            .await;
            return;
        }

        let mean = match keys.decrypt(&inner.scheme, &aggregate) {
            Ok(mean) => mean,
            Err(e) => {
                self.abort_aggregating(
                    round_id,
                    AbortReason::Cancelled {
                        detail: format!("decryption failed: {}", e),
                    },
                    contributors,
                )
                .await;
                return;
            }
        };

        inner.sequencer.wait_turn(round_id).await;

        let privacy = &inner.config.privacy;
        let sensitivity = privacy.clipping_norm * aggregate.max_weight() as f64
            / aggregate.total_weight as f64;
        let calibration = match inner.scheme.calibrate_noise(
            privacy.mechanism,
            privacy.epsilon_per_round,
            privacy.delta_per_round,
            sensitivity,
        ) {
            Ok(calibration) => calibration,
            Err(e) => {
                self.abort_aggregating(
                    round_id,
                    AbortReason::BudgetExceeded {
                        detail: e.to_string(),
                    },
                    contributors,
                )
                .await;
                return;
            }
        };

        let mut update = mean;
        let noised = inner.noise.lock().apply(&calibration, &mut update);
        if let Err(e) = noised {
            self.abort_aggregating(
                round_id,
                AbortReason::BudgetExceeded {
                    detail: e.to_string(),
                },
                contributors,
            )
            .await;
            return;
        }
        for value in update.iter_mut() {
            *value *= privacy.server_learning_rate;
        }

        let plan = CommitPlan {
            participants: contributors.clone(),
            cost: PrivacyCost::new(calibration.epsilon, calibration.delta),
            metrics: ModelMetrics {
                participants: contributors.len(),
                cohort_size,
                compliance_rate,
                epsilon: calibration.epsilon,
                delta: calibration.delta,
                noise_scale: calibration.scale,
                update_norm: l2_norm(&update),
            },
            update,
            digest: aggregate.digest_hex(),
        };

        let committed = retry_async(&inner.retry, |attempt| {
            self.try_commit(round_id, &plan, attempt)
        })
        .await;

        match committed {
            Ok(version) => {
                tracing::debug!(round_id, version, "Commit finished");
            }
            Err(CommitFailure::Denied(exceeded)) => {
                self.abort_aggregating(
                    round_id,
                    AbortReason::BudgetExceeded {
                        detail: exceeded.to_string(),
                    },
                    contributors,
                )
                .await;
            }
            Err(CommitFailure::Invalid(e)) => {
                self.abort_aggregating(
                    round_id,
                    AbortReason::BudgetExceeded {
                        detail: e.to_string(),
                    },
                    contributors,
                )
                .await;
            }
            Err(CommitFailure::NotAggregating) => {
                tracing::debug!(round_id, "Round ended before commit");
            }
        }
    }

    /// One authorize-then-commit attempt. The commit and the publication
    /// happen under the rounds lock so a concurrent abort cannot interleave.
    async fn try_commit(
        &self,
        round_id: RoundId,
        plan: &CommitPlan,
        attempt: u32,
    ) -> RetryResult<u64, CommitFailure> {
        let inner = &self.inner;
        let authorization = match inner.ledger.authorize(round_id, &plan.participants, plan.cost) {
            Ok(LedgerDecision::Authorized(authorization)) => authorization,
            Ok(LedgerDecision::Denied(exceeded)) => {
                return RetryResult::Fail(CommitFailure::Denied(exceeded))
            }
            Err(e) => return RetryResult::Fail(CommitFailure::Invalid(e)),
        };

        let mut rounds = inner.rounds.write().await;
        match rounds.get(&round_id) {
            Some(slot) if slot.round.state() == RoundState::Aggregating => {}
            _ => return RetryResult::Fail(CommitFailure::NotAggregating),
        }

        let spend = match inner.ledger.commit(&authorization) {
            Ok(record) => record,
            Err(CommitError::Conflict { node_id }) => {
                tracing::info!(round_id, attempt, node_id = ?node_id, "Ledger conflict, re-authorizing");
                return RetryResult::Retry(CommitFailure::Denied(BudgetExceeded::Contention {
                    attempts: attempt + 1,
                }));
            }
            Err(e @ CommitError::AlreadyCommitted { .. }) => {
                return RetryResult::Fail(CommitFailure::Invalid(FederationError::privacy(
                    e.to_string(),
                )))
            }
        };

        let current = inner.models.current();
        let parameters = current
            .parameters
            .iter()
            .zip(&plan.update)
            .map(|(p, u)| p + u)
            .collect();
        let model = GlobalModel {
            version: round_id,
            parameters,
            metrics: plan.metrics.clone(),
            committed_at: Utc::now(),
            aggregate_digest: Some(plan.digest.clone()),
        };
        let finalization = Finalization {
            contributors: Some(plan.participants.clone()),
            spend: Some(PrivacyCost::new(spend.epsilon, spend.delta)),
            digest: Some(plan.digest.clone()),
        };

        match inner.models.publish(model) {
            Ok(published) => {
                let version = published.version;
                self.finalize_locked(
                    &mut rounds,
                    round_id,
                    RoundOutcome::Committed { version },
                    finalization,
                );
                RetryResult::Ok(version)
            }
            Err(e) => {
                tracing::error!(round_id, error = %e, "Publication failed after budget spend");
                self.finalize_locked(
                    &mut rounds,
                    round_id,
                    RoundOutcome::Aborted(AbortReason::Cancelled {
                        detail: format!("publication failed: {}", e),
                    }),
                    finalization,
                );
                RetryResult::Fail(CommitFailure::NotAggregating)
            }
        }
    }

    async fn abort_aggregating(&self, round_id: RoundId, reason: AbortReason, contributors: Vec<NodeId>) {
        let mut rounds = self.inner.rounds.write().await;
        match rounds.get(&round_id) {
            Some(slot) if slot.round.state() == RoundState::Aggregating => {}
            _ => return,
        }
        self.finalize_locked(
            &mut rounds,
            round_id,
            RoundOutcome::Aborted(reason),
            Finalization {
                contributors: Some(contributors),
                ..Finalization::default()
            },
        );
    }

    /// Move a round to its terminal state and release everything it holds.
    fn finalize_locked(
        &self,
        rounds: &mut HashMap<RoundId, RoundSlot>,
        round_id: RoundId,
        outcome: RoundOutcome,
        details: Finalization,
    ) {
        let inner = &self.inner;
        let Some(mut slot) = rounds.remove(&round_id) else {
            return;
        };

        let target = if outcome.is_committed() {
            RoundState::Committed
        } else {
            RoundState::Aborted
        };
        if let Err(e) = slot.round.transition(target) {
            tracing::error!(round_id, error = %e, "Unexpected terminal transition");
        }
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        inner.registry.release_round(round_id);
        inner.sequencer.finish(round_id);

        let contributors = details
            .contributors
            .unwrap_or_else(|| slot.round.contributor_ids());
        let summary = slot.round.summary(
            outcome.clone(),
            contributors.clone(),
            details.spend,
            details.digest.clone(),
        );

        let audit_outcome = match &outcome {
            RoundOutcome::Committed { version } => {
                tracing::info!(round_id, version, contributors = contributors.len(), "Round committed");
                AuditOutcome::Committed { version: *version }
            }
            RoundOutcome::Aborted(reason) => {
                tracing::warn!(round_id, %reason, "Round aborted");
                AuditOutcome::Aborted {
                    reason: reason.clone(),
                }
            }
        };
        let record = AuditRecord {
            round_id,
            outcome: audit_outcome,
            cohort: summary.cohort.clone(),
            contributors,
            epsilon_spent: details.spend.map(|s| s.epsilon).unwrap_or(0.0),
            delta_spent: details.spend.map(|s| s.delta).unwrap_or(0.0),
            aggregate_digest: details.digest,
            recorded_at: summary.finished_at,
        };
        if let Err(e) = inner.audit.append(record) {
            tracing::error!(round_id, error = %e, "Failed to write audit record");
        }

        inner.history.write().push(summary);
        slot.outcome.send_replace(Some(outcome));
    }
}
