// rust/coordinator/src/simulation.rs

//! In-process federation driving the coordinator end to end.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use federation_core::privacy::clip_to_norm;
use federation_core::{
    Certification, EncryptionCapability, EncryptionStrength, FederationConfig, FederationError,
    GlobalModel, NodeDescriptor, NodeId, NodeRegistry, Result, RoundCoordinator, RoundId,
    RoundOutcome, RoundState, SchemeKind,
};

/// Standard deviation of the simulated local training step.
const LOCAL_UPDATE_STD: f64 = 0.01;

/// Spread of the initial model parameters.
const GENESIS_STD: f64 = 0.01;

/// The three hospitals of the reference deployment.
pub fn default_nodes() -> Vec<NodeDescriptor> {
    let encryption = EncryptionCapability::new(SchemeKind::MaskedAdditive, EncryptionStrength::Aes256);
    vec![
        NodeDescriptor::new("client1", "EU-WEST")
            .with_certifications([Certification::Gdpr, Certification::Iso27001])
            .with_encryption(encryption)
            .with_sample_count(1_200),
        NodeDescriptor::new("client2", "US-EAST")
            .with_certifications([Certification::Hipaa, Certification::Soc2])
            .with_encryption(encryption)
            .with_sample_count(800),
        NodeDescriptor::new("client3", "ASIA-EAST")
            .with_certifications([Certification::Iso27001, Certification::Soc2])
            .with_encryption(encryption)
            .with_sample_count(1_000),
    ]
}

#[derive(Debug, Clone)]
pub struct RoundReport {
    pub round_id: RoundId,
    pub outcome: RoundOutcome,
    pub participants: usize,
    pub compliance_rate: f64,
}

pub struct Simulation {
    coordinator: RoundCoordinator,
    nodes: Vec<NodeId>,
    rng: StdRng,
    local_step: Normal<f64>,
}

impl Simulation {
    pub fn new(config: FederationConfig, seed: Option<u64>) -> Result<Self> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let local_step = Normal::new(0.0, LOCAL_UPDATE_STD)
            .map_err(|e| FederationError::config(format!("local update distribution: {}", e)))?;
        let genesis_dist = Normal::new(0.0, GENESIS_STD)
            .map_err(|e| FederationError::config(format!("genesis distribution: {}", e)))?;

        let registry = Arc::new(NodeRegistry::new(config.registry.heartbeat_window()));
        let mut nodes = Vec::new();
        for descriptor in default_nodes() {
            nodes.push(descriptor.id.clone());
            registry.register(descriptor, Utc::now())?;
        }

        let parameters = (0..config.model.dimension)
            .map(|_| genesis_dist.sample(&mut rng))
            .collect();
        let coordinator = RoundCoordinator::new(config, registry, GlobalModel::genesis(parameters))?;

        Ok(Self {
            coordinator,
            nodes,
            rng,
            local_step,
        })
    }

    pub fn coordinator(&self) -> &RoundCoordinator {
        &self.coordinator
    }

    /// Heartbeat every node, run one round with concurrent submissions and
    /// wait for its outcome.
    pub async fn run_round(&mut self) -> Result<RoundReport> {
        let now = Utc::now();
        for node in &self.nodes {
            self.coordinator.registry().heartbeat(node, now)?;
        }

        let ticket = self.coordinator.start_round().await?;
        if ticket.state == RoundState::Collecting {
            let dimension = self.coordinator.config().model.dimension;
            let clipping_norm = self.coordinator.config().privacy.clipping_norm;

            let mut handles = Vec::with_capacity(ticket.cohort.len());
            for node_id in &ticket.cohort {
                let mut update: Vec<f64> = (0..dimension)
                    .map(|_| self.local_step.sample(&mut self.rng))
                    .collect();
                clip_to_norm(&mut update, clipping_norm);
                let Some(weight) = self.coordinator.registry().get(node_id).map(|n| n.sample_count)
                else {
                    tracing::warn!(node_id = %node_id, "Cohort node missing from registry");
                    continue;
                };

                let coordinator = self.coordinator.clone();
                let node_id = node_id.clone();
                let round_id = ticket.round_id;
                handles.push(tokio::spawn(async move {
                    let credentials = coordinator.credentials(round_id, &node_id).await?;
                    let sealed = credentials.seal(coordinator.scheme(), &update, weight)?;
                    let outcome = coordinator.submit(round_id, &node_id, sealed).await;
                    Ok::<_, FederationError>((node_id, outcome))
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(Ok((node_id, outcome))) if !outcome.is_accepted() => {
                        tracing::warn!(node_id = %node_id, ?outcome, "Node update not accepted");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Node failed to submit"),
                    Err(e) => tracing::warn!(error = %e, "Node task panicked"),
                }
            }
        }

        let outcome = self.coordinator.wait_for_outcome(ticket.round_id).await?;
        let participants = self
            .coordinator
            .history()
            .iter()
            .find(|s| s.round_id == ticket.round_id)
            .map(|s| s.contributors.len())
            .unwrap_or(0);

        Ok(RoundReport {
            round_id: ticket.round_id,
            outcome,
            participants,
            compliance_rate: ticket.compliance_rate,
        })
    }
}
