// rust/federation-core/src/registry.rs

//! Node identity, liveness and cohort membership.
//!
//! Liveness and heartbeat fields are per-node atomics so heartbeats never
//! contend with round operations. Descriptor metadata changes only through
//! the registry's update calls. Cohort claims live in a single table guarded
//! by one mutex; claiming a batch of nodes is atomic with respect to other
//! rounds.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::aggregation::EncryptionCapability;
use crate::compliance::Certification;
use crate::error::{FederationError, Result};

/// Opaque stable node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
    Active,
    Degraded,
    Unreachable,
}

impl Liveness {
    fn to_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Degraded => 1,
            Self::Unreachable => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Degraded,
            _ => Self::Unreachable,
        }
    }

    /// Whether contributions from a node in this state still count.
    pub fn is_reachable(self) -> bool {
        !matches!(self, Self::Unreachable)
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a node declares when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub jurisdiction: String,
    pub certifications: BTreeSet<Certification>,
    pub encryption: EncryptionCapability,
    pub sample_count: u64,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<NodeId>, jurisdiction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            jurisdiction: jurisdiction.into(),
            certifications: BTreeSet::new(),
            encryption: EncryptionCapability::default(),
            sample_count: 1,
        }
    }

    pub fn with_certifications(mut self, certs: impl IntoIterator<Item = Certification>) -> Self {
        self.certifications.extend(certs);
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionCapability) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u64) -> Self {
        self.sample_count = sample_count;
        self
    }
}

/// Point-in-time view of a registered node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub jurisdiction: String,
    pub certifications: BTreeSet<Certification>,
    pub encryption: EncryptionCapability,
    pub liveness: Liveness,
    pub last_seen_round: Option<u64>,
    pub sample_count: u64,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug)]
struct NodeEntry {
    descriptor: RwLock<NodeDescriptor>,
    liveness: AtomicU8,
    last_heartbeat_ms: AtomicI64,
    /// 0 means never; round numbers start at 1.
    last_seen_round: AtomicU64,
}

impl NodeEntry {
    fn view(&self) -> Node {
        let descriptor = self.descriptor.read().clone();
        let millis = self.last_heartbeat_ms.load(Ordering::Acquire);
        let last_seen_round = match self.last_seen_round.load(Ordering::Acquire) {
            0 => None,
            round => Some(round),
        };
        Node {
            id: descriptor.id,
            jurisdiction: descriptor.jurisdiction,
            certifications: descriptor.certifications,
            encryption: descriptor.encryption,
            liveness: Liveness::from_u8(self.liveness.load(Ordering::Acquire)),
            last_seen_round,
            sample_count: descriptor.sample_count,
            last_heartbeat: Utc
                .timestamp_millis_opt(millis)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Immutable registry view used for cohort selection and quorum checks.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    nodes: Vec<Node>,
}

impl RegistrySnapshot {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.id.cmp(id))
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    pub fn active(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.liveness == Liveness::Active)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessTransition {
    pub node_id: NodeId,
    pub from: Liveness,
    pub to: Liveness,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// Nodes now held by the claiming round. Empty if fewer than the
    /// requested minimum were free.
    pub claimed: Vec<NodeId>,
    /// Nodes skipped because another round holds them.
    pub deferred: Vec<NodeId>,
}

pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<NodeEntry>>>,
    claims: Mutex<HashMap<NodeId, u64>>,
    heartbeat_window: Duration,
}

impl NodeRegistry {
    pub fn new(heartbeat_window: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            heartbeat_window,
        }
    }

    pub fn heartbeat_window(&self) -> Duration {
        self.heartbeat_window
    }

    /// Add a node. Registration counts as its first heartbeat.
    pub fn register(&self, descriptor: NodeDescriptor, now: DateTime<Utc>) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&descriptor.id) {
            return Err(FederationError::duplicate_node(descriptor.id.as_str()));
        }
        let id = descriptor.id.clone();
        nodes.insert(
            id.clone(),
            Arc::new(NodeEntry {
                descriptor: RwLock::new(descriptor),
                liveness: AtomicU8::new(Liveness::Active.to_u8()),
                last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
                last_seen_round: AtomicU64::new(0),
            }),
        );
        tracing::info!(node_id = %id, "Registered node");
        Ok(())
    }

    fn entry(&self, id: &NodeId) -> Result<Arc<NodeEntry>> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FederationError::unknown_node(id.as_str()))
    }

    /// Record a heartbeat and mark the node Active. Returns the prior state.
    ///
    /// Out-of-order heartbeats never move the recorded time backwards.
    pub fn heartbeat(&self, id: &NodeId, timestamp: DateTime<Utc>) -> Result<Liveness> {
        let entry = self.entry(id)?;
        entry
            .last_heartbeat_ms
            .fetch_max(timestamp.timestamp_millis(), Ordering::AcqRel);
        let previous = Liveness::from_u8(
            entry
                .liveness
                .swap(Liveness::Active.to_u8(), Ordering::AcqRel),
        );
        if previous != Liveness::Active {
            tracing::info!(node_id = %id, from = %previous, "Node recovered");
        }
        Ok(previous)
    }

    pub fn record_participation(&self, id: &NodeId, round_id: u64) -> Result<()> {
        self.entry(id)?
            .last_seen_round
            .fetch_max(round_id, Ordering::AcqRel);
        Ok(())
    }

    /// Remove a node. Returns the round that held it, if any; its claim is
    /// dropped with it.
    pub fn deregister(&self, id: &NodeId) -> Result<Option<u64>> {
        if self.nodes.write().remove(id).is_none() {
            return Err(FederationError::unknown_node(id.as_str()));
        }
        let held_by = self.claims.lock().remove(id);
        tracing::info!(node_id = %id, held_by = ?held_by, "Deregistered node");
        Ok(held_by)
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.nodes.read().get(id).map(|entry| entry.view())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .values()
            .map(|entry| entry.view())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        RegistrySnapshot { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn update_sample_count(&self, id: &NodeId, sample_count: u64) -> Result<()> {
        self.entry(id)?.descriptor.write().sample_count = sample_count;
        Ok(())
    }

    pub fn update_capability(&self, id: &NodeId, encryption: EncryptionCapability) -> Result<()> {
        self.entry(id)?.descriptor.write().encryption = encryption;
        Ok(())
    }

    pub fn update_certifications(
        &self,
        id: &NodeId,
        certifications: BTreeSet<Certification>,
    ) -> Result<()> {
        self.entry(id)?.descriptor.write().certifications = certifications;
        Ok(())
    }

    /// Demote nodes whose heartbeat is older than one window (Degraded) or
    /// two windows (Unreachable).
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<LivenessTransition> {
        let window = i64::try_from(self.heartbeat_window.as_millis()).unwrap_or(i64::MAX);
        let now_ms = now.timestamp_millis();
        let entries: Vec<(NodeId, Arc<NodeEntry>)> = self
            .nodes
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut transitions = Vec::new();
        for (id, entry) in entries {
            let elapsed = now_ms.saturating_sub(entry.last_heartbeat_ms.load(Ordering::Acquire));
            let target = if elapsed > window.saturating_mul(2) {
                Liveness::Unreachable
            } else if elapsed > window {
                Liveness::Degraded
            } else {
                continue;
            };

            let current = entry.liveness.load(Ordering::Acquire);
            let from = Liveness::from_u8(current);
            if from == target || (from == Liveness::Unreachable && target == Liveness::Degraded) {
                continue;
            }
            // A heartbeat racing the sweep wins.
            if entry
                .liveness
                .compare_exchange(current, target.to_u8(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::warn!(node_id = %id, %from, to = %target, "Node missed heartbeat window");
                transitions.push(LivenessTransition {
                    node_id: id,
                    from,
                    to: target,
                });
            }
        }
        transitions.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        transitions
    }

    /// Claim candidates for `round_id`, skipping nodes held by other rounds.
    ///
    /// At most `max` nodes are claimed, in candidate order. If fewer than
    /// `min` are free, nothing is claimed.
    pub fn try_claim(
        &self,
        round_id: u64,
        candidates: &[NodeId],
        min: usize,
        max: Option<usize>,
    ) -> ClaimOutcome {
        let mut claims = self.claims.lock();
        let limit = max.unwrap_or(usize::MAX);

        let mut free = Vec::new();
        let mut deferred = Vec::new();
        for id in candidates {
            match claims.get(id) {
                Some(holder) if *holder != round_id => deferred.push(id.clone()),
                _ if free.len() < limit => free.push(id.clone()),
                _ => {}
            }
        }

        if free.len() < min {
            return ClaimOutcome {
                claimed: Vec::new(),
                deferred,
            };
        }
        for id in &free {
            claims.insert(id.clone(), round_id);
        }
        ClaimOutcome {
            claimed: free,
            deferred,
        }
    }

    /// Release one node if `round_id` holds it.
    pub fn release(&self, id: &NodeId, round_id: u64) -> bool {
        let mut claims = self.claims.lock();
        if claims.get(id) == Some(&round_id) {
            claims.remove(id);
            true
        } else {
            false
        }
    }

    /// Release every node held by `round_id`.
    pub fn release_round(&self, round_id: u64) -> Vec<NodeId> {
        let mut claims = self.claims.lock();
        let mut released: Vec<NodeId> = claims
            .iter()
            .filter(|(_, holder)| **holder == round_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &released {
            claims.remove(id);
        }
        released.sort();
        released
    }

    pub fn claimed_by(&self, id: &NodeId) -> Option<u64> {
        self.claims.lock().get(id).copied()
    }
}
