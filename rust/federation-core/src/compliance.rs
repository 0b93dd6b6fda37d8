// rust/federation-core/src/compliance.rs

//! Per-round admission checks against regulatory policy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregation::{EncryptionCapability, SchemeKind};
use crate::config::RoundPolicy;
use crate::error::{FederationError, Result};
use crate::registry::{Node, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Certification {
    Hipaa,
    Gdpr,
    Soc2,
    Iso27001,
    Ccpa,
    Pci,
}

impl fmt::Display for Certification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hipaa => "HIPAA",
            Self::Gdpr => "GDPR",
            Self::Soc2 => "SOC2",
            Self::Iso27001 => "ISO27001",
            Self::Ccpa => "CCPA",
            Self::Pci => "PCI",
        };
        f.write_str(name)
    }
}

impl FromStr for Certification {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "HIPAA" => Ok(Self::Hipaa),
            "GDPR" => Ok(Self::Gdpr),
            "SOC2" => Ok(Self::Soc2),
            "ISO27001" => Ok(Self::Iso27001),
            "CCPA" => Ok(Self::Ccpa),
            "PCI" => Ok(Self::Pci),
            other => Err(FederationError::config(format!(
                "unknown certification '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AdmissionRejection {
    #[error("missing certifications: {}", join(.missing))]
    MissingCertification { missing: BTreeSet<Certification> },
    #[error("unsupported encryption {declared}")]
    UnsupportedEncryption { declared: EncryptionCapability },
    #[error("jurisdiction '{jurisdiction}' is excluded")]
    JurisdictionExcluded { jurisdiction: String },
}

fn join(certs: &BTreeSet<Certification>) -> String {
    certs
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Reject(AdmissionRejection),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Result of screening a whole candidate set.
#[derive(Debug, Clone, Default)]
pub struct CohortScreening {
    pub admitted: Vec<NodeId>,
    pub rejected: Vec<(NodeId, AdmissionRejection)>,
}

impl CohortScreening {
    pub fn evaluated(&self) -> usize {
        self.admitted.len() + self.rejected.len()
    }

    /// Admitted over evaluated; 0 when nothing was evaluated.
    pub fn compliance_rate(&self) -> f64 {
        match self.evaluated() {
            0 => 0.0,
            n => self.admitted.len() as f64 / n as f64,
        }
    }
}

/// Matches `EU-WEST` against `EU-WEST` or its region prefix `EU`.
fn jurisdiction_matches(jurisdiction: &str, entry: &str) -> bool {
    let jurisdiction = jurisdiction.trim();
    let entry = entry.trim();
    if jurisdiction.eq_ignore_ascii_case(entry) {
        return true;
    }
    match jurisdiction.split_once('-') {
        Some((region, _)) => region.eq_ignore_ascii_case(entry),
        None => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ComplianceGate {
    scheme: SchemeKind,
}

impl ComplianceGate {
    /// A gate for coordinators running `scheme`; nodes must declare it.
    pub fn new(scheme: SchemeKind) -> Self {
        Self { scheme }
    }

    /// Certifications, then encryption, then jurisdiction. First failure wins.
    pub fn evaluate(&self, node: &Node, policy: &RoundPolicy) -> Admission {
        let missing: BTreeSet<Certification> = policy
            .required_certifications
            .difference(&node.certifications)
            .copied()
            .collect();
        if !missing.is_empty() {
            return Admission::Reject(AdmissionRejection::MissingCertification { missing });
        }

        if node.encryption.scheme != self.scheme
            || node.encryption.strength < policy.min_encryption_strength
        {
            return Admission::Reject(AdmissionRejection::UnsupportedEncryption {
                declared: node.encryption,
            });
        }

        let denied = policy
            .jurisdiction_denylist
            .iter()
            .any(|entry| jurisdiction_matches(&node.jurisdiction, entry));
        let allowed = policy.jurisdiction_allowlist.is_empty()
            || policy
                .jurisdiction_allowlist
                .iter()
                .any(|entry| jurisdiction_matches(&node.jurisdiction, entry));
        if denied || !allowed {
            return Admission::Reject(AdmissionRejection::JurisdictionExcluded {
                jurisdiction: node.jurisdiction.clone(),
            });
        }

        Admission::Admit
    }

    pub fn evaluate_cohort<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a Node>,
        policy: &RoundPolicy,
    ) -> CohortScreening {
        let mut screening = CohortScreening::default();
        for node in nodes {
            match self.evaluate(node, policy) {
                Admission::Admit => screening.admitted.push(node.id.clone()),
                Admission::Reject(reason) => {
                    tracing::debug!(node_id = %node.id, %reason, "Node not admitted");
                    screening.rejected.push((node.id.clone(), reason));
                }
            }
        }
        screening
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::EncryptionStrength;
    use crate::registry::Liveness;
    use chrono::Utc;

    fn node(id: &str, jurisdiction: &str, certs: &[Certification]) -> Node {
        Node {
            id: NodeId::from(id),
            jurisdiction: jurisdiction.to_string(),
            certifications: certs.iter().copied().collect(),
            encryption: EncryptionCapability::new(
                SchemeKind::MaskedAdditive,
                EncryptionStrength::Aes256,
            ),
            liveness: Liveness::Active,
            last_seen_round: None,
            sample_count: 100,
            last_heartbeat: Utc::now(),
        }
    }

    fn policy() -> RoundPolicy {
        RoundPolicy {
            required_certifications: [Certification::Gdpr, Certification::Soc2]
                .into_iter()
                .collect(),
            min_encryption_strength: EncryptionStrength::Aes192,
            ..RoundPolicy::default()
        }
    }

    fn gate() -> ComplianceGate {
        ComplianceGate::new(SchemeKind::MaskedAdditive)
    }

    #[test]
    fn test_admits_compliant_node() {
        let n = node("a", "EU-WEST", &[Certification::Gdpr, Certification::Soc2]);
        assert_eq!(gate().evaluate(&n, &policy()), Admission::Admit);
    }

    #[test]
    fn test_missing_certification() {
        let n = node("a", "EU-WEST", &[Certification::Gdpr]);
        match gate().evaluate(&n, &policy()) {
            Admission::Reject(AdmissionRejection::MissingCertification { missing }) => {
                assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec![Certification::Soc2]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_weak_encryption() {
        let mut n = node("a", "EU-WEST", &[Certification::Gdpr, Certification::Soc2]);
        n.encryption.strength = EncryptionStrength::Aes128;
        assert!(matches!(
            gate().evaluate(&n, &policy()),
            Admission::Reject(AdmissionRejection::UnsupportedEncryption { .. })
        ));
    }

    #[test]
    fn test_certifications_checked_before_encryption() {
        let mut n = node("a", "MARS", &[]);
        n.encryption.strength = EncryptionStrength::Aes128;
        assert!(matches!(
            gate().evaluate(&n, &policy()),
            Admission::Reject(AdmissionRejection::MissingCertification { .. })
        ));
    }

    #[test]
    fn test_jurisdiction_prefix_and_denylist() {
        let certs = [Certification::Gdpr, Certification::Soc2];
        let mut policy = policy();

        assert!(gate().evaluate(&node("a", "ASIA-EAST", &certs), &policy).is_admitted());
        assert!(!gate().evaluate(&node("a", "AFRICA-SOUTH", &certs), &policy).is_admitted());
        // "EUROPE" does not share the "EU" region prefix.
        assert!(!gate().evaluate(&node("a", "EUROPE", &certs), &policy).is_admitted());

        policy.jurisdiction_denylist = vec!["US-EAST".to_string()];
        assert!(matches!(
            gate().evaluate(&node("a", "US-EAST", &certs), &policy),
            Admission::Reject(AdmissionRejection::JurisdictionExcluded { .. })
        ));
        assert!(gate().evaluate(&node("a", "US-WEST", &certs), &policy).is_admitted());

        policy.jurisdiction_allowlist.clear();
        assert!(gate().evaluate(&node("a", "AFRICA-SOUTH", &certs), &policy).is_admitted());
    }

    #[test]
    fn test_evaluate_cohort_rate() {
        let certs = [Certification::Gdpr, Certification::Soc2];
        let nodes = vec![
            node("a", "EU-WEST", &certs),
            node("b", "US-EAST", &certs),
            node("c", "US-EAST", &[]),
            node("d", "MOON", &certs),
        ];
        let screening = gate().evaluate_cohort(&nodes, &policy());
        assert_eq!(screening.admitted, vec![NodeId::from("a"), NodeId::from("b")]);
        assert_eq!(screening.rejected.len(), 2);
        assert_eq!(screening.compliance_rate(), 0.5);
        assert_eq!(CohortScreening::default().compliance_rate(), 0.0);
    }

    #[test]
    fn test_certification_parse_and_display() {
        assert_eq!("soc2".parse::<Certification>().unwrap(), Certification::Soc2);
        assert_eq!(Certification::Iso27001.to_string(), "ISO27001");
        assert!("FOO".parse::<Certification>().is_err());
    }
}
