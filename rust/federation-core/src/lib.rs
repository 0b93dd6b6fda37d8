// rust/federation-core/src/lib.rs

//! Federated Learning Coordination - Core Library
//!
//! This crate coordinates training rounds across a federation of data-holding
//! nodes: registry and liveness, compliance screening, masked secure
//! aggregation, differential privacy accounting and the published model feed.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{FederationConfig, RoundPolicy};
pub use error::{FederationError, Result};

pub mod registry;
pub use registry::{Liveness, Node, NodeDescriptor, NodeId, NodeRegistry, RegistrySnapshot};

pub mod compliance;
pub use compliance::{Admission, AdmissionRejection, Certification, ComplianceGate};

pub mod aggregation;
pub use aggregation::{
    AggregationScheme, EncryptedUpdate, EncryptionCapability, EncryptionStrength,
    NodeCredentials, SchemeKind, SecureAggregator,
};

pub mod privacy;
pub use privacy::{NoiseMechanism, PrivacyBudgetLedger, PrivacyCost};

pub mod retry;

pub mod model;
pub use model::{GlobalModel, ModelLog, ModelMetrics};

pub mod audit;
pub use audit::{AuditLog, AuditRecord};

pub mod coordinator;
pub use coordinator::{
    AbortReason, RoundCoordinator, RoundId, RoundOutcome, RoundState, RoundSummary,
    RoundTicket, SubmissionOutcome, SubmissionRejection,
};
