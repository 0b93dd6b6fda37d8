// rust/federation-core/src/aggregation/mod.rs

//! Secure aggregation of encrypted node updates.

pub mod aggregator;
pub mod masking;
pub mod scheme;

pub use aggregator::{AggregateResult, Contribution, ExclusionReason, SecureAggregator};
pub use masking::{IntegrityVerifier, NodeCredentials, RoundKeys};
pub use scheme::{
    AggregationScheme, EncryptedUpdate, EncryptionCapability, EncryptionStrength, SchemeKind,
};
