// rust/federation-core/src/privacy/mod.rs

//! Differential privacy: noise calibration and budget accounting.

pub mod ledger;
pub mod noise;

pub use ledger::{
    Authorization, BudgetCaps, BudgetExceeded, BudgetMetric, CommitError, LedgerDecision,
    PrivacyBudgetLedger, PrivacyCost, SpendRecord,
};
pub use noise::{clip_to_norm, l2_norm, NoiseCalibration, NoiseInjector, NoiseMechanism};
