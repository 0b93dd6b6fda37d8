// rust/federation-core/src/config.rs

//! Configuration for the federation coordinator.
//!
//! Parsed from TOML, optionally overridden from `FLC_`-prefixed environment
//! variables, then validated.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::{AggregationScheme, EncryptionStrength, SchemeKind};
use crate::compliance::Certification;
use crate::error::{FederationError, Result};
use crate::privacy::{BudgetCaps, NoiseMechanism};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub policy: RoundPolicy,
    pub registry: RegistryConfig,
    pub aggregation: AggregationConfig,
    pub privacy: PrivacyConfig,
    pub ledger: LedgerConfig,
    pub model: ModelConfig,
    pub audit: AuditConfig,
}

/// Admission and budget policy. Each round keeps the policy it started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundPolicy {
    pub required_certifications: BTreeSet<Certification>,
    pub min_encryption_strength: EncryptionStrength,
    /// Jurisdiction tags or region prefixes. Empty admits everything not denied.
    pub jurisdiction_allowlist: Vec<String>,
    pub jurisdiction_denylist: Vec<String>,
    pub quorum_min: usize,
    pub round_deadline_ms: u64,
    pub epsilon_cap_per_node: f64,
    pub epsilon_cap_global: f64,
    pub delta_cap_per_node: f64,
    pub delta_cap_global: f64,
}

impl Default for RoundPolicy {
    fn default() -> Self {
        Self {
            required_certifications: BTreeSet::new(),
            min_encryption_strength: EncryptionStrength::Aes128,
            jurisdiction_allowlist: vec!["EU".to_string(), "US".to_string(), "ASIA".to_string()],
            jurisdiction_denylist: Vec::new(),
            quorum_min: 3,
            round_deadline_ms: 30_000,
            epsilon_cap_per_node: 10.0,
            epsilon_cap_global: 100.0,
            delta_cap_per_node: 1e-3,
            delta_cap_global: 1e-2,
        }
    }
}

impl RoundPolicy {
    pub fn round_deadline(&self) -> Duration {
        Duration::from_millis(self.round_deadline_ms)
    }

    pub fn budget_caps(&self) -> BudgetCaps {
        BudgetCaps {
            epsilon_per_node: self.epsilon_cap_per_node,
            epsilon_global: self.epsilon_cap_global,
            delta_per_node: self.delta_cap_per_node,
            delta_global: self.delta_cap_global,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.quorum_min < 2 {
            return Err(FederationError::config(
                "policy.quorum_min must be at least 2",
            ));
        }
        if self.round_deadline_ms == 0 {
            return Err(FederationError::config(
                "policy.round_deadline_ms must be greater than 0",
            ));
        }
        for (name, value) in [
            ("policy.epsilon_cap_per_node", self.epsilon_cap_per_node),
            ("policy.epsilon_cap_global", self.epsilon_cap_global),
            ("policy.delta_cap_per_node", self.delta_cap_per_node),
            ("policy.delta_cap_global", self.delta_cap_global),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(FederationError::config(format!(
                    "{} must be a non-negative number",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// One missed window demotes to Degraded, two to Unreachable.
    pub heartbeat_window_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_window_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.heartbeat_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub scheme: SchemeKind,
    pub fractional_bits: u32,
    /// Integrity violations tolerated per round before it aborts.
    pub integrity_violation_tolerance: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cohort_size: Option<usize>,
    /// Upper bound on the summed weights (sample counts) of one aggregate.
    /// Must fit the fixed-point range for `privacy.clipping_norm`.
    pub max_total_weight: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            scheme: SchemeKind::MaskedAdditive,
            fractional_bits: 16,
            integrity_violation_tolerance: 2,
            max_cohort_size: None,
            max_total_weight: 1 << 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub mechanism: NoiseMechanism,
    pub epsilon_per_round: f64,
    pub delta_per_round: f64,
    /// L2 bound each node clips its update to before sealing.
    pub clipping_norm: f64,
    pub server_learning_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_seed: Option<u64>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            mechanism: NoiseMechanism::Gaussian,
            epsilon_per_round: 0.5,
            delta_per_round: 1e-5,
            clipping_norm: 1.0,
            server_learning_rate: 1.0,
            noise_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Re-authorization attempts after a commit conflict.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 10,
            max_retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of model parameters.
    pub dimension: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        // 10x5 weights plus 5 biases
        Self { dimension: 55 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append JSON-lines audit records here when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl FromStr for FederationConfig {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| FederationError::config_with_source("failed to parse TOML config", e))
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl FederationConfig {
    /// Load, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FederationError::io_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLC_<SECTION>_<FIELD>` overrides, e.g. `FLC_POLICY_QUORUM_MIN`.
    ///
    /// Values that fail to parse are ignored. List fields take
    /// comma-separated values.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Policy
        if let Some(list) = env_list("FLC_POLICY_REQUIRED_CERTIFICATIONS") {
            let parsed: std::result::Result<BTreeSet<Certification>, _> =
                list.iter().map(|c| c.parse()).collect();
            if let Ok(certs) = parsed {
                self.policy.required_certifications = certs;
            }
        }
        if let Some(v) = env_parse("FLC_POLICY_MIN_ENCRYPTION_STRENGTH") {
            self.policy.min_encryption_strength = v;
        }
        if let Some(v) = env_list("FLC_POLICY_JURISDICTION_ALLOWLIST") {
            self.policy.jurisdiction_allowlist = v;
        }
        if let Some(v) = env_list("FLC_POLICY_JURISDICTION_DENYLIST") {
            self.policy.jurisdiction_denylist = v;
        }
        if let Some(v) = env_parse("FLC_POLICY_QUORUM_MIN") {
            self.policy.quorum_min = v;
        }
        if let Some(v) = env_parse("FLC_POLICY_ROUND_DEADLINE_MS") {
            self.policy.round_deadline_ms = v;
        }
        if let Some(v) = env_parse("FLC_POLICY_EPSILON_CAP_PER_NODE") {
            self.policy.epsilon_cap_per_node = v;
        }
        if let Some(v) = env_parse("FLC_POLICY_EPSILON_CAP_GLOBAL") {
            self.policy.epsilon_cap_global = v;
        }
        if let Some(v) = env_parse("FLC_POLICY_DELTA_CAP_PER_NODE") {
            self.policy.delta_cap_per_node = v;
        }
        if let Some(v) = env_parse("FLC_POLICY_DELTA_CAP_GLOBAL") {
            self.policy.delta_cap_global = v;
        }

        // Registry
        if let Some(v) = env_parse("FLC_REGISTRY_HEARTBEAT_WINDOW_MS") {
            self.registry.heartbeat_window_ms = v;
        }
        if let Some(v) = env_parse("FLC_REGISTRY_SWEEP_INTERVAL_MS") {
            self.registry.sweep_interval_ms = v;
        }

        // Aggregation
        if let Some(v) = env_parse("FLC_AGGREGATION_SCHEME") {
            self.aggregation.scheme = v;
        }
        if let Some(v) = env_parse("FLC_AGGREGATION_FRACTIONAL_BITS") {
            self.aggregation.fractional_bits = v;
        }
        if let Some(v) = env_parse("FLC_AGGREGATION_INTEGRITY_VIOLATION_TOLERANCE") {
            self.aggregation.integrity_violation_tolerance = v;
        }
        if let Some(v) = env_parse("FLC_AGGREGATION_MAX_COHORT_SIZE") {
            self.aggregation.max_cohort_size = Some(v);
        }
        if let Some(v) = env_parse("FLC_AGGREGATION_MAX_TOTAL_WEIGHT") {
            self.aggregation.max_total_weight = v;
        }

        // Privacy
        if let Some(v) = env_parse("FLC_PRIVACY_MECHANISM") {
            self.privacy.mechanism = v;
        }
        if let Some(v) = env_parse("FLC_PRIVACY_EPSILON_PER_ROUND") {
            self.privacy.epsilon_per_round = v;
        }
        if let Some(v) = env_parse("FLC_PRIVACY_DELTA_PER_ROUND") {
            self.privacy.delta_per_round = v;
        }
        if let Some(v) = env_parse("FLC_PRIVACY_CLIPPING_NORM") {
            self.privacy.clipping_norm = v;
        }
        if let Some(v) = env_parse("FLC_PRIVACY_SERVER_LEARNING_RATE") {
            self.privacy.server_learning_rate = v;
        }
        if let Some(v) = env_parse("FLC_PRIVACY_NOISE_SEED") {
            self.privacy.noise_seed = Some(v);
        }

        // Ledger
        if let Some(v) = env_parse("FLC_LEDGER_MAX_RETRIES") {
            self.ledger.max_retries = v;
        }
        if let Some(v) = env_parse("FLC_LEDGER_RETRY_DELAY_MS") {
            self.ledger.retry_delay_ms = v;
        }
        if let Some(v) = env_parse("FLC_LEDGER_MAX_RETRY_DELAY_MS") {
            self.ledger.max_retry_delay_ms = v;
        }

        // Model and audit
        if let Some(v) = env_parse("FLC_MODEL_DIMENSION") {
            self.model.dimension = v;
        }
        if let Ok(v) = std::env::var("FLC_AUDIT_PATH") {
            self.audit.path = Some(PathBuf::from(v));
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        if self.registry.heartbeat_window_ms == 0 {
            return Err(FederationError::config(
                "registry.heartbeat_window_ms must be greater than 0",
            ));
        }
        if self.registry.sweep_interval_ms == 0 {
            return Err(FederationError::config(
                "registry.sweep_interval_ms must be greater than 0",
            ));
        }

        if !(1..=32).contains(&self.aggregation.fractional_bits) {
            return Err(FederationError::config(
                "aggregation.fractional_bits must be between 1 and 32",
            ));
        }
        if let Some(max) = self.aggregation.max_cohort_size {
            if max < self.policy.quorum_min {
                return Err(FederationError::config(
                    "aggregation.max_cohort_size must be at least policy.quorum_min",
                ));
            }
        }

        let privacy = &self.privacy;
        if !privacy.epsilon_per_round.is_finite() || privacy.epsilon_per_round <= 0.0 {
            return Err(FederationError::config(
                "privacy.epsilon_per_round must be greater than 0",
            ));
        }
        if privacy.mechanism == NoiseMechanism::Gaussian
            && !(privacy.delta_per_round > 0.0 && privacy.delta_per_round < 1.0)
        {
            return Err(FederationError::config(
                "privacy.delta_per_round must be in (0, 1) for the gaussian mechanism",
            ));
        }
        if !privacy.clipping_norm.is_finite() || privacy.clipping_norm <= 0.0 {
            return Err(FederationError::config(
                "privacy.clipping_norm must be greater than 0",
            ));
        }
        let scale = (1u64 << self.aggregation.fractional_bits) as f64;
        if privacy.clipping_norm * scale >= (1u64 << 52) as f64 {
            return Err(FederationError::config(
                "privacy.clipping_norm is too large for aggregation.fractional_bits",
            ));
        }
        let capacity =
            AggregationScheme::from_config(&self.aggregation).weight_capacity(privacy.clipping_norm);
        if self.aggregation.max_total_weight == 0 || self.aggregation.max_total_weight > capacity {
            return Err(FederationError::config(format!(
                "aggregation.max_total_weight must be between 1 and {} for {} fractional bits and clipping_norm {}",
                capacity, self.aggregation.fractional_bits, privacy.clipping_norm
            )));
        }
        if !privacy.server_learning_rate.is_finite() || privacy.server_learning_rate <= 0.0 {
            return Err(FederationError::config(
                "privacy.server_learning_rate must be greater than 0",
            ));
        }

        if self.ledger.max_retry_delay_ms < self.ledger.retry_delay_ms {
            return Err(FederationError::config(
                "ledger.max_retry_delay_ms must be at least ledger.retry_delay_ms",
            ));
        }

        if self.model.dimension == 0 {
            return Err(FederationError::config(
                "model.dimension must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = FederationConfig::default();
        assert_eq!(config.policy.quorum_min, 3);
        assert_eq!(config.policy.round_deadline(), Duration::from_secs(30));
        assert_eq!(config.policy.jurisdiction_allowlist, vec!["EU", "US", "ASIA"]);
        assert_eq!(config.aggregation.fractional_bits, 16);
        assert_eq!(config.privacy.mechanism, NoiseMechanism::Gaussian);
        assert_eq!(config.model.dimension, 55);
        assert!(config.audit.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: FederationConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [policy]
            required_certifications = ["HIPAA", "GDPR"]
            min_encryption_strength = "aes256"
            jurisdiction_allowlist = ["EU"]
            jurisdiction_denylist = ["EU-NORTH"]
            quorum_min = 4
            round_deadline_ms = 1500
            epsilon_cap_per_node = 3.0
            epsilon_cap_global = 12.0

            [registry]
            heartbeat_window_ms = 200

            [aggregation]
            scheme = "masked_additive"
            fractional_bits = 20
            integrity_violation_tolerance = 0
            max_cohort_size = 8

            [privacy]
            mechanism = "laplace"
            epsilon_per_round = 0.25
            clipping_norm = 2.0
            noise_seed = 7

            [model]
            dimension = 10

            [audit]
            path = "/var/log/fl/audit.jsonl"
        "#;
        let config: FederationConfig = toml.parse().unwrap();

        assert_eq!(config.policy.required_certifications.len(), 2);
        assert!(config.policy.required_certifications.contains(&Certification::Hipaa));
        assert_eq!(config.policy.min_encryption_strength, EncryptionStrength::Aes256);
        assert_eq!(config.policy.jurisdiction_denylist, vec!["EU-NORTH"]);
        assert_eq!(config.policy.quorum_min, 4);
        assert_eq!(config.policy.budget_caps().epsilon_global, 12.0);
        assert_eq!(config.registry.heartbeat_window(), Duration::from_millis(200));
        assert_eq!(config.registry.sweep_interval_ms, 1_000);
        assert_eq!(config.aggregation.max_cohort_size, Some(8));
        assert_eq!(config.privacy.mechanism, NoiseMechanism::Laplace);
        assert_eq!(config.privacy.noise_seed, Some(7));
        assert_eq!(config.model.dimension, 10);
        assert_eq!(config.audit.path, Some(PathBuf::from("/var/log/fl/audit.jsonl")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid() {
        assert!("policy = [".parse::<FederationConfig>().is_err());
        assert!("[policy]\nrequired_certifications = [\"NOPE\"]"
            .parse::<FederationConfig>()
            .is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[policy]\nquorum_min = 5").unwrap();

        let config = FederationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.policy.quorum_min, 5);
    }

    #[test]
    fn test_from_file_validates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[policy]\nquorum_min = 1").unwrap();
        assert!(FederationConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_not_found() {
        let err = FederationConfig::from_file("/nonexistent/federation.toml").unwrap_err();
        assert!(matches!(err, FederationError::Io { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<fn(&mut FederationConfig)> = vec![
            |c| c.policy.quorum_min = 1,
            |c| c.policy.round_deadline_ms = 0,
            |c| c.policy.epsilon_cap_per_node = -1.0,
            |c| c.registry.heartbeat_window_ms = 0,
            |c| c.aggregation.fractional_bits = 0,
            |c| c.aggregation.max_cohort_size = Some(2),
            |c| c.privacy.epsilon_per_round = 0.0,
            |c| c.privacy.delta_per_round = 0.0,
            |c| c.privacy.clipping_norm = 0.0,
            |c| c.privacy.clipping_norm = 1e12,
            |c| c.aggregation.max_total_weight = 0,
            |c| c.privacy.server_learning_rate = f64::NAN,
            |c| c.ledger.max_retry_delay_ms = 1,
            |c| c.model.dimension = 0,
        ];
        for (i, mutate) in cases.into_iter().enumerate() {
            let mut config = FederationConfig::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "case {} should fail", i);
        }
    }

    #[test]
    fn test_total_weight_must_fit_fixed_point_range() {
        let mut config = FederationConfig::default();
        config.aggregation.fractional_bits = 32;
        // 2^32 weights of value 1.0 at 2^32 scale would wrap the signed lane.
        assert!(config.validate().is_err());

        config.aggregation.max_total_weight = (1 << 31) - 1;
        assert!(config.validate().is_ok());

        config.privacy.clipping_norm = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_laplace_allows_zero_delta() {
        let mut config = FederationConfig::default();
        config.privacy.mechanism = NoiseMechanism::Laplace;
        config.privacy.delta_per_round = 0.0;
        assert!(config.validate().is_ok());
    }

    fn clear_flc_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("FLC_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Env vars are process-global, so all override cases share one test.
    #[test]
    fn test_env_overrides() {
        clear_flc_env_vars();

        std::env::set_var("FLC_POLICY_QUORUM_MIN", "4");
        std::env::set_var("FLC_POLICY_REQUIRED_CERTIFICATIONS", "hipaa, soc2");
        std::env::set_var("FLC_POLICY_JURISDICTION_ALLOWLIST", "EU,US");
        std::env::set_var("FLC_POLICY_MIN_ENCRYPTION_STRENGTH", "aes192");
        std::env::set_var("FLC_PRIVACY_MECHANISM", "laplace");
        std::env::set_var("FLC_PRIVACY_NOISE_SEED", "99");
        std::env::set_var("FLC_AUDIT_PATH", "/tmp/audit.jsonl");

        let config = FederationConfig::default().with_env_overrides();
        assert_eq!(config.policy.quorum_min, 4);
        assert_eq!(
            config.policy.required_certifications,
            [Certification::Hipaa, Certification::Soc2].into_iter().collect()
        );
        assert_eq!(config.policy.jurisdiction_allowlist, vec!["EU", "US"]);
        assert_eq!(config.policy.min_encryption_strength, EncryptionStrength::Aes192);
        assert_eq!(config.privacy.mechanism, NoiseMechanism::Laplace);
        assert_eq!(config.privacy.noise_seed, Some(99));
        assert_eq!(config.audit.path, Some(PathBuf::from("/tmp/audit.jsonl")));

        clear_flc_env_vars();

        std::env::set_var("FLC_POLICY_QUORUM_MIN", "many");
        std::env::set_var("FLC_POLICY_REQUIRED_CERTIFICATIONS", "HIPAA,BOGUS");
        let config = FederationConfig::default().with_env_overrides();
        assert_eq!(config.policy.quorum_min, 3);
        assert!(config.policy.required_certifications.is_empty());

        clear_flc_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = FederationConfig::default();
        original.policy.required_certifications.insert(Certification::Gdpr);
        original.aggregation.max_cohort_size = Some(10);
        let text = toml::to_string(&original).unwrap();
        let parsed: FederationConfig = text.parse().unwrap();
        assert_eq!(parsed.policy, original.policy);
        assert_eq!(parsed.aggregation.max_cohort_size, Some(10));
    }
}
