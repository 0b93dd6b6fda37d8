// rust/federation-core/src/privacy/noise.rs

//! Calibrated noise for decrypted aggregates.

use std::fmt;
use std::str::FromStr;

use rand::distributions::Open01;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{FederationError, Result};

/// Largest epsilon for which the classical Gaussian bound holds.
pub const MAX_GAUSSIAN_EPSILON: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseMechanism {
    #[default]
    Gaussian,
    Laplace,
}

impl fmt::Display for NoiseMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gaussian => write!(f, "gaussian"),
            Self::Laplace => write!(f, "laplace"),
        }
    }
}

impl FromStr for NoiseMechanism {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gaussian" => Ok(Self::Gaussian),
            "laplace" => Ok(Self::Laplace),
            other => Err(FederationError::config(format!(
                "unknown noise mechanism '{}'",
                other
            ))),
        }
    }
}

/// The privacy guarantee a mechanism actually provides, and its noise scale.
///
/// `epsilon` and `delta` here are what gets charged to the ledger, which may
/// be less than what was requested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseCalibration {
    pub mechanism: NoiseMechanism,
    pub epsilon: f64,
    pub delta: f64,
    pub sensitivity: f64,
    /// Gaussian sigma or Laplace b.
    pub scale: f64,
}

impl NoiseMechanism {
    pub fn calibrate(self, epsilon: f64, delta: f64, sensitivity: f64) -> Result<NoiseCalibration> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(FederationError::privacy(format!(
                "epsilon must be positive, got {}",
                epsilon
            )));
        }
        if !sensitivity.is_finite() || sensitivity < 0.0 {
            return Err(FederationError::privacy(format!(
                "sensitivity must be non-negative, got {}",
                sensitivity
            )));
        }

        match self {
            Self::Gaussian => {
                if !(delta > 0.0 && delta < 1.0) {
                    return Err(FederationError::privacy(format!(
                        "gaussian mechanism needs delta in (0, 1), got {}",
                        delta
                    )));
                }
                let epsilon = epsilon.min(MAX_GAUSSIAN_EPSILON);
                let scale = sensitivity * (2.0_f64 * (1.25_f64 / delta).ln()).sqrt() / epsilon;
                Ok(NoiseCalibration {
                    mechanism: self,
                    epsilon,
                    delta,
                    sensitivity,
                    scale,
                })
            }
            Self::Laplace => Ok(NoiseCalibration {
                mechanism: self,
                epsilon,
                delta: 0.0,
                sensitivity,
                scale: sensitivity / epsilon,
            }),
        }
    }
}

/// Samples noise for a calibration.
pub struct NoiseInjector {
    rng: StdRng,
}

impl NoiseInjector {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic injector for replay and tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn apply(&mut self, calibration: &NoiseCalibration, values: &mut [f64]) -> Result<()> {
        if calibration.scale == 0.0 {
            return Ok(());
        }
        match calibration.mechanism {
            NoiseMechanism::Gaussian => {
                let normal = Normal::new(0.0, calibration.scale)
                    .map_err(|e| FederationError::privacy(format!("invalid gaussian scale: {}", e)))?;
                for v in values.iter_mut() {
                    *v += normal.sample(&mut self.rng);
                }
            }
            NoiseMechanism::Laplace => {
                let b = calibration.scale;
                for v in values.iter_mut() {
                    let u: f64 = self.rng.sample(Open01);
                    *v += laplace_offset(u, b);
                }
            }
        }
        Ok(())
    }
}

/// Inverse Laplace CDF at `u`, which must lie strictly inside (0, 1).
fn laplace_offset(u: f64, b: f64) -> f64 {
    let centered = u - 0.5;
    -b * centered.signum() * (1.0 - 2.0 * centered.abs()).ln()
}

impl Default for NoiseInjector {
    fn default() -> Self {
        Self::new()
    }
}

pub fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Scale `values` down so their L2 norm is at most `max_norm`.
pub fn clip_to_norm(values: &mut [f64], max_norm: f64) {
    let norm = l2_norm(values);
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for v in values.iter_mut() {
            *v *= scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_sigma() {
        let cal = NoiseMechanism::Gaussian.calibrate(0.5, 1e-5, 1.0).unwrap();
        let expected = (2.0_f64 * (1.25_f64 / 1e-5).ln()).sqrt() / 0.5;
        assert!((cal.scale - expected).abs() < 1e-9);
        assert_eq!(cal.epsilon, 0.5);
        assert_eq!(cal.delta, 1e-5);
    }

    #[test]
    fn test_gaussian_charges_clamped_epsilon() {
        let cal = NoiseMechanism::Gaussian.calibrate(3.0, 1e-5, 1.0).unwrap();
        assert_eq!(cal.epsilon, MAX_GAUSSIAN_EPSILON);
    }

    #[test]
    fn test_laplace_scale_and_zero_delta() {
        let cal = NoiseMechanism::Laplace.calibrate(2.0, 1e-5, 0.5).unwrap();
        assert_eq!(cal.scale, 0.25);
        assert_eq!(cal.delta, 0.0);
        assert_eq!(cal.epsilon, 2.0);
    }

    #[test]
    fn test_calibrate_rejects_bad_parameters() {
        assert!(NoiseMechanism::Gaussian.calibrate(0.0, 1e-5, 1.0).is_err());
        assert!(NoiseMechanism::Gaussian.calibrate(0.5, 0.0, 1.0).is_err());
        assert!(NoiseMechanism::Gaussian.calibrate(0.5, 1.0, 1.0).is_err());
        assert!(NoiseMechanism::Laplace.calibrate(-1.0, 0.0, 1.0).is_err());
        assert!(NoiseMechanism::Laplace.calibrate(1.0, 0.0, f64::NAN).is_err());
    }

    #[test]
    fn test_seeded_injector_is_reproducible() {
        let cal = NoiseMechanism::Gaussian.calibrate(0.5, 1e-5, 0.1).unwrap();
        let mut a = vec![0.0; 8];
        let mut b = vec![0.0; 8];
        NoiseInjector::seeded(11).apply(&cal, &mut a).unwrap();
        NoiseInjector::seeded(11).apply(&cal, &mut b).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_laplace_noise_is_centered() {
        let cal = NoiseMechanism::Laplace.calibrate(1.0, 0.0, 1.0).unwrap();
        let mut values = vec![0.0; 20_000];
        NoiseInjector::seeded(5).apply(&cal, &mut values).unwrap();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!(mean.abs() < 0.1, "mean was {}", mean);
    }

    #[test]
    fn test_laplace_noise_is_finite_at_interval_edges() {
        let smallest = f64::EPSILON / 2.0;
        assert!(laplace_offset(smallest, 1.0).is_finite());
        assert!(laplace_offset(1.0 - smallest, 1.0).is_finite());
        assert!(laplace_offset(smallest, 1.0) < -30.0);
        assert_eq!(laplace_offset(0.5, 1.0), 0.0);

        let cal = NoiseMechanism::Laplace.calibrate(0.1, 0.0, 1.0).unwrap();
        let mut values = vec![0.0; 50_000];
        NoiseInjector::seeded(17).apply(&cal, &mut values).unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_clip_to_norm() {
        let mut v = vec![3.0, 4.0];
        clip_to_norm(&mut v, 1.0);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-12);

        let mut small = vec![0.1, 0.1];
        clip_to_norm(&mut small, 1.0);
        assert_eq!(small, vec![0.1, 0.1]);
    }

    #[test]
    fn test_mechanism_parse() {
        assert_eq!("Laplace".parse::<NoiseMechanism>().unwrap(), NoiseMechanism::Laplace);
        assert!("exponential".parse::<NoiseMechanism>().is_err());
    }
}
