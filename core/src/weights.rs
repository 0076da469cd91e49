//! Log-scale weight algebra for particle systems.
//!
//! This module defines [WeightSet], the immutable-update container for particle
//! log-weights, along with the stabilized log-sum-exp utilities the rest of the crate is
//! built on. Weight updates are additive on the log scale and never mutate in place: an
//! auxiliary particle filter needs to reference the pre-update weight set after the main
//! weights have already been advanced, so `add` always returns a fresh instance.

use crate::SmcError;
use nalgebra::DVector;

/// Log of the sum of exponentials of `v`, stabilized by subtracting the maximum.
///
/// Returns `-inf` for a vector whose entries are all `-inf`.
pub fn log_sum_exp(v: &DVector<f64>) -> f64 {
    let m = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !m.is_finite() {
        return m;
    }
    m + v.iter().map(|x| (x - m).exp()).sum::<f64>().ln()
}

/// Log of the arithmetic mean of exponentials of `v`.
pub fn log_mean_exp(v: &DVector<f64>) -> f64 {
    log_sum_exp(v) - (v.len() as f64).ln()
}

/// Log of the weighted mean of exponentials of `v` under the probability vector `w`.
///
/// Computes $\log \sum_n W_n e^{v_n}$ through the same max-stabilized identity as
/// [log_sum_exp]. Entries of `v` paired with zero weight contribute nothing, even when
/// they are `-inf`.
pub fn log_weighted_mean_exp(v: &DVector<f64>, w: &DVector<f64>) -> f64 {
    assert_eq!(v.len(), w.len(), "value and weight vectors must match");
    let m = v
        .iter()
        .zip(w.iter())
        .filter(|&(_, &wi)| wi > 0.0)
        .map(|(&vi, _)| vi)
        .fold(f64::NEG_INFINITY, f64::max);
    if !m.is_finite() {
        return m;
    }
    let s: f64 = v
        .iter()
        .zip(w.iter())
        .filter(|&(_, &wi)| wi > 0.0)
        .map(|(&vi, &wi)| wi * (vi - m).exp())
        .sum();
    m + s.ln()
}

/// Weighted mean and variance of scalar values under the probability vector `w`.
pub fn wmean_and_var(w: &DVector<f64>, x: &[f64]) -> (f64, f64) {
    assert_eq!(w.len(), x.len(), "weight and value vectors must match");
    let mean: f64 = w.iter().zip(x.iter()).map(|(&wi, &xi)| wi * xi).sum();
    let second: f64 = w.iter().zip(x.iter()).map(|(&wi, &xi)| wi * xi * xi).sum();
    (mean, second - mean * mean)
}

/// A set of particle weights: log-weights together with their normalized form, effective
/// sample size, and log-mean.
///
/// The normalized weights are derived once at construction through the max-stabilized
/// exponential-normalize, so the invariants hold for the lifetime of the value:
/// the normalized weights sum to one (up to floating tolerance) and the ESS lies in
/// `(0, n]`, equal to `n` exactly when the weights are uniform. Construction detects the
/// degenerate all-`-inf` case and reports it as [SmcError::DegenerateWeights] instead of
/// producing NaNs.
#[derive(Clone, Debug)]
pub struct WeightSet {
    lw: DVector<f64>,
    w: DVector<f64>,
    ess: f64,
    log_mean: f64,
}

impl WeightSet {
    /// Uniform weights over `n` particles (all log-weights zero).
    pub fn uniform(n: usize) -> WeightSet {
        assert!(n >= 1, "a weight set must hold at least one particle");
        WeightSet {
            lw: DVector::zeros(n),
            w: DVector::from_element(n, 1.0 / n as f64),
            ess: n as f64,
            log_mean: 0.0,
        }
    }

    /// Build a weight set from raw log-weights.
    ///
    /// # Errors
    /// [SmcError::DegenerateWeights] if every entry is `-inf`, or if any entry is NaN or
    /// `+inf` (the normalization is undefined in all three cases).
    pub fn from_log_weights(lw: DVector<f64>) -> Result<WeightSet, SmcError> {
        assert!(lw.len() >= 1, "a weight set must hold at least one particle");
        let m = lw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !m.is_finite() {
            return Err(SmcError::DegenerateWeights);
        }
        let mut w = DVector::from_iterator(lw.len(), lw.iter().map(|x| (x - m).exp()));
        let total: f64 = w.sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(SmcError::DegenerateWeights);
        }
        w /= total;
        let ess = 1.0 / w.iter().map(|x| x * x).sum::<f64>();
        let log_mean = m + total.ln() - (lw.len() as f64).ln();
        Ok(WeightSet {
            lw,
            w,
            ess,
            log_mean,
        })
    }

    /// Pure additive update: a new weight set with `lw + delta` as log-weights. The
    /// receiver is left untouched.
    ///
    /// # Errors
    /// [SmcError::DegenerateWeights] if the incremented vector carries no mass.
    pub fn add(&self, delta: &DVector<f64>) -> Result<WeightSet, SmcError> {
        assert_eq!(
            delta.len(),
            self.lw.len(),
            "weight increment must match the particle count"
        );
        WeightSet::from_log_weights(&self.lw + delta)
    }

    /// Number of particles carried by this weight set.
    pub fn len(&self) -> usize {
        self.lw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lw.is_empty()
    }

    /// Raw log-weights.
    pub fn log_weights(&self) -> &DVector<f64> {
        &self.lw
    }

    /// Normalized weights; sum to one.
    pub fn normalized(&self) -> &DVector<f64> {
        &self.w
    }

    /// Effective sample size, `1 / sum(W_i^2)`.
    pub fn ess(&self) -> f64 {
        self.ess
    }

    /// Log of the mean of the unnormalized weights, computed via the stable log-sum-exp
    /// identity. Used by the engine for incremental log-likelihood estimation.
    pub fn log_mean(&self) -> f64 {
        self.log_mean
    }
}
