//! Reference state-space models.
//!
//! This module provides a one-dimensional linear-Gaussian state-space model, the
//! canonical validation target for particle filter implementations: its exact
//! log-likelihood is available in closed form through the Kalman recursion, so the
//! engine's normalizing-constant estimate can be checked against ground truth.
//!
//! [LinearGauss] is the bootstrap Feynman-Kac rendition of the model (the kernel is the
//! state transition, the potential is the observation density) with full quasi-Monte
//! Carlo support. [LinearGaussApf] wraps it into an auxiliary particle filter with the
//! exact one-step-ahead look-ahead function, which is tractable for this model.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::qmc::norm_quantile;
use crate::weights::wmean_and_var;
use crate::{FeynmanKac, Moments, QmcSupport, SmcError};

/// Gaussian log-density with the given mean and variance.
fn log_normal_pdf(x: f64, mean: f64, var: f64) -> f64 {
    let diff = x - mean;
    -0.5 * ((2.0 * std::f64::consts::PI * var).ln() + diff * diff / var)
}

/// One-dimensional linear-Gaussian state-space model, as a bootstrap Feynman-Kac model:
///
/// $$
/// X_0 \sim N(0, \sigma_0^2), \quad
/// X_t = \rho X_{t-1} + \sigma_X \epsilon_t, \quad
/// Y_t = X_t + \sigma_Y \eta_t
/// $$
///
/// with independent standard normal noise. The particles are plain `f64` states and the
/// potential at time t is the observation density of `data[t]`.
#[derive(Clone, Debug)]
pub struct LinearGauss {
    /// Autoregression coefficient of the state transition.
    pub rho: f64,
    /// Transition noise standard deviation.
    pub sigma_x: f64,
    /// Observation noise standard deviation.
    pub sigma_y: f64,
    /// Initial state standard deviation.
    pub sigma0: f64,
    /// Observed sequence; its length is the filter horizon.
    pub data: Vec<f64>,
}

impl LinearGauss {
    pub fn new(rho: f64, sigma_x: f64, sigma_y: f64, sigma0: f64, data: Vec<f64>) -> LinearGauss {
        assert!(sigma_x > 0.0, "transition noise must be positive");
        assert!(sigma_y > 0.0, "observation noise must be positive");
        assert!(sigma0 > 0.0, "initial noise must be positive");
        LinearGauss {
            rho,
            sigma_x,
            sigma_y,
            sigma0,
            data,
        }
    }

    /// Simulate a trajectory and its observations, e.g. to build a synthetic dataset.
    pub fn simulate(
        rho: f64,
        sigma_x: f64,
        sigma_y: f64,
        sigma0: f64,
        t: usize,
        rng: &mut StdRng,
    ) -> (Vec<f64>, Vec<f64>) {
        let transition = Normal::new(0.0, sigma_x).unwrap();
        let observation = Normal::new(0.0, sigma_y).unwrap();
        let initial = Normal::new(0.0, sigma0).unwrap();
        let mut states = Vec::with_capacity(t);
        let mut observations = Vec::with_capacity(t);
        let mut x = 0.0;
        for k in 0..t {
            x = if k == 0 {
                initial.sample(rng)
            } else {
                rho * x + transition.sample(rng)
            };
            states.push(x);
            observations.push(x + observation.sample(rng));
        }
        (states, observations)
    }

    /// Exact log-likelihood of the observed sequence via the Kalman filter recursion.
    /// This is the ground truth the engine's `log_likelihood` estimates.
    pub fn kalman_log_likelihood(&self) -> f64 {
        let mut log_likelihood = 0.0;
        let mut predicted_mean = 0.0;
        let mut predicted_var = self.sigma0 * self.sigma0;
        for &y in &self.data {
            let innovation_var = predicted_var + self.sigma_y * self.sigma_y;
            log_likelihood += log_normal_pdf(y, predicted_mean, innovation_var);
            let gain = predicted_var / innovation_var;
            let filtered_mean = predicted_mean + gain * (y - predicted_mean);
            let filtered_var = (1.0 - gain) * predicted_var;
            predicted_mean = self.rho * filtered_mean;
            predicted_var = self.rho * self.rho * filtered_var + self.sigma_x * self.sigma_x;
        }
        log_likelihood
    }
}

impl FeynmanKac for LinearGauss {
    type Particle = f64;

    fn horizon(&self) -> usize {
        self.data.len()
    }

    fn m0(&self, rng: &mut StdRng, n: usize) -> Vec<f64> {
        let initial = Normal::new(0.0, self.sigma0).unwrap();
        (0..n).map(|_| initial.sample(rng)).collect()
    }

    fn m(&self, rng: &mut StdRng, _t: usize, ancestors: &[f64]) -> Vec<f64> {
        let transition = Normal::new(0.0, self.sigma_x).unwrap();
        ancestors
            .iter()
            .map(|&xp| self.rho * xp + transition.sample(rng))
            .collect()
    }

    fn log_g(&self, t: usize, _ancestors: &[f64], particles: &[f64]) -> DVector<f64> {
        let y = self.data[t];
        let var = self.sigma_y * self.sigma_y;
        DVector::from_iterator(
            particles.len(),
            particles.iter().map(|&x| log_normal_pdf(y, x, var)),
        )
    }

    fn log_pt(&self, _t: usize, ancestor: &f64, particle: &f64) -> Result<f64, SmcError> {
        Ok(log_normal_pdf(
            *particle,
            self.rho * ancestor,
            self.sigma_x * self.sigma_x,
        ))
    }

    fn qmc(&self) -> Option<&dyn QmcSupport<f64>> {
        Some(self)
    }

    fn default_moments(&self, w: &DVector<f64>, particles: &[f64]) -> Option<Moments> {
        let (mean, var) = wmean_and_var(w, particles);
        Some(Moments {
            mean: DVector::from_element(1, mean),
            var: DVector::from_element(1, var),
        })
    }
}

impl QmcSupport<f64> for LinearGauss {
    fn du(&self) -> usize {
        1
    }

    fn gamma0(&self, u: &DMatrix<f64>) -> Vec<f64> {
        (0..u.nrows())
            .map(|i| self.sigma0 * norm_quantile(u[(i, 0)]))
            .collect()
    }

    fn gamma(&self, _t: usize, ancestors: &[f64], u: &DMatrix<f64>) -> Vec<f64> {
        ancestors
            .iter()
            .enumerate()
            .map(|(i, &xp)| self.rho * xp + self.sigma_x * norm_quantile(u[(i, 0)]))
            .collect()
    }

    fn coordinates(&self, particles: &[f64]) -> DMatrix<f64> {
        DMatrix::from_fn(particles.len(), 1, |r, _| particles[r])
    }
}

/// Auxiliary particle filter built on [LinearGauss], with the exact look-ahead
/// $\eta_t(x) = p(y_{t+1} \mid x) = N(y_{t+1}; \rho x, \sigma_X^2 + \sigma_Y^2)$.
#[derive(Clone, Debug)]
pub struct LinearGaussApf {
    pub inner: LinearGauss,
}

impl LinearGaussApf {
    pub fn new(inner: LinearGauss) -> LinearGaussApf {
        LinearGaussApf { inner }
    }
}

impl FeynmanKac for LinearGaussApf {
    type Particle = f64;

    fn horizon(&self) -> usize {
        self.inner.horizon()
    }

    fn m0(&self, rng: &mut StdRng, n: usize) -> Vec<f64> {
        self.inner.m0(rng, n)
    }

    fn m(&self, rng: &mut StdRng, t: usize, ancestors: &[f64]) -> Vec<f64> {
        self.inner.m(rng, t, ancestors)
    }

    fn log_g(&self, t: usize, ancestors: &[f64], particles: &[f64]) -> DVector<f64> {
        self.inner.log_g(t, ancestors, particles)
    }

    fn log_eta(&self, t: usize, particles: &[f64]) -> Option<DVector<f64>> {
        let y_next = *self.inner.data.get(t + 1)?;
        let var = self.inner.sigma_x * self.inner.sigma_x + self.inner.sigma_y * self.inner.sigma_y;
        Some(DVector::from_iterator(
            particles.len(),
            particles
                .iter()
                .map(|&x| log_normal_pdf(y_next, self.inner.rho * x, var)),
        ))
    }

    fn log_pt(&self, t: usize, ancestor: &f64, particle: &f64) -> Result<f64, SmcError> {
        self.inner.log_pt(t, ancestor, particle)
    }

    fn default_moments(&self, w: &DVector<f64>, particles: &[f64]) -> Option<Moments> {
        self.inner.default_moments(w, particles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    #[test]
    fn test_simulate_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let (states, observations) = LinearGauss::simulate(0.9, 1.0, 0.5, 2.0, 30, &mut rng);
        assert_eq!(states.len(), 30);
        assert_eq!(observations.len(), 30);
    }

    #[test]
    fn test_kalman_single_observation() {
        // with one observation the likelihood is N(y; 0, sigma0^2 + sigma_y^2)
        let model = LinearGauss::new(0.9, 1.0, 0.5, 2.0, vec![1.3]);
        let expected = log_normal_pdf(1.3, 0.0, 4.0 + 0.25);
        assert_approx_eq!(model.kalman_log_likelihood(), expected, 1e-12);
    }

    #[test]
    fn test_log_g_is_observation_density() {
        let model = LinearGauss::new(0.9, 1.0, 0.5, 2.0, vec![0.0, 2.0]);
        let lg = model.log_g(1, &[], &[2.0, 0.0]);
        assert_approx_eq!(lg[0], log_normal_pdf(2.0, 2.0, 0.25), 1e-12);
        assert!(lg[0] > lg[1]);
    }

    #[test]
    fn test_gamma_matches_kernel_through_quantiles() {
        let model = LinearGauss::new(0.5, 1.0, 0.5, 2.0, vec![0.0; 3]);
        // the median of the uniform maps to the kernel mean
        let u = DMatrix::from_element(1, 1, 0.5);
        let moved = model.gamma(1, &[2.0], &u);
        assert_approx_eq!(moved[0], 1.0, 1e-9);
        let u0 = DMatrix::from_element(1, 1, 0.5);
        assert_approx_eq!(model.gamma0(&u0)[0], 0.0, 1e-9);
    }

    #[test]
    fn test_apf_lookahead_peaks_at_predictive_mean() {
        let model = LinearGaussApf::new(LinearGauss::new(1.0, 1.0, 0.5, 2.0, vec![0.0, 3.0]));
        let le = model.log_eta(0, &[3.0, 0.0]).unwrap();
        // the particle whose propagated mean hits y_1 = 3 gets the larger look-ahead
        assert!(le[0] > le[1]);
    }

    #[test]
    fn test_apf_lookahead_absent_at_last_step() {
        let model = LinearGaussApf::new(LinearGauss::new(1.0, 1.0, 0.5, 2.0, vec![0.0, 3.0]));
        assert!(model.log_eta(1, &[0.0]).is_none());
    }

    #[test]
    fn test_transition_density_available() {
        let model = LinearGauss::new(0.9, 1.0, 0.5, 2.0, vec![0.0]);
        let lp = model.log_pt(1, &1.0, &0.9).unwrap();
        assert_approx_eq!(lp, log_normal_pdf(0.9, 0.9, 1.0), 1e-12);
    }
}
