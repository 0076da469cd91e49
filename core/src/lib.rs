//! Sequential Monte Carlo toolbox for building and analyzing particle filters
//!
//! This crate provides a generic sequential Monte Carlo (SMC) engine built around an abstract
//! Feynman-Kac model interface. A Feynman-Kac model is the mathematical description of the
//! operations a particle filter performs:
//!
//! - the initial distribution $M_0(dx_0)$ says how the particles are simulated at time 0;
//! - the Markov kernel $M_t(x_{t-1}, dx_t)$ says how particle $X_t$ is simulated at time $t$
//!   given its ancestor $X_{t-1}$;
//! - the potential function $G_t(x_{t-1}, x_t)$ says how a particle and its ancestor are
//!   reweighted at time $t$.
//!
//! Given a type implementing the [FeynmanKac] trait, the [smc::Smc] engine propagates a
//! population of N weighted particles through the model's time steps, resampling when the
//! effective sample size (ESS) degrades past a configurable threshold, and accumulates a
//! running estimate of the model's log normalizing constant (the log-likelihood in
//! state-space applications). Auxiliary particle filters (APF) and the low-discrepancy
//! (sequential quasi-Monte Carlo, SQMC) variant of the algorithm are supported through
//! optional model capabilities.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for
//!   weight vectors and particle coordinate matrices.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   Provides seeded random number generation for particle propagation and resampling.
//!
//! All other functionality is built on top of these crates or is auxiliary functionality
//! (e.g. I/O for the demonstration binary). The primary reference text is _An Introduction
//! to Sequential Monte Carlo_ by Nicolas Chopin and Omiros Papaspiliopoulos. Where
//! applicable, calculations are referenced by the appropriate chapter of the book. In
//! general, variables are named according to the quantity they represent and not the symbol
//! used in the book; for example the potential function evaluated on the log scale is named
//! `log_g` rather than `G`.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [weights]: The log-scale weight algebra: [weights::WeightSet] and stabilized
//!   log-sum-exp utilities.
//! - [resampling]: The standard resampling schemes (multinomial, residual, stratified,
//!   systematic, SSP) behind a single dispatch function.
//! - [qmc]: Low-discrepancy point set generation and the inverse normal CDF used by
//!   deterministic kernel pushforwards.
//! - [hilbert]: Space-filling-curve ordering of a particle ensemble, used to couple
//!   low-discrepancy draws to the empirical weighted distribution.
//! - [smc]: The particle filter engine itself: configuration, the step state machine,
//!   and the resample-move logic.
//! - [collectors]: Per-step summary collection (ESS, resampling flags, log-likelihood
//!   estimates, optional moments).
//! - [history]: Storage of the full particle system over time, for smoothing-style
//!   consumers and genealogy inspection.
//! - [models]: A reference one-dimensional linear-Gaussian state-space model with an
//!   exact Kalman likelihood, used for validation and by the demonstration binary.
//!
//! ## Weight arithmetic
//!
//! All weight updates are performed on the log scale until the final normalization step.
//! For a log-weight vector $\ell$ the normalized weights are
//!
//! $$
//! W_n = \frac{\exp(\ell_n - \max_m \ell_m)}{\sum_k \exp(\ell_k - \max_m \ell_m)}
//! $$
//!
//! which is exact and avoids overflow/underflow over long time horizons or under highly
//! peaked potentials. Potential functions may return $-\infty$ for particles assigned zero
//! weight; this propagates correctly through the log-sum-exp identity. A weight vector that
//! is $-\infty$ everywhere is a degenerate particle system and is reported as the distinct
//! [SmcError::DegenerateWeights] condition rather than producing NaNs.
pub mod collectors;
pub mod hilbert;
pub mod history;
pub mod models;
pub mod qmc;
pub mod resampling;
pub mod smc;
pub mod weights;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;

use crate::smc::SmcState;

/// Errors reported by the engine and its collaborators.
///
/// Configuration errors ([SmcError::InvalidConfig], [SmcError::UnknownScheme],
/// [SmcError::MissingCapability]) are raised at construction time, before any step
/// executes. [SmcError::DegenerateWeights] is raised by the weight algebra whenever a
/// reweighting leaves every particle with zero weight. No failure is retried; all errors
/// propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SmcError {
    /// A construction-time parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A resampling scheme name did not parse to a known scheme.
    #[error("unknown resampling scheme `{0}`")]
    UnknownScheme(String),
    /// The model does not provide a capability required by the selected mode,
    /// e.g. no deterministic pushforward under QMC mode, or no transition density
    /// for a smoothing consumer.
    #[error("model `{model}` does not provide the `{capability}` capability")]
    MissingCapability {
        model: &'static str,
        capability: &'static str,
    },
    /// Every log-weight is negative infinity: the particle system carries no mass
    /// and neither normalized weights nor the ESS are defined.
    #[error("degenerate weights: all log-weights are -inf")]
    DegenerateWeights,
    /// A resampling scheme produced the wrong number of offspring. This indicates
    /// pathological weight input (e.g. accumulated round-off) rather than a
    /// recoverable condition.
    #[error("resampling produced {got} offspring for a target of {expected}")]
    OffspringMismatch { expected: usize, got: usize },
}

/// Weighted mean and variance of a particle ensemble, one entry per state dimension.
#[derive(Clone, Debug)]
pub struct Moments {
    pub mean: DVector<f64>,
    pub var: DVector<f64>,
}

/// Feynman-Kac model trait: the capability set a statistical model must implement to be
/// run through the [smc::Smc] engine.
///
/// A minimal model implements [FeynmanKac::horizon], [FeynmanKac::m0], [FeynmanKac::m] and
/// [FeynmanKac::log_g]; everything else has a default. The particle representation is
/// opaque to the engine: it is whatever the model produces and consumes, from a plain
/// `f64` to a structured record.
///
/// Optional capabilities are detected at runtime through capability queries rather than
/// reflection, so the engine can branch deterministically and report a missing capability
/// as a named error before any step executes:
///
/// - a model is an *auxiliary* particle filter (APF) if and only if [FeynmanKac::log_eta]
///   returns a look-ahead weight vector;
/// - a model supports the sequential quasi-Monte Carlo variant if [FeynmanKac::qmc]
///   returns its [QmcSupport] extension;
/// - smoothing consumers require the transition log-density [FeynmanKac::log_pt], whose
///   absence is reported distinctly rather than silently treated as zero.
pub trait FeynmanKac {
    /// Particle state representation produced and consumed by this model.
    type Particle: Clone;

    /// Number of time steps of a complete run; the default [FeynmanKac::done] predicate
    /// terminates once the time index reaches this horizon.
    fn horizon(&self) -> usize;

    /// Draw `n` i.i.d. samples from the initial distribution $M_0$.
    fn m0(&self, rng: &mut StdRng, n: usize) -> Vec<Self::Particle>;

    /// Draw one descendant per ancestor under the time-`t` Markov kernel $M_t$.
    /// The output has the same length as `ancestors`.
    fn m(&self, rng: &mut StdRng, t: usize, ancestors: &[Self::Particle]) -> Vec<Self::Particle>;

    /// Log of the potential function $G_t(x_{t-1}, x_t)$, one entry per particle.
    ///
    /// Entries may be `-inf` for particles assigned zero weight (e.g. a hard constraint
    /// violation); the weight algebra tolerates these. At `t = 0` the `ancestors` slice
    /// is empty.
    fn log_g(
        &self,
        t: usize,
        ancestors: &[Self::Particle],
        particles: &[Self::Particle],
    ) -> DVector<f64>;

    /// Termination predicate, evaluated at step entry. Default: the time index has
    /// reached the horizon.
    fn done(&self, state: &SmcState<'_, Self::Particle>) -> bool {
        state.t >= self.horizon()
    }

    /// Resampling trigger, evaluated once per step after the auxiliary weights are set
    /// up. Default: the ESS of the auxiliary weights has dropped below `essrmin * n`.
    fn time_to_resample(&self, state: &SmcState<'_, Self::Particle>) -> bool {
        state.aux.ess() < state.essrmin * state.n as f64
    }

    /// Look-ahead weight function $\eta_t$ of an auxiliary particle filter. A model is an
    /// APF if and only if this returns `Some`; the engine detects the capability at
    /// runtime and applies the APF post-resampling weight correction.
    fn log_eta(&self, _t: usize, _particles: &[Self::Particle]) -> Option<DVector<f64>> {
        None
    }

    /// Transition log-density of $X_t$ given $X_{t-1}$, required by most smoothing
    /// consumers. The default reports the missing capability as a named condition.
    fn log_pt(
        &self,
        _t: usize,
        _ancestor: &Self::Particle,
        _particle: &Self::Particle,
    ) -> Result<f64, SmcError> {
        Err(SmcError::MissingCapability {
            model: std::any::type_name::<Self>(),
            capability: "log_pt",
        })
    }

    /// Capability query for the sequential quasi-Monte Carlo extension. Models that can
    /// express their initial law and kernel as deterministic pushforwards of uniform
    /// variates return `Some(self)` here.
    fn qmc(&self) -> Option<&dyn QmcSupport<Self::Particle>> {
        None
    }

    /// Weighted mean and variance of the ensemble, used by summary collectors. Models
    /// with a natural numeric embedding should implement this; the engine itself never
    /// requires it.
    fn default_moments(&self, _w: &DVector<f64>, _particles: &[Self::Particle]) -> Option<Moments> {
        None
    }
}

/// Capability set for the sequential quasi-Monte Carlo (SQMC) variant of the algorithm.
///
/// The pushforwards must be equal in distribution to the model's random counterparts:
/// if $U \sim \mathcal{U}([0,1]^{d_u})$ then `gamma0(U)` is distributed as `m0` and
/// `gamma(t, xp, U)` as the kernel $M_t(x_{t-1}, dx_t)$.
pub trait QmcSupport<P> {
    /// Dimension of the uniform draw consumed per particle transition.
    fn du(&self) -> usize;

    /// Deterministic pushforward of an `(n, du)` uniform point set to the initial law.
    fn gamma0(&self, u: &DMatrix<f64>) -> Vec<P>;

    /// Deterministic pushforward realizing the time-`t` kernel; `u` is `(n, du)` and
    /// row `i` drives the transition of `ancestors[i]`.
    fn gamma(&self, t: usize, ancestors: &[P], u: &DMatrix<f64>) -> Vec<P>;

    /// Numeric embedding of the ensemble consumed by the space-filling-curve ordering,
    /// one row per particle.
    fn coordinates(&self, particles: &[P]) -> DMatrix<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    struct Minimal;
    impl FeynmanKac for Minimal {
        type Particle = f64;
        fn horizon(&self) -> usize {
            1
        }
        fn m0(&self, _rng: &mut StdRng, n: usize) -> Vec<f64> {
            vec![0.0; n]
        }
        fn m(&self, _rng: &mut StdRng, _t: usize, ancestors: &[f64]) -> Vec<f64> {
            ancestors.to_vec()
        }
        fn log_g(&self, _t: usize, _ancestors: &[f64], particles: &[f64]) -> DVector<f64> {
            DVector::zeros(particles.len())
        }
    }

    #[test]
    fn test_default_capabilities() {
        let model = Minimal;
        let mut rng = StdRng::seed_from_u64(0);
        let x = model.m0(&mut rng, 4);
        assert!(model.log_eta(0, &x).is_none());
        assert!(model.qmc().is_none());
        assert!(
            model
                .default_moments(&DVector::from_element(4, 0.25), &x)
                .is_none()
        );
    }

    #[test]
    fn test_missing_transition_density_is_named() {
        let model = Minimal;
        let err = model.log_pt(1, &0.0, &0.0).unwrap_err();
        match err {
            SmcError::MissingCapability { model, capability } => {
                assert!(model.contains("Minimal"));
                assert_eq!(capability, "log_pt");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
