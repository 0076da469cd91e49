//! The particle filter engine.
//!
//! [Smc] owns the particle ensemble, the weights, the ancestor map, and the time index,
//! and drives the step state machine of a sequential Monte Carlo run:
//!
//! 1. at t = 0, draw the initial ensemble from the model's initial distribution (or push
//!    a low-discrepancy point set through the deterministic initial map in QMC mode);
//! 2. at t > 0, set up the auxiliary weights (the look-ahead-adjusted weights of an
//!    auxiliary particle filter, or the main weights otherwise), then resample-move:
//!    select ancestors when the resampling trigger fires, reset the weights, and apply
//!    the model's Markov kernel;
//! 3. reweight with the model's potential function and accumulate the incremental
//!    log normalizing-constant estimate;
//! 4. notify the history recorder and then the summary collectors.
//!
//! The engine is a restartable stateful stepper: [Smc::step] advances one step,
//! [Smc::run] drives the machine until the model's termination predicate holds. Both
//! mutate the same engine state, so an [Smc] value must not be stepped concurrently from
//! multiple threads; independent runs (separate engine instances with distinct seeds)
//! are embarrassingly parallel.
//!
//! A step either completes and commits a consistent new engine state, or returns an
//! error before any state is committed for that step (the random generator and the
//! low-discrepancy cursor may still have advanced).

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::{Duration, Instant};

use crate::collectors::{Collector, Summaries};
use crate::hilbert::{HilbertOrder, SpaceFillingOrder};
use crate::history::ParticleHistory;
use crate::qmc::{HaltonSequence, LowDiscrepancySource};
use crate::resampling::{ResamplingScheme, inverse_cdf, resample};
use crate::weights::{WeightSet, log_weighted_mean_exp};
use crate::{FeynmanKac, SmcError};

/// Engine configuration, consumed at construction.
#[derive(Clone, Debug)]
pub struct SmcConfig {
    /// Number of particles; at least 1.
    pub n: usize,
    /// Resampling scheme applied when the trigger fires.
    pub resampling: ResamplingScheme,
    /// ESS ratio threshold in `[0, 1]`: the default trigger resamples when the auxiliary
    /// ESS drops below `essrmin * n`. Zero disables resampling; one forces it whenever
    /// the weights are not exactly uniform.
    pub essrmin: f64,
    /// Run the sequential quasi-Monte Carlo variant. Requires the model's QMC
    /// capability; resampling then happens at every step and `resampling`/`essrmin`
    /// are ignored.
    pub qmc: bool,
    /// Record the full particle system at every step.
    pub store_history: bool,
    /// Record built-in per-step summaries.
    pub collect_summaries: bool,
    /// Also collect weighted ensemble moments (requires the model's moment support).
    pub collect_moments: bool,
    /// Emit a log line per completed step.
    pub verbose: bool,
    /// Seed for the engine's random generator. Independent runs should use distinct
    /// seeds for reproducibility.
    pub seed: u64,
}

impl Default for SmcConfig {
    fn default() -> Self {
        SmcConfig {
            n: 100,
            resampling: ResamplingScheme::Systematic,
            essrmin: 0.5,
            qmc: false,
            store_history: false,
            collect_summaries: true,
            collect_moments: false,
            verbose: false,
            seed: 42,
        }
    }
}

/// Read-only view of the engine state, handed to model predicates, the history
/// recorder, and summary collectors.
pub struct SmcState<'a, P> {
    /// Current time index.
    pub t: usize,
    /// Configured particle count.
    pub n: usize,
    /// Configured ESS ratio threshold.
    pub essrmin: f64,
    /// Current ensemble.
    pub particles: &'a [P],
    /// Ancestor indices into the previous ensemble; the identity when no resampling
    /// occurred.
    pub ancestors: &'a [usize],
    /// Main (inferential) weights.
    pub weights: &'a WeightSet,
    /// Auxiliary weights used for ancestor selection; equal to the main weights outside
    /// an auxiliary particle filter.
    pub aux: &'a WeightSet,
    /// Whether resampling was performed on this step.
    pub resampled: bool,
    /// Increment of the log normalizing-constant estimate contributed by this step.
    pub log_likelihood_increment: f64,
    /// Cumulative log normalizing-constant estimate.
    pub log_likelihood: f64,
    /// The particle history, when recording is enabled. Already updated for the current
    /// step by the time collectors run.
    pub history: Option<&'a ParticleHistory<P>>,
}

/// Outcome of the resample-move phase, committed only after the whole step succeeds.
struct Moved<P> {
    resampled: bool,
    ancestors: Vec<usize>,
    ancestor_states: Vec<P>,
    particles: Vec<P>,
    weights: WeightSet,
}

/// A sequential Monte Carlo run over a Feynman-Kac model.
pub struct Smc<M: FeynmanKac> {
    fk: M,
    config: SmcConfig,
    rng: StdRng,
    low_discrepancy: Box<dyn LowDiscrepancySource>,
    ordering: Box<dyn SpaceFillingOrder>,
    t: usize,
    particles: Vec<M::Particle>,
    ancestor_states: Vec<M::Particle>,
    ancestors: Vec<usize>,
    weights: WeightSet,
    aux: WeightSet,
    rs_flag: bool,
    log_likelihood_increment: f64,
    log_likelihood: f64,
    prev_log_mean: f64,
    history: Option<ParticleHistory<M::Particle>>,
    summaries: Option<Summaries>,
    collectors: Vec<Box<dyn Collector<M::Particle>>>,
    cpu_time: Duration,
}

impl<M: FeynmanKac> Smc<M> {
    /// Build an engine for the given model.
    ///
    /// Fails fast on configuration errors: a particle count of zero, an ESS threshold
    /// outside `[0, 1]`, or QMC mode requested from a model without the QMC capability.
    pub fn new(fk: M, config: SmcConfig) -> Result<Smc<M>, SmcError> {
        if config.n < 1 {
            return Err(SmcError::InvalidConfig(
                "particle count must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&config.essrmin) {
            return Err(SmcError::InvalidConfig(format!(
                "ESS ratio threshold must lie in [0, 1], got {}",
                config.essrmin
            )));
        }
        if config.qmc && fk.qmc().is_none() {
            return Err(SmcError::MissingCapability {
                model: std::any::type_name::<M>(),
                capability: "qmc",
            });
        }
        debug!(
            "engine configured: n={}, resampling={}, essrmin={}, qmc={}, seed={}",
            config.n, config.resampling, config.essrmin, config.qmc, config.seed
        );
        let rng = StdRng::seed_from_u64(config.seed);
        let n = config.n;
        Ok(Smc {
            fk,
            rng,
            low_discrepancy: Box::new(HaltonSequence::new()),
            ordering: Box::new(HilbertOrder),
            t: 0,
            particles: Vec::new(),
            ancestor_states: Vec::new(),
            ancestors: Vec::new(),
            weights: WeightSet::uniform(n),
            aux: WeightSet::uniform(n),
            rs_flag: false,
            log_likelihood_increment: 0.0,
            log_likelihood: 0.0,
            prev_log_mean: 0.0,
            history: config.store_history.then(ParticleHistory::new),
            summaries: config.collect_summaries.then(Summaries::new),
            collectors: Vec::new(),
            cpu_time: Duration::ZERO,
            config,
        })
    }

    /// Replace the low-discrepancy source used in QMC mode (a fresh Halton sequence by
    /// default).
    pub fn with_low_discrepancy(mut self, source: Box<dyn LowDiscrepancySource>) -> Smc<M> {
        self.low_discrepancy = source;
        self
    }

    /// Replace the space-filling ordering used in QMC mode (Hilbert by default).
    pub fn with_ordering(mut self, ordering: Box<dyn SpaceFillingOrder>) -> Smc<M> {
        self.ordering = ordering;
        self
    }

    /// Register an additional per-step observer, notified after the history recorder.
    pub fn add_collector(&mut self, collector: Box<dyn Collector<M::Particle>>) {
        self.collectors.push(collector);
    }

    /// Current time index (number of completed steps).
    pub fn t(&self) -> usize {
        self.t
    }

    /// Current ensemble; empty before the first step.
    pub fn particles(&self) -> &[M::Particle] {
        &self.particles
    }

    /// Ancestor indices of the current ensemble.
    pub fn ancestors(&self) -> &[usize] {
        &self.ancestors
    }

    /// Main weights.
    pub fn weights(&self) -> &WeightSet {
        &self.weights
    }

    /// Auxiliary weights (equal to the main weights outside an APF).
    pub fn aux_weights(&self) -> &WeightSet {
        &self.aux
    }

    /// Whether the last completed step resampled.
    pub fn resampled(&self) -> bool {
        self.rs_flag
    }

    /// Increment of the log normalizing-constant estimate from the last step.
    pub fn log_likelihood_increment(&self) -> f64 {
        self.log_likelihood_increment
    }

    /// Cumulative log normalizing-constant estimate.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Elapsed wall-clock time of the last [Smc::run] invocation.
    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    /// The model being filtered.
    pub fn model(&self) -> &M {
        &self.fk
    }

    pub fn config(&self) -> &SmcConfig {
        &self.config
    }

    /// Recorded particle history, when enabled.
    pub fn history(&self) -> Option<&ParticleHistory<M::Particle>> {
        self.history.as_ref()
    }

    /// Built-in summaries, when enabled.
    pub fn summaries(&self) -> Option<&Summaries> {
        self.summaries.as_ref()
    }

    /// Read-only view of the current engine state.
    pub fn state(&self) -> SmcState<'_, M::Particle> {
        SmcState {
            t: self.t,
            n: self.config.n,
            essrmin: self.config.essrmin,
            particles: &self.particles,
            ancestors: &self.ancestors,
            weights: &self.weights,
            aux: &self.aux,
            resampled: self.rs_flag,
            log_likelihood_increment: self.log_likelihood_increment,
            log_likelihood: self.log_likelihood,
            history: self.history.as_ref(),
        }
    }

    /// Advance the filter by one step.
    ///
    /// Returns `Ok(true)` when a step was performed and `Ok(false)` when the model's
    /// termination predicate already held (the engine is then inert). With the default
    /// predicate, a horizon of `T` yields exactly `T` completed steps, `t = 0..T-1`.
    pub fn step(&mut self) -> Result<bool, SmcError> {
        if self.fk.done(&self.state()) {
            return Ok(false);
        }
        if self.t == 0 {
            let particles = self.generate_particles()?;
            let increment = self.fk.log_g(0, &[], &particles);
            let weights = WeightSet::from_log_weights(increment)?;
            self.ancestors = (0..particles.len()).collect();
            self.ancestor_states = Vec::new();
            self.particles = particles;
            self.rs_flag = false;
            self.aux = weights.clone();
            self.weights = weights;
        } else {
            let (log_eta, aux) = self.setup_auxiliary_weights()?;
            let moved = if self.config.qmc {
                self.resample_move_qmc(&aux, log_eta.as_ref())?
            } else {
                self.resample_move(&aux, log_eta.as_ref())?
            };
            let increment = self
                .fk
                .log_g(self.t, &moved.ancestor_states, &moved.particles);
            let weights = moved.weights.add(&increment)?;
            self.rs_flag = moved.resampled;
            self.ancestors = moved.ancestors;
            self.ancestor_states = moved.ancestor_states;
            self.particles = moved.particles;
            // the auxiliary weights collapse back onto the main weights for the next step
            self.aux = weights.clone();
            self.weights = weights;
        }
        self.compute_summaries();
        self.t += 1;
        Ok(true)
    }

    /// Run the filter until the model's termination predicate holds, recording the
    /// elapsed wall-clock time of this invocation.
    pub fn run(&mut self) -> Result<(), SmcError> {
        let start = Instant::now();
        while self.step()? {}
        self.cpu_time = start.elapsed();
        Ok(())
    }

    fn generate_particles(&mut self) -> Result<Vec<M::Particle>, SmcError> {
        if self.config.qmc {
            let qmc = self.fk.qmc().ok_or(SmcError::MissingCapability {
                model: std::any::type_name::<M>(),
                capability: "qmc",
            })?;
            let u = self.low_discrepancy.draw(self.config.n, qmc.du());
            Ok(qmc.gamma0(&u))
        } else {
            Ok(self.fk.m0(&mut self.rng, self.config.n))
        }
    }

    /// Auxiliary weights for ancestor selection: the main weights advanced by the
    /// model's look-ahead term when it is an APF, the main weights themselves otherwise.
    fn setup_auxiliary_weights(&self) -> Result<(Option<DVector<f64>>, WeightSet), SmcError> {
        match self.fk.log_eta(self.t - 1, &self.particles) {
            Some(log_eta) => {
                let aux = self.weights.add(&log_eta)?;
                Ok((Some(log_eta), aux))
            }
            None => Ok((None, self.weights.clone())),
        }
    }

    /// Post-resampling weights. A plain filter restarts from uniform weights; an APF
    /// must remove the look-ahead bias: the new log-weight of a particle with ancestor
    /// `a` is the log of the weighted average of the look-ahead function minus the
    /// ancestor's own look-ahead value.
    fn reset_weights(
        &self,
        ancestors: &[usize],
        log_eta: Option<&DVector<f64>>,
    ) -> Result<WeightSet, SmcError> {
        match log_eta {
            Some(le) => {
                let log_avg = log_weighted_mean_exp(le, self.weights.normalized());
                let lw = DVector::from_iterator(
                    ancestors.len(),
                    ancestors.iter().map(|&a| log_avg - le[a]),
                );
                WeightSet::from_log_weights(lw)
            }
            None => Ok(WeightSet::uniform(self.config.n)),
        }
    }

    fn resample_move(
        &mut self,
        aux: &WeightSet,
        log_eta: Option<&DVector<f64>>,
    ) -> Result<Moved<M::Particle>, SmcError> {
        let resampled = {
            let state = SmcState {
                t: self.t,
                n: self.config.n,
                essrmin: self.config.essrmin,
                particles: &self.particles,
                ancestors: &self.ancestors,
                weights: &self.weights,
                aux,
                resampled: self.rs_flag,
                log_likelihood_increment: self.log_likelihood_increment,
                log_likelihood: self.log_likelihood,
                history: self.history.as_ref(),
            };
            self.fk.time_to_resample(&state)
        };
        if resampled {
            // we always resample down to the configured particle count, whatever the
            // size of the current ensemble
            let ancestors = resample(
                self.config.resampling,
                aux.normalized(),
                self.config.n,
                &mut self.rng,
            )?;
            let ancestor_states: Vec<M::Particle> = ancestors
                .iter()
                .map(|&a| self.particles[a].clone())
                .collect();
            let weights = self.reset_weights(&ancestors, log_eta)?;
            let particles = self.fk.m(&mut self.rng, self.t, &ancestor_states);
            Ok(Moved {
                resampled,
                ancestors,
                ancestor_states,
                particles,
                weights,
            })
        } else {
            let ancestors: Vec<usize> = (0..self.particles.len()).collect();
            let ancestor_states = self.particles.clone();
            let particles = self.fk.m(&mut self.rng, self.t, &ancestor_states);
            Ok(Moved {
                resampled,
                ancestors,
                ancestor_states,
                particles,
                weights: self.weights.clone(),
            })
        }
    }

    /// Low-discrepancy resample-move. Resampling always happens in this mode: the sorted
    /// first coordinate of the point set is pushed through the inverse CDF of the
    /// auxiliary weights laid out along the space-filling order of the current ensemble,
    /// which couples the point set to the empirical weighted distribution; the remaining
    /// coordinates drive the deterministic kernel pushforward.
    fn resample_move_qmc(
        &mut self,
        aux: &WeightSet,
        log_eta: Option<&DVector<f64>>,
    ) -> Result<Moved<M::Particle>, SmcError> {
        let qmc = self.fk.qmc().ok_or(SmcError::MissingCapability {
            model: std::any::type_name::<M>(),
            capability: "qmc",
        })?;
        let n = self.config.n;
        let du = qmc.du();
        let u = self.low_discrepancy.draw(n, du + 1);
        let mut tau: Vec<usize> = (0..n).collect();
        tau.sort_by(|&a, &b| u[(a, 0)].total_cmp(&u[(b, 0)]));
        let sorted_u: Vec<f64> = tau.iter().map(|&i| u[(i, 0)]).collect();

        let coords = qmc.coordinates(&self.particles);
        let curve_order = self.ordering.order(&coords);
        let ordered_weights = DVector::from_iterator(
            n,
            curve_order.iter().map(|&i| aux.normalized()[i]),
        );
        let within_order = inverse_cdf(&sorted_u, &ordered_weights);
        let ancestors: Vec<usize> = within_order.iter().map(|&j| curve_order[j]).collect();
        let ancestor_states: Vec<M::Particle> = ancestors
            .iter()
            .map(|&a| self.particles[a].clone())
            .collect();

        let v = DMatrix::from_fn(n, du, |r, c| u[(tau[r], c + 1)]);
        let weights = self.reset_weights(&ancestors, log_eta)?;
        let particles = qmc.gamma(self.t, &ancestor_states, &v);
        Ok(Moved {
            resampled: true,
            ancestors,
            ancestor_states,
            particles,
            weights,
        })
    }

    /// Incremental log-evidence and observer notification.
    ///
    /// The telescoping estimator `log_mean(t) - log_mean(t-1)` is only valid because
    /// between two non-resampling steps the weight set is a strict additive extension of
    /// the previous one; a model that resets weights outside resampling violates that
    /// precondition.
    fn compute_summaries(&mut self) {
        let previous = self.prev_log_mean;
        self.prev_log_mean = self.weights.log_mean();
        self.log_likelihood_increment = if self.t == 0 || self.rs_flag {
            self.prev_log_mean
        } else {
            self.prev_log_mean - previous
        };
        self.log_likelihood += self.log_likelihood_increment;
        if self.config.verbose {
            info!(
                "t={}: resample={}, ESS (end of step)={:.2}",
                self.t,
                self.rs_flag,
                self.weights.ess()
            );
        }
        // history must be current before any collector runs
        if let Some(mut history) = self.history.take() {
            history.save(&self.state());
            self.history = Some(history);
        }
        let moments = if self.config.collect_moments {
            self.fk
                .default_moments(self.weights.normalized(), &self.particles)
        } else {
            None
        };
        if let Some(mut summaries) = self.summaries.take() {
            summaries.record(&self.state(), moments);
            self.summaries = Some(summaries);
        }
        let mut collectors = std::mem::take(&mut self.collectors);
        for collector in collectors.iter_mut() {
            collector.collect(&self.state());
        }
        self.collectors = collectors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinearGauss;

    fn model(t: usize) -> LinearGauss {
        let mut rng = StdRng::seed_from_u64(99);
        let (_states, observations) = LinearGauss::simulate(0.9, 1.0, 0.2, 1.0, t, &mut rng);
        LinearGauss::new(0.9, 1.0, 0.2, 1.0, observations)
    }

    #[test]
    fn test_invalid_particle_count() {
        let config = SmcConfig {
            n: 0,
            ..SmcConfig::default()
        };
        assert!(matches!(
            Smc::new(model(5), config),
            Err(SmcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_ess_threshold() {
        let config = SmcConfig {
            essrmin: 1.5,
            ..SmcConfig::default()
        };
        assert!(matches!(
            Smc::new(model(5), config),
            Err(SmcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_step_until_done() {
        let mut pf = Smc::new(model(5), SmcConfig::default()).unwrap();
        let mut steps = 0;
        while pf.step().unwrap() {
            steps += 1;
        }
        assert_eq!(steps, 5);
        assert_eq!(pf.t(), 5);
        // inert once done
        assert!(!pf.step().unwrap());
        assert_eq!(pf.t(), 5);
    }

    #[test]
    fn test_run_matches_stepping() {
        let config = SmcConfig {
            seed: 7,
            ..SmcConfig::default()
        };
        let mut stepped = Smc::new(model(10), config.clone()).unwrap();
        while stepped.step().unwrap() {}
        let mut ran = Smc::new(model(10), config).unwrap();
        ran.run().unwrap();
        assert_eq!(stepped.t(), ran.t());
        assert_eq!(stepped.log_likelihood(), ran.log_likelihood());
    }

    #[test]
    fn test_ensemble_size_invariant() {
        let config = SmcConfig {
            n: 64,
            ..SmcConfig::default()
        };
        let mut pf = Smc::new(model(8), config).unwrap();
        while pf.step().unwrap() {
            assert_eq!(pf.particles().len(), 64);
            assert_eq!(pf.ancestors().len(), 64);
            assert!(pf.ancestors().iter().all(|&a| a < 64));
            assert_eq!(pf.weights().len(), 64);
        }
    }
}
