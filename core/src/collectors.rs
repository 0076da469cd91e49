//! Per-step summary collection.
//!
//! Observers are notified once per completed step, strictly after the history recorder
//! (some collectors read the history through the step state). The engine always feeds its
//! built-in [Summaries] when enabled; additional observers implement [Collector] and are
//! registered on the engine.

use crate::Moments;
use crate::smc::SmcState;

/// Observer notified once per completed step with read-only access to the engine state.
pub trait Collector<P> {
    fn collect(&mut self, state: &SmcState<'_, P>);
}

/// Built-in per-step summaries: effective sample sizes, resampling flags, and the
/// incremental and cumulative log normalizing-constant estimates. Weighted moments are
/// appended when the engine is configured to collect them and the model provides a
/// numeric embedding.
#[derive(Clone, Debug, Default)]
pub struct Summaries {
    /// ESS of the main weights at the end of each step.
    pub effective_sample_sizes: Vec<f64>,
    /// Whether resampling was performed at each step; always false at t = 0.
    pub resampling_flags: Vec<bool>,
    /// Per-step increment of the log normalizing-constant estimate.
    pub log_likelihood_increments: Vec<f64>,
    /// Cumulative log normalizing-constant estimate after each step.
    pub log_likelihoods: Vec<f64>,
    /// Weighted ensemble moments, when collected; empty otherwise.
    pub moments: Vec<Moments>,
}

impl Summaries {
    pub fn new() -> Summaries {
        Summaries::default()
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.effective_sample_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effective_sample_sizes.is_empty()
    }

    pub(crate) fn record<P>(&mut self, state: &SmcState<'_, P>, moments: Option<Moments>) {
        self.effective_sample_sizes.push(state.weights.ess());
        self.resampling_flags.push(state.resampled);
        self.log_likelihood_increments
            .push(state.log_likelihood_increment);
        self.log_likelihoods.push(state.log_likelihood);
        if let Some(m) = moments {
            self.moments.push(m);
        }
    }
}
