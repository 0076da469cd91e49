//! Storage of the complete particle system over time.
//!
//! A [ParticleHistory] receives a snapshot once per completed step, before any summary
//! collector runs, and keeps the ensemble, ancestor map, and weights of every step.
//! This is the substrate smoothing algorithms work from; the recorder itself only stores
//! and answers genealogy queries.

use crate::smc::SmcState;
use crate::weights::WeightSet;

/// Complete per-step record of a particle filter run.
#[derive(Clone, Debug)]
pub struct ParticleHistory<P> {
    ensembles: Vec<Vec<P>>,
    ancestors: Vec<Vec<usize>>,
    weights: Vec<WeightSet>,
}

impl<P: Clone> ParticleHistory<P> {
    pub fn new() -> ParticleHistory<P> {
        ParticleHistory {
            ensembles: Vec::new(),
            ancestors: Vec::new(),
            weights: Vec::new(),
        }
    }

    /// Record the state of a just-completed step.
    pub(crate) fn save(&mut self, state: &SmcState<'_, P>) {
        self.ensembles.push(state.particles.to_vec());
        self.ancestors.push(state.ancestors.to_vec());
        self.weights.push(state.weights.clone());
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.ensembles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ensembles.is_empty()
    }

    /// Ensemble recorded at step `t`.
    pub fn ensemble(&self, t: usize) -> &[P] {
        &self.ensembles[t]
    }

    /// Ancestor map recorded at step `t` (the identity at t = 0 and at non-resampling
    /// steps).
    pub fn ancestor_map(&self, t: usize) -> &[usize] {
        &self.ancestors[t]
    }

    /// Weights recorded at step `t`.
    pub fn weights(&self, t: usize) -> &WeightSet {
        &self.weights[t]
    }

    /// Ancestral lineage of final-step particle `n`: the index of its ancestor at every
    /// recorded step, oldest first.
    pub fn genealogy(&self, n: usize) -> Vec<usize> {
        let steps = self.len();
        let mut lineage = vec![0usize; steps];
        if steps == 0 {
            return lineage;
        }
        lineage[steps - 1] = n;
        for t in (1..steps).rev() {
            lineage[t - 1] = self.ancestors[t][lineage[t]];
        }
        lineage
    }
}
