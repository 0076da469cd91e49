//! Resampling schemes for particle systems.
//!
//! Resampling replaces the weighted ensemble with draws (with replacement, proportional
//! to weight) from itself. All schemes share a single contract: given normalized weights
//! and a target count, return ancestor indices into the source ensemble. The scheme is
//! selected by name at configuration time through [ResamplingScheme]; an unknown name is
//! a configuration error raised at parse time, never lazily per step.
//!
//! The unbiased schemes implemented here are the standard ones: multinomial, residual,
//! stratified, systematic, and SSP (Srinivasan sampling process). All of them route
//! through [inverse_cdf], the inverse-transform lookup of sorted uniforms against the
//! cumulative weight distribution, except SSP which balances fractional offspring counts
//! pairwise.

use crate::SmcError;
use nalgebra::DVector;
use rand::Rng;
use rand::rngs::StdRng;
use std::fmt::{self, Display};
use std::str::FromStr;

/// Named resampling scheme, selected at configuration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResamplingScheme {
    Multinomial,
    Residual,
    Stratified,
    Systematic,
    Ssp,
}

impl Default for ResamplingScheme {
    fn default() -> Self {
        ResamplingScheme::Systematic
    }
}

impl Display for ResamplingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResamplingScheme::Multinomial => "multinomial",
            ResamplingScheme::Residual => "residual",
            ResamplingScheme::Stratified => "stratified",
            ResamplingScheme::Systematic => "systematic",
            ResamplingScheme::Ssp => "ssp",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ResamplingScheme {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "multinomial" => Ok(ResamplingScheme::Multinomial),
            "residual" => Ok(ResamplingScheme::Residual),
            "stratified" => Ok(ResamplingScheme::Stratified),
            "systematic" => Ok(ResamplingScheme::Systematic),
            "ssp" => Ok(ResamplingScheme::Ssp),
            _ => Err(SmcError::UnknownScheme(s.to_string())),
        }
    }
}

/// Draw `m` ancestor indices from the normalized weights `w` under the given scheme.
///
/// The returned indices lie in `[0, w.len())` and may repeat. The target count `m` is
/// independent of the source size; the engine always requests its configured particle
/// count.
pub fn resample(
    scheme: ResamplingScheme,
    w: &DVector<f64>,
    m: usize,
    rng: &mut StdRng,
) -> Result<Vec<usize>, SmcError> {
    match scheme {
        ResamplingScheme::Multinomial => Ok(multinomial(w, m, rng)),
        ResamplingScheme::Residual => Ok(residual(w, m, rng)),
        ResamplingScheme::Stratified => Ok(stratified(w, m, rng)),
        ResamplingScheme::Systematic => Ok(systematic(w, m, rng)),
        ResamplingScheme::Ssp => ssp(w, m, rng),
    }
}

/// Inverse-transform lookup of sorted points against the cumulative distribution of `w`.
///
/// `su` must be sorted ascending with values in `[0, 1)`. Returns one index per point:
/// the smallest `j` such that `su[i] <= w[0] + ... + w[j]`, clamped to the last index to
/// absorb floating round-off in the cumulative sum.
pub fn inverse_cdf(su: &[f64], w: &DVector<f64>) -> Vec<usize> {
    let n = w.len();
    let mut ancestors = Vec::with_capacity(su.len());
    let mut j = 0usize;
    let mut cumsum = w[0];
    for &u in su {
        while u > cumsum && j < n - 1 {
            j += 1;
            cumsum += w[j];
        }
        ancestors.push(j);
    }
    ancestors
}

/// `n` sorted uniform variates in O(n), via normalized exponential spacings.
pub fn uniform_spacings(n: usize, rng: &mut StdRng) -> Vec<f64> {
    let mut cumulative = Vec::with_capacity(n + 1);
    let mut z = 0.0;
    for _ in 0..=n {
        z -= rng.random::<f64>().ln();
        cumulative.push(z);
    }
    let total = cumulative[n];
    cumulative.truncate(n);
    cumulative.iter().map(|v| v / total).collect()
}

fn multinomial(w: &DVector<f64>, m: usize, rng: &mut StdRng) -> Vec<usize> {
    inverse_cdf(&uniform_spacings(m, rng), w)
}

fn stratified(w: &DVector<f64>, m: usize, rng: &mut StdRng) -> Vec<usize> {
    let su: Vec<f64> = (0..m)
        .map(|i| (i as f64 + rng.random::<f64>()) / m as f64)
        .collect();
    inverse_cdf(&su, w)
}

fn systematic(w: &DVector<f64>, m: usize, rng: &mut StdRng) -> Vec<usize> {
    let u = rng.random::<f64>();
    let su: Vec<f64> = (0..m).map(|i| (i as f64 + u) / m as f64).collect();
    inverse_cdf(&su, w)
}

fn residual(w: &DVector<f64>, m: usize, rng: &mut StdRng) -> Vec<usize> {
    let n = w.len();
    let mut ancestors = Vec::with_capacity(m);
    let mut residuals = DVector::zeros(n);
    for i in 0..n {
        let mw = m as f64 * w[i];
        let copies = mw.floor() as usize;
        for _ in 0..copies {
            ancestors.push(i);
        }
        residuals[i] = mw - copies as f64;
    }
    let leftover = m - ancestors.len();
    if leftover > 0 {
        let total: f64 = residuals.sum();
        residuals /= total;
        ancestors.extend(multinomial(&residuals, leftover, rng));
    }
    ancestors
}

/// SSP resampling: balance the fractional parts of the expected offspring counts
/// pairwise, so every particle receives either `floor(m w_i)` or `ceil(m w_i)` children.
fn ssp(w: &DVector<f64>, m: usize, rng: &mut StdRng) -> Result<Vec<usize>, SmcError> {
    let n = w.len();
    let mut children = vec![0usize; n];
    let mut frac = vec![0.0f64; n];
    for i in 0..n {
        let mw = m as f64 * w[i];
        children[i] = mw.floor() as usize;
        frac[i] = mw - children[i] as f64;
    }
    const TOL: f64 = 1e-9;
    // Pairwise martingale balancing: each exchange pushes one of the two active
    // fractional parts to an integer, so at most one index stays fractional.
    let mut active: Option<usize> = None;
    for k in 0..n {
        if frac[k] <= TOL {
            continue;
        }
        let Some(i) = active else {
            active = Some(k);
            continue;
        };
        let j = k;
        let up = (1.0 - frac[i]).min(frac[j]);
        let down = frac[i].min(1.0 - frac[j]);
        let p_up = up / (up + down);
        if rng.random::<f64>() < p_up {
            frac[i] += up;
            frac[j] -= up;
        } else {
            frac[i] -= down;
            frac[j] += down;
        }
        active = None;
        for idx in [i, j] {
            if frac[idx] >= 1.0 - TOL {
                children[idx] += 1;
                frac[idx] = 0.0;
            } else if frac[idx] > TOL {
                active = Some(idx);
            } else {
                frac[idx] = 0.0;
            }
        }
    }
    // round-off may leave one index carrying (almost) a full unit of mass
    if let Some(idx) = active {
        if frac[idx] >= 0.5 {
            children[idx] += 1;
        }
    }
    let produced: usize = children.iter().sum();
    if produced != m {
        return Err(SmcError::OffspringMismatch {
            expected: m,
            got: produced,
        });
    }
    let mut ancestors = Vec::with_capacity(m);
    for (i, &c) in children.iter().enumerate() {
        for _ in 0..c {
            ancestors.push(i);
        }
    }
    Ok(ancestors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    fn weights(v: Vec<f64>) -> DVector<f64> {
        let mut w = DVector::from_vec(v);
        let total: f64 = w.sum();
        w /= total;
        w
    }

    #[test]
    fn test_scheme_parsing() {
        assert_eq!(
            "systematic".parse::<ResamplingScheme>().unwrap(),
            ResamplingScheme::Systematic
        );
        assert_eq!(
            "SSP".parse::<ResamplingScheme>().unwrap(),
            ResamplingScheme::Ssp
        );
        assert!(matches!(
            "bogus".parse::<ResamplingScheme>(),
            Err(SmcError::UnknownScheme(_))
        ));
    }

    #[test]
    fn test_inverse_cdf_points_at_mass() {
        let w = weights(vec![0.5, 0.25, 0.25]);
        let su = [0.1, 0.4, 0.6, 0.9];
        assert_eq!(inverse_cdf(&su, &w), vec![0, 0, 1, 2]);
    }

    #[test]
    fn test_inverse_cdf_clamps_roundoff() {
        let w = weights(vec![0.5, 0.5]);
        // a point numerically above the cumulative sum must clamp to the last index
        let su = [0.9999999999999999, 1.0 - 1e-16];
        let a = inverse_cdf(&su, &w);
        assert!(a.iter().all(|&i| i < 2));
    }

    #[test]
    fn test_uniform_spacings_sorted_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        let su = uniform_spacings(100, &mut rng);
        assert_eq!(su.len(), 100);
        for pair in su.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(su[0] >= 0.0 && su[99] < 1.0);
    }

    #[test]
    fn test_all_schemes_return_valid_indices() {
        let w = weights(vec![0.1, 0.2, 0.3, 0.25, 0.15]);
        for scheme in [
            ResamplingScheme::Multinomial,
            ResamplingScheme::Residual,
            ResamplingScheme::Stratified,
            ResamplingScheme::Systematic,
            ResamplingScheme::Ssp,
        ] {
            let mut rng = StdRng::seed_from_u64(11);
            let a = resample(scheme, &w, 200, &mut rng).unwrap();
            assert_eq!(a.len(), 200, "{scheme} returned the wrong count");
            assert!(a.iter().all(|&i| i < 5), "{scheme} returned a bad index");
        }
    }

    #[test]
    fn test_offspring_counts_track_weights() {
        let w = weights(vec![0.05, 0.15, 0.3, 0.5]);
        let m = 10_000;
        for scheme in [
            ResamplingScheme::Residual,
            ResamplingScheme::Stratified,
            ResamplingScheme::Systematic,
            ResamplingScheme::Ssp,
        ] {
            let mut rng = StdRng::seed_from_u64(23);
            let a = resample(scheme, &w, m, &mut rng).unwrap();
            let mut counts = [0usize; 4];
            for &i in &a {
                counts[i] += 1;
            }
            for i in 0..4 {
                let expected = m as f64 * w[i];
                // low-variance schemes keep offspring within one of the expectation
                assert!(
                    (counts[i] as f64 - expected).abs() <= 1.0 + 1e-9,
                    "{scheme}: particle {i} got {} children, expected about {expected}",
                    counts[i]
                );
            }
        }
    }

    #[test]
    fn test_multinomial_counts_approach_weights() {
        let w = weights(vec![0.2, 0.8]);
        let m = 100_000;
        let mut rng = StdRng::seed_from_u64(5);
        let a = resample(ResamplingScheme::Multinomial, &w, m, &mut rng).unwrap();
        let heavy = a.iter().filter(|&&i| i == 1).count();
        assert_approx_eq!(heavy as f64 / m as f64, 0.8, 0.01);
    }

    #[test]
    fn test_ssp_exact_on_integer_weights() {
        let w = weights(vec![0.25, 0.25, 0.25, 0.25]);
        let mut rng = StdRng::seed_from_u64(3);
        let a = resample(ResamplingScheme::Ssp, &w, 8, &mut rng).unwrap();
        let mut counts = [0usize; 4];
        for &i in &a {
            counts[i] += 1;
        }
        assert_eq!(counts, [2, 2, 2, 2]);
    }
}
