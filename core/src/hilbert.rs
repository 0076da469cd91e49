//! Space-filling-curve ordering of particle ensembles.
//!
//! The sequential quasi-Monte Carlo resampling step couples sorted low-discrepancy
//! uniforms to the empirical weighted distribution. For that coupling to preserve the
//! low-discrepancy structure, the ensemble must first be laid out along a one-dimensional
//! traversal that keeps nearby particles adjacent; the Hilbert curve is the standard
//! choice. [SpaceFillingOrder] is the pluggable contract; [HilbertOrder] implements it by
//! quantizing each coordinate to a fixed-precision lattice, computing the Hilbert index
//! of every particle (Skilling's transpose algorithm), and argsorting the indices.
//! In one dimension the Hilbert traversal degenerates to a plain sort.

use nalgebra::DMatrix;

/// Deterministic ordering of a particle ensemble along a space-filling traversal.
pub trait SpaceFillingOrder {
    /// Return a permutation of `0..n` such that following it visits the rows of
    /// `coords` (one row per particle) in traversal order.
    fn order(&self, coords: &DMatrix<f64>) -> Vec<usize>;
}

/// Hilbert-curve ordering of the quantized ensemble.
#[derive(Clone, Copy, Debug, Default)]
pub struct HilbertOrder;

impl SpaceFillingOrder for HilbertOrder {
    fn order(&self, coords: &DMatrix<f64>) -> Vec<usize> {
        let n = coords.nrows();
        let d = coords.ncols();
        if n == 0 {
            return Vec::new();
        }
        if d <= 1 {
            return argsort_by_key(n, |i| coords[(i, 0)]);
        }
        // One u64 Hilbert index per particle: d axes of `bits` bits each must fit.
        let bits = ((62 / d) as u32).clamp(1, 31);
        let lattice = quantize(coords, bits);
        let keys: Vec<u64> = (0..n)
            .map(|i| {
                let axes: Vec<u64> = (0..d).map(|j| lattice[(i, j)]).collect();
                hilbert_index(&axes, bits)
            })
            .collect();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| keys[i]);
        order
    }
}

/// Rescale each column to `[0, 2^bits - 1]` integers. Constant columns collapse to zero.
fn quantize(coords: &DMatrix<f64>, bits: u32) -> DMatrix<u64> {
    let max_cell = ((1u64 << bits) - 1) as f64;
    let n = coords.nrows();
    let d = coords.ncols();
    let mut lattice = DMatrix::zeros(n, d);
    for j in 0..d {
        let col = coords.column(j);
        let lo = col.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = col.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let span = hi - lo;
        if span <= 0.0 || !span.is_finite() {
            continue;
        }
        for i in 0..n {
            lattice[(i, j)] = ((coords[(i, j)] - lo) / span * max_cell).floor() as u64;
        }
    }
    lattice
}

/// Hilbert index of a lattice point, `bits` bits per axis.
///
/// Skilling's algorithm: convert the axis coordinates to the transposed Hilbert
/// representation in place, then gather the index by interleaving bits, most significant
/// first.
pub(crate) fn hilbert_index(axes: &[u64], bits: u32) -> u64 {
    let n = axes.len();
    let mut x = axes.to_vec();
    let m = 1u64 << (bits - 1);

    // Inverse undo excess work
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }
    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u64;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for xi in x.iter_mut() {
        *xi ^= t;
    }
    // Interleave the transposed form into a single index
    let mut index = 0u64;
    for b in (0..bits).rev() {
        for xi in x.iter() {
            index = (index << 1) | ((xi >> b) & 1);
        }
    }
    index
}

fn argsort_by_key<F: Fn(usize) -> f64>(n: usize, key: F) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| key(a).total_cmp(&key(b)));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_dimension_is_plain_sort() {
        let coords = DMatrix::from_vec(5, 1, vec![0.3, -1.0, 2.5, 0.0, 1.1]);
        let order = HilbertOrder.order(&coords);
        assert_eq!(order, vec![1, 3, 0, 4, 2]);
    }

    #[test]
    fn test_first_order_curve_visits_quadrants_in_curve_order() {
        // 2x2 Hilbert curve: (0,0) -> (0,1) -> (1,1) -> (1,0)
        assert_eq!(hilbert_index(&[0, 0], 1), 0);
        assert_eq!(hilbert_index(&[0, 1], 1), 1);
        assert_eq!(hilbert_index(&[1, 1], 1), 2);
        assert_eq!(hilbert_index(&[1, 0], 1), 3);
    }

    #[test]
    fn test_indices_are_a_bijection_on_the_lattice() {
        let bits = 3;
        let side = 1u64 << bits;
        let mut seen = vec![false; (side * side) as usize];
        for a in 0..side {
            for b in 0..side {
                let h = hilbert_index(&[a, b], bits) as usize;
                assert!(!seen[h], "index {h} visited twice");
                seen[h] = true;
            }
        }
        assert!(seen.iter().all(|&v| v));
    }

    #[test]
    fn test_consecutive_indices_are_lattice_neighbors() {
        let bits = 4;
        let side = 1u64 << bits;
        let mut by_index = vec![(0u64, 0u64); (side * side) as usize];
        for a in 0..side {
            for b in 0..side {
                by_index[hilbert_index(&[a, b], bits) as usize] = (a, b);
            }
        }
        for pair in by_index.windows(2) {
            let (a0, b0) = pair[0];
            let (a1, b1) = pair[1];
            let dist = a0.abs_diff(a1) + b0.abs_diff(b1);
            assert_eq!(dist, 1, "curve jumped from {pair:?}");
        }
    }

    #[test]
    fn test_order_is_a_permutation() {
        let coords = DMatrix::from_fn(50, 3, |r, c| ((r * 31 + c * 17) % 23) as f64 * 0.13);
        let order = HilbertOrder.order(&coords);
        let mut seen = vec![false; 50];
        for &i in &order {
            assert!(!seen[i]);
            seen[i] = true;
        }
    }

    #[test]
    fn test_constant_column_is_harmless() {
        let coords = DMatrix::from_fn(10, 2, |r, c| if c == 0 { 5.0 } else { r as f64 });
        let order = HilbertOrder.order(&coords);
        assert_eq!(order.len(), 10);
    }
}
