//! Randomized low-rank SVD of the (implicitly centered) expression matrix.
//!
//! Range finder with a Gaussian sketch, QR re-orthonormalization between power
//! iterations, and a thin SVD of the projected matrix. The data matrix is only
//! touched through [`apply`] and [`apply_transpose`], which stream over row
//! blocks and subtract the mean as a rank-1 term, so sparse input stays sparse.

use log::{debug, trace};
use ndarray::{s, Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::{PcaError, Result};
use crate::linalg_backends::{BackendQR, BackendSVD, LinAlgBackendProvider};
use crate::matrix::ExpressionMatrix;
use crate::result::project;

/// Parameters of one randomized decomposition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SketchParams {
    pub n_comps: usize,
    pub n_oversamples: usize,
    pub n_power_iterations: usize,
    pub seed: u64,
    pub chunk_size: usize,
}

/// Leading right singular vectors and singular values.
#[derive(Debug)]
pub(crate) struct LowRankSvd {
    /// Shape `(n_features, n_comps)`, orthonormal columns.
    pub right_vectors: Array2<f64>,
    /// Descending, length `n_comps`.
    pub singular_values: Array1<f64>,
}

/// `(X − 1μᵀ) M`
fn apply(x: &ExpressionMatrix, mean: Option<&Array1<f64>>, m: &Array2<f64>, chunk_size: usize) -> Array2<f64> {
    project(x, m, mean, chunk_size)
}

/// `(X − 1μᵀ)ᵀ Q = Σ_b Xbᵀ Q_b − μ (1ᵀQ)`
fn apply_transpose(
    x: &ExpressionMatrix,
    mean: Option<&Array1<f64>>,
    q: &Array2<f64>,
    chunk_size: usize,
) -> Array2<f64> {
    let mut out = Array2::zeros((x.n_vars(), q.ncols()));
    for (range, block) in x.row_blocks(chunk_size) {
        out += &block.t_dot(&q.slice(s![range, ..]));
    }
    if let Some(mean) = mean {
        let q_sums = q.sum_axis(Axis(0));
        for (mut row, &mu) in out.rows_mut().into_iter().zip(mean.iter()) {
            if mu != 0.0 {
                row.scaled_add(-mu, &q_sums);
            }
        }
    }
    out
}

fn orthonormalize(backend: &LinAlgBackendProvider<f64>, m: &Array2<f64>, stage: &str) -> Result<Array2<f64>> {
    backend
        .qr_q_factor(m)
        .map_err(|e| PcaError::Decomposition(format!("QR decomposition of {} failed: {}", stage, e)))
}

pub(crate) fn randomized_svd(
    x: &ExpressionMatrix,
    mean: Option<&Array1<f64>>,
    params: SketchParams,
) -> Result<LowRankSvd> {
    let (n_obs, n_vars) = x.shape();
    let backend = LinAlgBackendProvider::<f64>::new();
    let k = params.n_comps;
    let sketch_width = (k + params.n_oversamples).min(n_obs.min(n_vars)).max(k);
    debug!(
        "Randomized SVD: k={}, sketch width={}, power iterations={}, seed={}",
        k, sketch_width, params.n_power_iterations, params.seed
    );

    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    let omega = Array2::from_shape_fn((n_vars, sketch_width), |_| rng.sample::<f64, _>(StandardNormal));

    let mut q = orthonormalize(&backend, &apply(x, mean, &omega, params.chunk_size), "the initial sketch")?;
    for i in 0..params.n_power_iterations {
        let w = orthonormalize(
            &backend,
            &apply_transpose(x, mean, &q, params.chunk_size),
            "the transposed power iterate",
        )?;
        q = orthonormalize(&backend, &apply(x, mean, &w, params.chunk_size), "the power iterate")?;
        trace!("Finished power iteration {}", i + 1);
    }

    // B = Qᵀ A, formed as (Aᵀ Q)ᵀ.
    let b = apply_transpose(x, mean, &q, params.chunk_size).reversed_axes();
    let svd = backend
        .svd_into(b.as_standard_layout().into_owned(), false, true)
        .map_err(|e| PcaError::Decomposition(format!("SVD of the projected sketch failed: {}", e)))?;
    let vt = svd
        .vt
        .ok_or_else(|| PcaError::Decomposition("SVD did not return right singular vectors".to_string()))?;
    if vt.nrows() < k || svd.s.len() < k {
        return Err(PcaError::Decomposition(format!(
            "Sketch of rank {} cannot provide {} components",
            svd.s.len(),
            k
        )));
    }

    Ok(LowRankSvd {
        right_vectors: vt.slice(s![..k, ..]).t().to_owned(),
        singular_values: svd.s.slice(s![..k]).to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn low_rank_fixture() -> Array2<f64> {
        // Rank-2 signal plus a small deterministic perturbation.
        Array2::from_shape_fn((40, 12), |(i, j)| {
            let a = (i as f64 * 0.3).sin();
            let b = (i as f64 * 0.7).cos();
            3.0 * a * (j as f64 + 1.0) + b * (12.0 - j as f64) + 1e-3 * ((i * 7 + j * 3) % 5) as f64
        })
    }

    #[test]
    fn transposed_product_applies_centering() {
        let x = array![[1.0, 2.0], [3.0, 6.0], [5.0, 1.0]];
        let mean = x.mean_axis(Axis(0)).unwrap();
        let q = array![[1.0, 0.0], [0.5, 1.0], [-1.0, 2.0]];
        let expected = (&x - &mean).t().dot(&q);
        let m = ExpressionMatrix::from(x);
        let sparse = ExpressionMatrix::from(m.to_sparse().unwrap());
        for chunk in [1, 2, 3] {
            for input in [&m, &sparse] {
                let got = apply_transpose(input, Some(&mean), &q, chunk);
                for (a, b) in got.iter().zip(expected.iter()) {
                    assert_abs_diff_eq!(a, b, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn leading_singular_values_match_exact_svd() {
        let x = low_rank_fixture();
        let mean = x.mean_axis(Axis(0)).unwrap();
        let centered = &x - &mean;
        let exact = LinAlgBackendProvider::<f64>::new()
            .svd_into(centered, false, false)
            .unwrap()
            .s;

        let m = ExpressionMatrix::from(x);
        let params = SketchParams {
            n_comps: 2,
            n_oversamples: 6,
            n_power_iterations: 3,
            seed: 7,
            chunk_size: 16,
        };
        let out = randomized_svd(&m, Some(&mean), params).unwrap();
        assert_eq!(out.right_vectors.dim(), (12, 2));
        for i in 0..2 {
            assert_abs_diff_eq!(out.singular_values[i], exact[i], epsilon = 1e-6 * exact[0]);
        }
        let gram = out.right_vectors.t().dot(&out.right_vectors);
        assert_abs_diff_eq!(gram[[0, 0]], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(gram[[0, 1]], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn same_seed_gives_same_sketch() {
        let m = ExpressionMatrix::from(low_rank_fixture());
        let params = SketchParams {
            n_comps: 3,
            n_oversamples: 2,
            n_power_iterations: 1,
            seed: 11,
            chunk_size: 40,
        };
        let a = randomized_svd(&m, None, params).unwrap();
        let b = randomized_svd(&m, None, params).unwrap();
        assert_eq!(a.singular_values, b.singular_values);
        assert_eq!(a.right_vectors, b.right_vectors);
    }
}
