// Principal component analysis (PCA) of observations × features expression matrices

use std::time::Instant;

use log::{debug, info, trace, warn};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PcaError, Result};
use crate::linalg_backends::{BackendEigh, LinAlgBackendProvider};
use crate::matrix::ExpressionMatrix;
use crate::moments::{ColumnStatsAccumulator, MomentAccumulator, MomentKind};
use crate::randomized::{randomized_svd, SketchParams};
use crate::result::{canonicalize_signs, project, PcaResult};

/// Lower and upper clamp of the adaptive oversampling used by [`Solver::Randomized`].
const ADAPTIVE_OVERSAMPLES_LOWER_BOUND: usize = 5;
const ADAPTIVE_OVERSAMPLES_UPPER_BOUND: usize = 20;
/// Relative size below which a negative eigenvalue is treated as rounding noise.
const NEGATIVE_EIGENVALUE_TOLERANCE: f64 = 1e-10;
/// Loadings recovered through the Gram matrix with a smaller norm are zeroed.
const NORMALIZATION_THRESHOLD: f64 = 1e-9;

/// Decomposition strategy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Solver {
    /// [`Solver::Covariance`] when chunked or when `n_features <= n_observations`,
    /// [`Solver::Gram`] otherwise.
    #[default]
    Auto,
    /// Eigendecomposition of the feature × feature covariance, accumulated block by block.
    Covariance,
    /// Eigendecomposition of the observation × observation Gram matrix. Needs every row
    /// at once; chunked runs fall back to [`Solver::Covariance`].
    Gram,
    /// Randomized range finder. `n_oversamples == 0` selects an adaptive amount
    /// (10% of `n_comps`, clamped to `[5, 20]`).
    Randomized {
        n_oversamples: usize,
        n_power_iterations: usize,
    },
}

impl Solver {
    /// Randomized solver with adaptive oversampling and two power iterations.
    pub fn randomized() -> Self {
        Solver::Randomized {
            n_oversamples: 0,
            n_power_iterations: 2,
        }
    }
}

/// Parameters of one PCA invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PcaConfig {
    /// Number of components; `None` uses `min(n_observations, n_features) - 1`.
    pub n_comps: Option<usize>,
    /// Center features before decomposing. `false` computes a truncated SVD of the raw matrix.
    pub zero_center: bool,
    /// Stream the input in row blocks of `chunk_size`.
    pub chunked: bool,
    /// Rows per block; `None` uses every row. Ignored unless `chunked`.
    pub chunk_size: Option<usize>,
    pub solver: Solver,
    /// Seed for [`Solver::Randomized`].
    pub random_seed: u64,
    /// Restrict the decomposition to highly variable features. Only honored by
    /// [`crate::store::pca`], which owns the feature mask; [`Pca::compute`] rejects it.
    pub use_highly_variable: bool,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            n_comps: None,
            zero_center: true,
            chunked: false,
            chunk_size: None,
            solver: Solver::Auto,
            random_seed: 0,
            use_highly_variable: false,
        }
    }
}

impl PcaConfig {
    pub fn with_n_comps(mut self, n_comps: usize) -> Self {
        self.n_comps = Some(n_comps);
        self
    }

    pub fn with_zero_center(mut self, zero_center: bool) -> Self {
        self.zero_center = zero_center;
        self
    }

    /// Enables chunked execution with `chunk_size` rows per block.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunked = true;
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_solver(mut self, solver: Solver) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_use_highly_variable(mut self, use_highly_variable: bool) -> Self {
        self.use_highly_variable = use_highly_variable;
        self
    }
}

/// Computes principal components of an expression matrix.
///
/// The engine holds only its configuration; every call to [`Pca::compute`]
/// returns a fresh [`PcaResult`] and never mutates the input.
///
/// # Examples
///
/// ```no_run
/// use ndarray::array;
/// use scpca::{ExpressionMatrix, Pca, PcaConfig};
///
/// let x = ExpressionMatrix::from(array![[1.0, 0.0, 2.0], [0.0, 3.0, 1.0], [4.0, 1.0, 0.0]]);
/// let result = Pca::new(PcaConfig::default().with_n_comps(2)).compute(&x).unwrap();
/// assert_eq!(result.components.dim(), (3, 2));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Pca {
    config: PcaConfig,
}

impl Pca {
    pub fn new(config: PcaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PcaConfig {
        &self.config
    }

    /// Runs the decomposition.
    ///
    /// # Errors
    /// - [`PcaError::Shape`] for an empty matrix, fewer than two observations, or
    ///   `use_highly_variable` (the mask lives in [`crate::store::ExpressionData`]).
    /// - [`PcaError::InvalidChunkSize`] for `chunk_size == 0` with chunking enabled.
    /// - [`PcaError::OutOfRange`] when `n_comps` is zero or exceeds
    ///   `min(n_observations, n_features) - 1` (centered) / `min(n_observations, n_features)` (uncentered).
    /// - [`PcaError::Decomposition`] / [`PcaError::NonFinite`] when the backend fails.
    ///
    /// All validation happens before any pass over the data.
    pub fn compute(&self, x: &ExpressionMatrix) -> Result<PcaResult> {
        let start = Instant::now();
        let (n_obs, n_vars) = x.shape();
        if self.config.use_highly_variable {
            return Err(PcaError::shape(
                "use_highly_variable needs a feature mask; run through store::pca",
            ));
        }
        x.ensure_non_empty()?;
        let chunk_size = self.chunk_size(n_obs)?;
        let n_comps = self.n_comps(n_obs, n_vars)?;
        if n_obs < 2 {
            return Err(PcaError::shape(format!(
                "At least 2 observations are required, got {}",
                n_obs
            )));
        }
        let solver = self.resolve_solver(n_obs, n_vars);
        info!(
            "PCA on {} x {} {} matrix: n_comps={}, zero_center={}, chunk_size={}, solver={:?}",
            n_obs,
            n_vars,
            if x.is_sparse() { "sparse" } else { "dense" },
            n_comps,
            self.config.zero_center,
            chunk_size,
            solver
        );

        let mut result = match solver {
            Solver::Gram => self.gram_decomposition(x, n_comps)?,
            Solver::Randomized {
                n_oversamples,
                n_power_iterations,
            } => self.randomized_decomposition(x, n_comps, n_oversamples, n_power_iterations, chunk_size)?,
            Solver::Covariance | Solver::Auto => self.covariance_decomposition(x, n_comps, chunk_size)?,
        };

        result.components = project(x, &result.loadings, result.mean.as_ref(), chunk_size);
        canonicalize_signs(&mut result.loadings, &mut result.components);

        info!(
            "PCA finished in {:?}; leading variance ratio {:.4}",
            start.elapsed(),
            result.variance_ratio.first().copied().unwrap_or(0.0)
        );
        Ok(result)
    }

    fn chunk_size(&self, n_obs: usize) -> Result<usize> {
        if !self.config.chunked {
            return Ok(n_obs);
        }
        match self.config.chunk_size {
            Some(0) => Err(PcaError::InvalidChunkSize),
            Some(size) => Ok(size),
            None => Ok(n_obs),
        }
    }

    fn n_comps(&self, n_obs: usize, n_vars: usize) -> Result<usize> {
        let min_dim = n_obs.min(n_vars);
        let max = if self.config.zero_center {
            min_dim.saturating_sub(1)
        } else {
            min_dim
        };
        let n_comps = self.config.n_comps.unwrap_or(min_dim.saturating_sub(1));
        if n_comps == 0 || n_comps > max {
            return Err(PcaError::OutOfRange { n_comps, max });
        }
        Ok(n_comps)
    }

    fn resolve_solver(&self, n_obs: usize, n_vars: usize) -> Solver {
        match self.config.solver {
            Solver::Auto if self.config.chunked || n_vars <= n_obs => Solver::Covariance,
            Solver::Auto => Solver::Gram,
            Solver::Gram if self.config.chunked => {
                warn!("Gram solver needs every row at once; falling back to the covariance solver for chunked PCA");
                Solver::Covariance
            }
            other => other,
        }
    }

    fn covariance_decomposition(&self, x: &ExpressionMatrix, n_comps: usize, chunk_size: usize) -> Result<PcaResult> {
        let kind = if self.config.zero_center {
            MomentKind::Centered
        } else {
            MomentKind::Raw
        };
        let accumulate_start = Instant::now();
        let accumulator = x
            .row_blocks(chunk_size)
            .fold(MomentAccumulator::new(kind, x.n_vars()), |acc, (range, block)| {
                trace!("Folding rows {}..{} into the second moment", range.start, range.end);
                acc.fold(&block)
            });
        debug!(
            "Accumulated {:?} second moment over {} observations in {:?}",
            kind,
            accumulator.n_seen(),
            accumulate_start.elapsed()
        );
        let moments = accumulator
            .finish()
            .ok_or_else(|| PcaError::shape("At least 2 observations are required"))?;

        let eigh = LinAlgBackendProvider::<f64>::new()
            .eigh_upper(&moments.covariance)
            .map_err(|e| PcaError::Decomposition(format!("Eigendecomposition of the covariance matrix failed: {}", e)))?;
        let (variance, loadings) = leading_eigenpairs(eigh.eigenvalues, &eigh.eigenvectors, n_comps)?;

        let total_variance = moments.total_variance();
        Ok(assemble(
            loadings,
            variance,
            total_variance,
            self.config.zero_center.then_some(moments.mean),
        ))
    }

    fn gram_decomposition(&self, x: &ExpressionMatrix, n_comps: usize) -> Result<PcaResult> {
        let n_obs = x.n_obs();
        let block = x.row_block(0..n_obs);
        let stats = ColumnStatsAccumulator::new(x.n_vars())
            .fold(&block)
            .finish()
            .ok_or_else(|| PcaError::shape("At least 2 observations are required"))?;
        let mean = self.config.zero_center.then_some(stats.mean);

        // K = (X − 1μᵀ)(X − 1μᵀ)ᵀ = XXᵀ − (Xμ)1ᵀ − 1(Xμ)ᵀ + (μᵀμ)11ᵀ
        let mut gram = block.outer_gram();
        if let Some(mean) = mean.as_ref() {
            let x_mu = block.dot(&mean.view().insert_axis(Axis(1)).to_owned()).remove_axis(Axis(1));
            let mu_sq = mean.dot(mean);
            for ((i, j), g) in gram.indexed_iter_mut() {
                *g += mu_sq - x_mu[i] - x_mu[j];
            }
        }
        gram /= (n_obs - 1) as f64;
        debug!("Formed {} x {} Gram matrix", n_obs, n_obs);

        let eigh = LinAlgBackendProvider::<f64>::new()
            .eigh_upper(&gram)
            .map_err(|e| PcaError::Decomposition(format!("Eigendecomposition of the Gram matrix failed: {}", e)))?;
        let (variance, left_vectors) = leading_eigenpairs(eigh.eigenvalues, &eigh.eigenvectors, n_comps)?;

        // V = Xcᵀ U, columns normalized.
        let mut loadings = block.t_dot(&left_vectors.view());
        if let Some(mean) = mean.as_ref() {
            let u_sums = left_vectors.sum_axis(Axis(0));
            for (mut row, &mu) in loadings.rows_mut().into_iter().zip(mean.iter()) {
                row.scaled_add(-mu, &u_sums);
            }
        }
        for mut column in loadings.columns_mut() {
            let norm = column.dot(&column).sqrt();
            if norm > NORMALIZATION_THRESHOLD {
                column.mapv_inplace(|v| v / norm);
            } else {
                column.fill(0.0);
            }
        }

        let total_variance = if self.config.zero_center {
            stats.total_variance
        } else {
            stats.total_raw_variance
        };
        Ok(assemble(loadings, variance, total_variance, mean))
    }

    fn randomized_decomposition(
        &self,
        x: &ExpressionMatrix,
        n_comps: usize,
        n_oversamples: usize,
        n_power_iterations: usize,
        chunk_size: usize,
    ) -> Result<PcaResult> {
        let stats = x
            .row_blocks(chunk_size)
            .fold(ColumnStatsAccumulator::new(x.n_vars()), |acc, (_, block)| acc.fold(&block))
            .finish()
            .ok_or_else(|| PcaError::shape("At least 2 observations are required"))?;
        let (mean, total_variance) = if self.config.zero_center {
            (Some(stats.mean), stats.total_variance)
        } else {
            (None, stats.total_raw_variance)
        };

        let n_oversamples = if n_oversamples == 0 {
            ((n_comps as f64 * 0.1).ceil() as usize)
                .clamp(ADAPTIVE_OVERSAMPLES_LOWER_BOUND, ADAPTIVE_OVERSAMPLES_UPPER_BOUND)
        } else {
            n_oversamples
        };
        let svd = randomized_svd(
            x,
            mean.as_ref(),
            SketchParams {
                n_comps,
                n_oversamples,
                n_power_iterations,
                seed: self.config.random_seed,
                chunk_size,
            },
        )?;
        if svd.singular_values.iter().any(|s| !s.is_finite()) {
            return Err(PcaError::NonFinite("singular values"));
        }
        let denom = (stats.n_obs - 1) as f64;
        let variance = svd.singular_values.mapv(|s| s * s / denom);
        Ok(assemble(svd.right_vectors, variance, total_variance, mean))
    }
}

/// Top `k` eigenpairs in descending order, eigenvalues clamped at zero.
fn leading_eigenpairs(
    eigenvalues: Array1<f64>,
    eigenvectors: &Array2<f64>,
    k: usize,
) -> Result<(Array1<f64>, Array2<f64>)> {
    if eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(PcaError::NonFinite("eigenvalues"));
    }
    let n = eigenvalues.len();
    if k > n {
        return Err(PcaError::Decomposition(format!(
            "Eigendecomposition returned {} eigenpairs, {} requested",
            n, k
        )));
    }
    let largest = eigenvalues.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));

    // eigh returns ascending eigenvalues.
    let mut variance = Array1::zeros(k);
    let mut vectors = Array2::zeros((eigenvectors.nrows(), k));
    for (out, src) in (0..k).zip((0..n).rev()) {
        let mut value = eigenvalues[src];
        if value < 0.0 {
            if value < -NEGATIVE_EIGENVALUE_TOLERANCE * largest {
                warn!("Clamping negative eigenvalue {:e} of component {} to zero", value, out);
            }
            value = 0.0;
        }
        variance[out] = value;
        vectors.column_mut(out).assign(&eigenvectors.column(src));
    }
    Ok((variance, vectors))
}

fn assemble(
    loadings: Array2<f64>,
    variance: Array1<f64>,
    total_variance: f64,
    mean: Option<Array1<f64>>,
) -> PcaResult {
    let variance_ratio = if total_variance > 0.0 {
        variance.mapv(|v| v / total_variance)
    } else {
        Array1::zeros(variance.len())
    };
    PcaResult {
        components: Array2::zeros((0, loadings.ncols())),
        loadings,
        variance,
        variance_ratio,
        mean,
        total_variance,
    }
}

/// One-shot PCA with default solver selection.
///
/// Equivalent to `Pca::new(config).compute(x)` with `config` built from the arguments.
pub fn compute(
    x: &ExpressionMatrix,
    n_comps: Option<usize>,
    zero_center: bool,
    chunked: bool,
    chunk_size: Option<usize>,
) -> Result<PcaResult> {
    let config = PcaConfig {
        n_comps,
        zero_center,
        chunked,
        chunk_size,
        ..PcaConfig::default()
    };
    Pca::new(config).compute(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn eigenpairs_come_back_descending_and_clamped() {
        let vectors = Array2::from_shape_fn((3, 3), |(i, j)| (3 * i + j) as f64);
        let (variance, leading) = leading_eigenpairs(array![-1e-3, -1e-17, 2.0], &vectors, 3).unwrap();
        assert_eq!(variance, array![2.0, 0.0, 0.0]);
        assert_eq!(leading.column(0), vectors.column(2));
        assert_eq!(leading.column(1), vectors.column(1));
        assert_eq!(leading.column(2), vectors.column(0));

        let (variance, leading) = leading_eigenpairs(array![0.5, 1.0, 3.0], &Array2::eye(3), 2).unwrap();
        assert_eq!(variance, array![3.0, 1.0]);
        assert_eq!(leading, array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0]]);
    }

    #[test]
    fn eigenpair_failures_are_errors() {
        let too_many = leading_eigenpairs(array![1.0, 2.0, 3.0], &Array2::eye(3), 4);
        assert!(matches!(too_many, Err(PcaError::Decomposition(_))));
        let nan = leading_eigenpairs(array![1.0, f64::NAN, 3.0], &Array2::eye(3), 1);
        assert!(matches!(nan, Err(PcaError::NonFinite(_))));
        let inf = leading_eigenpairs(array![1.0, 2.0, f64::INFINITY], &Array2::eye(3), 1);
        assert!(matches!(inf, Err(PcaError::NonFinite(_))));
    }

    #[test]
    fn zero_total_variance_gives_zero_ratios() {
        let result = assemble(Array2::eye(2), array![0.0, 0.0], 0.0, None);
        assert_eq!(result.variance_ratio, array![0.0, 0.0]);
        assert_eq!(result.components.dim(), (0, 2));
    }
}
