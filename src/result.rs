// Output of a PCA run: scores, loadings, variance summary, persistence and projection

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{PcaError, Result};
use crate::matrix::ExpressionMatrix;

/// Output bundle of one PCA invocation.
///
/// Component signs are canonical: in every column of `loadings` the entry with
/// the largest magnitude is positive. Other implementations may return the
/// opposite sign for any component, so cross-implementation comparisons should
/// use absolute values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PcaResult {
    /// Per-observation scores. Shape: (n_observations, n_comps)
    pub components: Array2<f64>,
    /// Per-feature weights. Shape: (n_features, n_comps)
    ///
    /// Columns are orthonormal, except that the Gram solver returns a zero column for
    /// a component beyond the rank of the data (its scores and variance are zero too).
    pub loadings: Array2<f64>,
    /// Variance captured by each component, non-increasing. Shape: (n_comps)
    pub variance: Array1<f64>,
    /// `variance / total_variance`. Shape: (n_comps)
    pub variance_ratio: Array1<f64>,
    /// Per-feature mean removed before projection; `None` for uncentered PCA.
    pub mean: Option<Array1<f64>>,
    /// Variance of the full spectrum used as the ratio denominator.
    pub total_variance: f64,
}

impl PcaResult {
    pub fn n_comps(&self) -> usize {
        self.variance.len()
    }

    pub fn cumulative_variance_ratio(&self) -> Array1<f64> {
        let mut running = 0.0;
        self.variance_ratio.mapv(|r| {
            running += r;
            running
        })
    }

    /// Projects observations onto the stored loadings, `chunk_size` rows at a time.
    ///
    /// # Errors
    /// [`PcaError::Shape`] when the feature dimension differs from the fitted one.
    pub fn transform(&self, x: &ExpressionMatrix, chunk_size: Option<usize>) -> Result<Array2<f64>> {
        let n_features = self.loadings.nrows();
        if x.n_vars() != n_features {
            return Err(PcaError::shape(format!(
                "Input feature dimension ({}) does not match the fitted feature dimension ({})",
                x.n_vars(),
                n_features
            )));
        }
        Ok(project(x, &self.loadings, self.mean.as_ref(), chunk_size.unwrap_or(x.n_obs())))
    }

    /// Writes the result with bincode.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| PcaError::Serialization(format!("Failed to serialize PCA result: {}", e)))?;
        Ok(())
    }

    /// Reads a result written by [`PcaResult::save`] and checks its dimensions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let result: PcaResult =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| PcaError::Serialization(format!("Failed to deserialize PCA result: {}", e)))?;

        let k = result.variance.len();
        if result.components.ncols() != k || result.loadings.ncols() != k || result.variance_ratio.len() != k {
            return Err(PcaError::shape(format!(
                "Loaded PCA result has inconsistent component counts: components={}, loadings={}, variance={}, variance_ratio={}",
                result.components.ncols(),
                result.loadings.ncols(),
                k,
                result.variance_ratio.len()
            )));
        }
        if let Some(mean) = result.mean.as_ref() {
            if mean.len() != result.loadings.nrows() {
                return Err(PcaError::shape(format!(
                    "Loaded PCA result has a mean of length {} for {} features",
                    mean.len(),
                    result.loadings.nrows()
                )));
            }
        }
        if result.variance.iter().any(|&v| !v.is_finite() || v < 0.0) {
            return Err(PcaError::NonFinite("loaded variance"));
        }
        Ok(result)
    }
}

/// `(X − 1 μᵀ) V` evaluated block by block as `Xb V − 1 (μᵀ V)`.
pub(crate) fn project(
    x: &ExpressionMatrix,
    loadings: &Array2<f64>,
    mean: Option<&Array1<f64>>,
    chunk_size: usize,
) -> Array2<f64> {
    let offset = mean.map(|m| m.dot(loadings));
    let mut scores = Array2::zeros((x.n_obs(), loadings.ncols()));
    for (range, block) in x.row_blocks(chunk_size) {
        let mut block_scores = block.dot(loadings);
        if let Some(offset) = offset.as_ref() {
            block_scores -= offset;
        }
        scores.slice_mut(s![range, ..]).assign(&block_scores);
    }
    scores
}

/// Flips each component so that its largest-magnitude loading is positive.
/// Ties go to the lowest feature index.
pub(crate) fn canonicalize_signs(loadings: &mut Array2<f64>, components: &mut Array2<f64>) {
    for k in 0..loadings.ncols() {
        let mut pivot = 0.0f64;
        for &v in loadings.column(k) {
            if v.abs() > pivot.abs() {
                pivot = v;
            }
        }
        if pivot < 0.0 {
            loadings.column_mut(k).mapv_inplace(|v| -v);
            components.column_mut(k).mapv_inplace(|v| -v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn sample_result() -> PcaResult {
        PcaResult {
            components: array![[1.0, 0.5], [-1.0, -0.5], [0.0, 0.0]],
            loadings: array![[0.6, 0.8], [0.8, -0.6]],
            variance: array![1.0, 0.25],
            variance_ratio: array![0.6, 0.15],
            mean: Some(array![1.0, 2.0]),
            total_variance: 1.0 / 0.6,
        }
    }

    #[test]
    fn canonical_sign_makes_largest_loading_positive() {
        let mut loadings = array![[0.1, -0.2], [-0.9, 0.3], [0.2, -0.7]];
        let mut components = array![[1.0, 2.0], [3.0, 4.0]];
        canonicalize_signs(&mut loadings, &mut components);
        assert_eq!(loadings, array![[-0.1, 0.2], [0.9, -0.3], [-0.2, 0.7]]);
        assert_eq!(components, array![[-1.0, -2.0], [-3.0, -4.0]]);

        let mut tied = array![[0.5], [-0.5]];
        let mut none = Array2::zeros((0, 1));
        canonicalize_signs(&mut tied, &mut none);
        assert_eq!(tied, array![[0.5], [-0.5]]);
        let mut tied = array![[-0.5], [0.5]];
        canonicalize_signs(&mut tied, &mut none);
        assert_eq!(tied, array![[0.5], [-0.5]]);
    }

    #[test]
    fn cumulative_ratio_is_running_sum() {
        let cumulative = sample_result().cumulative_variance_ratio();
        assert_abs_diff_eq!(cumulative[0], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(cumulative[1], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn transform_centers_with_stored_mean() {
        let result = sample_result();
        let x = ExpressionMatrix::from(array![[1.0, 2.0], [2.0, 2.0], [1.0, 3.0]]);
        let scores = result.transform(&x, Some(2)).unwrap();
        assert_abs_diff_eq!(scores[[0, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scores[[1, 0]], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(scores[[2, 1]], -0.6, epsilon = 1e-12);

        let wrong = ExpressionMatrix::from(Array2::<f64>::zeros((2, 3)));
        assert!(matches!(result.transform(&wrong, None), Err(PcaError::Shape(_))));
    }

    #[test]
    fn save_and_load_preserve_the_result() {
        let result = sample_result();
        let file = NamedTempFile::new().unwrap();
        result.save(file.path()).unwrap();
        let loaded = PcaResult::load(file.path()).unwrap();
        assert_eq!(loaded, result);
    }

    #[test]
    fn load_rejects_inconsistent_results() {
        let mut result = sample_result();
        result.variance_ratio = array![0.5];
        let file = NamedTempFile::new().unwrap();
        result.save(file.path()).unwrap();
        assert!(matches!(PcaResult::load(file.path()), Err(PcaError::Shape(_))));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.bin");
        assert!(matches!(PcaResult::load(missing), Err(PcaError::Io(_))));
    }
}
