//! Observations × features input matrices and row-block kernels.
//!
//! Every pass the engine makes over the data goes through [`ExpressionMatrix::row_blocks`],
//! so dense and CSR inputs share one code path and chunked execution only changes the
//! block height.

use std::ops::Range;

use nalgebra_sparse::CsrMatrix;
use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, ArrayView2, Axis, Zip};
use rayon::prelude::*;

use crate::error::{PcaError, Result};

/// Observations (rows) × features (columns) expression matrix.
///
/// Values are held in `f64`. Single-precision inputs are cast into a new copy by
/// [`ExpressionMatrix::from_dense_f32`] / [`ExpressionMatrix::from_sparse_f32`].
#[derive(Debug, Clone)]
pub enum ExpressionMatrix {
    Dense(Array2<f64>),
    Sparse(CsrMatrix<f64>),
}

impl From<Array2<f64>> for ExpressionMatrix {
    fn from(value: Array2<f64>) -> Self {
        ExpressionMatrix::Dense(value)
    }
}

impl From<CsrMatrix<f64>> for ExpressionMatrix {
    fn from(value: CsrMatrix<f64>) -> Self {
        ExpressionMatrix::Sparse(value)
    }
}

impl ExpressionMatrix {
    pub fn from_dense_f32(data: &Array2<f32>) -> Self {
        ExpressionMatrix::Dense(data.mapv(f64::from))
    }

    pub fn from_sparse_f32(data: &CsrMatrix<f32>) -> Result<Self> {
        let values = data.values().iter().map(|&v| f64::from(v)).collect();
        let csr = CsrMatrix::try_from_csr_data(
            data.nrows(),
            data.ncols(),
            data.row_offsets().to_vec(),
            data.col_indices().to_vec(),
            values,
        )
        .map_err(|e| PcaError::shape(format!("Invalid CSR data: {}", e)))?;
        Ok(ExpressionMatrix::Sparse(csr))
    }

    /// `(n_observations, n_features)`
    pub fn shape(&self) -> (usize, usize) {
        match self {
            ExpressionMatrix::Dense(x) => x.dim(),
            ExpressionMatrix::Sparse(x) => (x.nrows(), x.ncols()),
        }
    }

    pub fn n_obs(&self) -> usize {
        self.shape().0
    }

    pub fn n_vars(&self) -> usize {
        self.shape().1
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, ExpressionMatrix::Sparse(_))
    }

    /// Number of stored entries (all entries for dense input).
    pub fn nnz(&self) -> usize {
        match self {
            ExpressionMatrix::Dense(x) => x.len(),
            ExpressionMatrix::Sparse(x) => x.nnz(),
        }
    }

    /// Fails with [`PcaError::Shape`] when the matrix has no rows or no columns.
    pub fn ensure_non_empty(&self) -> Result<()> {
        let (n_obs, n_vars) = self.shape();
        if n_obs == 0 || n_vars == 0 {
            return Err(PcaError::shape(format!(
                "Input matrix is empty ({} observations x {} features)",
                n_obs, n_vars
            )));
        }
        Ok(())
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            ExpressionMatrix::Dense(x) => x.clone(),
            ExpressionMatrix::Sparse(x) => {
                let mut dense = Array2::zeros((x.nrows(), x.ncols()));
                for (i, j, &v) in x.triplet_iter() {
                    dense[[i, j]] = v;
                }
                dense
            }
        }
    }

    /// CSR copy of the matrix; explicit zeros of a dense input are dropped.
    pub fn to_sparse(&self) -> Result<CsrMatrix<f64>> {
        match self {
            ExpressionMatrix::Sparse(x) => Ok(x.clone()),
            ExpressionMatrix::Dense(x) => {
                let mut row_offsets = Vec::with_capacity(x.nrows() + 1);
                let mut col_indices = Vec::new();
                let mut values = Vec::new();
                row_offsets.push(0);
                for row in x.rows() {
                    for (j, &v) in row.iter().enumerate() {
                        if v != 0.0 {
                            col_indices.push(j);
                            values.push(v);
                        }
                    }
                    row_offsets.push(values.len());
                }
                CsrMatrix::try_from_csr_data(x.nrows(), x.ncols(), row_offsets, col_indices, values)
                    .map_err(|e| PcaError::shape(format!("Invalid CSR data: {}", e)))
            }
        }
    }

    /// Copy restricted to the given feature columns, which must be strictly increasing.
    pub fn select_features(&self, features: &[usize]) -> Result<Self> {
        let n_vars = self.n_vars();
        if features.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PcaError::shape("Selected feature indices must be strictly increasing"));
        }
        if let Some(&last) = features.last() {
            if last >= n_vars {
                return Err(PcaError::shape(format!(
                    "Feature index {} is out of bounds for {} features",
                    last, n_vars
                )));
            }
        }
        match self {
            ExpressionMatrix::Dense(x) => Ok(ExpressionMatrix::Dense(x.select(Axis(1), features))),
            ExpressionMatrix::Sparse(x) => {
                let mut remap = vec![None; n_vars];
                for (new_j, &old_j) in features.iter().enumerate() {
                    remap[old_j] = Some(new_j);
                }
                let mut row_offsets = Vec::with_capacity(x.nrows() + 1);
                let mut col_indices = Vec::new();
                let mut values = Vec::new();
                row_offsets.push(0);
                for row in x.row_iter() {
                    for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                        if let Some(new_j) = remap[j] {
                            col_indices.push(new_j);
                            values.push(v);
                        }
                    }
                    row_offsets.push(values.len());
                }
                let csr = CsrMatrix::try_from_csr_data(
                    x.nrows(),
                    features.len(),
                    row_offsets,
                    col_indices,
                    values,
                )
                .map_err(|e| PcaError::shape(format!("Invalid CSR data: {}", e)))?;
                Ok(ExpressionMatrix::Sparse(csr))
            }
        }
    }

    /// Borrowed view over rows `range`.
    pub fn row_block(&self, range: Range<usize>) -> RowBlock<'_> {
        match self {
            ExpressionMatrix::Dense(x) => RowBlock::Dense(x.slice(s![range.start..range.end, ..])),
            ExpressionMatrix::Sparse(x) => RowBlock::Sparse(CsrRows {
                row_offsets: &x.row_offsets()[range.start..=range.end],
                col_indices: x.col_indices(),
                values: x.values(),
                n_cols: x.ncols(),
            }),
        }
    }

    /// Contiguous row blocks of `chunk_size` rows; the last block may be shorter.
    pub fn row_blocks(&self, chunk_size: usize) -> impl Iterator<Item = (Range<usize>, RowBlock<'_>)> {
        row_ranges(self.n_obs(), chunk_size).map(move |range| (range.clone(), self.row_block(range)))
    }
}

/// Splits `0..n_rows` into contiguous ranges of at most `chunk_size` rows.
pub fn row_ranges(n_rows: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = chunk_size.max(1);
    (0..n_rows)
        .step_by(step)
        .map(move |start| start..(start + step).min(n_rows))
}

/// CSR rows borrowed from a larger matrix. `row_offsets` index into the full
/// `col_indices` / `values` arrays.
#[derive(Debug, Clone, Copy)]
pub struct CsrRows<'a> {
    row_offsets: &'a [usize],
    col_indices: &'a [usize],
    values: &'a [f64],
    n_cols: usize,
}

impl<'a> CsrRows<'a> {
    pub fn n_rows(&self) -> usize {
        self.row_offsets.len() - 1
    }

    pub fn row(&self, i: usize) -> (&'a [usize], &'a [f64]) {
        let span = self.row_offsets[i]..self.row_offsets[i + 1];
        (&self.col_indices[span.clone()], &self.values[span])
    }
}

/// A block of consecutive observations.
#[derive(Debug, Clone)]
pub enum RowBlock<'a> {
    Dense(ArrayView2<'a, f64>),
    Sparse(CsrRows<'a>),
}

impl RowBlock<'_> {
    pub fn n_rows(&self) -> usize {
        match self {
            RowBlock::Dense(x) => x.nrows(),
            RowBlock::Sparse(x) => x.n_rows(),
        }
    }

    pub fn n_cols(&self) -> usize {
        match self {
            RowBlock::Dense(x) => x.ncols(),
            RowBlock::Sparse(x) => x.n_cols,
        }
    }

    /// Per-feature sums over the rows of the block.
    pub fn column_sums(&self) -> Array1<f64> {
        match self {
            RowBlock::Dense(x) => x.sum_axis(Axis(0)),
            RowBlock::Sparse(x) => {
                let mut sums = Array1::zeros(x.n_cols);
                for i in 0..x.n_rows() {
                    let (cols, vals) = x.row(i);
                    for (&j, &v) in cols.iter().zip(vals) {
                        sums[j] += v;
                    }
                }
                sums
            }
        }
    }

    /// Per-feature sums of squares over the rows of the block.
    pub fn column_sums_of_squares(&self) -> Array1<f64> {
        match self {
            RowBlock::Dense(x) => x.map_axis(Axis(0), |col| col.dot(&col)),
            RowBlock::Sparse(x) => {
                let mut sums = Array1::zeros(x.n_cols);
                for i in 0..x.n_rows() {
                    let (cols, vals) = x.row(i);
                    for (&j, &v) in cols.iter().zip(vals) {
                        sums[j] += v * v;
                    }
                }
                sums
            }
        }
    }

    /// Adds `Xbᵀ Xb` into `out`, shape `(n_features, n_features)`.
    pub fn gram_into(&self, out: &mut Array2<f64>) {
        match self {
            RowBlock::Dense(x) => general_mat_mul(1.0, &x.t(), x, 1.0, out),
            RowBlock::Sparse(x) => {
                for i in 0..x.n_rows() {
                    let (cols, vals) = x.row(i);
                    for (&j, &vj) in cols.iter().zip(vals) {
                        let mut out_row = out.row_mut(j);
                        for (&k, &vk) in cols.iter().zip(vals) {
                            out_row[k] += vj * vk;
                        }
                    }
                }
            }
        }
    }

    /// `Xb Xbᵀ`, shape `(n_rows, n_rows)`.
    pub fn outer_gram(&self) -> Array2<f64> {
        match self {
            RowBlock::Dense(x) => x.dot(&x.t()),
            RowBlock::Sparse(x) => {
                let n = x.n_rows();
                let mut outer = Array2::zeros((n, n));
                let mut scattered = vec![0.0; x.n_cols];
                for a in 0..n {
                    let (cols_a, vals_a) = x.row(a);
                    for (&j, &v) in cols_a.iter().zip(vals_a) {
                        scattered[j] = v;
                    }
                    for b in a..n {
                        let (cols_b, vals_b) = x.row(b);
                        let dot: f64 = cols_b
                            .iter()
                            .zip(vals_b)
                            .map(|(&j, &v)| scattered[j] * v)
                            .sum();
                        outer[[a, b]] = dot;
                        outer[[b, a]] = dot;
                    }
                    for &j in cols_a {
                        scattered[j] = 0.0;
                    }
                }
                outer
            }
        }
    }

    /// `Xb M` for `M` of shape `(n_features, k)`; result `(n_rows, k)`.
    pub fn dot(&self, m: &Array2<f64>) -> Array2<f64> {
        match self {
            RowBlock::Dense(x) => x.dot(m),
            RowBlock::Sparse(x) => {
                let mut out = Array2::zeros((x.n_rows(), m.ncols()));
                out.axis_iter_mut(Axis(0))
                    .into_par_iter()
                    .enumerate()
                    .for_each(|(i, mut out_row)| {
                        let (cols, vals) = x.row(i);
                        for (&j, &v) in cols.iter().zip(vals) {
                            Zip::from(&mut out_row)
                                .and(m.row(j))
                                .for_each(|o, &mj| *o += v * mj);
                        }
                    });
                out
            }
        }
    }

    /// `Xbᵀ Q` for `Q` of shape `(n_rows, k)`; result `(n_features, k)`.
    pub fn t_dot(&self, q: &ArrayView2<f64>) -> Array2<f64> {
        match self {
            RowBlock::Dense(x) => x.t().dot(q),
            RowBlock::Sparse(x) => {
                let mut out = Array2::zeros((x.n_cols, q.ncols()));
                for i in 0..x.n_rows() {
                    let (cols, vals) = x.row(i);
                    let q_row = q.row(i);
                    for (&j, &v) in cols.iter().zip(vals) {
                        out.row_mut(j).scaled_add(v, &q_row);
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra_sparse::CooMatrix;
    use ndarray::array;

    fn dense_fixture() -> Array2<f64> {
        array![
            [1.0, 0.0, 2.0],
            [0.0, 0.0, 0.0],
            [3.0, 4.0, 0.0],
            [0.0, 5.0, 6.0],
        ]
    }

    fn sparse_fixture() -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(4, 3);
        coo.push(0, 0, 1.0);
        coo.push(0, 2, 2.0);
        coo.push(2, 0, 3.0);
        coo.push(2, 1, 4.0);
        coo.push(3, 1, 5.0);
        coo.push(3, 2, 6.0);
        CsrMatrix::from(&coo)
    }

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn row_ranges_cover_all_rows() {
        let ranges: Vec<_> = row_ranges(10, 4).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
        let single: Vec<_> = row_ranges(3, 100).collect();
        assert_eq!(single, vec![0..3]);
        assert_eq!(row_ranges(0, 4).count(), 0);
    }

    #[test]
    fn dense_and_sparse_round_trip() {
        let dense = ExpressionMatrix::from(dense_fixture());
        let sparse = ExpressionMatrix::from(dense.to_sparse().unwrap());
        assert_eq!(sparse.nnz(), 6);
        assert_eq!(sparse.to_dense(), dense_fixture());
    }

    #[test]
    fn block_kernels_agree_between_representations() {
        let dense = ExpressionMatrix::from(dense_fixture());
        let sparse = ExpressionMatrix::from(sparse_fixture());
        let m = array![[1.0, -1.0], [0.5, 2.0], [0.0, 1.0]];
        for range in [0..4, 1..3, 3..4] {
            let d = dense.row_block(range.clone());
            let s = sparse.row_block(range.clone());
            assert_eq!(d.n_rows(), s.n_rows());
            let mut dg = Array2::from_elem((3, 3), 1.0);
            let mut sg = Array2::from_elem((3, 3), 1.0);
            d.gram_into(&mut dg);
            s.gram_into(&mut sg);
            assert_close(&dg, &sg);
            let rows = dense_fixture().slice(s![range.clone(), ..]).to_owned();
            assert_close(&dg, &(rows.t().dot(&rows) + 1.0));
            assert_close(&d.outer_gram(), &s.outer_gram());
            assert_close(&d.dot(&m), &s.dot(&m));
            let q = Array2::from_shape_fn((range.len(), 2), |(i, j)| (i + 2 * j) as f64);
            assert_close(&d.t_dot(&q.view()), &s.t_dot(&q.view()));
            for (ds, ss) in [
                (d.column_sums(), s.column_sums()),
                (d.column_sums_of_squares(), s.column_sums_of_squares()),
            ] {
                for (x, y) in ds.iter().zip(ss.iter()) {
                    assert_abs_diff_eq!(x, y, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn select_features_keeps_order() {
        let sparse = ExpressionMatrix::from(sparse_fixture());
        let subset = sparse.select_features(&[0, 2]).unwrap();
        assert_eq!(subset.shape(), (4, 2));
        assert_eq!(subset.to_dense(), array![[1.0, 2.0], [0.0, 0.0], [3.0, 0.0], [0.0, 6.0]]);
        assert!(sparse.select_features(&[2, 0]).is_err());
        assert!(sparse.select_features(&[5]).is_err());
    }

    #[test]
    fn f32_inputs_are_cast_into_copies() {
        let data = array![[1.5f32, 0.0], [0.0, 2.25]];
        let m = ExpressionMatrix::from_dense_f32(&data);
        assert_eq!(m.to_dense(), array![[1.5, 0.0], [0.0, 2.25]]);
        let coo = CooMatrix::try_from_triplets(2, 2, vec![0, 1], vec![0, 1], vec![1.5f32, 2.25]).unwrap();
        let s = ExpressionMatrix::from_sparse_f32(&CsrMatrix::from(&coo)).unwrap();
        assert!(s.is_sparse());
        assert_eq!(s.to_dense(), m.to_dense());
    }

    #[test]
    fn empty_matrix_is_rejected() {
        let m = ExpressionMatrix::from(Array2::<f64>::zeros((0, 3)));
        assert!(matches!(m.ensure_non_empty(), Err(PcaError::Shape(_))));
    }
}
