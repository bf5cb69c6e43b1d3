//! Streaming first and second moments over row blocks.
//!
//! The accumulator is an explicit fold state: each block contributes its count,
//! mean and scatter, and blocks are merged with the pairwise update of
//! Chan, Golub & LeVeque. A single block reduces to `XᵀX − n μμᵀ`, which is the
//! rank-1 correction that lets sparse input be centered without densifying it.

use ndarray::{Array1, Array2};

use crate::matrix::RowBlock;

/// Which second moment the fold accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MomentKind {
    /// Scatter about the running mean: `Σ (x − μ)(x − μ)ᵀ`.
    Centered,
    /// Raw second moment: `Σ x xᵀ`.
    Raw,
}

/// Fold state threaded through successive row blocks.
#[derive(Debug, Clone)]
pub struct MomentAccumulator {
    kind: MomentKind,
    n_seen: usize,
    mean: Array1<f64>,
    second_moment: Array2<f64>,
}

/// Finished moments of the full matrix.
#[derive(Debug, Clone)]
pub struct Moments {
    pub n_obs: usize,
    /// Per-feature mean.
    pub mean: Array1<f64>,
    /// `second_moment / (n_obs − 1)`: the covariance for [`MomentKind::Centered`],
    /// the uncentered second moment for [`MomentKind::Raw`].
    pub covariance: Array2<f64>,
}

impl Moments {
    /// Trace of [`Moments::covariance`], i.e. the total variance over the full spectrum.
    pub fn total_variance(&self) -> f64 {
        self.covariance.diag().sum()
    }
}

impl MomentAccumulator {
    pub fn new(kind: MomentKind, n_features: usize) -> Self {
        Self {
            kind,
            n_seen: 0,
            mean: Array1::zeros(n_features),
            second_moment: Array2::zeros((n_features, n_features)),
        }
    }

    pub fn n_seen(&self) -> usize {
        self.n_seen
    }

    /// Folds one block of observations into the state.
    pub fn fold(mut self, block: &RowBlock<'_>) -> Self {
        let n_block = block.n_rows();
        if n_block == 0 {
            return self;
        }
        let block_sums = block.column_sums();
        block.gram_into(&mut self.second_moment);

        match self.kind {
            MomentKind::Raw => {
                let n_total = (self.n_seen + n_block) as f64;
                self.mean = (&self.mean * self.n_seen as f64 + &block_sums) / n_total;
            }
            MomentKind::Centered => {
                let n_a = self.n_seen as f64;
                let n_b = n_block as f64;
                let n_total = n_a + n_b;
                let block_mean = &block_sums / n_b;
                // Block scatter about its own mean, in place.
                subtract_outer(&mut self.second_moment, &block_mean, &block_mean, n_b);
                let delta = &block_mean - &self.mean;
                if self.n_seen > 0 {
                    subtract_outer(&mut self.second_moment, &delta, &delta, -(n_a * n_b / n_total));
                }
                self.mean.scaled_add(n_b / n_total, &delta);
            }
        }
        self.n_seen += n_block;
        self
    }

    /// Normalizes the accumulated second moment by `n − 1`.
    ///
    /// Returns `None` when fewer than two observations were folded in.
    pub fn finish(self) -> Option<Moments> {
        if self.n_seen < 2 {
            return None;
        }
        let denom = (self.n_seen - 1) as f64;
        let mut covariance = self.second_moment / denom;
        symmetrize(&mut covariance);
        Some(Moments {
            n_obs: self.n_seen,
            mean: self.mean,
            covariance,
        })
    }
}

/// `m −= scale · a bᵀ`
fn subtract_outer(m: &mut Array2<f64>, a: &Array1<f64>, b: &Array1<f64>, scale: f64) {
    for (mut row, &ai) in m.rows_mut().into_iter().zip(a.iter()) {
        if ai != 0.0 {
            row.scaled_add(-scale * ai, b);
        }
    }
}

fn symmetrize(m: &mut Array2<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[[i, j]] + m[[j, i]]);
            m[[i, j]] = avg;
            m[[j, i]] = avg;
        }
    }
}

/// Per-feature mean and total sum of squares in one pass, without the
/// feature×feature second moment. Used by solvers that never form a covariance.
#[derive(Debug, Clone)]
pub struct ColumnStats {
    pub n_obs: usize,
    pub mean: Array1<f64>,
    /// `Σ_j var(x_j)` with `n − 1` normalization.
    pub total_variance: f64,
    /// `‖X‖_F² / (n − 1)`.
    pub total_raw_variance: f64,
}

#[derive(Debug, Clone)]
pub struct ColumnStatsAccumulator {
    n_seen: usize,
    mean: Array1<f64>,
    m2: Array1<f64>,
    sum_of_squares: f64,
}

impl ColumnStatsAccumulator {
    pub fn new(n_features: usize) -> Self {
        Self {
            n_seen: 0,
            mean: Array1::zeros(n_features),
            m2: Array1::zeros(n_features),
            sum_of_squares: 0.0,
        }
    }

    pub fn fold(mut self, block: &RowBlock<'_>) -> Self {
        let n_block = block.n_rows();
        if n_block == 0 {
            return self;
        }
        let nb = n_block as f64;
        let sums = block.column_sums();
        let block_mean = &sums / nb;
        let block_sq = block.column_sums_of_squares();
        let block_m2 = &block_sq - &(&block_mean * &block_mean * nb);

        if self.n_seen == 0 {
            self.mean = block_mean;
            self.m2 = block_m2;
        } else {
            let na = self.n_seen as f64;
            let n_total = na + nb;
            let delta = &block_mean - &self.mean;
            self.m2 = &self.m2 + &block_m2 + &(&delta * &delta * (na * nb / n_total));
            self.mean.scaled_add(nb / n_total, &delta);
        }
        self.sum_of_squares += block_sq.sum();
        self.n_seen += n_block;
        self
    }

    pub fn finish(self) -> Option<ColumnStats> {
        if self.n_seen < 2 {
            return None;
        }
        let denom = (self.n_seen - 1) as f64;
        Some(ColumnStats {
            n_obs: self.n_seen,
            mean: self.mean,
            total_variance: self.m2.iter().map(|v| v.max(0.0)).sum::<f64>() / denom,
            total_raw_variance: self.sum_of_squares / denom,
        })
    }
}
