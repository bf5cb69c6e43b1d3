// src/linalg_backends.rs

use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh as NdLinalgEigh, JobSvd, SVDDCInto, QR as NdLinalgQR, UPLO};
use std::error::Error;
use std::marker::PhantomData;

/// Errors surfaced by a backend before they are mapped into [`crate::PcaError`].
pub type BackendError = Box<dyn Error + Send + Sync>;

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns; `eigenvectors.column(i)` belongs to `eigenvalues[i]`.
    pub eigenvectors: Array2<F>,
}

/// Symmetric eigendecomposition reading the upper triangle.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, BackendError>;
}

/// QR decomposition returning only the thin Q factor.
pub trait BackendQR<F: 'static + Copy + Send + Sync> {
    fn qr_q_factor(&self, matrix: &Array2<F>) -> Result<Array2<F>, BackendError>;
}

/// Output of a thin singular value decomposition.
#[derive(Debug)]
pub struct SVDOutput<F: 'static> {
    /// Left singular vectors, shape `(m, min(m, n))`.
    pub u: Option<Array2<F>>,
    /// Singular values in descending order.
    pub s: Array1<F>,
    /// Right singular vectors (transposed), shape `(min(m, n), n)`.
    pub vt: Option<Array2<F>>,
}

/// Thin singular value decomposition.
pub trait BackendSVD<F: 'static + Copy + Send + Sync> {
    fn svd_into(
        &self,
        matrix: Array2<F>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<F>, BackendError>;
}

/// LAPACK-backed implementation through `ndarray-linalg`.
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> BackendError {
    Box::new(e)
}

impl BackendEigh<f64> for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, BackendError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(format!(
                "Matrix must be square for eigendecomposition, got {}x{}",
                matrix.nrows(),
                matrix.ncols()
            )
            .into());
        }
        if matrix.is_empty() {
            return Ok(EighOutput {
                eigenvalues: Array1::zeros(0),
                eigenvectors: Array2::zeros((0, 0)),
            });
        }
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendQR<f64> for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, BackendError> {
        let (nrows, ncols) = matrix.dim();
        if nrows == 0 || ncols == 0 {
            return Ok(Array2::zeros((nrows, nrows.min(ncols))));
        }
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

impl BackendSVD<f64> for NdarrayLinAlgBackend {
    fn svd_into(
        &self,
        matrix: Array2<f64>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<f64>, BackendError> {
        let (nrows, ncols) = matrix.dim();
        if matrix.is_empty() {
            let k_dim = nrows.min(ncols);
            return Ok(SVDOutput {
                u: compute_u.then(|| Array2::zeros((nrows, k_dim))),
                s: Array1::zeros(k_dim),
                vt: compute_v.then(|| Array2::zeros((k_dim, ncols))),
            });
        }
        let job = if compute_u || compute_v {
            JobSvd::Some
        } else {
            JobSvd::None
        };
        let (u, s, vt) = matrix.svddc_into(job).map_err(to_dyn_error)?;
        Ok(SVDOutput {
            u: if compute_u { u } else { None },
            s,
            vt: if compute_v { vt } else { None },
        })
    }
}

/// Dispatches to the backend selected at compile time.
///
/// Every LAPACK provider feature (`backend_openblas`, `backend_mkl`, ...) is
/// routed through `ndarray-linalg`, so the provider only forwards.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

impl<F> BackendEigh<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, BackendError> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

impl<F> BackendQR<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendQR<F>,
{
    fn qr_q_factor(&self, matrix: &Array2<F>) -> Result<Array2<F>, BackendError> {
        NdarrayLinAlgBackend.qr_q_factor(matrix)
    }
}

impl<F> BackendSVD<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendSVD<F>,
{
    fn svd_into(
        &self,
        matrix: Array2<F>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<F>, BackendError> {
        NdarrayLinAlgBackend.svd_into(matrix, compute_u, compute_v)
    }
}
