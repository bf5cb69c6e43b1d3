//! Attaching PCA results to an annotated expression container.
//!
//! Results are written under fixed keys: scores into the per-observation slot
//! [`X_PCA_KEY`], loadings into the per-feature slot [`PCS_KEY`] and the
//! variance summary into the unstructured slot [`PCA_UNS_KEY`].

use std::collections::HashMap;

use log::{debug, info};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{PcaError, Result};
use crate::matrix::ExpressionMatrix;
use crate::pca::{Pca, PcaConfig, Solver};
use crate::result::PcaResult;

pub const X_PCA_KEY: &str = "X_pca";
pub const PCS_KEY: &str = "PCs";
pub const PCA_UNS_KEY: &str = "pca";

/// Parameters recorded next to the variance summary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PcaParams {
    pub n_comps: usize,
    pub zero_center: bool,
    pub use_highly_variable: bool,
    pub chunked: bool,
    pub chunk_size: Option<usize>,
    pub solver: Solver,
}

/// Contents of the `pca` unstructured entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PcaSummary {
    pub variance: Array1<f64>,
    pub variance_ratio: Array1<f64>,
    pub params: PcaParams,
}

/// Destination for PCA artifacts. Inserting under an existing key replaces it.
pub trait ResultSink {
    fn insert_obsm(&mut self, key: &str, value: Array2<f64>);
    fn insert_varm(&mut self, key: &str, value: Array2<f64>);
    fn insert_uns(&mut self, key: &str, value: PcaSummary);
}

/// In-memory annotated expression matrix.
#[derive(Debug, Clone)]
pub struct ExpressionData {
    pub x: ExpressionMatrix,
    /// Per-feature highly-variable flag.
    pub highly_variable: Option<Vec<bool>>,
    pub obsm: HashMap<String, Array2<f64>>,
    pub varm: HashMap<String, Array2<f64>>,
    pub uns: HashMap<String, PcaSummary>,
}

impl ExpressionData {
    pub fn new(x: ExpressionMatrix) -> Self {
        Self {
            x,
            highly_variable: None,
            obsm: HashMap::new(),
            varm: HashMap::new(),
            uns: HashMap::new(),
        }
    }

    pub fn with_highly_variable(mut self, mask: Vec<bool>) -> Self {
        self.highly_variable = Some(mask);
        self
    }

    pub fn n_obs(&self) -> usize {
        self.x.n_obs()
    }

    pub fn n_vars(&self) -> usize {
        self.x.n_vars()
    }
}

impl ResultSink for ExpressionData {
    fn insert_obsm(&mut self, key: &str, value: Array2<f64>) {
        self.obsm.insert(key.to_string(), value);
    }

    fn insert_varm(&mut self, key: &str, value: Array2<f64>) {
        self.varm.insert(key.to_string(), value);
    }

    fn insert_uns(&mut self, key: &str, value: PcaSummary) {
        self.uns.insert(key.to_string(), value);
    }
}

/// Indices of flagged features; errors when the mask does not cover every feature
/// or flags none of them.
fn highly_variable_features(mask: &[bool], n_vars: usize) -> Result<Vec<usize>> {
    if mask.len() != n_vars {
        return Err(PcaError::shape(format!(
            "highly_variable mask has length {} but the matrix has {} features",
            mask.len(),
            n_vars
        )));
    }
    let selected: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(j, &keep)| keep.then_some(j))
        .collect();
    if selected.is_empty() {
        return Err(PcaError::shape("highly_variable mask selects no features"));
    }
    Ok(selected)
}

/// Writes scores, loadings and summary under the standard keys.
pub fn commit<S: ResultSink + ?Sized>(sink: &mut S, scores: Array2<f64>, loadings: Array2<f64>, summary: PcaSummary) {
    sink.insert_obsm(X_PCA_KEY, scores);
    sink.insert_varm(PCS_KEY, loadings);
    sink.insert_uns(PCA_UNS_KEY, summary);
}

/// Runs PCA on `data.x` and stores the result in `data`.
///
/// With `use_highly_variable`, only flagged features enter the decomposition and
/// the `PCs` rows of the other features are zero. Nothing is written when the
/// computation fails.
pub fn pca(data: &mut ExpressionData, config: &PcaConfig) -> Result<PcaResult> {
    let n_vars = data.n_vars();
    let engine = Pca::new(config.clone().with_use_highly_variable(false));
    let (result, pcs) = if config.use_highly_variable {
        let mask = data.highly_variable.as_deref().ok_or_else(|| {
            PcaError::shape("use_highly_variable requires a highly_variable feature mask")
        })?;
        let features = highly_variable_features(mask, n_vars)?;
        info!("Restricting PCA to {} of {} highly variable features", features.len(), n_vars);
        let subset = data.x.select_features(&features)?;
        let result = engine.compute(&subset)?;
        let mut pcs = Array2::zeros((n_vars, result.n_comps()));
        for (row, &j) in features.iter().enumerate() {
            pcs.row_mut(j).assign(&result.loadings.row(row));
        }
        (result, pcs)
    } else {
        let result = engine.compute(&data.x)?;
        let pcs = result.loadings.clone();
        (result, pcs)
    };

    let summary = PcaSummary {
        variance: result.variance.clone(),
        variance_ratio: result.variance_ratio.clone(),
        params: PcaParams {
            n_comps: result.n_comps(),
            zero_center: config.zero_center,
            use_highly_variable: config.use_highly_variable,
            chunked: config.chunked,
            chunk_size: config.chunk_size,
            solver: config.solver,
        },
    };
    commit(data, result.components.clone(), pcs, summary);
    debug!("Stored PCA results under '{}', '{}' and '{}'", X_PCA_KEY, PCS_KEY, PCA_UNS_KEY);
    Ok(result)
}
