// Principal component analysis for single-cell expression matrices

#![doc = include_str!("../README.md")]

pub mod error;
pub mod linalg_backends;
pub mod matrix;
pub mod moments;
pub mod pca;
mod randomized;
pub mod result;
pub mod store;

pub use error::{PcaError, Result};
pub use matrix::{ExpressionMatrix, RowBlock};
pub use pca::{compute, Pca, PcaConfig, Solver};
pub use result::PcaResult;
pub use store::{ExpressionData, PcaSummary, ResultSink, PCA_UNS_KEY, PCS_KEY, X_PCA_KEY};
