//! Dimensionality reduction behind the [`Reducer`] seam.

mod umap;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::vectors::VectorSet;

pub use umap::Umap;

pub const DEFAULT_N_NEIGHBORS: usize = 15;
pub const DEFAULT_MIN_DIST: f32 = 0.1;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceParams {
    pub target_dim: usize,
    /// Neighbourhood size, counting the point itself. Higher favours global structure.
    pub n_neighbors: usize,
    /// Minimum spacing in the layout. Lower packs clusters tighter.
    pub min_dist: f32,
    pub seed: u64,
    pub n_epochs: Option<usize>,
}

impl Default for ReduceParams {
    fn default() -> Self {
        Self {
            target_dim: 0,
            n_neighbors: DEFAULT_N_NEIGHBORS,
            min_dist: DEFAULT_MIN_DIST,
            seed: DEFAULT_SEED,
            n_epochs: None,
        }
    }
}

pub trait Reducer {
    fn name(&self) -> &'static str;

    /// Called only with validated parameters and `target_dim > 0`.
    fn fit_transform(
        &self,
        vectors: &VectorSet,
        params: &ReduceParams,
    ) -> Result<VectorSet, PipelineError>;
}

pub fn reduce(
    vectors: &VectorSet,
    params: &ReduceParams,
    reducer: &dyn Reducer,
) -> Result<VectorSet, PipelineError> {
    if params.target_dim == 0 {
        return Ok(vectors.clone());
    }

    validate_params(vectors, params)?;

    let reduced = reducer.fit_transform(vectors, params)?;
    if reduced.len() != vectors.len() {
        return Err(PipelineError::RowCountMismatch {
            vectors: reduced.len(),
            metadata: vectors.len(),
        });
    }
    if !reduced.is_empty() && reduced.dimensions() != params.target_dim {
        return Err(PipelineError::DimensionMismatch {
            row: 0,
            expected: params.target_dim,
            actual: reduced.dimensions(),
        });
    }

    Ok(reduced)
}

fn validate_params(vectors: &VectorSet, params: &ReduceParams) -> Result<(), PipelineError> {
    if params.n_neighbors < 2 {
        return Err(PipelineError::invalid_parameter(
            "n_neighbors",
            format!("{} is below the minimum of 2", params.n_neighbors),
        ));
    }
    if !params.min_dist.is_finite() || params.min_dist < 0.0 {
        return Err(PipelineError::invalid_parameter(
            "min_dist",
            format!("{} must be a non-negative number", params.min_dist),
        ));
    }
    if params.n_epochs == Some(0) {
        return Err(PipelineError::invalid_parameter(
            "n_epochs",
            "must be at least 1",
        ));
    }
    if vectors.len() < params.n_neighbors {
        return Err(PipelineError::DegenerateInput {
            rows: vectors.len(),
            required: params.n_neighbors,
            reason: format!("a {}-neighbour graph needs that many rows", params.n_neighbors),
        });
    }
    if params.target_dim >= vectors.dimensions() {
        return Err(PipelineError::invalid_parameter(
            "target_dim",
            format!(
                "{} must be less than the input dimension {}",
                params.target_dim,
                vectors.dimensions()
            ),
        ));
    }
    if vectors.as_flat().iter().any(|value| !value.is_finite()) {
        return Err(PipelineError::invalid_parameter(
            "vectors",
            "input contains non-finite values",
        ));
    }

    Ok(())
}
