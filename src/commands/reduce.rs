use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use super::{check_recorded_dimensions, open_store, StageRun};
use crate::artifacts::{
    check_freshness, remove_fingerprint, require_upstream, should_run, write_fingerprint,
    Fingerprint, Stage,
};
use crate::cli::{ReduceArgs, RefreshMode, UmapArgs};
use crate::model::{StageOutcome, StageStatus};
use crate::reduce::{reduce, ReduceParams, Reducer, Umap};
use crate::vectors::{read_vectors_tsv, write_vectors_tsv};

#[derive(Debug, Clone, Serialize)]
pub struct ReduceConfig {
    pub output_root: PathBuf,
    pub model_id: String,
    pub params: ReduceParams,
    pub refresh_mode: RefreshMode,
}

impl ReduceConfig {
    pub(crate) fn params_from(umap_dims: usize, umap: &UmapArgs) -> ReduceParams {
        ReduceParams {
            target_dim: umap_dims,
            n_neighbors: umap.n_neighbors,
            min_dist: umap.min_dist,
            seed: umap.seed,
            n_epochs: umap.n_epochs,
        }
    }
}

impl From<ReduceArgs> for ReduceConfig {
    fn from(args: ReduceArgs) -> Self {
        Self {
            params: Self::params_from(args.umap_dims, &args.umap),
            output_root: args.store.output_root,
            model_id: args.store.model_id,
            refresh_mode: args.store.refresh_mode,
        }
    }
}

#[derive(Serialize)]
struct ReduceFingerprintParams<'a> {
    reducer: &'a str,
    params: &'a ReduceParams,
}

pub fn run(args: ReduceArgs) -> Result<()> {
    run_stage(&ReduceConfig::from(args))?;
    Ok(())
}

pub fn run_stage(config: &ReduceConfig) -> Result<StageOutcome> {
    let store = open_store(&config.output_root, &config.model_id)?;
    let upstream = store.vectors_path();
    let run = StageRun::start(Stage::Reduce, config.refresh_mode);

    if config.params.target_dim == 0 {
        info!("reduction disabled (0 dimensions); clustering reads the raw vectors");
        return run.finish(&store, StageStatus::Disabled, &upstream, None, None, config);
    }

    require_upstream(Stage::Reduce, &upstream)?;
    let output = store.reduced_vectors_path(config.params.target_dim);
    let reducer = Umap;

    let params = ReduceFingerprintParams {
        reducer: reducer.name(),
        params: &config.params,
    };
    let expected = Fingerprint::compute(Stage::Reduce, &params, &[upstream.as_path()])?;
    let freshness = check_freshness(&[output.as_path()], &expected)?;
    if !should_run(config.refresh_mode, freshness) {
        return run.skip(&store, &output, freshness, config);
    }

    let vectors = read_vectors_tsv(&upstream)?;
    check_recorded_dimensions(&upstream, &vectors)?;

    info!(
        rows = vectors.len(),
        from_dims = vectors.dimensions(),
        to_dims = config.params.target_dim,
        n_neighbors = config.params.n_neighbors,
        min_dist = config.params.min_dist,
        seed = config.params.seed,
        "reducing vectors"
    );

    let reduced = reduce(&vectors, &config.params, &reducer)?;

    remove_fingerprint(&output)?;
    write_vectors_tsv(&output, &reduced)?;
    let fingerprint = expected.with_shape(reduced.len(), Some(config.params.target_dim));
    write_fingerprint(&output, &fingerprint)?;

    run.finish(
        &store,
        StageStatus::Completed,
        &output,
        Some(freshness),
        Some(&fingerprint),
        config,
    )
}
