use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use super::{check_recorded_dimensions, open_store, StageRun};
use crate::artifacts::{
    check_freshness, remove_fingerprint, require_upstream, should_run, write_fingerprint,
    Fingerprint, Stage,
};
use crate::cli::{ClusterArgs, RefreshMode};
use crate::cluster::{
    append_cluster_columns, cluster, cluster_column_name, level_width, Clusterer, WardClusterer,
};
use crate::error::PipelineError;
use crate::model::{ClusterLevelSummary, StageOutcome, StageStatus};
use crate::table::{read_metadata_tsv, write_metadata_tsv};
use crate::vectors::read_vectors_tsv;

#[derive(Debug, Clone, Serialize)]
pub struct ClusterConfig {
    pub output_root: PathBuf,
    pub model_id: String,
    pub levels: Vec<usize>,
    pub umap_dims: usize,
    pub refresh_mode: RefreshMode,
}

impl From<ClusterArgs> for ClusterConfig {
    fn from(args: ClusterArgs) -> Self {
        Self {
            output_root: args.store.output_root,
            model_id: args.store.model_id,
            levels: args.levels.levels,
            umap_dims: args.umap_dims,
            refresh_mode: args.store.refresh_mode,
        }
    }
}

#[derive(Serialize)]
struct ClusterFingerprintParams<'a> {
    clusterer: &'a str,
    levels: Vec<usize>,
    umap_dims: usize,
}

pub fn run(args: ClusterArgs) -> Result<()> {
    run_stage(&ClusterConfig::from(args))?;
    Ok(())
}

pub fn run_stage(config: &ClusterConfig) -> Result<StageOutcome> {
    if config.levels.is_empty() {
        return Err(PipelineError::invalid_parameter(
            "levels",
            "at least one cluster level is required",
        )
        .into());
    }

    let store = open_store(&config.output_root, &config.model_id)?;
    let vectors_path = store.cluster_input_path(config.umap_dims);
    let metadata_path = store.metadata_path();
    require_upstream(Stage::Cluster, &vectors_path)?;
    require_upstream(Stage::Cluster, &metadata_path)?;

    let output = store.clusters_metadata_path();
    let clusterer = WardClusterer;
    let params = ClusterFingerprintParams {
        clusterer: clusterer.name(),
        levels: config
            .levels
            .iter()
            .copied()
            .collect::<BTreeSet<usize>>()
            .into_iter()
            .collect(),
        umap_dims: config.umap_dims,
    };
    let expected = Fingerprint::compute(
        Stage::Cluster,
        &params,
        &[vectors_path.as_path(), metadata_path.as_path()],
    )?;
    let freshness = check_freshness(&[output.as_path()], &expected)?;

    let mut run = StageRun::start(Stage::Cluster, config.refresh_mode);
    if !should_run(config.refresh_mode, freshness) {
        return run.skip(&store, &output, freshness, config);
    }

    let vectors = read_vectors_tsv(&vectors_path)?;
    check_recorded_dimensions(&vectors_path, &vectors)?;
    let metadata = read_metadata_tsv(&metadata_path)?;
    if vectors.len() != metadata.row_count() {
        return Err(PipelineError::RowCountMismatch {
            vectors: vectors.len(),
            metadata: metadata.row_count(),
        }
        .into());
    }

    info!(
        rows = vectors.len(),
        dims = vectors.dimensions(),
        input = %vectors_path.display(),
        levels = ?params.levels,
        "clustering vectors"
    );

    let assignments = cluster(&vectors, &config.levels, &clusterer)?;
    let width = level_width(assignments.keys());
    let summaries = assignments
        .values()
        .map(|assignment| {
            let (min_size, median_size, max_size) = assignment.size_summary();
            ClusterLevelSummary {
                level: assignment.level,
                column: cluster_column_name(assignment.level, width),
                min_size,
                median_size,
                max_size,
            }
        })
        .collect::<Vec<ClusterLevelSummary>>();
    for summary in &summaries {
        info!(
            column = %summary.column,
            min_size = summary.min_size,
            median_size = summary.median_size,
            max_size = summary.max_size,
            "cluster level sizes"
        );
    }
    run.set_summary(&summaries)?;

    let augmented = append_cluster_columns(&metadata, &assignments)?;

    remove_fingerprint(&output)?;
    write_metadata_tsv(&output, &augmented)?;
    let fingerprint = expected.with_shape(augmented.row_count(), None);
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
