use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use super::{open_store, vector_row_count, StageRun};
use crate::artifacts::{
    check_freshness, remove_fingerprint, require_upstream, should_run, write_fingerprint,
    Fingerprint, Stage,
};
use crate::cli::{FacetsArgs, RefreshMode};
use crate::error::PipelineError;
use crate::facets::{compress, CATCH_ALL_LABEL};
use crate::model::{StageOutcome, StageStatus};
use crate::table::{read_metadata_tsv, write_metadata_tsv};

#[derive(Debug, Clone, Serialize)]
pub struct FacetConfig {
    pub output_root: PathBuf,
    pub model_id: String,
    pub columns: Vec<String>,
    pub top_n: usize,
    pub refresh_mode: RefreshMode,
}

impl From<FacetsArgs> for FacetConfig {
    fn from(args: FacetsArgs) -> Self {
        Self {
            output_root: args.store.output_root,
            model_id: args.store.model_id,
            columns: args.facets.facet_columns,
            top_n: args.facets.top_n,
            refresh_mode: args.store.refresh_mode,
        }
    }
}

#[derive(Serialize)]
struct FacetFingerprintParams<'a> {
    columns: &'a [String],
    top_n: usize,
    catch_all: &'a str,
}

pub fn run(args: FacetsArgs) -> Result<()> {
    run_stage(&FacetConfig::from(args))?;
    Ok(())
}

pub fn run_stage(config: &FacetConfig) -> Result<StageOutcome> {
    if config.top_n == 0 {
        return Err(PipelineError::InvalidTopN { top_n: 0 }.into());
    }

    let store = open_store(&config.output_root, &config.model_id)?;
    let metadata_path = store.metadata_path();
    let vectors_path = store.vectors_path();
    require_upstream(Stage::Facets, &metadata_path)?;
    require_upstream(Stage::Facets, &vectors_path)?;

    let output = store.facets_metadata_path();
    let params = FacetFingerprintParams {
        columns: &config.columns,
        top_n: config.top_n,
        catch_all: CATCH_ALL_LABEL,
    };
    let expected = Fingerprint::compute(Stage::Facets, &params, &[metadata_path.as_path()])?;
    let freshness = check_freshness(&[output.as_path()], &expected)?;

    let mut run = StageRun::start(Stage::Facets, config.refresh_mode);
    if !should_run(config.refresh_mode, freshness) {
        return run.skip(&store, &output, freshness, config);
    }

    let metadata = read_metadata_tsv(&metadata_path)?;
    let vector_rows = vector_row_count(&vectors_path)?;
    if vector_rows != metadata.row_count() {
        return Err(PipelineError::RowCountMismatch {
            vectors: vector_rows,
            metadata: metadata.row_count(),
        }
        .into());
    }

    info!(
        rows = metadata.row_count(),
        top_n = config.top_n,
        columns = ?config.columns,
        "compressing facet columns"
    );

    let (augmented, mappings) = compress(&metadata, &config.columns, config.top_n)?;
    run.set_summary(&mappings)?;

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
