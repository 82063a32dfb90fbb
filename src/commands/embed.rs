use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::{open_store, process_env, EnvLookup, StageRun};
use crate::artifacts::{
    check_freshness, remove_fingerprint, should_run, write_fingerprint, Fingerprint, Stage,
};
use crate::cli::{EmbedArgs, RefreshMode};
use crate::error::PipelineError;
use crate::model::{StageOutcome, StageStatus};
use crate::semantic::{
    embed_documents, resolve_backend, resolve_model_config, SemanticModelConfig,
};
use crate::table::{combine_row_text, read_source_table, stage_metadata_tsv, TEXT_SEPARATOR};
use crate::util::persist_together;
use crate::vectors::stage_vectors_tsv;

#[derive(Debug, Clone, Serialize)]
pub struct EmbedConfig {
    pub input: PathBuf,
    pub output_root: PathBuf,
    pub model_id: String,
    pub text_columns: Vec<String>,
    pub batch_size: usize,
    pub refresh_mode: RefreshMode,
}

impl From<EmbedArgs> for EmbedConfig {
    fn from(args: EmbedArgs) -> Self {
        Self {
            input: args.input,
            output_root: args.store.output_root,
            model_id: args.store.model_id,
            text_columns: args.text.text_columns,
            batch_size: args.text.batch_size,
            refresh_mode: args.store.refresh_mode,
        }
    }
}

/// Everything that changes the vectors. Batch size does not.
#[derive(Serialize)]
struct EmbedFingerprintParams<'a> {
    model: &'a SemanticModelConfig,
    text_columns: &'a [String],
    separator: &'a str,
}

pub fn run(args: EmbedArgs) -> Result<()> {
    run_stage(&EmbedConfig::from(args), &process_env)?;
    Ok(())
}

pub fn run_stage(config: &EmbedConfig, env: EnvLookup<'_>) -> Result<StageOutcome> {
    if !config.input.is_file() {
        return Err(PipelineError::InputNotFound {
            path: config.input.clone(),
        }
        .into());
    }

    let store = open_store(&config.output_root, &config.model_id)?;
    let model = resolve_model_config(&config.model_id)?;
    let vectors_path = store.vectors_path();
    let metadata_path = store.metadata_path();

    let params = EmbedFingerprintParams {
        model: &model,
        text_columns: &config.text_columns,
        separator: TEXT_SEPARATOR,
    };
    let expected = Fingerprint::compute(Stage::Embed, &params, &[config.input.as_path()])?;
    let freshness = check_freshness(&[vectors_path.as_path(), metadata_path.as_path()], &expected)?;

    let mut run = StageRun::start(Stage::Embed, config.refresh_mode);
    if !should_run(config.refresh_mode, freshness) {
        return run.skip(&store, &vectors_path, freshness, config);
    }

    let embedder = resolve_backend(&config.model_id, env)?;

    info!(
        input = %config.input.display(),
        model_id = %model.model_id,
        slug = store.slug(),
        freshness = freshness.as_str(),
        "embedding source table"
    );

    let table = read_source_table(&config.input)?;
    let documents = combine_row_text(&table, &config.text_columns)?;

    let blank_rows = documents
        .iter()
        .filter(|document| document.trim().is_empty())
        .count();
    if blank_rows > 0 {
        warn!(blank_rows, "rows with no text embed as zero vectors");
        run.warn(format!("{blank_rows} rows have no text in the selected columns"));
    }

    let vectors = embed_documents(embedder.as_ref(), &documents, config.batch_size)?;
    if vectors.len() != table.row_count() {
        return Err(PipelineError::RowCountMismatch {
            vectors: vectors.len(),
            metadata: table.row_count(),
        }
        .into());
    }

    remove_fingerprint(&vectors_path)?;
    persist_together(vec![
        stage_vectors_tsv(&vectors_path, &vectors)?,
        stage_metadata_tsv(&metadata_path, &table)?,
    ])?;

    let fingerprint = expected.with_shape(vectors.len(), Some(vectors.dimensions()));
    write_fingerprint(&vectors_path, &fingerprint)?;

    info!(
        rows = vectors.len(),
        dims = vectors.dimensions(),
        vectors = %vectors_path.display(),
        metadata = %metadata_path.display(),
        "embedding artifacts written"
    );

    run.finish(
        &store,
        StageStatus::Completed,
        &vectors_path,
        Some(freshness),
        Some(&fingerprint),
        config,
    )
}
