use anyhow::Result;
use serde::Serialize;
use tracing::info;

use super::cluster::ClusterConfig;
use super::embed::EmbedConfig;
use super::facets::FacetConfig;
use super::reduce::ReduceConfig;
use super::{cluster, embed, facets, process_env, reduce, EnvLookup};
use crate::cli::PipelineArgs;
use crate::model::StageOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub embed: EmbedConfig,
    pub reduce: ReduceConfig,
    pub cluster: ClusterConfig,
    pub facets: FacetConfig,
}

impl From<PipelineArgs> for PipelineConfig {
    fn from(args: PipelineArgs) -> Self {
        let store = args.store;
        Self {
            embed: EmbedConfig {
                input: args.input,
                output_root: store.output_root.clone(),
                model_id: store.model_id.clone(),
                text_columns: args.text.text_columns,
                batch_size: args.text.batch_size,
                refresh_mode: store.refresh_mode,
            },
            reduce: ReduceConfig {
                output_root: store.output_root.clone(),
                model_id: store.model_id.clone(),
                params: ReduceConfig::params_from(args.umap_dims, &args.umap),
                refresh_mode: store.refresh_mode,
            },
            cluster: ClusterConfig {
                output_root: store.output_root.clone(),
                model_id: store.model_id.clone(),
                levels: args.levels.levels,
                umap_dims: args.umap_dims,
                refresh_mode: store.refresh_mode,
            },
            facets: FacetConfig {
                output_root: store.output_root,
                model_id: store.model_id,
                columns: args.facets.facet_columns,
                top_n: args.facets.top_n,
                refresh_mode: store.refresh_mode,
            },
        }
    }
}

pub fn run(args: PipelineArgs) -> Result<()> {
    run_stages(&PipelineConfig::from(args), &process_env)?;
    Ok(())
}

/// Runs the stages in order and stops at the first failure.
pub fn run_stages(config: &PipelineConfig, env: EnvLookup<'_>) -> Result<Vec<StageOutcome>> {
    let outcomes = vec![
        embed::run_stage(&config.embed, env)?,
        reduce::run_stage(&config.reduce)?,
        cluster::run_stage(&config.cluster)?,
        facets::run_stage(&config.facets)?,
    ];

    for outcome in &outcomes {
        info!(
            stage = %outcome.stage,
            status = outcome.status.as_str(),
            path = %outcome.artifact.display(),
            rows = outcome.rows.unwrap_or_default(),
            "pipeline stage"
        );
    }

    Ok(outcomes)
}
