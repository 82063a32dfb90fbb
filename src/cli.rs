use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::cluster::DEFAULT_LEVELS;
use crate::facets::DEFAULT_TOP_N;
use crate::reduce::{DEFAULT_MIN_DIST, DEFAULT_N_NEIGHBORS, DEFAULT_SEED};
use crate::semantic::DEFAULT_MODEL_ID;

#[derive(Parser, Debug)]
#[command(
    name = "projector-prep",
    version,
    about = "Prepare vectors, layouts, clusters and facets for the Embedding Projector"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Embed(EmbedArgs),
    Reduce(ReduceArgs),
    Cluster(ClusterArgs),
    Facets(FacetsArgs),
    Pipeline(PipelineArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshMode {
    /// Always recompute.
    Full,
    /// Recompute when the artifact is absent or its fingerprint no longer matches.
    MissingOrStale,
    /// Recompute only when the artifact is absent, even if parameters changed.
    Missing,
}

impl RefreshMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::MissingOrStale => "missing-or-stale",
            Self::Missing => "missing",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, default_value = "output")]
    pub output_root: PathBuf,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long, value_enum, default_value_t = RefreshMode::MissingOrStale)]
    pub refresh_mode: RefreshMode,
}

#[derive(Args, Debug, Clone)]
pub struct TextArgs {
    /// Columns to embed, comma-separated (default: all columns).
    #[arg(long = "text-columns", short = 't', value_delimiter = ',')]
    pub text_columns: Vec<String>,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
}

#[derive(Args, Debug, Clone)]
pub struct UmapArgs {
    #[arg(long, default_value_t = DEFAULT_N_NEIGHBORS)]
    pub n_neighbors: usize,

    #[arg(long, default_value_t = DEFAULT_MIN_DIST)]
    pub min_dist: f32,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    #[arg(long)]
    pub n_epochs: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct LevelArgs {
    /// Cluster counts to cut the hierarchy at.
    #[arg(
        long,
        short = 'l',
        num_args = 1..,
        value_delimiter = ',',
        default_values_t = DEFAULT_LEVELS
    )]
    pub levels: Vec<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct FacetArgs {
    /// Columns to compress, comma-separated (default: all columns).
    #[arg(long = "facet-columns", short = 'c', value_delimiter = ',')]
    pub facet_columns: Vec<String>,

    #[arg(long, short = 'n', default_value_t = DEFAULT_TOP_N)]
    pub top_n: usize,
}

#[derive(Args, Debug, Clone)]
pub struct EmbedArgs {
    pub input: PathBuf,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub text: TextArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ReduceArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Target dimensionality; 0 disables reduction.
    #[arg(long, short = 'd', default_value_t = 50)]
    pub umap_dims: usize,

    #[command(flatten)]
    pub umap: UmapArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Cluster the UMAP output of this dimensionality; 0 clusters raw vectors.
    #[arg(long, default_value_t = 0)]
    pub umap_dims: usize,

    #[command(flatten)]
    pub levels: LevelArgs,
}

#[derive(Args, Debug, Clone)]
pub struct FacetsArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub facets: FacetArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    pub input: PathBuf,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub text: TextArgs,

    /// UMAP dimensionality used as clustering input; 0 skips reduction.
    #[arg(long, short = 'd', default_value_t = 0)]
    pub umap_dims: usize,

    #[command(flatten)]
    pub umap: UmapArgs,

    #[command(flatten)]
    pub levels: LevelArgs,

    #[command(flatten)]
    pub facets: FacetArgs,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "output")]
    pub output_root: PathBuf,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn pipeline_args_accept_comma_lists() {
        let cli = Cli::try_parse_from([
            "projector-prep",
            "pipeline",
            "books.csv",
            "--text-columns",
            "title,description",
            "--levels",
            "3,5,10",
            "--facet-columns",
            "publisher,genre",
            "--top-n",
            "8",
        ])
        .expect("parse pipeline args");

        let Commands::Pipeline(args) = cli.command else {
            panic!("expected pipeline command");
        };
        assert_eq!(args.text.text_columns, vec!["title", "description"]);
        assert_eq!(args.levels.levels, vec![3, 5, 10]);
        assert_eq!(args.facets.facet_columns, vec!["publisher", "genre"]);
        assert_eq!(args.facets.top_n, 8);
        assert_eq!(args.umap_dims, 0);
        assert_eq!(args.store.refresh_mode, RefreshMode::MissingOrStale);
    }

    #[test]
    fn cluster_levels_default_to_four_granularities() {
        let cli = Cli::try_parse_from(["projector-prep", "cluster"]).expect("parse");
        let Commands::Cluster(args) = cli.command else {
            panic!("expected cluster command");
        };
        assert_eq!(args.levels.levels, vec![3, 5, 10, 20]);
        assert_eq!(args.store.model_id, DEFAULT_MODEL_ID);
    }
}
