use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::cluster::{self, ClusterConfig};
use super::embed::{self, EmbedConfig};
use super::facets::{self, FacetConfig};
use super::pipeline::{run_stages, PipelineConfig};
use super::reduce::{self, ReduceConfig};
use super::{open_store, status};
use crate::artifacts::{read_fingerprint, Freshness, Stage};
use crate::cli::RefreshMode;
use crate::error::PipelineError;
use crate::model::StageStatus;
use crate::reduce::ReduceParams;
use crate::semantic::DEFAULT_MODEL_ID;
use crate::table::read_metadata_tsv;
use crate::vectors::read_vectors_tsv;

const MODEL: &str = "local-hash-32";

fn no_env(_: &str) -> Option<String> {
    None
}

fn write_books(dir: &Path) -> PathBuf {
    let themes = [
        ("space", "starship crew explores distant galaxy", "scifi"),
        ("garden", "roses tulips and soil through the seasons", "gardening"),
        ("detective", "inspector solves a murder in the fog", "mystery"),
        ("kitchen", "bread pastry and slow cooked stews", "cooking"),
    ];
    let publishers = ["Acme", "Zenith", "Acme", "Northwind", "Acme", "Orbit"];

    let mut csv = String::from("title,description,genre,publisher\n");
    for index in 0..24 {
        let (topic, blurb, genre) = themes[index % themes.len()];
        let genre = if index == 23 { "poetry" } else { genre };
        csv.push_str(&format!(
            "\"{topic} volume {index}\",\"{blurb}, part {index}\",{genre},{}\n",
            publishers[index % publishers.len()]
        ));
    }

    let path = dir.join("books.csv");
    fs::write(&path, csv).expect("write books");
    path
}

fn pipeline_config(root: &Path, input: &Path) -> PipelineConfig {
    let output_root = root.join("output");
    PipelineConfig {
        embed: EmbedConfig {
            input: input.to_path_buf(),
            output_root: output_root.clone(),
            model_id: MODEL.to_string(),
            text_columns: vec!["title".to_string(), "description".to_string()],
            batch_size: 5,
            refresh_mode: RefreshMode::MissingOrStale,
        },
        reduce: ReduceConfig {
            output_root: output_root.clone(),
            model_id: MODEL.to_string(),
            params: ReduceParams::default(),
            refresh_mode: RefreshMode::MissingOrStale,
        },
        cluster: ClusterConfig {
            output_root: output_root.clone(),
            model_id: MODEL.to_string(),
            levels: vec![2, 4],
            umap_dims: 0,
            refresh_mode: RefreshMode::MissingOrStale,
        },
        facets: FacetConfig {
            output_root,
            model_id: MODEL.to_string(),
            columns: vec!["genre".to_string()],
            top_n: 3,
            refresh_mode: RefreshMode::MissingOrStale,
        },
    }
}

fn pipeline_error(err: &anyhow::Error) -> &PipelineError {
    err.downcast_ref::<PipelineError>()
        .unwrap_or_else(|| panic!("expected a pipeline error, got: {err:#}"))
}

#[test]
fn pipeline_writes_row_aligned_artifacts() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);

    let outcomes = run_stages(&config, &no_env).expect("pipeline");
    let statuses = outcomes
        .iter()
        .map(|outcome| (outcome.stage, outcome.status))
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![
            (Stage::Embed, StageStatus::Completed),
            (Stage::Reduce, StageStatus::Disabled),
            (Stage::Cluster, StageStatus::Completed),
            (Stage::Facets, StageStatus::Completed),
        ]
    );

    let store = open_store(&config.embed.output_root, MODEL).expect("store");
    assert_eq!(store.slug(), "local-hash-32");

    let vectors = read_vectors_tsv(&store.vectors_path()).expect("vectors");
    let metadata = read_metadata_tsv(&store.metadata_path()).expect("metadata");
    assert_eq!(vectors.len(), 24);
    assert_eq!(vectors.dimensions(), 32);
    assert_eq!(metadata.row_count(), 24);
    assert_eq!(metadata.columns(), &["title", "description", "genre", "publisher"]);
    assert_eq!(metadata.rows()[1][1], "roses tulips and soil through the seasons, part 1");

    let clusters = read_metadata_tsv(&store.clusters_metadata_path()).expect("clusters");
    assert_eq!(
        clusters.columns(),
        &["title", "description", "genre", "publisher", "cluster_2", "cluster_4"]
    );
    assert_eq!(&clusters.rows()[5][..4], metadata.rows()[5].as_slice());
    for (index, level) in [(4, 2usize), (5, 4usize)] {
        let labels = clusters
            .column_values(index)
            .map(|value| value.parse::<usize>().expect("numeric label"))
            .collect::<Vec<usize>>();
        assert_eq!(labels.len(), 24);
        assert!(labels.iter().all(|label| *label < level));
    }

    let facets = read_metadata_tsv(&store.facets_metadata_path()).expect("facets");
    assert_eq!(facets.columns().last().map(String::as_str), Some("genre_top3"));
    let compressed = facets.column_values(4).collect::<Vec<&str>>();
    assert_eq!(compressed[23], "Other");
    assert_eq!(compressed[3], "Other");
    assert_eq!(compressed[0], "scifi");

    for outcome in &outcomes {
        assert!(outcome.manifest_path.is_file(), "{}", outcome.manifest_path.display());
    }
}

#[test]
fn rerun_skips_fresh_artifacts() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);
    run_stages(&config, &no_env).expect("first run");

    let store = open_store(&config.embed.output_root, MODEL).expect("store");
    let before = fs::read(store.vectors_path()).expect("read vectors");

    let outcomes = run_stages(&config, &no_env).expect("second run");
    for outcome in outcomes.iter().filter(|outcome| outcome.stage != Stage::Reduce) {
        assert_eq!(outcome.status, StageStatus::Skipped, "{}", outcome.stage);
        assert_eq!(outcome.freshness, Some(Freshness::Fresh));
    }
    assert_eq!(outcomes[0].rows, Some(24));
    assert_eq!(fs::read(store.vectors_path()).expect("read vectors"), before);
}

#[test]
fn changed_parameters_make_artifacts_stale() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);
    run_stages(&config, &no_env).expect("pipeline");
    let store = open_store(&config.facets.output_root, MODEL).expect("store");

    let mut facets_config = config.facets.clone();
    facets_config.top_n = 2;
    let outcome = facets::run_stage(&facets_config).expect("recompute");
    assert_eq!(outcome.status, StageStatus::Completed);
    assert_eq!(outcome.freshness, Some(Freshness::Stale));
    let table = read_metadata_tsv(&store.facets_metadata_path()).expect("facets");
    assert_eq!(table.columns().last().map(String::as_str), Some("genre_top2"));

    // Existence-only mode keeps the artifact even though top_n changed.
    facets_config.top_n = 4;
    facets_config.refresh_mode = RefreshMode::Missing;
    let outcome = facets::run_stage(&facets_config).expect("missing mode");
    assert_eq!(outcome.status, StageStatus::Skipped);
    assert_eq!(outcome.freshness, Some(Freshness::Stale));
    let table = read_metadata_tsv(&store.facets_metadata_path()).expect("facets");
    assert_eq!(table.columns().last().map(String::as_str), Some("genre_top2"));

    facets_config.top_n = 2;
    facets_config.refresh_mode = RefreshMode::Full;
    let outcome = facets::run_stage(&facets_config).expect("full mode");
    assert_eq!(outcome.status, StageStatus::Completed);
    assert_eq!(outcome.freshness, Some(Freshness::Fresh));
}

#[test]
fn changed_input_invalidates_downstream_stages() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);
    run_stages(&config, &no_env).expect("pipeline");

    let mut csv = fs::read_to_string(&input).expect("read input");
    csv.push_str("\"late arrival\",\"an extra row\",poetry,Acme\n");
    fs::write(&input, csv).expect("rewrite input");

    let outcomes = run_stages(&config, &no_env).expect("rerun");
    assert_eq!(outcomes[0].status, StageStatus::Completed);
    assert_eq!(outcomes[0].rows, Some(25));
    assert_eq!(outcomes[2].status, StageStatus::Completed);
    assert_eq!(outcomes[3].status, StageStatus::Completed);

    let store = open_store(&config.cluster.output_root, MODEL).expect("store");
    let clusters = read_metadata_tsv(&store.clusters_metadata_path()).expect("clusters");
    assert_eq!(clusters.row_count(), 25);
}

#[test]
fn downstream_stages_require_upstream_artifacts() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);

    let err = cluster::run_stage(&config.cluster).expect_err("no vectors yet");
    match pipeline_error(&err) {
        PipelineError::MissingUpstreamArtifact { stage, path } => {
            assert_eq!(stage, "cluster");
            assert!(path.ends_with("local-hash-32/projector_vectors.tsv"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut reduce_config = config.reduce.clone();
    reduce_config.params.target_dim = 2;
    let err = reduce::run_stage(&reduce_config).expect_err("no vectors yet");
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::MissingUpstreamArtifact { stage, .. } if stage == "reduce"
    ));

    let err = facets::run_stage(&config.facets).expect_err("no metadata yet");
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::MissingUpstreamArtifact { stage, .. } if stage == "facets"
    ));

    embed::run_stage(&config.embed, &no_env).expect("embed");
    let mut cluster_config = config.cluster.clone();
    cluster_config.umap_dims = 2;
    let err = cluster::run_stage(&cluster_config).expect_err("no reduction yet");
    match pipeline_error(&err) {
        PipelineError::MissingUpstreamArtifact { path, .. } => {
            assert!(path.ends_with("projector_umap2_vectors.tsv"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn invalid_cluster_level_writes_no_artifact() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);
    embed::run_stage(&config.embed, &no_env).expect("embed");

    let mut cluster_config = config.cluster.clone();
    cluster_config.levels = vec![3, 100];
    let err = cluster::run_stage(&cluster_config).expect_err("level above row count");
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::InvalidClusterLevel { level: 100, rows: 24 }
    ));

    let store = open_store(&config.cluster.output_root, MODEL).expect("store");
    assert!(!store.clusters_metadata_path().exists());

    cluster_config.levels = Vec::new();
    let err = cluster::run_stage(&cluster_config).expect_err("no levels");
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::InvalidParameter { name, .. } if name == "levels"
    ));
}

#[test]
fn mismatched_metadata_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);
    embed::run_stage(&config.embed, &no_env).expect("embed");

    let store = open_store(&config.cluster.output_root, MODEL).expect("store");
    let mut metadata = fs::read_to_string(store.metadata_path()).expect("read metadata");
    metadata.push_str("stray\trow\tx\ty\n");
    fs::write(store.metadata_path(), metadata).expect("rewrite metadata");

    let err = cluster::run_stage(&config.cluster).expect_err("25 metadata rows");
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::RowCountMismatch { vectors: 24, metadata: 25 }
    ));

    let err = facets::run_stage(&config.facets).expect_err("25 metadata rows");
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::RowCountMismatch { vectors: 24, metadata: 25 }
    ));
}

#[test]
fn reduced_vectors_feed_clustering() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let mut config = pipeline_config(dir.path(), &input);
    config.reduce.params = ReduceParams {
        target_dim: 2,
        n_neighbors: 5,
        n_epochs: Some(40),
        ..ReduceParams::default()
    };
    config.cluster.umap_dims = 2;

    let outcomes = run_stages(&config, &no_env).expect("pipeline");
    assert_eq!(outcomes[1].status, StageStatus::Completed);
    assert_eq!(outcomes[1].dimensions, Some(2));

    let store = open_store(&config.reduce.output_root, MODEL).expect("store");
    let reduced = read_vectors_tsv(&store.reduced_vectors_path(2)).expect("reduced");
    assert_eq!(reduced.len(), 24);
    assert_eq!(reduced.dimensions(), 2);

    let recorded = read_fingerprint(&store.clusters_metadata_path())
        .expect("read fingerprint")
        .expect("fingerprint present");
    assert!(recorded
        .upstream
        .iter()
        .any(|digest| digest.path.ends_with("projector_umap2_vectors.tsv")));

    let reports = status::collect(&store).expect("status");
    let names = reports
        .iter()
        .map(|report| report.name.as_str())
        .collect::<Vec<&str>>();
    assert_eq!(names, vec!["vectors", "metadata", "umap2", "clusters", "facets"]);
    assert!(reports.iter().all(|report| report.present));
    assert_eq!(reports[2].rows, Some(24));
    assert_eq!(reports[2].dimensions, Some(2));
}

#[test]
fn reduce_rejects_too_few_rows_for_the_neighbourhood() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);
    embed::run_stage(&config.embed, &no_env).expect("embed");

    let mut reduce_config = config.reduce.clone();
    reduce_config.params.target_dim = 2;
    reduce_config.params.n_neighbors = 30;
    let err = reduce::run_stage(&reduce_config).expect_err("24 rows < 30 neighbours");
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::DegenerateInput { rows: 24, required: 30, .. }
    ));

    let store = open_store(&config.reduce.output_root, MODEL).expect("store");
    assert!(!store.reduced_vectors_path(2).exists());
}

#[test]
fn single_column_scenario_collapses_the_rare_value() {
    let dir = TempDir::new().expect("temp dir");
    let input = dir.path().join("letters.csv");
    fs::write(&input, "text\na\nb\na\n").expect("write input");

    let output_root = dir.path().join("output");
    let embed_config = EmbedConfig {
        input,
        output_root: output_root.clone(),
        model_id: "local-hash-16".to_string(),
        text_columns: Vec::new(),
        batch_size: 64,
        refresh_mode: RefreshMode::MissingOrStale,
    };
    let outcome = embed::run_stage(&embed_config, &no_env).expect("embed");
    assert_eq!((outcome.rows, outcome.dimensions), (Some(3), Some(16)));

    let store = open_store(&output_root, "local-hash-16").expect("store");
    let vectors = read_vectors_tsv(&store.vectors_path()).expect("vectors");
    assert_eq!(vectors.row(0), vectors.row(2));

    let facet_config = FacetConfig {
        output_root,
        model_id: "local-hash-16".to_string(),
        columns: vec!["text".to_string()],
        top_n: 1,
        refresh_mode: RefreshMode::MissingOrStale,
    };
    facets::run_stage(&facet_config).expect("facets");
    let table = read_metadata_tsv(&store.facets_metadata_path()).expect("facets");
    assert_eq!(table.columns(), &["text", "text_top1"]);
    assert_eq!(table.column_values(1).collect::<Vec<&str>>(), vec!["a", "Other", "a"]);
    assert_eq!(table.column_values(0).collect::<Vec<&str>>(), vec!["a", "b", "a"]);
}

#[test]
fn embed_reports_input_column_and_backend_errors() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);

    let mut missing_input = config.embed.clone();
    missing_input.input = dir.path().join("absent.csv");
    let err = embed::run_stage(&missing_input, &no_env).expect_err("missing input");
    assert!(matches!(pipeline_error(&err), PipelineError::InputNotFound { .. }));

    let mut bad_column = config.embed.clone();
    bad_column.text_columns = vec!["title".to_string(), "subtitle".to_string()];
    let err = embed::run_stage(&bad_column, &no_env).expect_err("missing column");
    match pipeline_error(&err) {
        PipelineError::ColumnNotFound { missing, .. } => assert_eq!(missing, &["subtitle"]),
        other => panic!("unexpected error: {other}"),
    }
    let store = open_store(&config.embed.output_root, MODEL).expect("store");
    assert!(!store.vectors_path().exists());

    let mut unknown = config.embed.clone();
    unknown.model_id = "acme/unknown-encoder".to_string();
    let err = embed::run_stage(&unknown, &no_env).expect_err("unknown backend");
    assert!(matches!(pipeline_error(&err), PipelineError::BackendUnavailable { .. }));
}

#[test]
fn gated_backend_needs_its_credential() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let mut embed_config = pipeline_config(dir.path(), &input).embed;
    embed_config.model_id = "google/embeddinggemma-300m".to_string();

    let err = embed::run_stage(&embed_config, &no_env).expect_err("no token");
    match pipeline_error(&err) {
        PipelineError::BackendAuthRequired { env_var, .. } => assert_eq!(env_var, "HF_TOKEN"),
        other => panic!("unexpected error: {other}"),
    }

    let with_token = |name: &str| (name == "HF_TOKEN").then(|| "hf_test".to_string());
    let err = embed::run_stage(&embed_config, &with_token).expect_err("no runtime");
    assert!(matches!(pipeline_error(&err), PipelineError::BackendUnavailable { .. }));

    let store = open_store(&embed_config.output_root, &embed_config.model_id).expect("store");
    assert!(store.root().ends_with("embeddinggemma-300m"));
    assert!(!store.vectors_path().exists());
}

#[test]
fn catalog_model_without_runtime_writes_nothing() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let mut embed_config = pipeline_config(dir.path(), &input).embed;
    embed_config.model_id = DEFAULT_MODEL_ID.to_string();

    let err = embed::run_stage(&embed_config, &no_env).expect_err("no runtime");
    match pipeline_error(&err) {
        PipelineError::BackendUnavailable { model_id, .. } => {
            assert_eq!(model_id, DEFAULT_MODEL_ID)
        }
        other => panic!("unexpected error: {other}"),
    }

    let store = open_store(&embed_config.output_root, DEFAULT_MODEL_ID).expect("store");
    assert!(!store.vectors_path().exists());
    assert!(!store.metadata_path().exists());
}

#[test]
fn failed_metadata_write_leaves_no_vectors_behind() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);
    let store = open_store(&config.embed.output_root, MODEL).expect("store");
    fs::create_dir_all(store.metadata_path()).expect("occupy metadata path");

    embed::run_stage(&config.embed, &no_env).expect_err("metadata cannot be placed");

    assert!(!store.vectors_path().exists());
    assert!(read_fingerprint(&store.vectors_path()).expect("read").is_none());
    assert!(store.metadata_path().is_dir());
}

#[test]
fn clustering_rejects_vectors_replaced_with_another_width() {
    let dir = TempDir::new().expect("temp dir");
    let input = write_books(dir.path());
    let config = pipeline_config(dir.path(), &input);
    embed::run_stage(&config.embed, &no_env).expect("embed");

    let store = open_store(&config.embed.output_root, MODEL).expect("store");
    fs::write(store.vectors_path(), "0.1\t0.2\t0.3\n".repeat(24)).expect("replace vectors");

    let err = cluster::run_stage(&config.cluster).expect_err("width changed");
    match pipeline_error(&err) {
        PipelineError::DimensionMismatch {
            expected, actual, ..
        } => assert_eq!((*expected, *actual), (32, 3)),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!store.clusters_metadata_path().exists());
}

#[test]
fn repeated_source_headers_stay_addressable() {
    let dir = TempDir::new().expect("temp dir");
    let input = dir.path().join("shelves.csv");
    let mut csv = String::from("title,genre,genre\n");
    for index in 0..6 {
        let shelf = if index < 4 { "front" } else { "back" };
        csv.push_str(&format!("book {index},drama,{shelf}\n"));
    }
    fs::write(&input, csv).expect("write input");

    let mut config = pipeline_config(dir.path(), &input);
    config.embed.text_columns = vec!["title".to_string()];
    config.facets.columns = vec!["genre".to_string(), "genre.1".to_string()];
    config.facets.top_n = 1;
    embed::run_stage(&config.embed, &no_env).expect("embed");
    facets::run_stage(&config.facets).expect("facets");

    let store = open_store(&config.facets.output_root, MODEL).expect("store");
    let table = read_metadata_tsv(&store.facets_metadata_path()).expect("facets metadata");
    assert_eq!(
        table.columns(),
        &["title", "genre", "genre.1", "genre_top1", "genre.1_top1"]
    );
    let shelves = table.column_values(4).collect::<Vec<&str>>();
    assert_eq!(shelves, vec!["front", "front", "front", "front", "Other", "Other"]);
}

#[test]
fn blank_documents_are_recorded_as_warnings() {
    let dir = TempDir::new().expect("temp dir");
    let input = dir.path().join("sparse.tsv");
    fs::write(&input, "title\tnotes\nDune\tclassic\n\t\nEmma\t\n").expect("write input");

    let embed_config = EmbedConfig {
        input,
        output_root: dir.path().join("output"),
        model_id: MODEL.to_string(),
        text_columns: Vec::new(),
        batch_size: 2,
        refresh_mode: RefreshMode::Full,
    };
    let outcome = embed::run_stage(&embed_config, &no_env).expect("embed");
    assert_eq!(outcome.rows, Some(3));

    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(&outcome.manifest_path).expect("read manifest"))
            .expect("parse manifest");
    assert_eq!(manifest["stage"], "embed");
    assert_eq!(manifest["status"], "completed");
    assert_eq!(manifest["refresh_mode"], "full");
    assert_eq!(manifest["warnings"].as_array().map(Vec::len), Some(1));
}
