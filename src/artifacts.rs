//! On-disk artifact store, one directory per embedding backend, plus the
//! fingerprint sidecars that decide whether a stage can be skipped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::RefreshMode;
use crate::error::PipelineError;
use crate::semantic::backend_slug;
use crate::util::{now_utc_string, sha256_file, sha256_hex, write_json_pretty};

pub const VECTORS_FILE: &str = "projector_vectors.tsv";
pub const METADATA_FILE: &str = "projector_metadata.tsv";
pub const CLUSTERS_METADATA_FILE: &str = "projector_clusters_metadata.tsv";
pub const FACETS_METADATA_FILE: &str = "projector_facets_metadata.tsv";
pub const FINGERPRINT_SUFFIX: &str = ".fingerprint.json";
pub const FINGERPRINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Embed,
    Reduce,
    Cluster,
    Facets,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embed => "embed",
            Self::Reduce => "reduce",
            Self::Cluster => "cluster",
            Self::Facets => "facets",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    slug: String,
    root: PathBuf,
}

impl ArtifactStore {
    pub fn for_backend(output_root: &Path, model_id: &str) -> Self {
        let slug = backend_slug(model_id);
        Self {
            root: output_root.join(&slug),
            slug,
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.root.join(VECTORS_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn reduced_vectors_path(&self, dims: usize) -> PathBuf {
        self.root.join(format!("projector_umap{dims}_vectors.tsv"))
    }

    /// Raw vectors when `umap_dims` is 0, otherwise the matching reduction.
    pub fn cluster_input_path(&self, umap_dims: usize) -> PathBuf {
        if umap_dims == 0 {
            self.vectors_path()
        } else {
            self.reduced_vectors_path(umap_dims)
        }
    }

    pub fn clusters_metadata_path(&self) -> PathBuf {
        self.root.join(CLUSTERS_METADATA_FILE)
    }

    pub fn facets_metadata_path(&self) -> PathBuf {
        self.root.join(FACETS_METADATA_FILE)
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    /// Reduced-vector artifacts currently present, by dimension.
    pub fn existing_reductions(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to read entry in {}", self.root.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let dims = name
                .strip_prefix("projector_umap")
                .and_then(|rest| rest.strip_suffix("_vectors.tsv"))
                .and_then(|dims| dims.parse::<usize>().ok());
            if let Some(dims) = dims {
                found.push((dims, entry.path()));
            }
        }

        found.sort();
        Ok(found)
    }
}

pub fn require_upstream(stage: Stage, path: &Path) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::MissingUpstreamArtifact {
            stage: stage.to_string(),
            path: path.to_path_buf(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDigest {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub fingerprint_version: u32,
    pub stage: Stage,
    pub fingerprint: String,
    pub params: serde_json::Value,
    pub upstream: Vec<UpstreamDigest>,
    pub rows: Option<usize>,
    pub dimensions: Option<usize>,
    pub created_at: String,
}

impl Fingerprint {
    /// Digest over the stage, its effective parameters and the content of every
    /// upstream file.
    pub fn compute<P: Serialize>(stage: Stage, params: &P, upstream: &[&Path]) -> Result<Self> {
        let params = serde_json::to_value(params)
            .with_context(|| format!("failed to serialize {stage} parameters"))?;

        let mut digests = Vec::with_capacity(upstream.len());
        for path in upstream {
            digests.push(UpstreamDigest {
                path: path.display().to_string(),
                sha256: sha256_file(path)?,
            });
        }

        let mut payload = format!("v{FINGERPRINT_VERSION}|{stage}|{params}");
        for digest in &digests {
            payload.push('|');
            payload.push_str(&digest.sha256);
        }

        Ok(Self {
            fingerprint_version: FINGERPRINT_VERSION,
            stage,
            fingerprint: sha256_hex(payload.as_bytes()),
            params,
            upstream: digests,
            rows: None,
            dimensions: None,
            created_at: now_utc_string(),
        })
    }

    pub fn with_shape(mut self, rows: usize, dimensions: Option<usize>) -> Self {
        self.rows = Some(rows);
        self.dimensions = dimensions;
        self
    }
}

pub fn fingerprint_path(artifact: &Path) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(FINGERPRINT_SUFFIX);
    artifact.with_file_name(name)
}

pub fn read_fingerprint(artifact: &Path) -> Result<Option<Fingerprint>> {
    let path = fingerprint_path(artifact);
    if !path.is_file() {
        return Ok(None);
    }

    let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let fingerprint = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(fingerprint))
}

pub fn write_fingerprint(artifact: &Path, fingerprint: &Fingerprint) -> Result<()> {
    write_json_pretty(&fingerprint_path(artifact), fingerprint)
}

/// Drops the sidecar before an artifact is rewritten, so an interrupted rewrite is
/// never mistaken for a fresh one.
pub fn remove_fingerprint(artifact: &Path) -> Result<()> {
    let path = fingerprint_path(artifact);
    if path.is_file() {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Missing,
    /// Present, but written without a fingerprint.
    Untracked,
    Stale,
    Fresh,
}

impl Freshness {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Untracked => "untracked",
            Self::Stale => "stale",
            Self::Fresh => "fresh",
        }
    }
}

/// Compares what is on disk against `expected`. Every path in `artifacts` must
/// exist; the first one carries the fingerprint sidecar.
pub fn check_freshness(artifacts: &[&Path], expected: &Fingerprint) -> Result<Freshness> {
    if artifacts.iter().any(|path| !path.is_file()) {
        return Ok(Freshness::Missing);
    }
    let Some(primary) = artifacts.first() else {
        return Ok(Freshness::Missing);
    };

    let freshness = match read_fingerprint(primary) {
        Ok(Some(recorded)) if recorded.fingerprint == expected.fingerprint => Freshness::Fresh,
        Ok(Some(_)) => Freshness::Stale,
        Ok(None) => Freshness::Untracked,
        Err(_) => Freshness::Stale,
    };
    Ok(freshness)
}

pub fn should_run(mode: RefreshMode, freshness: Freshness) -> bool {
    match mode {
        RefreshMode::Full => true,
        RefreshMode::Missing => freshness == Freshness::Missing,
        RefreshMode::MissingOrStale => freshness != Freshness::Fresh,
    }
}
