pub mod cluster;
pub mod embed;
pub mod facets;
pub mod pipeline;
pub mod reduce;
pub mod status;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::artifacts::{read_fingerprint, ArtifactStore, Fingerprint, Freshness, Stage};
use crate::cli::RefreshMode;
use crate::error::PipelineError;
use crate::model::{StageOutcome, StageRunManifest, StageStatus, MANIFEST_VERSION};
use crate::semantic::resolve_model_config;
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};
use crate::vectors::{read_vectors_tsv, VectorSet};

/// Looks up credential variables; stages take it as a parameter so tests never touch
/// the process environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Resolves the backend first so every stage agrees on the canonical namespace.
pub(crate) fn open_store(output_root: &Path, model_id: &str) -> Result<ArtifactStore> {
    let model = resolve_model_config(model_id)?;
    Ok(ArtifactStore::for_backend(output_root, &model.model_id))
}

/// Row count of a vector artifact, taken from its fingerprint when one was recorded.
pub(crate) fn vector_row_count(path: &Path) -> Result<usize> {
    if let Some(rows) = read_fingerprint(path)?.and_then(|recorded| recorded.rows) {
        return Ok(rows);
    }
    Ok(read_vectors_tsv(path)?.len())
}

/// The writing stage records the dimension; a vector file that disagrees was replaced
/// behind the store's back.
pub(crate) fn check_recorded_dimensions(path: &Path, vectors: &VectorSet) -> Result<()> {
    let recorded = read_fingerprint(path)?.and_then(|fingerprint| fingerprint.dimensions);
    match recorded {
        Some(expected) if !vectors.is_empty() && expected != vectors.dimensions() => {
            Err(PipelineError::DimensionMismatch {
                row: 0,
                expected,
                actual: vectors.dimensions(),
            }
            .into())
        }
        _ => Ok(()),
    }
}

pub(crate) struct StageRun {
    stage: Stage,
    refresh_mode: RefreshMode,
    generated_at: String,
    started: Instant,
    summary: serde_json::Value,
    warnings: Vec<String>,
}

impl StageRun {
    pub(crate) fn start(stage: Stage, refresh_mode: RefreshMode) -> Self {
        Self {
            stage,
            refresh_mode,
            generated_at: now_utc_string(),
            started: Instant::now(),
            summary: serde_json::Value::Null,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub(crate) fn set_summary<T: Serialize>(&mut self, summary: &T) -> Result<()> {
        self.summary = serde_json::to_value(summary)
            .with_context(|| format!("failed to serialize {} summary", self.stage))?;
        Ok(())
    }

    pub(crate) fn skip<C: Serialize>(
        self,
        store: &ArtifactStore,
        artifact: &Path,
        freshness: Freshness,
        config: &C,
    ) -> Result<StageOutcome> {
        info!(
            stage = %self.stage,
            path = %artifact.display(),
            freshness = freshness.as_str(),
            refresh_mode = self.refresh_mode.as_str(),
            "artifact reused, skipping"
        );
        let recorded = read_fingerprint(artifact).ok().flatten();
        self.finish(
            store,
            StageStatus::Skipped,
            artifact,
            Some(freshness),
            recorded.as_ref(),
            config,
        )
    }

    pub(crate) fn finish<C: Serialize>(
        self,
        store: &ArtifactStore,
        status: StageStatus,
        artifact: &Path,
        freshness: Option<Freshness>,
        fingerprint: Option<&Fingerprint>,
        config: &C,
    ) -> Result<StageOutcome> {
        let manifest_dir = store.manifest_dir();
        ensure_directory(&manifest_dir)?;

        let compact = utc_compact_string(Utc::now());
        let config = serde_json::to_value(config)
            .with_context(|| format!("failed to serialize {} config", self.stage))?;
        let rows = fingerprint.and_then(|value| value.rows);
        let dimensions = fingerprint.and_then(|value| value.dimensions);

        let manifest = StageRunManifest {
            manifest_version: MANIFEST_VERSION,
            run_id: format!("{}-{compact}", self.stage),
            stage: self.stage,
            status,
            generated_at: self.generated_at,
            backend_slug: store.slug().to_string(),
            artifact: artifact.display().to_string(),
            freshness_before: freshness,
            refresh_mode: self.refresh_mode.as_str().to_string(),
            fingerprint: fingerprint.map(|value| value.fingerprint.clone()),
            rows,
            dimensions,
            duration_ms: self.started.elapsed().as_millis(),
            config,
            summary: self.summary,
            warnings: self.warnings,
        };

        let manifest_path = manifest_dir.join(format!("{}_run_{compact}.json", self.stage));
        write_json_pretty(&manifest_path, &manifest)?;

        info!(
            stage = %self.stage,
            status = status.as_str(),
            path = %artifact.display(),
            manifest = %manifest_path.display(),
            "stage finished"
        );

        Ok(StageOutcome {
            stage: self.stage,
            status,
            artifact: artifact.to_path_buf(),
            freshness,
            rows,
            dimensions,
            manifest_path,
        })
    }
}
