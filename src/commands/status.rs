use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use super::open_store;
use crate::artifacts::{read_fingerprint, ArtifactStore};
use crate::cli::StatusArgs;

#[derive(Debug, Clone)]
pub struct ArtifactStatus {
    pub name: String,
    pub path: PathBuf,
    pub present: bool,
    pub rows: Option<usize>,
    pub dimensions: Option<usize>,
    pub fingerprint: Option<String>,
    pub created_at: Option<String>,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let store = open_store(&args.output_root, &args.model_id)?;
    info!(root = %store.root().display(), slug = store.slug(), "status requested");

    for status in collect(&store)? {
        if status.present {
            info!(
                artifact = %status.name,
                path = %status.path.display(),
                rows = ?status.rows,
                dims = ?status.dimensions,
                fingerprint = %status.fingerprint.unwrap_or_else(|| "untracked".to_string()),
                created_at = %status.created_at.unwrap_or_default(),
                "artifact present"
            );
        } else {
            warn!(artifact = %status.name, path = %status.path.display(), "artifact missing");
        }
    }

    Ok(())
}

/// One entry per artifact the stages can produce, plus every reduction on disk.
pub fn collect(store: &ArtifactStore) -> Result<Vec<ArtifactStatus>> {
    // Metadata is written together with the vectors and shares their sidecar.
    let mut artifacts = vec![
        ("vectors".to_string(), store.vectors_path(), store.vectors_path()),
        ("metadata".to_string(), store.metadata_path(), store.vectors_path()),
    ];
    for (dims, path) in store.existing_reductions()? {
        artifacts.push((format!("umap{dims}"), path.clone(), path));
    }
    for (name, path) in [
        ("clusters", store.clusters_metadata_path()),
        ("facets", store.facets_metadata_path()),
    ] {
        artifacts.push((name.to_string(), path.clone(), path));
    }

    artifacts
        .into_iter()
        .map(|(name, path, sidecar_of)| describe(name, &path, &sidecar_of))
        .collect()
}

fn describe(name: String, path: &Path, sidecar_of: &Path) -> Result<ArtifactStatus> {
    let present = path.is_file();
    let recorded = if present { read_fingerprint(sidecar_of)? } else { None };

    Ok(ArtifactStatus {
        name,
        path: path.to_path_buf(),
        present,
        rows: recorded.as_ref().and_then(|value| value.rows),
        dimensions: recorded.as_ref().and_then(|value| value.dimensions),
        fingerprint: recorded.as_ref().map(|value| value.fingerprint.clone()),
        created_at: recorded.map(|value| value.created_at),
    })
}
