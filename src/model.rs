use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::artifacts::{Freshness, Stage};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Skipped,
    /// The stage was turned off by its parameters (reduce with 0 dimensions).
    Disabled,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    pub artifact: PathBuf,
    pub freshness: Option<Freshness>,
    pub rows: Option<usize>,
    pub dimensions: Option<usize>,
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub generated_at: String,
    pub backend_slug: String,
    pub artifact: String,
    pub freshness_before: Option<Freshness>,
    pub refresh_mode: String,
    pub fingerprint: Option<String>,
    pub rows: Option<usize>,
    pub dimensions: Option<usize>,
    pub duration_ms: u128,
    pub config: serde_json::Value,
    pub summary: serde_json::Value,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterLevelSummary {
    pub level: usize,
    pub column: String,
    pub min_size: usize,
    pub median_size: usize,
    pub max_size: usize,
}
