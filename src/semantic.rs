//! Embedding backends and the batched embedding driver.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::PipelineError;
use crate::vectors::VectorSet;

pub const DEFAULT_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_NORMALIZATION: &str = "l2";
pub const LOCAL_HASH_BACKEND: &str = "local-hash-v1";
pub const SENTENCE_TRANSFORMERS_BACKEND: &str = "sentence-transformers";
pub const LOCAL_HASH_PREFIX: &str = "local-hash-";
pub const MIN_LOCAL_DIMENSIONS: usize = 8;
pub const MAX_LOCAL_DIMENSIONS: usize = 4096;

static SLUG_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9._]+").expect("slug pattern is valid"));

struct CatalogEntry {
    model_id: &'static str,
    dimensions: usize,
    credential_env: Option<&'static str>,
}

const MODEL_CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        model_id: "sentence-transformers/all-MiniLM-L6-v2",
        dimensions: 384,
        credential_env: None,
    },
    CatalogEntry {
        model_id: "sentence-transformers/all-mpnet-base-v2",
        dimensions: 768,
        credential_env: None,
    },
    CatalogEntry {
        model_id: "BAAI/bge-small-en-v1.5",
        dimensions: 384,
        credential_env: None,
    },
    CatalogEntry {
        model_id: "nomic-ai/nomic-embed-text-v1.5",
        dimensions: 768,
        credential_env: None,
    },
    CatalogEntry {
        model_id: "google/embeddinggemma-300m",
        dimensions: 768,
        credential_env: Some("HF_TOKEN"),
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticModelConfig {
    pub model_id: String,
    pub model_name: String,
    pub dimensions: usize,
    pub normalization: String,
    pub backend: String,
    pub credential_env: Option<String>,
}

pub trait TextEmbedder {
    fn config(&self) -> &SemanticModelConfig;

    fn dimensions(&self) -> usize {
        self.config().dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

pub fn catalog_model_ids() -> impl Iterator<Item = &'static str> {
    MODEL_CATALOG.iter().map(|entry| entry.model_id)
}

pub fn resolve_model_config(model_id: &str) -> Result<SemanticModelConfig, PipelineError> {
    let trimmed = model_id.trim();
    let resolved_id = if trimmed.is_empty() {
        DEFAULT_MODEL_ID
    } else {
        trimmed
    };

    if let Some(entry) = MODEL_CATALOG
        .iter()
        .find(|entry| entry.model_id.eq_ignore_ascii_case(resolved_id))
    {
        return Ok(SemanticModelConfig {
            model_id: entry.model_id.to_string(),
            model_name: entry.model_id.to_string(),
            dimensions: entry.dimensions,
            normalization: DEFAULT_NORMALIZATION.to_string(),
            backend: SENTENCE_TRANSFORMERS_BACKEND.to_string(),
            credential_env: entry.credential_env.map(ToOwned::to_owned),
        });
    }

    if let Some(raw_dims) = resolved_id.strip_prefix(LOCAL_HASH_PREFIX) {
        let dimensions = parse_canonical_dimensions(raw_dims).ok_or_else(|| {
            PipelineError::BackendUnavailable {
                model_id: resolved_id.to_string(),
                reason: format!("'{raw_dims}' is not a plain dimension count"),
            }
        })?;
        if !(MIN_LOCAL_DIMENSIONS..=MAX_LOCAL_DIMENSIONS).contains(&dimensions) {
            return Err(PipelineError::BackendUnavailable {
                model_id: resolved_id.to_string(),
                reason: format!(
                    "local hashing supports {MIN_LOCAL_DIMENSIONS}..={MAX_LOCAL_DIMENSIONS} \
                     dimensions"
                ),
            });
        }

        let model_id = format!("{LOCAL_HASH_PREFIX}{dimensions}");
        return Ok(SemanticModelConfig {
            model_name: model_id.clone(),
            model_id,
            dimensions,
            normalization: DEFAULT_NORMALIZATION.to_string(),
            backend: LOCAL_HASH_BACKEND.to_string(),
            credential_env: None,
        });
    }

    Err(PipelineError::BackendUnavailable {
        model_id: resolved_id.to_string(),
        reason: format!(
            "not installed; known models: {}",
            catalog_model_ids().collect::<Vec<&str>>().join(", ")
        ),
    })
}

/// Digits only, without sign or leading zeros, so each dimension count has exactly
/// one spelling and one namespace.
fn parse_canonical_dimensions(raw: &str) -> Option<usize> {
    let canonical = !raw.is_empty()
        && raw.bytes().all(|byte| byte.is_ascii_digit())
        && !(raw.len() > 1 && raw.starts_with('0'));
    if canonical { raw.parse().ok() } else { None }
}

/// Resolves and authorizes a backend. `env` looks up credential variables so tests
/// can run without touching the process environment. Catalog models resolve their
/// identity but have no runtime in this build, so they are reported unavailable
/// rather than replaced.
pub fn resolve_backend(
    model_id: &str,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Box<dyn TextEmbedder>, PipelineError> {
    let config = resolve_model_config(model_id)?;

    if let Some(env_var) = config.credential_env.as_deref() {
        let present = env(env_var)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        if !present {
            return Err(PipelineError::BackendAuthRequired {
                model_id: config.model_id.clone(),
                env_var: env_var.to_string(),
            });
        }
    }

    if config.backend != LOCAL_HASH_BACKEND {
        return Err(PipelineError::BackendUnavailable {
            reason: format!(
                "no {} runtime is installed; use {LOCAL_HASH_PREFIX}<dims> for local embedding",
                config.backend
            ),
            model_id: config.model_id,
        });
    }

    Ok(Box::new(LocalHashEmbedder::new(config)))
}

/// Filesystem-safe namespace for a model identity.
pub fn backend_slug(model_id: &str) -> String {
    let trimmed = model_id.trim();
    let base = trimmed
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(trimmed)
        .to_ascii_lowercase();

    let slug = SLUG_SEPARATORS.replace_all(&base, "-");
    let slug = slug.trim_matches(|character| character == '-' || character == '.');

    if slug.is_empty() {
        "default".to_string()
    } else {
        slug.to_string()
    }
}

pub fn embed_documents(
    embedder: &dyn TextEmbedder,
    documents: &[String],
    batch_size: usize,
) -> Result<VectorSet, PipelineError> {
    let batch_size = batch_size.max(1);
    let dimensions = embedder.dimensions();
    let total = documents.len();
    let mut values = Vec::<f32>::with_capacity(total * dimensions);

    for (batch_index, batch) in documents.chunks(batch_size).enumerate() {
        let embeddings = embedder.embed_batch(batch)?;
        if embeddings.len() != batch.len() {
            return Err(PipelineError::RowCountMismatch {
                vectors: embeddings.len(),
                metadata: batch.len(),
            });
        }

        for (offset, embedding) in embeddings.iter().enumerate() {
            if embedding.len() != dimensions {
                return Err(PipelineError::DimensionMismatch {
                    row: batch_index * batch_size + offset,
                    expected: dimensions,
                    actual: embedding.len(),
                });
            }
            values.extend_from_slice(embedding);
        }

        let done = (batch_index * batch_size + batch.len()).min(total);
        info!(
            model_id = %embedder.config().model_id,
            done,
            total,
            "embed batch completed"
        );
    }

    VectorSet::from_flat(total, dimensions, values)
}

/// Feature-hashing embedder. Words and adjacent-word bigrams are hashed into signed,
/// weighted buckets, seeded by the model identity, then L2-normalized.
pub struct LocalHashEmbedder {
    config: SemanticModelConfig,
}

impl LocalHashEmbedder {
    pub fn new(config: SemanticModelConfig) -> Self {
        Self { config }
    }

    pub fn embed_text(&self, payload: &str) -> Vec<f32> {
        let dims = self.config.dimensions;
        let mut vector = vec![0_f32; dims];

        for token in tokenize_payload(payload) {
            let hash = stable_hash(&self.config.model_id, &token);
            let index = (hash % dims as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
            vector[index] += sign * weight;
        }

        normalize_vector(&mut vector);
        vector
    }
}

impl TextEmbedder for LocalHashEmbedder {
    fn config(&self) -> &SemanticModelConfig {
        &self.config
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

fn stable_hash(seed: &str, token: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update([0_u8]);
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn tokenize_payload(payload: &str) -> Vec<String> {
    let words = payload
        .split_whitespace()
        .map(|value| {
            value
                .chars()
                .filter(|character| character.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|value| !value.is_empty())
        .collect::<Vec<String>>();

    let mut features = Vec::<String>::with_capacity(words.len() * 2);
    for (index, word) in words.iter().enumerate() {
        features.push(format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            features.push(format!("b:{word}_{next}"));
        }
    }
    features
}

fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    for value in values {
        *value /= norm;
    }
}
