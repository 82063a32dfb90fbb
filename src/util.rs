use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::warn;

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];

    loop {
        let count = file
            .read(&mut buf)
            .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// A fully written temporary file waiting to be renamed onto its target.
pub struct StagedFile {
    temp: NamedTempFile,
    path: PathBuf,
}

impl StagedFile {
    pub fn persist(self) -> Result<()> {
        self.temp
            .persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to place {}", self.path.display()))?;
        Ok(())
    }
}

/// Writes the content for `path` into a synced temporary file in the same directory.
pub fn stage_file<F>(path: &Path, write: F) -> Result<StagedFile>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_directory(parent)?;

    let temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temporary file in {}", parent.display()))?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        write(&mut writer)?;
        writer
            .flush()
            .with_context(|| format!("failed to flush temporary file for {}", path.display()))?;
    }
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temporary file for {}", path.display()))?;

    Ok(StagedFile {
        temp,
        path: path.to_path_buf(),
    })
}

/// Writes `path` through a temporary file in the same directory and renames it into
/// place once `write` succeeds, so readers never observe a partial file.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    stage_file(path, write)?.persist()
}

/// Places staged files in order. If one cannot be placed, the ones already placed are
/// removed again and the rest are discarded with their temporary files.
pub fn persist_together(files: Vec<StagedFile>) -> Result<()> {
    let mut placed: Vec<PathBuf> = Vec::with_capacity(files.len());
    for file in files {
        let path = file.path.clone();
        if let Err(err) = file.persist() {
            for path in &placed {
                if let Err(cleanup) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %cleanup, "rollback failed");
                }
            }
            return Err(err);
        }
        placed.push(path);
    }
    Ok(())
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;

    write_atomic(path, |file| {
        file.write_all(&data)
            .with_context(|| format!("failed to write json file: {}", path.display()))?;
        file.write_all(b"\n")
            .with_context(|| format!("failed to finalize json file: {}", path.display()))?;
        Ok(())
    })
}
