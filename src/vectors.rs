use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::PipelineError;
use crate::util::{stage_file, StagedFile};

/// Row-aligned vectors of a single dimension, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSet {
    dimensions: usize,
    rows: usize,
    values: Vec<f32>,
}

impl VectorSet {
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, PipelineError> {
        let dimensions = rows.first().map(Vec::len).unwrap_or(0);
        let mut values = Vec::with_capacity(rows.len() * dimensions);
        for (index, row) in rows.iter().enumerate() {
            if row.len() != dimensions {
                return Err(PipelineError::DimensionMismatch {
                    row: index,
                    expected: dimensions,
                    actual: row.len(),
                });
            }
            values.extend_from_slice(row);
        }

        Ok(Self {
            dimensions,
            rows: rows.len(),
            values,
        })
    }

    pub fn from_flat(
        rows: usize,
        dimensions: usize,
        values: Vec<f32>,
    ) -> Result<Self, PipelineError> {
        if values.len() != rows * dimensions {
            return Err(PipelineError::invalid_parameter(
                "vector buffer",
                format!(
                    "{} values cannot form {rows} rows of {dimensions} dimensions",
                    values.len()
                ),
            ));
        }

        Ok(Self {
            dimensions,
            rows,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.dimensions;
        &self.values[start..start + self.dimensions]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> + '_ {
        (0..self.rows).map(move |index| self.row(index))
    }

    pub fn as_flat(&self) -> &[f32] {
        &self.values
    }
}

pub fn write_vectors_tsv(path: &Path, vectors: &VectorSet) -> Result<()> {
    stage_vectors_tsv(path, vectors)?.persist()
}

/// Writes the vectors next to `path` without placing them yet.
pub fn stage_vectors_tsv(path: &Path, vectors: &VectorSet) -> Result<StagedFile> {
    stage_file(path, |file| {
        for row in vectors.iter() {
            let line = row
                .iter()
                .map(|value| value.to_string())
                .collect::<Vec<String>>()
                .join("\t");
            writeln!(file, "{line}")?;
        }
        Ok(())
    })
    .with_context(|| format!("failed to write vectors {}", path.display()))
}

pub fn read_vectors_tsv(path: &Path) -> Result<VectorSet> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read vectors {}", path.display()))?;

    let mut rows = Vec::<Vec<f32>>::new();
    for (index, line) in text.lines().enumerate() {
        if line.is_empty() {
            return Err(PipelineError::malformed(path, format!("row {index} is empty")).into());
        }

        let row = line
            .split('\t')
            .map(|value| {
                value.trim().parse::<f32>().map_err(|err| {
                    PipelineError::malformed(path, format!("row {index}: '{value}': {err}"))
                })
            })
            .collect::<Result<Vec<f32>, PipelineError>>()?;
        rows.push(row);
    }

    let vectors = VectorSet::from_rows(rows).map_err(|err| match err {
        PipelineError::DimensionMismatch {
            row,
            expected,
            actual,
        } => PipelineError::malformed(
            path,
            format!("row {row} has {actual} values, expected {expected}"),
        ),
        other => other,
    })?;

    Ok(vectors)
}
