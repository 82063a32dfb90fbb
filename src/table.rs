//! In-memory tabular data plus the source-table and metadata TSV codecs.
//!
//! A row's position is its identity: nothing in this module sorts, filters or
//! deduplicates rows.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::error::PipelineError;
use crate::util::{stage_file, StagedFile};

pub const TEXT_SEPARATOR: &str = " ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, PipelineError> {
        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(PipelineError::invalid_parameter(
                    "table",
                    format!(
                        "row {index} has {} cells but the header has {} columns",
                        row.len(),
                        columns.len()
                    ),
                ));
            }
        }

        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Maps column names to indices. An empty request selects every column.
    pub fn resolve_columns(&self, names: &[String]) -> Result<Vec<usize>, PipelineError> {
        if names.is_empty() {
            return Ok((0..self.columns.len()).collect());
        }

        let mut indices = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match self.column_index(name) {
                Some(index) => indices.push(index),
                None => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(PipelineError::ColumnNotFound {
                missing,
                available: self.columns.clone(),
            });
        }

        Ok(indices)
    }

    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().map(move |row| row[index].as_str())
    }

    /// Returns a copy of the table with `values` appended as a new last column.
    pub fn with_column(&self, name: &str, values: Vec<String>) -> Result<Self, PipelineError> {
        if self.column_index(name).is_some() {
            return Err(PipelineError::DuplicateColumn {
                column: name.to_string(),
            });
        }
        if values.len() != self.rows.len() {
            return Err(PipelineError::RowCountMismatch {
                vectors: values.len(),
                metadata: self.rows.len(),
            });
        }

        let mut columns = self.columns.clone();
        columns.push(name.to_string());
        let rows = self
            .rows
            .iter()
            .zip(values)
            .map(|(row, value)| {
                let mut row = row.clone();
                row.push(value);
                row
            })
            .collect();

        Ok(Self { columns, rows })
    }
}

/// Builds one document per row from the selected columns.
pub fn combine_row_text(table: &Table, columns: &[String]) -> Result<Vec<String>, PipelineError> {
    let indices = table.resolve_columns(columns)?;

    Ok(table
        .rows()
        .iter()
        .map(|row| {
            indices
                .iter()
                .map(|&index| row[index].trim())
                .collect::<Vec<&str>>()
                .join(TEXT_SEPARATOR)
        })
        .collect())
}

/// Loads the source CSV (or TSV, by extension). Falls back to latin-1 when the bytes
/// are not valid UTF-8.
pub fn read_source_table(path: &Path) -> Result<Table> {
    if !path.is_file() {
        return Err(PipelineError::InputNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }

    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let text = match String::from_utf8(raw) {
        Ok(text) => text,
        Err(err) => err.into_bytes().iter().map(|&byte| byte as char).collect(),
    };

    let is_tsv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("tsv"))
        .unwrap_or(false);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(if is_tsv { b'\t' } else { b',' })
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let columns = dedupe_headers(
        reader
            .headers()
            .map_err(|err| PipelineError::malformed(path, format!("unreadable header: {err}")))?
            .iter()
            .map(|value| value.trim_start_matches('\u{feff}').to_string())
            .collect(),
    );

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record
            .map_err(|err| PipelineError::malformed(path, format!("row {index}: {err}")))?;
        if record.len() > columns.len() {
            return Err(PipelineError::malformed(
                path,
                format!(
                    "row {index} has {} fields but the header has {}",
                    record.len(),
                    columns.len()
                ),
            )
            .into());
        }

        let mut row = record.iter().map(ToOwned::to_owned).collect::<Vec<String>>();
        row.resize(columns.len(), String::new());
        rows.push(row);
    }

    Ok(Table::new(columns, rows)?)
}

/// Repeated header names get a `.1`, `.2`, ... suffix, skipping names already taken.
fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut taken = headers.iter().cloned().collect::<HashSet<String>>();
    let mut seen = HashSet::with_capacity(headers.len());
    let mut columns = Vec::with_capacity(headers.len());

    for header in headers {
        if seen.insert(header.clone()) {
            columns.push(header);
            continue;
        }

        let renamed = (1..)
            .map(|suffix| format!("{header}.{suffix}"))
            .find(|candidate| !taken.contains(candidate))
            .unwrap_or_default();
        warn!(column = %header, renamed = %renamed, "renamed duplicate source column");
        taken.insert(renamed.clone());
        seen.insert(renamed.clone());
        columns.push(renamed);
    }

    columns
}

pub fn escape_cell(value: &str) -> String {
    value
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

pub fn write_metadata_tsv(path: &Path, table: &Table) -> Result<()> {
    stage_metadata_tsv(path, table)?.persist()
}

pub fn stage_metadata_tsv(path: &Path, table: &Table) -> Result<StagedFile> {
    stage_file(path, |file| {
        let header = table
            .columns()
            .iter()
            .map(|column| escape_cell(column))
            .collect::<Vec<String>>()
            .join("\t");
        writeln!(file, "{header}")?;

        for row in table.rows() {
            let line = row
                .iter()
                .map(|value| escape_cell(value))
                .collect::<Vec<String>>()
                .join("\t");
            writeln!(file, "{line}")?;
        }
        Ok(())
    })
    .with_context(|| format!("failed to write metadata {}", path.display()))
}

/// Reads a metadata TSV as written by [`write_metadata_tsv`]. Cells keep their
/// escaped form so they round-trip byte for byte into derived artifacts.
pub fn read_metadata_tsv(path: &Path) -> Result<Table> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read metadata {}", path.display()))?;

    let mut lines = text.lines();
    let Some(header) = lines.next() else {
        return Err(PipelineError::malformed(path, "missing header line").into());
    };
    let columns = header.split('\t').map(ToOwned::to_owned).collect::<Vec<String>>();

    let mut rows = Vec::new();
    for (index, line) in lines.enumerate() {
        let row = line.split('\t').map(ToOwned::to_owned).collect::<Vec<String>>();
        if row.len() != columns.len() {
            return Err(PipelineError::malformed(
                path,
                format!(
                    "row {index} has {} cells but the header has {}",
                    row.len(),
                    columns.len()
                ),
            )
            .into());
        }
        rows.push(row);
    }

    Ok(Table::new(columns, rows)?)
}
