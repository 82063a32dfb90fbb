//! Top-N facet compression for high-cardinality categorical columns.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::table::Table;

pub const CATCH_ALL_LABEL: &str = "Other";
pub const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetMapping {
    pub column: String,
    pub distinct_values: usize,
    /// Kept values, most frequent first.
    pub kept: Vec<String>,
    pub catch_all: String,
}

impl FacetMapping {
    /// Counts values (the empty value included) and keeps the `top_n` most frequent.
    /// Equal counts rank by first appearance.
    pub fn build<'a>(
        column: &str,
        values: impl IntoIterator<Item = &'a str>,
        top_n: usize,
    ) -> Result<Self, PipelineError> {
        if top_n == 0 {
            return Err(PipelineError::InvalidTopN { top_n });
        }

        let mut position = HashMap::<&str, usize>::new();
        let mut counts = Vec::<(&str, usize)>::new();
        for value in values {
            match position.get(value) {
                Some(&index) => counts[index].1 += 1,
                None => {
                    position.insert(value, counts.len());
                    counts.push((value, 1));
                }
            }
        }

        let distinct_values = counts.len();
        let mut catch_all = CATCH_ALL_LABEL.to_string();
        while position.contains_key(catch_all.as_str()) {
            catch_all.push('_');
        }

        counts.sort_by(|left, right| right.1.cmp(&left.1));
        let kept = counts
            .into_iter()
            .take(top_n)
            .map(|(value, _)| value.to_string())
            .collect();

        Ok(Self {
            column: column.to_string(),
            distinct_values,
            kept,
            catch_all,
        })
    }

    pub fn apply<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let kept = self.kept.iter().map(String::as_str).collect::<HashSet<&str>>();
        values
            .into_iter()
            .map(|value| {
                if kept.contains(value) {
                    value.to_string()
                } else {
                    self.catch_all.clone()
                }
            })
            .collect()
    }
}

pub fn facet_column_name(column: &str, top_n: usize) -> String {
    format!("{column}_top{top_n}")
}

/// Appends a `{column}_top{N}` companion for each nominated column (all columns
/// when `columns` is empty).
pub fn compress(
    table: &Table,
    columns: &[String],
    top_n: usize,
) -> Result<(Table, Vec<FacetMapping>), PipelineError> {
    if top_n == 0 {
        return Err(PipelineError::InvalidTopN { top_n });
    }
    let indices = table.resolve_columns(columns)?;

    let mut augmented = table.clone();
    let mut mappings = Vec::with_capacity(indices.len());
    for index in indices {
        let column = &table.columns()[index];
        let output_name = facet_column_name(column, top_n);
        if augmented.column_index(&output_name).is_some() {
            warn!(column = %column, output = %output_name, "facet column already present");
            continue;
        }

        let mapping = FacetMapping::build(column, table.column_values(index), top_n)?;
        let compressed = mapping.apply(table.column_values(index));
        let collapsed_rows = compressed
            .iter()
            .filter(|value| **value == mapping.catch_all)
            .count();

        info!(
            column = %column,
            distinct_values = mapping.distinct_values,
            kept = mapping.kept.len(),
            collapsed_rows,
            "compressed facet column"
        );

        augmented = augmented.with_column(&output_name, compressed)?;
        mappings.push(mapping);
    }

    Ok((augmented, mappings))
}
