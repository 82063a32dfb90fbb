use tracing::info;

use super::{Clusterer, Dendrogram, Merge};
use crate::error::PipelineError;
use crate::vectors::VectorSet;

/// Ward linkage via the nearest-neighbour chain. Only group centroids and sizes
/// are kept, so memory grows with `rows * dims` rather than `rows^2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WardClusterer;

struct Group {
    centroid: Vec<f64>,
    size: usize,
}

impl Clusterer for WardClusterer {
    fn name(&self) -> &'static str {
        "ward"
    }

    fn build(&self, vectors: &VectorSet) -> Result<Dendrogram, PipelineError> {
        let rows = vectors.len();
        if rows == 0 {
            return Err(PipelineError::DegenerateInput {
                rows,
                required: 1,
                reason: "nothing to cluster".to_string(),
            });
        }
        if vectors.as_flat().iter().any(|value| !value.is_finite()) {
            return Err(PipelineError::invalid_parameter(
                "vectors",
                "input contains non-finite values",
            ));
        }

        info!(rows, dims = vectors.dimensions(), "building ward linkage tree");

        // Slot i holds the group whose representative leaf is i; None once absorbed.
        let mut groups = vectors
            .iter()
            .map(|row| {
                Some(Group {
                    centroid: row.iter().map(|value| f64::from(*value)).collect(),
                    size: 1,
                })
            })
            .collect::<Vec<Option<Group>>>();

        let mut merges = Vec::with_capacity(rows - 1);
        let mut chain = Vec::<usize>::with_capacity(rows);

        while merges.len() + 1 < rows {
            if chain.is_empty() {
                let Some(first) = groups.iter().position(Option::is_some) else {
                    break;
                };
                chain.push(first);
            }

            let (left, right, height) = loop {
                let tip = chain[chain.len() - 1];
                let previous = chain.len().checked_sub(2).map(|index| chain[index]);

                let mut best = previous.map(|index| (index, ward_height(&groups, tip, index)));
                for (candidate, group) in groups.iter().enumerate() {
                    if candidate == tip || group.is_none() {
                        continue;
                    }
                    let height = ward_height(&groups, tip, candidate);
                    if best.is_none_or(|(_, best_height)| height < best_height) {
                        best = Some((candidate, height));
                    }
                }

                let Some((nearest, height)) = best else {
                    return Err(PipelineError::invalid_parameter(
                        "vectors",
                        "linkage chain ran out of groups",
                    ));
                };
                if Some(nearest) == previous {
                    chain.truncate(chain.len() - 2);
                    break (tip.min(nearest), tip.max(nearest), height);
                }
                chain.push(nearest);
            };

            let absorbed = groups[right].take();
            if let (Some(kept), Some(absorbed)) = (groups[left].as_mut(), absorbed) {
                let total = kept.size + absorbed.size;
                for (value, other) in kept.centroid.iter_mut().zip(&absorbed.centroid) {
                    *value = (*value * kept.size as f64 + other * absorbed.size as f64)
                        / total as f64;
                }
                kept.size = total;
                merges.push(Merge {
                    left,
                    right,
                    height,
                    size: total,
                });
            }
        }

        Dendrogram::new(rows, merges)
    }
}

/// scipy's Ward height: `sqrt(2 * |A||B| / (|A| + |B|) * ||cA - cB||^2)`.
fn ward_height(groups: &[Option<Group>], left: usize, right: usize) -> f64 {
    let (Some(a), Some(b)) = (&groups[left], &groups[right]) else {
        return f64::INFINITY;
    };

    let squared = a
        .centroid
        .iter()
        .zip(&b.centroid)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>();
    let weight = (a.size * b.size) as f64 / (a.size + b.size) as f64;
    (2.0 * weight * squared).sqrt()
}
