//! Seeded single-threaded UMAP.
//!
//! Exact k-nearest-neighbour graph, fuzzy simplicial set with fuzzy-union
//! symmetrization, random initial layout, then stochastic gradient descent with
//! negative sampling. Every source of randomness flows from one `ChaCha8Rng`, and
//! edges are processed in sorted order, so a fixed seed gives identical output.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use super::{ReduceParams, Reducer};
use crate::error::PipelineError;
use crate::vectors::VectorSet;

const SMOOTH_K_TOLERANCE: f64 = 1e-5;
const MIN_K_DIST_SCALE: f64 = 1e-3;
const BINARY_SEARCH_STEPS: usize = 64;
const NEGATIVE_SAMPLE_RATE: usize = 5;
const GRADIENT_CLIP: f32 = 4.0;
const INIT_RANGE: f32 = 10.0;
const SPREAD: f64 = 1.0;
const SMALL_DATASET_EPOCHS: usize = 500;
const LARGE_DATASET_EPOCHS: usize = 200;
const LARGE_DATASET_ROWS: usize = 10_000;

#[derive(Debug, Default, Clone, Copy)]
pub struct Umap;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Edge {
    head: usize,
    tail: usize,
    weight: f64,
}

impl Reducer for Umap {
    fn name(&self) -> &'static str {
        "umap"
    }

    fn fit_transform(
        &self,
        vectors: &VectorSet,
        params: &ReduceParams,
    ) -> Result<VectorSet, PipelineError> {
        let rows = vectors.len();
        let dim = params.target_dim;
        let n_epochs = params.n_epochs.unwrap_or(if rows <= LARGE_DATASET_ROWS {
            SMALL_DATASET_EPOCHS
        } else {
            LARGE_DATASET_EPOCHS
        });

        info!(
            rows,
            from = vectors.dimensions(),
            to = dim,
            n_neighbors = params.n_neighbors,
            min_dist = params.min_dist,
            n_epochs,
            seed = params.seed,
            "running umap"
        );

        let knn = nearest_neighbors(vectors, params.n_neighbors);
        let graph = fuzzy_simplicial_set(&knn, params.n_neighbors);
        let (a, b) = fit_ab(SPREAD, f64::from(params.min_dist));

        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let mut embedding = (0..rows * dim)
            .map(|_| rng.gen_range(-INIT_RANGE..INIT_RANGE))
            .collect::<Vec<f32>>();

        optimize_layout(
            &mut embedding,
            dim,
            rows,
            &graph,
            n_epochs,
            a as f32,
            b as f32,
            &mut rng,
        );

        VectorSet::from_flat(rows, dim, embedding)
    }
}

/// For every row, the row itself followed by its `k - 1` nearest other rows as
/// `(index, euclidean distance)`. Ties resolve to the lower index.
fn nearest_neighbors(vectors: &VectorSet, k: usize) -> Vec<Vec<(usize, f64)>> {
    let rows = vectors.len();
    let mut out = Vec::with_capacity(rows);

    for i in 0..rows {
        let origin = vectors.row(i);
        let mut candidates = (0..rows)
            .filter(|&j| j != i)
            .map(|j| (j, squared_distance(origin, vectors.row(j))))
            .collect::<Vec<(usize, f64)>>();
        candidates.sort_by(|left, right| left.1.total_cmp(&right.1).then(left.0.cmp(&right.0)));
        candidates.truncate(k - 1);

        let mut neighbors = Vec::with_capacity(k);
        neighbors.push((i, 0.0));
        neighbors.extend(
            candidates
                .into_iter()
                .map(|(index, squared)| (index, squared.sqrt())),
        );
        out.push(neighbors);
    }

    out
}

fn squared_distance(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right)
        .map(|(l, r)| {
            let delta = f64::from(*l) - f64::from(*r);
            delta * delta
        })
        .sum()
}

/// Per-row `(rho, sigma)`: distance to the nearest distinct neighbour and the
/// bandwidth whose membership sum matches `log2(k)`.
fn smooth_knn_dist(knn: &[Vec<(usize, f64)>], k: usize) -> Vec<(f64, f64)> {
    let target = (k as f64).log2();
    let all_mean = {
        let (sum, count) = knn
            .iter()
            .flat_map(|neighbors| neighbors.iter())
            .fold((0.0_f64, 0usize), |(sum, count), (_, distance)| (sum + distance, count + 1));
        if count == 0 { 0.0 } else { sum / count as f64 }
    };

    knn.iter()
        .map(|neighbors| {
            let rho = neighbors
                .iter()
                .map(|(_, distance)| *distance)
                .find(|distance| *distance > 0.0)
                .unwrap_or(0.0);

            let mut lo = 0.0_f64;
            let mut hi = f64::INFINITY;
            let mut mid = 1.0_f64;

            for _ in 0..BINARY_SEARCH_STEPS {
                let psum = neighbors
                    .iter()
                    .skip(1)
                    .map(|(_, distance)| {
                        let shifted = distance - rho;
                        if shifted > 0.0 { (-shifted / mid).exp() } else { 1.0 }
                    })
                    .sum::<f64>();

                if (psum - target).abs() < SMOOTH_K_TOLERANCE {
                    break;
                }

                if psum > target {
                    hi = mid;
                    mid = (lo + hi) / 2.0;
                } else {
                    lo = mid;
                    mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
                }
            }

            let local_mean = neighbors.iter().map(|(_, distance)| distance).sum::<f64>()
                / neighbors.len() as f64;
            let floor = (if rho > 0.0 { local_mean } else { all_mean }) * MIN_K_DIST_SCALE;

            (rho, mid.max(floor))
        })
        .collect()
}

/// Symmetric membership graph, both directions of every pair, sorted by
/// `(head, tail)`.
fn fuzzy_simplicial_set(knn: &[Vec<(usize, f64)>], k: usize) -> Vec<Edge> {
    let bandwidths = smooth_knn_dist(knn, k);

    let mut directed = BTreeMap::<(usize, usize), f64>::new();
    for (i, neighbors) in knn.iter().enumerate() {
        let (rho, sigma) = bandwidths[i];
        for &(j, distance) in neighbors {
            if j == i {
                continue;
            }
            let shifted = distance - rho;
            let weight = if shifted <= 0.0 || sigma == 0.0 {
                1.0
            } else {
                (-shifted / sigma).exp()
            };
            if weight > 0.0 {
                directed.insert((i, j), weight);
            }
        }
    }

    let mut edges = Vec::with_capacity(directed.len() * 2);
    for (&(i, j), &forward) in &directed {
        let backward = directed.get(&(j, i)).copied();
        let reverse = backward.unwrap_or(0.0);
        let weight = forward + reverse - forward * reverse;

        edges.push(Edge {
            head: i,
            tail: j,
            weight,
        });
        if backward.is_none() {
            edges.push(Edge {
                head: j,
                tail: i,
                weight,
            });
        }
    }

    edges.sort_by(|left, right| left.head.cmp(&right.head).then(left.tail.cmp(&right.tail)));
    edges
}

/// Fits `1 / (1 + a * x^(2b))` to the offset-exponential target curve by
/// successively finer grid searches.
fn fit_ab(spread: f64, min_dist: f64) -> (f64, f64) {
    const SAMPLES: usize = 300;
    const COARSE_STEPS: usize = 60;
    const FINE_STEPS: usize = 21;
    const ROUNDS: usize = 6;

    let xs = (0..SAMPLES)
        .map(|index| index as f64 * 3.0 * spread / (SAMPLES - 1) as f64)
        .collect::<Vec<f64>>();
    let ys = xs
        .iter()
        .map(|&x| if x < min_dist { 1.0 } else { (-(x - min_dist) / spread).exp() })
        .collect::<Vec<f64>>();

    let loss = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&ys)
            .map(|(&x, &y)| {
                let fitted = 1.0 / (1.0 + a * x.powf(2.0 * b));
                (fitted - y).powi(2)
            })
            .sum()
    };

    let (log_a_lo, log_a_hi) = (1e-2_f64.ln(), 1e2_f64.ln());
    let (b_lo, b_hi) = (0.1_f64, 3.0_f64);
    let mut step_log_a = (log_a_hi - log_a_lo) / (COARSE_STEPS - 1) as f64;
    let mut step_b = (b_hi - b_lo) / (COARSE_STEPS - 1) as f64;

    let mut best = (log_a_lo, b_lo, f64::INFINITY);
    for i in 0..COARSE_STEPS {
        for j in 0..COARSE_STEPS {
            let log_a = log_a_lo + i as f64 * step_log_a;
            let b = b_lo + j as f64 * step_b;
            let value = loss(log_a.exp(), b);
            if value < best.2 {
                best = (log_a, b, value);
            }
        }
    }

    for _ in 0..ROUNDS {
        let (center_log_a, center_b, _) = best;
        let start_log_a = center_log_a - 2.0 * step_log_a;
        let start_b = center_b - 2.0 * step_b;
        step_log_a = 4.0 * step_log_a / (FINE_STEPS - 1) as f64;
        step_b = 4.0 * step_b / (FINE_STEPS - 1) as f64;

        for i in 0..FINE_STEPS {
            for j in 0..FINE_STEPS {
                let log_a = start_log_a + i as f64 * step_log_a;
                let b = start_b + j as f64 * step_b;
                if b <= 0.0 {
                    continue;
                }
                let value = loss(log_a.exp(), b);
                if value < best.2 {
                    best = (log_a, b, value);
                }
            }
        }
    }

    (best.0.exp(), best.1)
}

fn clip(value: f32) -> f32 {
    value.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

#[allow(clippy::too_many_arguments)]
fn optimize_layout(
    embedding: &mut [f32],
    dim: usize,
    rows: usize,
    graph: &[Edge],
    n_epochs: usize,
    a: f32,
    b: f32,
    rng: &mut ChaCha8Rng,
) {
    let max_weight = graph.iter().map(|edge| edge.weight).fold(0.0_f64, f64::max);
    if max_weight <= 0.0 {
        return;
    }

    let min_weight = max_weight / n_epochs as f64;
    let edges = graph
        .iter()
        .filter(|edge| edge.weight >= min_weight)
        .collect::<Vec<&Edge>>();

    let epochs_per_sample = edges
        .iter()
        .map(|edge| max_weight / edge.weight)
        .collect::<Vec<f64>>();
    let epochs_per_negative = epochs_per_sample
        .iter()
        .map(|value| value / NEGATIVE_SAMPLE_RATE as f64)
        .collect::<Vec<f64>>();
    let mut next_sample = epochs_per_sample.clone();
    let mut next_negative = epochs_per_negative.clone();

    let mut current = vec![0_f32; dim];

    for epoch in 0..n_epochs {
        let epoch_f = epoch as f64;
        let alpha = 1.0 - epoch as f32 / n_epochs as f32;

        for (index, edge) in edges.iter().enumerate() {
            if next_sample[index] > epoch_f {
                continue;
            }

            let head = edge.head * dim;
            let tail = edge.tail * dim;

            let d2 = (0..dim)
                .map(|d| (embedding[head + d] - embedding[tail + d]).powi(2))
                .sum::<f32>();
            let attract = if d2 > 0.0 {
                -2.0 * a * b * d2.powf(b - 1.0) / (a * d2.powf(b) + 1.0)
            } else {
                0.0
            };
            for d in 0..dim {
                let grad = clip(attract * (embedding[head + d] - embedding[tail + d])) * alpha;
                embedding[head + d] += grad;
                embedding[tail + d] -= grad;
            }
            next_sample[index] += epochs_per_sample[index];

            let negatives =
                ((epoch_f - next_negative[index]) / epochs_per_negative[index]).max(0.0) as usize;
            current.copy_from_slice(&embedding[head..head + dim]);
            for _ in 0..negatives {
                let other = rng.gen_range(0..rows);
                if other == edge.head {
                    continue;
                }
                let other_start = other * dim;
                let d2 = (0..dim)
                    .map(|d| (current[d] - embedding[other_start + d]).powi(2))
                    .sum::<f32>();
                let repel = if d2 > 0.0 {
                    2.0 * b / ((0.001 + d2) * (a * d2.powf(b) + 1.0))
                } else {
                    0.0
                };
                if repel > 0.0 {
                    for d in 0..dim {
                        current[d] +=
                            clip(repel * (current[d] - embedding[other_start + d])) * alpha;
                    }
                }
            }
            embedding[head..head + dim].copy_from_slice(&current);
            next_negative[index] += negatives as f64 * epochs_per_negative[index];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> VectorSet {
        let mut rows = Vec::new();
        for blob in 0..2 {
            for member in 0..10 {
                let offset = if blob == 0 { 0.0 } else { 50.0 };
                rows.push(
                    (0..8)
                        .map(|d| offset + ((member * 7 + d * 3) % 11) as f32 * 0.1)
                        .collect::<Vec<f32>>(),
                );
            }
        }
        VectorSet::from_rows(rows).expect("blob vectors")
    }

    fn params(seed: u64) -> ReduceParams {
        ReduceParams {
            target_dim: 2,
            n_neighbors: 5,
            min_dist: 0.1,
            seed,
            n_epochs: Some(200),
        }
    }

    fn centroid(vectors: &VectorSet, range: std::ops::Range<usize>) -> Vec<f64> {
        let count = range.len() as f64;
        let mut sum = vec![0.0; vectors.dimensions()];
        for row in range {
            for (d, value) in vectors.row(row).iter().enumerate() {
                sum[d] += f64::from(*value);
            }
        }
        sum.into_iter().map(|value| value / count).collect()
    }

    #[test]
    fn fit_ab_matches_reference_curve_for_default_min_dist() {
        let (a, b) = fit_ab(1.0, 0.1);
        assert!((a - 1.577).abs() < 0.1, "a = {a}");
        assert!((b - 0.895).abs() < 0.05, "b = {b}");
    }

    #[test]
    fn nearest_neighbors_start_with_self() {
        let knn = nearest_neighbors(&two_blobs(), 5);
        assert_eq!(knn.len(), 20);
        for (row, neighbors) in knn.iter().enumerate() {
            assert_eq!(neighbors.len(), 5);
            assert_eq!(neighbors[0], (row, 0.0));
            let same_blob = |index: usize| (index < 10) == (row < 10);
            assert!(neighbors.iter().all(|(index, _)| same_blob(*index)));
        }
    }

    #[test]
    fn graph_is_symmetric() {
        let knn = nearest_neighbors(&two_blobs(), 5);
        let graph = fuzzy_simplicial_set(&knn, 5);
        for edge in &graph {
            let mirror = graph
                .iter()
                .find(|other| other.head == edge.tail && other.tail == edge.head)
                .expect("mirror edge");
            assert_eq!(mirror.weight, edge.weight);
            assert!(edge.weight > 0.0 && edge.weight <= 1.0);
        }
    }

    #[test]
    fn same_seed_reproduces_layout() {
        let vectors = two_blobs();
        let first = Umap.fit_transform(&vectors, &params(7)).expect("first run");
        let second = Umap.fit_transform(&vectors, &params(7)).expect("second run");
        assert_eq!(first, second);

        let other = Umap.fit_transform(&vectors, &params(8)).expect("other seed");
        assert_ne!(first, other);
    }

    #[test]
    fn separated_blobs_stay_separated() {
        let reduced = Umap.fit_transform(&two_blobs(), &params(42)).expect("reduce");
        assert_eq!(reduced.len(), 20);
        assert_eq!(reduced.dimensions(), 2);
        assert!(reduced.as_flat().iter().all(|value| value.is_finite()));

        let left = centroid(&reduced, 0..10);
        let right = centroid(&reduced, 10..20);
        let between = left
            .iter()
            .zip(&right)
            .map(|(l, r)| (l - r).powi(2))
            .sum::<f64>()
            .sqrt();

        let spread = |range: std::ops::Range<usize>, center: &[f64]| {
            range
                .clone()
                .map(|row| {
                    reduced
                        .row(row)
                        .iter()
                        .zip(center)
                        .map(|(value, c)| (f64::from(*value) - c).powi(2))
                        .sum::<f64>()
                        .sqrt()
                })
                .sum::<f64>()
                / range.len() as f64
        };

        assert!(between > spread(0..10, &left));
        assert!(between > spread(10..20, &right));
    }
}
