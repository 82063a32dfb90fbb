//! Multi-level hierarchical clustering: build one hierarchy, cut it at each
//! requested cluster count, and attach the labels as metadata columns.

mod ward;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::PipelineError;
use crate::table::Table;
use crate::vectors::VectorSet;

pub use ward::WardClusterer;

pub const CLUSTER_COLUMN_PREFIX: &str = "cluster_";
pub const DEFAULT_LEVELS: [usize; 4] = [3, 5, 10, 20];

pub trait Clusterer {
    fn name(&self) -> &'static str;

    fn build(&self, vectors: &VectorSet) -> Result<Dendrogram, PipelineError>;
}

/// One agglomeration step. `left` and `right` are representative leaf rows of the
/// two groups being joined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub height: f64,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dendrogram {
    leaves: usize,
    merges: Vec<Merge>,
}

impl Dendrogram {
    /// Orders merges by height; equal heights keep their construction order.
    pub fn new(leaves: usize, mut merges: Vec<Merge>) -> Result<Self, PipelineError> {
        if merges.len() + 1 != leaves.max(1) {
            return Err(PipelineError::invalid_parameter(
                "dendrogram",
                format!("{} merges cannot join {leaves} leaves", merges.len()),
            ));
        }
        if let Some(merge) = merges
            .iter()
            .find(|merge| merge.left >= leaves || merge.right >= leaves)
        {
            return Err(PipelineError::invalid_parameter(
                "dendrogram",
                format!("merge references leaf {} of {leaves}", merge.left.max(merge.right)),
            ));
        }

        merges.sort_by(|left, right| left.height.total_cmp(&right.height));
        Ok(Self { leaves, merges })
    }

    pub fn leaves(&self) -> usize {
        self.leaves
    }

    pub fn merges(&self) -> &[Merge] {
        &self.merges
    }

    /// Labels every leaf with one of exactly `clusters` groups, numbered by first
    /// appearance in row order.
    pub fn cut(&self, clusters: usize) -> Result<Vec<usize>, PipelineError> {
        if clusters == 0 || clusters > self.leaves {
            return Err(PipelineError::InvalidClusterLevel {
                level: clusters,
                rows: self.leaves,
            });
        }

        let mut groups = DisjointSet::new(self.leaves);
        for merge in &self.merges[..self.leaves - clusters] {
            groups.union(merge.left, merge.right);
        }

        let mut label_of_root = BTreeMap::<usize, usize>::new();
        let labels = (0..self.leaves)
            .map(|leaf| {
                let root = groups.find(leaf);
                let next = label_of_root.len();
                *label_of_root.entry(root).or_insert(next)
            })
            .collect::<Vec<usize>>();

        Ok(labels)
    }
}

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = node;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    fn union(&mut self, left: usize, right: usize) {
        let left = self.find(left);
        let right = self.find(right);
        if left == right {
            return;
        }
        match self.rank[left].cmp(&self.rank[right]) {
            std::cmp::Ordering::Less => self.parent[left] = right,
            std::cmp::Ordering::Greater => self.parent[right] = left,
            std::cmp::Ordering::Equal => {
                self.parent[right] = left;
                self.rank[left] += 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterAssignment {
    pub level: usize,
    pub labels: Vec<usize>,
}

impl ClusterAssignment {
    /// `(min, median, max)` group sizes.
    pub fn size_summary(&self) -> (usize, usize, usize) {
        let mut counts = vec![0usize; self.level];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts.sort_unstable();
        match (counts.first(), counts.last()) {
            (Some(&min), Some(&max)) => (min, counts[counts.len() / 2], max),
            _ => (0, 0, 0),
        }
    }
}

/// Checks every level against the row count and returns them deduplicated in
/// ascending order.
pub fn validate_levels(levels: &[usize], rows: usize) -> Result<Vec<usize>, PipelineError> {
    if levels.is_empty() {
        return Err(PipelineError::invalid_parameter(
            "levels",
            "at least one cluster level is required",
        ));
    }
    if let Some(&level) = levels.iter().find(|&&level| level == 0 || level > rows) {
        return Err(PipelineError::InvalidClusterLevel { level, rows });
    }

    Ok(levels.iter().copied().collect::<BTreeSet<usize>>().into_iter().collect())
}

pub fn cluster(
    vectors: &VectorSet,
    levels: &[usize],
    clusterer: &dyn Clusterer,
) -> Result<BTreeMap<usize, ClusterAssignment>, PipelineError> {
    let levels = validate_levels(levels, vectors.len())?;
    let dendrogram = clusterer.build(vectors)?;
    if dendrogram.leaves() != vectors.len() {
        return Err(PipelineError::RowCountMismatch {
            vectors: vectors.len(),
            metadata: dendrogram.leaves(),
        });
    }

    levels
        .into_iter()
        .map(|level| {
            let labels = dendrogram.cut(level)?;
            Ok((level, ClusterAssignment { level, labels }))
        })
        .collect()
}

/// Digits needed for the widest level, so text and numeric column order agree.
pub fn level_width<'a>(levels: impl IntoIterator<Item = &'a usize>) -> usize {
    levels
        .into_iter()
        .max()
        .map(|level| level.to_string().len())
        .unwrap_or(1)
}

pub fn cluster_column_name(level: usize, width: usize) -> String {
    format!("{CLUSTER_COLUMN_PREFIX}{level:0width$}")
}

pub fn append_cluster_columns(
    table: &Table,
    assignments: &BTreeMap<usize, ClusterAssignment>,
) -> Result<Table, PipelineError> {
    let width = level_width(assignments.keys());
    let mut augmented = table.clone();
    for (level, assignment) in assignments {
        let values = assignment
            .labels
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<String>>();
        augmented = augmented.with_column(&cluster_column_name(*level, width), values)?;
    }
    Ok(augmented)
}
