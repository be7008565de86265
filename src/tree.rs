//! Gradient-boosted decision trees whose splits are private to the party that owns them.
//!
//! The shared structure of a tree only contains opaque [`SplitRef`]s. Which feature and which
//! threshold a split tests is recorded in the owner's private [`LookupTable`], so only the owner
//! can route samples through its own splits. The choreography that grows these trees is in
//! [`protocol`], replaying them for new samples in [`crate::inference`].

use serde::{Deserialize, Serialize};

use crate::{config::Objective, session::Role};

pub mod protocol;

/// An opaque reference to a split, meaningful only to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitRef {
    /// The party whose lookup table holds the split.
    pub owner: Role,
    /// The row of the owner's lookup table.
    pub record_id: u64,
}

/// A node of a shared tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// A terminal node.
    Leaf {
        /// The (unshrunk) leaf weight `-G / (H + λ)`.
        weight: f64,
    },
    /// An inner node; samples with `x <= threshold` go left.
    Split {
        /// Which party decides the split.
        split: SplitRef,
        /// Samples that satisfy the split.
        left: Box<Node>,
        /// All other samples.
        right: Box<Node>,
    },
}

impl Node {
    /// The number of leaves below (and including) this node.
    pub fn leaves(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Node::Leaf { .. } => count += 1,
                Node::Split { left, right, .. } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        count
    }

    /// The length of the longest path from this node to a leaf.
    pub fn depth(&self) -> u32 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    /// All splits of the tree, in preorder.
    pub fn splits(&self) -> Vec<SplitRef> {
        let mut splits = vec![];
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Node::Split { split, left, right } = node {
                splits.push(*split);
                stack.push(right);
                stack.push(left);
            }
        }
        splits
    }
}

/// A row of a private lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LookupRow {
    /// The id under which the split appears in the shared tree.
    pub record_id: u64,
    /// The column of the owner's shard.
    pub feature: usize,
    /// Samples with `x <= threshold` go left.
    pub threshold: f64,
}

/// The private mapping from record ids to `(feature, threshold)`, one table per tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupTable {
    rows: Vec<LookupRow>,
}

impl LookupTable {
    /// Records a split and returns its new record id.
    pub fn insert(&mut self, feature: usize, threshold: f64) -> u64 {
        let record_id = self.rows.len() as u64;
        self.rows.push(LookupRow {
            record_id,
            feature,
            threshold,
        });
        record_id
    }

    /// Looks up a split by its record id.
    pub fn get(&self, record_id: u64) -> Option<&LookupRow> {
        usize::try_from(record_id)
            .ok()
            .and_then(|i| self.rows.get(i))
    }

    /// All rows, ordered by record id.
    pub fn rows(&self) -> &[LookupRow] {
        &self.rows
    }

    /// The number of recorded splits.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no split was recorded.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The gradient and hessian sums on both sides of a candidate split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitStats {
    /// Σg of the samples that go left.
    pub g_left: f64,
    /// Σg of the samples that go right.
    pub g_right: f64,
    /// Σh of the samples that go left.
    pub h_left: f64,
    /// Σh of the samples that go right.
    pub h_right: f64,
}

/// Parameters of the gain computation, taken from [`crate::config::TreeConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainParams {
    /// L2 regularization on leaf weights.
    pub lambda: f64,
    /// Minimum loss reduction of a split.
    pub gamma: f64,
    /// Minimum hessian sum of each child.
    pub min_child_weight: f64,
}

/// `G_L²/(H_L+λ) + G_R²/(H_R+λ) − (G_L+G_R)²/(H_L+H_R+λ) − γ`
pub fn gain(stats: &SplitStats, lambda: f64, gamma: f64) -> f64 {
    let score = |g: f64, h: f64| g * g / (h + lambda);
    score(stats.g_left, stats.h_left) + score(stats.g_right, stats.h_right)
        - score(
            stats.g_left + stats.g_right,
            stats.h_left + stats.h_right,
        )
        - gamma
}

/// The optimal weight `-G / (H + λ)` of a leaf.
pub fn leaf_weight(g: f64, h: f64, lambda: f64) -> f64 {
    if h + lambda == 0.0 { 0.0 } else { -g / (h + lambda) }
}

/// The winning candidate of a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Best {
    /// The party that owns the candidate.
    pub owner: Role,
    /// The index into the owner's candidate list.
    pub candidate: usize,
    /// The gain of the split.
    pub gain: f64,
    /// The sums the gain was computed from.
    pub stats: SplitStats,
}

/// Picks the candidate with the highest positive gain whose children are heavy enough.
///
/// Ties are won by the candidate that comes first.
pub fn best_split(
    candidates: impl IntoIterator<Item = (Role, usize, SplitStats)>,
    params: &GainParams,
) -> Option<Best> {
    let mut best: Option<Best> = None;
    for (owner, candidate, stats) in candidates {
        if stats.h_left < params.min_child_weight || stats.h_right < params.min_child_weight {
            continue;
        }
        let gain = gain(&stats, params.lambda, params.gamma);
        if !gain.is_finite() || gain <= 0.0 {
            continue;
        }
        if best.is_none_or(|b| gain > b.gain) {
            best = Some(Best {
                owner,
                candidate,
                gain,
                stats,
            });
        }
    }
    best
}

/// A candidate split of the local party.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// The column of the local shard.
    pub feature: usize,
    /// Samples with `x <= threshold` go left.
    pub threshold: f64,
}

/// Quantile thresholds of one column, ascending and without the maximum.
///
/// Columns with at most `max_bins` distinct values use every distinct value.
pub fn thresholds(rows: &[Vec<f64>], feature: usize, max_bins: usize) -> Vec<f64> {
    let mut values: Vec<f64> = rows.iter().map(|r| r[feature]).collect();
    values.sort_by(f64::total_cmp);
    values.dedup();
    let Some(&max) = values.last() else {
        return vec![];
    };
    let mut thresholds: Vec<f64> = if values.len() <= max_bins {
        values
    } else {
        (1..max_bins)
            .map(|k| values[k * (values.len() - 1) / max_bins])
            .collect()
    };
    thresholds.dedup();
    thresholds.retain(|&t| t < max);
    thresholds
}

/// All candidates of a shard, ordered by feature, then by threshold.
pub fn candidates(rows: &[Vec<f64>], max_bins: usize) -> Vec<Candidate> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    (0..width)
        .flat_map(|feature| {
            thresholds(rows, feature, max_bins)
                .into_iter()
                .map(move |threshold| Candidate { feature, threshold })
        })
        .collect()
}

/// Splits the samples into those that go left and those that go right.
pub fn partition(
    rows: &[Vec<f64>],
    samples: &[usize],
    feature: usize,
    threshold: f64,
) -> (Vec<usize>, Vec<usize>) {
    samples
        .iter()
        .partition(|&&i| rows[i][feature] <= threshold)
}

/// For every candidate, folds the values of the samples that go left (`None` if none do).
///
/// Sums are accumulated over the samples sorted by feature value, so every feature costs one
/// pass over the samples no matter how many thresholds it has.
pub(crate) fn left_sums<T: Clone, E>(
    rows: &[Vec<f64>],
    samples: &[usize],
    candidates: &[Candidate],
    value: impl Fn(usize) -> T,
    mut add: impl FnMut(&T, &T) -> Result<T, E>,
) -> Result<Vec<Option<T>>, E> {
    let mut sums = Vec::with_capacity(candidates.len());
    let mut sorted: Vec<usize> = samples.to_vec();
    let mut current: Option<usize> = None;
    let mut acc: Option<T> = None;
    let mut next = 0;
    for c in candidates {
        if current != Some(c.feature) {
            current = Some(c.feature);
            sorted.sort_by(|&a, &b| rows[a][c.feature].total_cmp(&rows[b][c.feature]));
            acc = None;
            next = 0;
        }
        while next < sorted.len() && rows[sorted[next]][c.feature] <= c.threshold {
            let v = value(sorted[next]);
            acc = Some(match &acc {
                None => v,
                Some(acc) => add(acc, &v)?,
            });
            next += 1;
        }
        sums.push(acc.clone());
    }
    Ok(sums)
}

/// Per-sample gradient and hessian of the loss at the current raw scores.
pub fn gradients(objective: Objective, labels: &[f64], scores: &[f64]) -> Vec<(f64, f64)> {
    labels
        .iter()
        .zip(scores)
        .map(|(&y, &score)| match objective {
            Objective::Logistic => {
                let p = objective.link(score);
                (p - y, p * (1.0 - p))
            }
            Objective::Linear => (score - y, 1.0),
        })
        .collect()
}

/// The mean training loss at the current raw scores.
pub fn loss(objective: Objective, labels: &[f64], scores: &[f64]) -> f64 {
    let n = labels.len().max(1) as f64;
    let total: f64 = labels
        .iter()
        .zip(scores)
        .map(|(&y, &score)| match objective {
            Objective::Logistic => {
                let p = objective.link(score).clamp(1e-15, 1.0 - 1e-15);
                -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            }
            Objective::Linear => 0.5 * (score - y) * (score - y),
        })
        .sum();
    total / n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(g_left: f64, g_right: f64, h_left: f64, h_right: f64) -> SplitStats {
        SplitStats {
            g_left,
            g_right,
            h_left,
            h_right,
        }
    }

    #[test]
    fn gain_matches_hand_computation() {
        // 4/(2+1) + 16/(2+1) - 4/(4+1) - 0.5
        let g = gain(&stats(2.0, -4.0, 2.0, 2.0), 1.0, 0.5);
        assert!((g - (4.0 / 3.0 + 16.0 / 3.0 - 0.8 - 0.5)).abs() < 1e-12);
        assert_eq!(leaf_weight(2.0, 3.0, 1.0), -0.5);
    }

    #[test]
    fn best_split_respects_min_child_weight_and_ties() {
        let params = GainParams {
            lambda: 1.0,
            gamma: 0.0,
            min_child_weight: 1.0,
        };
        let candidates = [
            (Role::Host, 0, stats(3.0, -3.0, 0.5, 3.0)),
            (Role::Host, 1, stats(1.0, -1.0, 2.0, 2.0)),
            (Role::Guest(0), 0, stats(1.0, -1.0, 2.0, 2.0)),
            (Role::Guest(0), 1, stats(0.0, 0.0, 2.0, 2.0)),
        ];
        let best = best_split(candidates, &params).expect("a split has positive gain");
        assert_eq!((best.owner, best.candidate), (Role::Host, 1));
        assert!(best_split([(Role::Host, 0, stats(0.0, 0.0, 2.0, 2.0))], &params).is_none());
    }

    #[test]
    fn thresholds_exclude_the_maximum() {
        let rows: Vec<Vec<f64>> = [3.0, 1.0, 2.0, 2.0].iter().map(|&x| vec![x]).collect();
        assert_eq!(thresholds(&rows, 0, 32), vec![1.0, 2.0]);
        let many: Vec<Vec<f64>> = (0..100).map(|i| vec![i as f64]).collect();
        let t = thresholds(&many, 0, 4);
        assert_eq!(t, vec![24.0, 49.0, 74.0]);
    }

    #[test]
    fn left_sums_follow_sorted_order() -> Result<(), ()> {
        let rows = vec![vec![0.5, 9.0], vec![0.1, 7.0], vec![0.3, 8.0]];
        let candidates = candidates(&rows, 32);
        assert_eq!(candidates.len(), 4);
        let sums = left_sums(&rows, &[0, 1, 2], &candidates, |i| i as f64 + 1.0, |a, b| {
            Ok::<_, ()>(a + b)
        })?;
        assert_eq!(sums, vec![Some(2.0), Some(5.0), Some(2.0), Some(5.0)]);
        let subset = left_sums(&rows, &[0], &candidates, |i| i as f64 + 1.0, |a, b| {
            Ok::<_, ()>(a + b)
        })?;
        assert_eq!(subset, vec![None, None, None, None]);
        Ok(())
    }

    #[test]
    fn tree_shape() {
        let leaf = |weight| Box::new(Node::Leaf { weight });
        let tree = Node::Split {
            split: SplitRef {
                owner: Role::Host,
                record_id: 0,
            },
            left: leaf(1.0),
            right: Box::new(Node::Split {
                split: SplitRef {
                    owner: Role::Guest(0),
                    record_id: 0,
                },
                left: leaf(2.0),
                right: leaf(3.0),
            }),
        };
        assert_eq!(tree.leaves(), 3);
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.splits().len(), 2);
        let (l, r) = partition(&[vec![1.0], vec![2.0]], &[0, 1], 0, 1.0);
        assert_eq!((l, r), (vec![0], vec![1]));
    }
}
