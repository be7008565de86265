#![allow(dead_code)]

use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing_subscriber::EnvFilter;
use vfl_mpc::{
    channel::ChannelOptions,
    session::{Role, Session},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn sessions(roles: &[Role], options: ChannelOptions) -> Vec<Session> {
    Session::local(roles, options, Duration::from_secs(60))
}

/// Samples split column-wise between parties, with binary labels.
pub struct Dataset {
    pub shards: Vec<Vec<Vec<f64>>>,
    pub labels: Vec<f64>,
}

impl Dataset {
    /// The columns of all shards side by side, as a single party would hold them.
    pub fn joined(&self) -> Vec<Vec<f64>> {
        (0..self.labels.len())
            .map(|i| {
                self.shards
                    .iter()
                    .flat_map(|shard| shard[i].iter().copied())
                    .collect()
            })
            .collect()
    }
}

/// Uniform features in `[-1, 1]`, labelled by whether their sum is positive.
///
/// Samples closer than `margin` to the separating hyperplane are redrawn.
pub fn separable(samples: usize, widths: &[usize], margin: f64, seed: u64) -> Dataset {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let total: usize = widths.iter().sum();
    let mut rows = vec![];
    let mut labels = vec![];
    while rows.len() < samples {
        let row: Vec<f64> = (0..total).map(|_| rng.random_range(-1.0..1.0)).collect();
        let sum: f64 = row.iter().sum();
        if sum.abs() < margin {
            continue;
        }
        labels.push(if sum > 0.0 { 1.0 } else { 0.0 });
        rows.push(row);
    }
    Dataset {
        shards: split_columns(&rows, widths),
        labels,
    }
}

/// Features in `[0, 1]` where only the given column of all columns decides the label.
pub fn decided_by(samples: usize, widths: &[usize], column: usize, seed: u64) -> Dataset {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let total: usize = widths.iter().sum();
    let rows: Vec<Vec<f64>> = (0..samples)
        .map(|_| (0..total).map(|_| rng.random_range(0.0..1.0)).collect())
        .collect();
    let labels = rows
        .iter()
        .map(|row| if row[column] > 0.6 { 1.0 } else { 0.0 })
        .collect();
    Dataset {
        shards: split_columns(&rows, widths),
        labels,
    }
}

fn split_columns(rows: &[Vec<f64>], widths: &[usize]) -> Vec<Vec<Vec<f64>>> {
    let mut start = 0;
    widths
        .iter()
        .map(|&w| {
            let shard = rows.iter().map(|row| row[start..start + w].to_vec()).collect();
            start += w;
            shard
        })
        .collect()
}

pub fn accuracy(predictions: &[f64], labels: &[f64]) -> f64 {
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|&(&p, &y)| (p > 0.5) == (y > 0.5))
        .count();
    correct as f64 / labels.len() as f64
}
