//! Session and training configuration, constructed once and passed by reference.

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{channel::ChannelOptions, session::Role};

/// Errors caused by invalid or unsupported configurations.
#[derive(Debug, Error)]
pub enum Error {
    /// A field holds a value outside of its valid range.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// Only binary classification is supported by the additive schemes.
    #[error("{classes} classes requested, but only binary objectives are supported")]
    MulticlassUnsupported {
        /// The number of requested classes.
        classes: u32,
    },
    /// The party must accept connections, but has no address to listen on.
    #[error("{0} must accept connections, but no listen address is configured")]
    MissingListenAddress(Role),
    /// The same peer is listed twice or the party lists itself.
    #[error("peer {0} is listed more than once or is the local party")]
    DuplicatePeer(Role),
    /// A configuration file could not be read.
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    /// A configuration file could not be parsed.
    #[error("could not parse config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// The loss a model is trained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Squared error, identity link.
    Linear,
    /// Binary cross-entropy, sigmoid link.
    Logistic,
}

impl Objective {
    /// Applies the link function to a raw score.
    pub fn link(self, score: f64) -> f64 {
        match self {
            Objective::Linear => score,
            Objective::Logistic => 1.0 / (1.0 + (-score).exp()),
        }
    }
}

/// Address of a remote party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The role the peer plays in the session.
    pub role: Role,
    /// Where the peer accepts connections.
    pub address: SocketAddr,
}

/// Everything a party needs to wire up its channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// The role of the local party.
    pub role: Role,
    /// Where the local party accepts connections from peers with a lower role.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    /// All remote parties this party talks to.
    pub peers: Vec<PeerConfig>,
    /// How long a `recv` waits before the iteration is aborted.
    #[serde(with = "duration_ms", default = "default_recv_timeout")]
    pub recv_timeout: Duration,
    /// How long a party keeps dialing a peer that is not up yet.
    #[serde(with = "duration_ms", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Timeouts and cache behaviour of every channel.
    #[serde(default)]
    pub channel: ChannelOptions,
}

fn default_recv_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(60)
}

impl SessionConfig {
    /// Reads and validates a JSON session config.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that peers are unique and that a listen address exists if one is needed.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = vec![self.role];
        for peer in &self.peers {
            if seen.contains(&peer.role) {
                return Err(Error::DuplicatePeer(peer.role));
            }
            seen.push(peer.role);
        }
        if self.listen.is_none() && self.peers.iter().any(|p| p.role < self.role) {
            return Err(Error::MissingListenAddress(self.role));
        }
        if self.recv_timeout.is_zero() {
            return Err(Error::Invalid {
                field: "recv_timeout",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Parameters of the vertical linear / logistic regression protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearConfig {
    /// Number of full gradient-exchange iterations.
    pub iterations: u32,
    /// Step size of the local update `w -= lr * grad / n`.
    pub learning_rate: f64,
    /// L2 regularization strength.
    #[serde(default)]
    pub lambda: f64,
    /// The trained loss.
    pub objective: Objective,
    /// Number of label classes, only 2 is supported.
    #[serde(default = "default_classes")]
    pub num_classes: u32,
    /// Whether the active party fits an intercept.
    #[serde(default = "default_true")]
    pub fit_bias: bool,
}

/// Parameters of the vertical gradient-boosted tree protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Number of boosting rounds (trees).
    pub rounds: u32,
    /// Shrinkage applied to every leaf weight.
    pub learning_rate: f64,
    /// Maximum depth of a tree, a root-only tree has depth 0.
    pub max_depth: u32,
    /// Minimum hessian sum of each child of a split.
    #[serde(default = "default_min_child_weight")]
    pub min_child_weight: f64,
    /// L2 regularization on leaf weights.
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    /// Minimum loss reduction of a split.
    #[serde(default)]
    pub gamma: f64,
    /// Maximum number of candidate thresholds (plus one) per feature.
    #[serde(default = "default_max_bins")]
    pub max_bins: usize,
    /// The trained loss.
    pub objective: Objective,
    /// Number of label classes, only 2 is supported.
    #[serde(default = "default_classes")]
    pub num_classes: u32,
    /// Raw score every prediction starts from.
    #[serde(default)]
    pub base_score: f64,
}

fn default_classes() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_min_child_weight() -> f64 {
    1.0
}

fn default_lambda() -> f64 {
    1.0
}

fn default_max_bins() -> usize {
    32
}

fn check_classes(objective: Objective, classes: u32) -> Result<(), Error> {
    match (objective, classes) {
        (Objective::Logistic, 2) => Ok(()),
        (Objective::Logistic, classes) => Err(Error::MulticlassUnsupported { classes }),
        (Objective::Linear, _) => Ok(()),
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), Error> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::Invalid {
            field,
            reason: format!("{value} is not a positive number"),
        })
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), Error> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::Invalid {
            field,
            reason: format!("{value} is negative or not a number"),
        })
    }
}

impl LinearConfig {
    /// Rejects unsupported requests before any party starts training.
    pub fn validate(&self) -> Result<(), Error> {
        if self.iterations == 0 {
            return Err(Error::Invalid {
                field: "iterations",
                reason: "at least one iteration is required".into(),
            });
        }
        positive("learning_rate", self.learning_rate)?;
        non_negative("lambda", self.lambda)?;
        check_classes(self.objective, self.num_classes)
    }
}

impl TreeConfig {
    /// Rejects unsupported requests before any party starts training.
    pub fn validate(&self) -> Result<(), Error> {
        if self.rounds == 0 {
            return Err(Error::Invalid {
                field: "rounds",
                reason: "at least one round is required".into(),
            });
        }
        if self.max_bins < 2 {
            return Err(Error::Invalid {
                field: "max_bins",
                reason: "at least 2 bins are needed to form a threshold".into(),
            });
        }
        positive("learning_rate", self.learning_rate)?;
        non_negative("min_child_weight", self.min_child_weight)?;
        non_negative("lambda", self.lambda)?;
        non_negative("gamma", self.gamma)?;
        if !self.base_score.is_finite() {
            return Err(Error::Invalid {
                field: "base_score",
                reason: "must be finite".into(),
            });
        }
        check_classes(self.objective, self.num_classes)
    }
}

/// Returns the number of features of a row-major shard, rejecting ragged or empty shards.
pub(crate) fn shard_width(rows: &[Vec<f64>]) -> Result<usize, Error> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if width == 0 {
        return Err(Error::Invalid {
            field: "features",
            reason: "the shard holds no samples or no features".into(),
        });
    }
    if let Some(i) = rows.iter().position(|r| r.len() != width) {
        return Err(Error::Invalid {
            field: "features",
            reason: format!("row {i} has {} features, expected {width}", rows[i].len()),
        });
    }
    if rows.iter().flatten().any(|x| !x.is_finite()) {
        return Err(Error::Invalid {
            field: "features",
            reason: "features must be finite".into(),
        });
    }
    Ok(width)
}

/// Checks that there is one label per sample and that labels fit the objective.
pub(crate) fn check_labels(
    objective: Objective,
    labels: &[f64],
    samples: usize,
) -> Result<(), Error> {
    if labels.len() != samples {
        return Err(Error::Invalid {
            field: "labels",
            reason: format!("{} labels for {samples} samples", labels.len()),
        });
    }
    let valid = |y: &f64| match objective {
        Objective::Linear => y.is_finite(),
        Objective::Logistic => *y == 0.0 || *y == 1.0,
    };
    match labels.iter().position(|y| !valid(y)) {
        Some(i) => Err(Error::Invalid {
            field: "labels",
            reason: format!("label {} of sample {i} is invalid for {objective:?}", labels[i]),
        }),
        None => Ok(()),
    }
}

/// (De-)serializes a [`Duration`] as a number of milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
