//! The error type returned by all protocol entry points.

use std::time::Duration;

use thiserror::Error;

use crate::{channel, config, crypto, session::Role};

/// A custom error type for the training and inference protocols.
///
/// None of these errors is retried inside an iteration: masks that were already consumed can not
/// be replayed safely, so a failed iteration fails the whole run.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection to a peer failed or was lost.
    #[error("transport error: {0}")]
    Transport(channel::Error),
    /// A peer did not send an expected value in time.
    #[error("no value tagged `{tag}` arrived within {after:?}")]
    Timeout {
        /// The tag that was awaited.
        tag: String,
        /// How long the party waited.
        after: Duration,
    },
    /// A received value does not have the shape the protocol expects at this point.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The next operation would exceed the multiplicative depth of a leveled ciphertext.
    #[error("multiplicative budget exceeded: {needed} levels needed, {remaining} remaining")]
    CryptoBudgetExceeded {
        /// Levels the next operation consumes.
        needed: u32,
        /// Levels left before a refresh is required.
        remaining: u32,
    },
    /// A homomorphic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::Error),
    /// The requested configuration is invalid or unsupported.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    /// The session has no channel to the given peer.
    #[error("no channel to {0}")]
    UnknownPeer(Role),
    /// A model artifact could not be read or written.
    #[error("could not persist model: {0}")]
    Io(#[from] std::io::Error),
    /// A model artifact could not be (de-)serialized.
    #[error("could not (de-)serialize model: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        match e {
            channel::Error::Timeout { tag, after } => Self::Timeout { tag, after },
            channel::Error::Serde { .. }
            | channel::Error::InvalidLength { .. }
            | channel::Error::TagCollision { .. }
            | channel::Error::FrameTooLarge { .. } => Self::ProtocolViolation(e.to_string()),
            channel::Error::Transport { .. } | channel::Error::Closed(_) => Self::Transport(e),
        }
    }
}

pub(crate) fn transport(phase: impl Into<String>, reason: impl ToString) -> Error {
    Error::Transport(channel::Error::Transport {
        phase: phase.into(),
        reason: reason.to_string(),
    })
}
