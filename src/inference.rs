//! Prediction with trained models.
//!
//! Tree ensembles are replayed node by node: at every split only the owner can look up feature
//! and threshold, so it routes the samples and publishes nothing but the two index sets. Guests
//! owning a split send these sets to the Host, which checks and relays them to the other Guests,
//! just like during training. Every party walks the trees in the same order and therefore ends up
//! with the same leaf for every sample and the same prediction.
//!
//! Linear models are recombined by the Active party from its own and the Passive party's partial
//! scores.

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::{
    config::shard_width,
    error::Error,
    model::{LinearModel, TreeModel},
    session::{Role, Session},
    tree::{LookupTable, Node, SplitRef, partition, protocol::check_partition},
};

/// The samples a split sends to either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Routing {
    left: Vec<usize>,
    right: Vec<usize>,
}

fn route_locally(
    table: &LookupTable,
    split: &SplitRef,
    rows: &[Vec<f64>],
    width: usize,
    samples: &[usize],
) -> Result<Routing, Error> {
    let row = table.get(split.record_id).ok_or_else(|| {
        Error::ProtocolViolation(format!("no lookup row with record id {}", split.record_id))
    })?;
    if row.feature >= width {
        return Err(Error::ProtocolViolation(format!(
            "split {} tests feature {}, but the shard has {width} columns",
            split.record_id, row.feature
        )));
    }
    let (left, right) = partition(rows, samples, row.feature, row.threshold);
    Ok(Routing { left, right })
}

/// Decides how the samples at `split` are routed, sending or relaying the decision as needed.
async fn route(
    session: &Session,
    table: Option<&LookupTable>,
    split: &SplitRef,
    rows: &[Vec<f64>],
    width: usize,
    samples: &[usize],
    tag: &str,
) -> Result<Routing, Error> {
    let me = session.role();
    let guests: Vec<Role> = session
        .peers()
        .filter(|&p| matches!(p, Role::Guest(_)) && p != split.owner)
        .collect();
    if split.owner == me {
        let table = table.ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "{me} owns split {} without a lookup table",
                split.record_id
            ))
        })?;
        let routing = route_locally(table, split, rows, width, samples)?;
        match me {
            Role::Host => session.broadcast(&guests, tag, &routing).await?,
            _ => session.send(Role::Host, tag, &routing).await?,
        }
        return Ok(routing);
    }
    match me {
        Role::Host => {
            let routing: Routing = session.recv(split.owner, tag).await?;
            check_partition(samples, &routing.left, &routing.right, true)?;
            session.broadcast(&guests, tag, &routing).await?;
            Ok(routing)
        }
        _ => {
            let routing: Routing = session.recv(Role::Host, tag).await?;
            check_partition(samples, &routing.left, &routing.right, true)?;
            Ok(routing)
        }
    }
}

/// Predicts the samples with a tree ensemble, in lock-step with all other parties.
///
/// `rows` is the party's own shard of the samples to predict, in the same order at every party.
/// `batch` must be unique per call within a session, as it is part of every tag. Returns the
/// predictions after the link function, which every party learns.
#[instrument(level = Level::DEBUG, skip_all, fields(role = %session.role(), batch = batch), err)]
pub async fn predict_trees(
    session: &Session,
    model: &TreeModel,
    rows: &[Vec<f64>],
    batch: u64,
) -> Result<Vec<f64>, Error> {
    let width = if rows.is_empty() { 0 } else { shard_width(rows)? };
    let mut scores = vec![model.base_score; rows.len()];
    for (t, tree) in model.trees.iter().enumerate() {
        let table = model.lookup_tables.get(t);
        let mut visited = 0;
        let mut stack: Vec<(&Node, Vec<usize>)> = vec![(tree, (0..rows.len()).collect())];
        while let Some((node, samples)) = stack.pop() {
            if samples.is_empty() {
                continue;
            }
            match node {
                Node::Leaf { weight } => {
                    for i in samples {
                        scores[i] += model.learning_rate * weight;
                    }
                }
                Node::Split { split, left, right } => {
                    let tag = format!("route/{batch}/{t}/{visited}");
                    visited += 1;
                    let routing = route(session, table, split, rows, width, &samples, &tag).await?;
                    stack.push((right, routing.right));
                    stack.push((left, routing.left));
                }
            }
        }
        debug!("Tree {t} replayed with {visited} routed splits");
    }
    Ok(scores
        .into_iter()
        .map(|s| model.objective.link(s))
        .collect())
}

/// Combines both partial scores of a linear model at the Active party.
#[instrument(level = Level::DEBUG, skip_all, fields(batch = batch), err)]
pub async fn predict_linear_active(
    session: &Session,
    model: &LinearModel,
    rows: &[Vec<f64>],
    batch: u64,
) -> Result<Vec<f64>, Error> {
    let passive: Vec<f64> = session
        .recv_vec(Role::Passive, &format!("predict_u_a/{batch}"), rows.len())
        .await?;
    rows.iter()
        .zip(passive)
        .map(|(row, u_a)| Ok(model.objective.link(model.partial_score(row)? + u_a)))
        .collect()
}

/// Sends the Passive party's partial scores of a linear model to the Active party.
#[instrument(level = Level::DEBUG, skip_all, fields(batch = batch), err)]
pub async fn predict_linear_passive(
    session: &Session,
    model: &LinearModel,
    rows: &[Vec<f64>],
    batch: u64,
) -> Result<(), Error> {
    let partial = rows
        .iter()
        .map(|row| model.partial_score(row))
        .collect::<Result<Vec<f64>, Error>>()?;
    session
        .send(Role::Active, &format!("predict_u_a/{batch}"), &partial)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_record_ids_are_rejected() {
        let mut table = LookupTable::default();
        let record_id = table.insert(0, 0.5);
        let rows = vec![vec![0.1], vec![0.9]];
        let split = SplitRef {
            owner: Role::Host,
            record_id,
        };
        let routing = route_locally(&table, &split, &rows, 1, &[0, 1]).unwrap();
        assert_eq!((routing.left, routing.right), (vec![0], vec![1]));
        let unknown = SplitRef {
            record_id: record_id + 1,
            ..split
        };
        assert!(route_locally(&table, &unknown, &rows, 1, &[0, 1]).is_err());
        assert!(route_locally(&table, &split, &rows, 0, &[0, 1]).is_err());
    }
}
