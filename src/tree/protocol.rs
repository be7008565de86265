//! The Host/Guest choreography that grows one boosted tree per round.
//!
//! The Host holds the labels and the key pair. At the start of every round it sends the encrypted
//! per-sample gradients and hessians to every Guest. Nodes are then grown depth-first, left before
//! right, with node ids allocated in the same order by every party:
//!
//! 1. Unless the node is a forced leaf (maximum depth reached or fewer than two samples), every
//!    Guest sends the encrypted `(ΣG_L, ΣG_R, ΣH_L, ΣH_R)` of each of its candidates.
//! 2. The Host decrypts them, scores them together with its own plaintext candidates and picks
//!    the best split.
//! 3. If the Host owns it, the Host partitions locally and announces `(Host, record_id)` with the
//!    two sample sets. If a Guest owns it, only that Guest learns the index of the winning
//!    candidate, partitions locally and returns its record id and the sample sets, which the Host
//!    checks and relays to the other Guests. No party ever learns another party's feature or
//!    threshold.
//! 4. Without a split with positive gain the node becomes a leaf, whose weight the Host computes
//!    from its plaintext sums and announces to everyone.
//!
//! Guests are only connected to the Host, so everything between Guests is relayed.

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, info, instrument};

use crate::{
    config::{TreeConfig, check_labels, shard_width},
    crypto::{Scheme, fresh_rng, sum},
    error::Error,
    model::TreeModel,
    session::{Role, Session},
    tree::{
        Candidate, GainParams, LookupTable, Node, SplitRef, SplitStats, best_split, candidates,
        gradients, leaf_weight, left_sums, loss, partition,
    },
};

/// The encrypted gradient and hessian of one sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedGradient<C> {
    /// `[g_i]`
    pub g: C,
    /// `[h_i]`
    pub h: C,
}

/// The encrypted sums of one candidate split, as sent by a Guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedStats<C> {
    /// `[ΣG_L]`
    pub g_left: C,
    /// `[ΣG_R]`
    pub g_right: C,
    /// `[ΣH_L]`
    pub h_left: C,
    /// `[ΣH_R]`
    pub h_right: C,
}

impl<C> EncryptedStats<C> {
    fn decrypt<S: Scheme<Ciphertext = C>>(&self, sk: &S::SecretKey) -> Result<SplitStats, Error> {
        Ok(SplitStats {
            g_left: S::decrypt(sk, &self.g_left)?,
            g_right: S::decrypt(sk, &self.g_right)?,
            h_left: S::decrypt(sk, &self.h_left)?,
            h_right: S::decrypt(sk, &self.h_right)?,
        })
    }
}

/// What the Host tells a Guest about a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Decision {
    Leaf {
        weight: f64,
    },
    Split {
        split: SplitRef,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    /// The recipient owns the winning candidate with this index.
    YouOwn {
        candidate: usize,
    },
}

/// The owning Guest's answer to [`Decision::YouOwn`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SplitOutcome {
    record_id: u64,
    left: Vec<usize>,
    right: Vec<usize>,
}

enum Slot {
    Pending,
    Leaf(f64),
    Split {
        split: SplitRef,
        left: usize,
        right: usize,
    },
}

struct Work {
    node: usize,
    samples: Vec<usize>,
    depth: u32,
}

/// The node ids of a tree being grown, in allocation order.
struct Arena {
    slots: Vec<Slot>,
    stack: Vec<Work>,
}

impl Arena {
    fn new(samples: usize) -> Self {
        Self {
            slots: vec![Slot::Pending],
            stack: vec![Work {
                node: 0,
                samples: (0..samples).collect(),
                depth: 0,
            }],
        }
    }

    fn split(&mut self, work: &Work, split: SplitRef, left: Vec<usize>, right: Vec<usize>) {
        let (l, r) = (self.slots.len(), self.slots.len() + 1);
        self.slots.push(Slot::Pending);
        self.slots.push(Slot::Pending);
        self.slots[work.node] = Slot::Split {
            split,
            left: l,
            right: r,
        };
        self.stack.push(Work {
            node: r,
            samples: right,
            depth: work.depth + 1,
        });
        self.stack.push(Work {
            node: l,
            samples: left,
            depth: work.depth + 1,
        });
    }

    /// Builds the tree bottom-up; children always have larger ids than their parent.
    fn assemble(self) -> Result<Node, Error> {
        let mut built: Vec<Option<Node>> = Vec::with_capacity(self.slots.len());
        built.resize_with(self.slots.len(), || None);
        for (id, slot) in self.slots.into_iter().enumerate().rev() {
            let node = match slot {
                Slot::Pending => {
                    return Err(Error::ProtocolViolation(format!("node {id} was never decided")));
                }
                Slot::Leaf(weight) => Node::Leaf { weight },
                Slot::Split { split, left, right } => {
                    let mut child = |i: usize| {
                        built[i].take().ok_or_else(|| {
                            Error::ProtocolViolation(format!("node {i} is referenced twice"))
                        })
                    };
                    let left = Box::new(child(left)?);
                    let right = Box::new(child(right)?);
                    Node::Split { split, left, right }
                }
            };
            built[id] = Some(node);
        }
        built
            .first_mut()
            .and_then(Option::take)
            .ok_or_else(|| Error::ProtocolViolation("empty tree".into()))
    }
}

fn node_tag(name: &str, round: u32, node: usize) -> String {
    format!("{name}/{round}/{node}")
}

fn is_forced_leaf(config: &TreeConfig, work: &Work) -> bool {
    work.depth >= config.max_depth || work.samples.len() < 2
}

/// Checks that `left` and `right` are a partition of `samples`, optionally into non-empty sets.
pub(crate) fn check_partition(
    samples: &[usize],
    left: &[usize],
    right: &[usize],
    allow_empty: bool,
) -> Result<(), Error> {
    let mut expected = samples.to_vec();
    expected.sort_unstable();
    let mut actual: Vec<usize> = left.iter().chain(right).copied().collect();
    actual.sort_unstable();
    let empty = left.is_empty() || right.is_empty();
    if (empty && !allow_empty) || actual != expected {
        return Err(Error::ProtocolViolation(format!(
            "split into {} + {} samples is not a partition of the node's {} samples",
            left.len(),
            right.len(),
            samples.len()
        )));
    }
    Ok(())
}

fn gain_params(config: &TreeConfig) -> GainParams {
    GainParams {
        lambda: config.lambda,
        gamma: config.gamma,
        min_child_weight: config.min_child_weight,
    }
}

fn guests(session: &Session) -> Vec<Role> {
    session
        .peers()
        .filter(|p| matches!(p, Role::Guest(_)))
        .collect()
}

/// Grows the trees as the label-holding Host, which also owns the key pair.
#[instrument(level = Level::DEBUG, skip_all, fields(scheme = S::NAME), err)]
pub async fn train_host<S: Scheme>(
    session: &Session,
    config: &TreeConfig,
    params: &S::Params,
    features: &[Vec<f64>],
    labels: &[f64],
) -> Result<TreeModel, Error> {
    config.validate()?;
    shard_width(features)?;
    let n = features.len();
    check_labels(config.objective, labels, n)?;
    let guests = guests(session);
    let mut rng = fresh_rng();
    let (pk, sk) = S::keygen(params, &mut rng)?;
    session.send_public_key::<S>(&guests, &pk).await?;
    for &guest in &guests {
        let count: usize = session.recv(guest, "sample_count").await?;
        if count != n {
            return Err(Error::ProtocolViolation(format!(
                "{guest} holds {count} samples, the host holds {n}"
            )));
        }
    }
    let candidates = candidates(features, config.max_bins);
    let params = gain_params(config);
    let mut scores = vec![config.base_score; n];
    let mut trees = vec![];
    let mut lookup_tables = vec![];
    for round in 0..config.rounds {
        let gh = gradients(config.objective, labels, &scores);
        let encrypted = gh
            .iter()
            .map(|&(g, h)| -> Result<_, Error> {
                Ok(EncryptedGradient {
                    g: S::encrypt(&pk, g, &mut rng)?,
                    h: S::encrypt(&pk, h, &mut rng)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        session
            .broadcast(&guests, &format!("encrypted_gh/{round}"), &encrypted)
            .await?;

        let mut arena = Arena::new(n);
        let mut table = LookupTable::default();
        let mut leaves: Vec<(f64, Vec<usize>)> = vec![];
        while let Some(work) = arena.stack.pop() {
            let (g, h) = work
                .samples
                .iter()
                .fold((0.0, 0.0), |(g, h), &i| (g + gh[i].0, h + gh[i].1));
            let tag = node_tag("decision", round, work.node);
            let best = if is_forced_leaf(config, &work) {
                None
            } else {
                let own = left_sums(
                    features,
                    &work.samples,
                    &candidates,
                    |i| gh[i],
                    |a, b| Ok::<_, Error>((a.0 + b.0, a.1 + b.1)),
                )?;
                let mut scored: Vec<(Role, usize, SplitStats)> = own
                    .into_iter()
                    .enumerate()
                    .map(|(c, sums)| {
                        let (g_left, h_left) = sums.unwrap_or((0.0, 0.0));
                        let stats = SplitStats {
                            g_left,
                            g_right: g - g_left,
                            h_left,
                            h_right: h - h_left,
                        };
                        (Role::Host, c, stats)
                    })
                    .collect();
                for &guest in &guests {
                    let sums: Vec<EncryptedStats<S::Ciphertext>> = session
                        .recv(guest, &node_tag("split_sums", round, work.node))
                        .await?;
                    for (c, s) in sums.iter().enumerate() {
                        scored.push((guest, c, s.decrypt::<S>(&sk)?));
                    }
                }
                best_split(scored, &params)
            };
            let Some(best) = best else {
                let weight = leaf_weight(g, h, config.lambda);
                session
                    .broadcast(&guests, &tag, &Decision::Leaf { weight })
                    .await?;
                arena.slots[work.node] = Slot::Leaf(weight);
                leaves.push((weight, work.samples));
                continue;
            };
            let (split, left, right) = if best.owner == Role::Host {
                let Candidate { feature, threshold } = candidates[best.candidate];
                let (left, right) = partition(features, &work.samples, feature, threshold);
                let record_id = table.insert(feature, threshold);
                let split = SplitRef {
                    owner: Role::Host,
                    record_id,
                };
                (split, left, right)
            } else {
                let decision = Decision::YouOwn {
                    candidate: best.candidate,
                };
                session.send(best.owner, &tag, &decision).await?;
                let outcome: SplitOutcome = session
                    .recv(best.owner, &node_tag("split_result", round, work.node))
                    .await?;
                check_partition(&work.samples, &outcome.left, &outcome.right, false)?;
                let h_left: f64 = outcome.left.iter().map(|&i| gh[i].1).sum();
                if (h_left - best.stats.h_left).abs() > 1e-6 * (1.0 + h.abs()) {
                    return Err(Error::ProtocolViolation(format!(
                        "{} reported a left child with Σh = {h_left}, its sums promised {}",
                        best.owner, best.stats.h_left
                    )));
                }
                let split = SplitRef {
                    owner: best.owner,
                    record_id: outcome.record_id,
                };
                (split, outcome.left, outcome.right)
            };
            debug!(
                "Node {} split by {} with gain {:.6}",
                work.node, split.owner, best.gain
            );
            let others: Vec<Role> = guests
                .iter()
                .copied()
                .filter(|&g| g != split.owner)
                .collect();
            let decision = Decision::Split {
                split,
                left: left.clone(),
                right: right.clone(),
            };
            session.broadcast(&others, &tag, &decision).await?;
            arena.split(&work, split, left, right);
        }

        for (weight, samples) in &leaves {
            for &i in samples {
                scores[i] += config.learning_rate * weight;
            }
        }
        let tree = arena.assemble()?;
        info!(
            "Round {round}: tree with {} leaves, training loss {:.6}",
            tree.leaves(),
            loss(config.objective, labels, &scores)
        );
        trees.push(tree);
        lookup_tables.push(table);
    }
    Ok(TreeModel {
        role: session.role(),
        trees,
        lookup_tables,
        learning_rate: config.learning_rate,
        base_score: config.base_score,
        objective: config.objective,
    })
}

/// Takes part in growing the trees as a Guest that holds features only.
#[instrument(level = Level::DEBUG, skip_all, fields(scheme = S::NAME), err)]
pub async fn train_guest<S: Scheme>(
    session: &Session,
    config: &TreeConfig,
    features: &[Vec<f64>],
) -> Result<TreeModel, Error> {
    config.validate()?;
    shard_width(features)?;
    let n = features.len();
    let me = session.role();
    let pk = session.recv_public_key::<S>(Role::Host).await?;
    session.send(Role::Host, "sample_count", &n).await?;
    let candidates = candidates(features, config.max_bins);
    let mut rng = fresh_rng();
    let mut trees = vec![];
    let mut lookup_tables = vec![];
    for round in 0..config.rounds {
        let gh: Vec<EncryptedGradient<S::Ciphertext>> = session
            .recv_vec(Role::Host, &format!("encrypted_gh/{round}"), n)
            .await?;
        let zero = S::encrypt(&pk, 0.0, &mut rng)?;
        let mut arena = Arena::new(n);
        let mut table = LookupTable::default();
        while let Some(work) = arena.stack.pop() {
            if !is_forced_leaf(config, &work) {
                let missing = || Error::ProtocolViolation("node without samples".into());
                let g = sum::<S>(&pk, work.samples.iter().map(|&i| &gh[i].g))?
                    .ok_or_else(missing)?;
                let h = sum::<S>(&pk, work.samples.iter().map(|&i| &gh[i].h))?
                    .ok_or_else(missing)?;
                let left = left_sums(
                    features,
                    &work.samples,
                    &candidates,
                    |i| (gh[i].g.clone(), gh[i].h.clone()),
                    |a, b| Ok::<_, Error>((S::add(&pk, &a.0, &b.0)?, S::add(&pk, &a.1, &b.1)?)),
                )?;
                let stats = left
                    .into_iter()
                    .map(|sums| -> Result<EncryptedStats<S::Ciphertext>, Error> {
                        let Some((g_left, h_left)) = sums else {
                            return Ok(EncryptedStats {
                                g_left: zero.clone(),
                                g_right: g.clone(),
                                h_left: zero.clone(),
                                h_right: h.clone(),
                            });
                        };
                        Ok(EncryptedStats {
                            g_right: S::add(&pk, &g, &S::neg(&pk, &g_left)?)?,
                            h_right: S::add(&pk, &h, &S::neg(&pk, &h_left)?)?,
                            g_left,
                            h_left,
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                session
                    .send(Role::Host, &node_tag("split_sums", round, work.node), &stats)
                    .await?;
            }
            let decision: Decision = session
                .recv(Role::Host, &node_tag("decision", round, work.node))
                .await?;
            match decision {
                Decision::Leaf { weight } => arena.slots[work.node] = Slot::Leaf(weight),
                Decision::Split { split, left, right } => {
                    check_partition(&work.samples, &left, &right, false)?;
                    arena.split(&work, split, left, right);
                }
                Decision::YouOwn { candidate } => {
                    let Some(&Candidate { feature, threshold }) = candidates.get(candidate) else {
                        return Err(Error::ProtocolViolation(format!(
                            "the host picked candidate {candidate}, {me} only has {}",
                            candidates.len()
                        )));
                    };
                    let (left, right) = partition(features, &work.samples, feature, threshold);
                    let record_id = table.insert(feature, threshold);
                    let outcome = SplitOutcome {
                        record_id,
                        left: left.clone(),
                        right: right.clone(),
                    };
                    session
                        .send(
                            Role::Host,
                            &node_tag("split_result", round, work.node),
                            &outcome,
                        )
                        .await?;
                    let split = SplitRef {
                        owner: me,
                        record_id,
                    };
                    arena.split(&work, split, left, right);
                }
            }
        }
        let tree = arena.assemble()?;
        debug!("Round {round}: received tree with {} leaves", tree.leaves());
        trees.push(tree);
        lookup_tables.push(table);
    }
    Ok(TreeModel {
        role: me,
        trees,
        lookup_tables,
        learning_rate: config.learning_rate,
        base_score: config.base_score,
        objective: config.objective,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_are_checked() {
        assert!(check_partition(&[3, 1, 2], &[1], &[2, 3], false).is_ok());
        assert!(check_partition(&[1, 2], &[1, 2], &[], false).is_err());
        assert!(check_partition(&[1, 2], &[1, 2], &[], true).is_ok());
        assert!(check_partition(&[1, 2], &[1], &[1], true).is_err());
        assert!(check_partition(&[1, 2], &[1, 2], &[3], true).is_err());
    }

    #[test]
    fn arena_assembles_in_allocation_order() -> Result<(), Error> {
        let mut arena = Arena::new(3);
        let root = arena.stack.pop().ok_or(Error::ProtocolViolation("no root".into()))?;
        let split = SplitRef {
            owner: Role::Host,
            record_id: 0,
        };
        arena.split(&root, split, vec![0], vec![1, 2]);
        let left = arena.stack.pop().ok_or(Error::ProtocolViolation("no left".into()))?;
        assert_eq!((left.node, left.samples.as_slice()), (1, &[0][..]));
        arena.slots[left.node] = Slot::Leaf(1.0);
        let right = arena.stack.pop().ok_or(Error::ProtocolViolation("no right".into()))?;
        arena.slots[right.node] = Slot::Leaf(2.0);
        let tree = arena.assemble()?;
        assert_eq!(
            tree,
            Node::Split {
                split,
                left: Box::new(Node::Leaf { weight: 1.0 }),
                right: Box::new(Node::Leaf { weight: 2.0 }),
            }
        );
        Ok(())
    }

    #[test]
    fn undecided_nodes_are_rejected() {
        assert!(Arena::new(1).assemble().is_err());
    }
}
