//! Trained model artifacts as persisted by every party.
//!
//! Each party stores only its own share of a model: its own weights for linear models, the
//! shared tree structure plus its own private lookup tables for trees.

use std::path::Path;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    config::{self, Objective},
    error::Error,
    session::Role,
    tree::{LookupTable, Node},
};

/// The part of a linear or logistic model held by one party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// The party that owns these weights.
    pub role: Role,
    /// One weight per selected column.
    pub weights: Vec<f64>,
    /// The intercept, always 0 for parties that do not fit one.
    pub bias: f64,
    /// The columns of the party's shard the weights apply to.
    pub columns: Vec<usize>,
    /// The loss the model was trained for.
    pub objective: Objective,
}

impl LinearModel {
    /// The party's contribution `x · w + bias` to the raw score of a sample.
    ///
    /// Fails if the row lacks one of the model's columns.
    pub fn partial_score(&self, row: &[f64]) -> Result<f64, Error> {
        let mut score = self.bias;
        for (&c, w) in self.columns.iter().zip(&self.weights) {
            let x = row.get(c).ok_or_else(|| config::Error::Invalid {
                field: "features",
                reason: format!("the model uses column {c}, but the row has {}", row.len()),
            })?;
            score += x * w;
        }
        Ok(score)
    }
}

/// A boosted tree ensemble as seen by one party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeModel {
    /// The party that owns the lookup tables.
    pub role: Role,
    /// The shared trees, one per boosting round.
    pub trees: Vec<Node>,
    /// The party's private lookup table for every tree.
    pub lookup_tables: Vec<LookupTable>,
    /// Shrinkage applied to every leaf weight.
    pub learning_rate: f64,
    /// Raw score every prediction starts from.
    pub base_score: f64,
    /// The loss the model was trained for.
    pub objective: Objective,
}

/// Writes a model as pretty-printed JSON.
pub fn save_json<T: Serialize>(path: impl AsRef<Path>, model: &T) -> Result<(), Error> {
    std::fs::write(path, serde_json::to_string_pretty(model)?)?;
    Ok(())
}

/// Reads a model from a JSON file.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, Error> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::SplitRef;

    #[test]
    fn tree_model_survives_json() -> Result<(), Error> {
        let mut table = LookupTable::default();
        let record_id = table.insert(1, 0.1 + 0.2);
        let model = TreeModel {
            role: Role::Guest(0),
            trees: vec![Node::Split {
                split: SplitRef {
                    owner: Role::Guest(0),
                    record_id,
                },
                left: Box::new(Node::Leaf { weight: -0.5 }),
                right: Box::new(Node::Leaf {
                    weight: 0.15384615384615385,
                }),
            }],
            lookup_tables: vec![table],
            learning_rate: 0.3,
            base_score: -1.3336122539654747,
            objective: Objective::Logistic,
        };
        let path = std::env::temp_dir().join(format!("vfl-tree-{}.json", std::process::id()));
        save_json(&path, &model)?;
        let loaded: TreeModel = load_json(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(loaded, model);
        Ok(())
    }

    #[test]
    fn partial_score_uses_selected_columns() -> Result<(), Error> {
        let model = LinearModel {
            role: Role::Active,
            weights: vec![2.0, -1.0],
            bias: 0.5,
            columns: vec![0, 2],
            objective: Objective::Linear,
        };
        assert_eq!(model.partial_score(&[1.0, 100.0, 3.0])?, 0.5 + 2.0 - 3.0);
        assert!(matches!(
            model.partial_score(&[1.0, 100.0]),
            Err(Error::Config(_))
        ));
        Ok(())
    }
}
