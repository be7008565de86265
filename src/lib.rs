//! The secure computation core of a vertical federated learning system.
//!
//! In vertical federated learning, several parties hold different features (columns) of the same
//! samples, and only one of them holds the labels. This crate lets them train models jointly
//! without revealing their raw features or labels to each other. Parties only ever exchange
//! homomorphically encrypted values or values hidden under one-time random masks.
//!
//! ## Main Components
//!
//! * [`channel`]: Tagged, acknowledged point-to-point channels with an inbound cache, so that the
//!   sequential protocol logic can consume messages in its own order.
//! * [`session`]: The channels of one party to all of its peers, wired over TCP or in memory.
//! * [`crypto`]: The homomorphic encryption schemes, behind the [`crypto::Scheme`] trait.
//! * [`linear`]: Linear and logistic regression, trained with masked gradients between an Active
//!   party (labels), a Passive party (features) and an Arbiter (key holder).
//! * [`tree`]: Gradient-boosted trees between a Host (labels) and Guests (features), where only the
//!   owner of a split knows its feature and threshold.
//! * [`inference`]: Predictions with trained models, replaying private splits in lock-step.
//! * [`model`]: The model artifacts every party persists.
//!
//! ## Basic Usage
//!
//! Every party runs its own process:
//!
//! 1. Load a [`config::SessionConfig`] and call [`session::Session::connect`].
//! 2. Call the entry point for its role, e.g. [`linear::train_active`] or
//!    [`tree::protocol::train_guest`], with the same [`config::LinearConfig`] or
//!    [`config::TreeConfig`] as all other parties.
//! 3. Persist the returned model with [`model::save_json`].
//!
//! For testing, [`session::Session::local`] wires all parties up in memory.
//!
//! ## Security Properties
//!
//! The protocols are secure against honest-but-curious parties: every party follows the protocol
//! but may try to learn from what it sees. The Arbiter of the gradient exchange and the Host of
//! the tree protocol must not collude with any other party, as they hold the decryption keys.
//! Training results (weights, tree structure, leaf weights) are revealed to the parties that hold
//! them; protection against inference from these outputs is out of scope.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod inference;
pub mod linear;
pub mod model;
pub mod session;
pub mod tree;
