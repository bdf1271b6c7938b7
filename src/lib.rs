//! Blockgibbs – the concurrency core of a parallel blocked-Gibbs sampler.
//!
//! A discrete probabilistic model is given as a collection of *factors*, each
//! a log-probability table over a handful of *variables*. Blocked Gibbs
//! sampling draws whole groups of variables ("blocks") jointly. This crate
//! turns the factors into a pairwise Markov random field and lets many
//! workers grow disjoint *trees* over it at the same time, so every tree can
//! be handed to a sampler while no other worker touches its vertices.
//!
//! ## Modules
//! * [`factor`] – Variables, domains, assignments and log-space factor tables.
//! * [`model`] – The [`model::ModelBuilder`] and the immutable
//!   [`model::FactorizedModel`] with its variable to factor index.
//! * [`pairwise`] – Conversion of a model into a [`graph::Graph`], with a
//!   pluggable [`pairwise::EdgeFactorStrategy`] for the edge tables.
//! * [`graph`] – Vertex and edge state: assignment, beliefs, messages.
//! * [`tree`] – The lock-free tree-growth protocol and the per-vertex
//!   membership record it runs on.
//! * [`codec`] – Binary checkpoint format for vertices, edges and graphs.
//! * [`persist`] – SQLite checkpoint store.
//! * [`workers`] – A threaded reference scheduler for the protocol.
//! * [`settings`] – Layered runtime configuration.
//!
//! ## Tree growth
//! Every vertex runs a small state machine
//! (`AVAILABLE → CANDIDATE → BOUNDARY → TREE_NODE → CALIBRATED`) whose state,
//! parent and height live in one atomic word. Ownership changes hands only
//! through compare-and-set, so two trees can never claim the same vertex and
//! a lost claim is simply skipped. A tree is *complete* when its root is
//! calibrated, which happens after every other member has been.
//!
//! ## Quick Start
//! ```
//! use blockgibbs::factor::{Domain, Factor, Variable};
//! use blockgibbs::model::ModelBuilder;
//! use blockgibbs::pairwise::{construct_pairwise_graph, MarginalProduct};
//! use blockgibbs::tree::{GrowthPolicy, TreeProtocol, TreeState};
//! use rand::SeedableRng;
//!
//! let (a, b) = (Variable::new(0, 2), Variable::new(1, 2));
//! let mut builder = ModelBuilder::new();
//! builder.add_factor(Factor::new(Domain::new([a, b]).unwrap()));
//! let model = builder.build().unwrap();
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(1);
//! let graph = construct_pairwise_graph(&model, &MarginalProduct, &mut rng).unwrap();
//! let protocol = TreeProtocol::new(&graph, GrowthPolicy::default());
//!
//! let mut work = protocol.start_root(0).unwrap().schedule;
//! let mut completed = None;
//! while let Some(vertex) = work.pop() {
//!     let progress = protocol.update(vertex);
//!     work.extend(progress.schedule);
//!     completed = completed.or(progress.completed);
//! }
//! assert_eq!(completed, Some(0));
//! assert_eq!(graph.vertex(1).state(), TreeState::Calibrated);
//! let block = protocol.release_tree(0).unwrap();
//! assert_eq!(block.len(), 2);
//! ```
//!
//! ## Persistence
//! [`codec::encode_graph`] and [`codec::decode_graph`] move a whole graph to
//! and from a byte stream, [`codec::encode_model`] and [`codec::decode_model`]
//! do the same for the model behind it. The [`persist::Persistor`] keeps the
//! model and one record per vertex and per edge in SQLite next to a blake3
//! digest, and refuses to restore anything whose digest does not match.

pub mod codec;
pub mod error;
pub mod factor;
pub mod graph;
pub mod model;
pub mod pairwise;
pub mod persist;
pub mod settings;
pub mod tree;
pub mod workers;
