//! # Rotabel Core Library
//!
//! A loopy belief propagation solver for sidechain rotamer optimization inside a
//! molecular-mechanics energy engine. Given a pairwise interaction graph over
//! residues with small discrete rotamer alphabets, the solver estimates per-residue
//! and per-pair rotamer marginals, evaluates the Bethe free energy of the converged
//! beliefs, and back-propagates derivatives into the interaction graph.
//!
//! ## Architectural Philosophy
//!
//! The library is designed with a strict two-layer architecture to ensure a clear
//! separation of concerns, making it modular, testable, and extensible.
//!
//! - **[`core`]: The Foundation.** Contains stateless building blocks: the packed
//!   bead-id encoding shared with the interaction graph, dense and AoSoA vector
//!   storage specialized for small fixed alphabets, and the traits through which
//!   external collaborators (the pair interaction graph and one-body energy
//!   providers) are consumed.
//!
//! - **[`engine`]: The Logic Core.** This stateful layer runs the optimization.
//!   It holds the per-alphabet node and edge state ([`engine::nodes::NodeHolder`],
//!   [`engine::edges::EdgeHolder`]), implements the damped asynchronous message
//!   updates, and orchestrates one full evaluation cycle in
//!   [`engine::solver::RotamerSolver`]: fill, solve, derivative propagation, and
//!   the optional free-energy readout.
//!
//! The public entry point is the solver itself, usually constructed through the
//! named factory surface in [`engine::registry`].

pub mod core;
pub mod engine;

pub use crate::core::graph::{Bead, InteractionGraph, OneBodyEnergy, PairEdge};
pub use crate::core::ids::{BeadId, DecodedBead, IdError, ROTAMER_FIELD_BITS, UPPER_ROT};
pub use crate::engine::config::{ConfigError, SolverConfig};
pub use crate::engine::error::EngineError;
pub use crate::engine::registry::{EnergyNode, NodeArgs, NodeRegistry};
pub use crate::engine::solver::{ComputeMode, RotamerSolver, SolveStats};
