//!
//! Higher-order HMM model definition
//!
//! A model is a set of states (each referencing an emission), a variable-order
//! transition over state-history contexts and a final-state predicate.
//!
//! # Contexts and layers
//!
//! ```text
//! layer l   : number of symbols consumed so far, 0 <= l <= L
//! context   : recent state history (up to the maximal Markov order)
//! child     : a legal move (context -> state); silent moves keep the layer,
//!             emitting moves consume one symbol
//! ```
//!
//! At each layer the transition enumerates the reachable contexts: first the
//! contexts entered by an emitting move, then the contexts reachable from
//! them through silent moves, in topological order of the silent subgraph.
//!
pub mod emission;
pub mod model;
pub mod state;
pub mod transition;

pub use emission::{DiscreteEmission, Emission};
pub use model::HigherOrderHmm;
pub use state::State;
pub use transition::{Transition, TransitionElement};
