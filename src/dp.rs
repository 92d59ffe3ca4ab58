//!
//! Exact dynamic programming over the layered context structure
//!
//! All algorithms run in log space and share one pair of matrices indexed
//! by `[layer][context]`:
//!
//! ```text
//! fwd[l][c] = log sum of all partial paths that consume the first l
//!             symbols and arrive in context c
//! bwd[l][c] = log sum (or max) of all completions from context c over
//!             the remaining symbols, ending in a final state
//! ```
//!
//! Within a layer, silent moves propagate along the topologically sorted
//! context list: forward pushes reach later contexts of the same layer,
//! backward reads them in reverse order.
//!
pub mod backward;
pub mod forward;
pub mod posterior;
pub mod sample;
pub mod table;
pub mod viterbi;

pub use backward::{fill_backward, fill_backward_baum_welch, ScoreKind};
pub use forward::{fill_forward, log_score_from_forward};
pub use posterior::fill_log_state_posteriors;
pub use sample::{sample_path, sample_training_pass};
pub use table::DpTables;
pub use viterbi::{viterbi_decode, viterbi_training_pass};

use crate::error::HmmError;
use crate::hmm::HigherOrderHmm;
use crate::seq::Sequence;

pub(crate) fn no_path() -> HmmError {
    HmmError::computation("the sequence has no valid path through the model")
}

/// One move of a decoded or sampled state path.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PathMove {
    pub layer: usize,
    pub ctx: usize,
    pub child: usize,
    pub state: usize,
    pub advance: usize,
}

/// Counts the moves of a hard-assigned path into the sufficient statistics.
pub(crate) fn count_moves(
    model: &mut HigherOrderHmm,
    seq: &Sequence,
    moves: &[PathMove],
    weight: f64,
) {
    for mv in moves {
        if mv.advance == 1 {
            model.add_emission_statistic(mv.state, seq.rank(mv.layer), weight);
        }
        model.add_transition_statistic(mv.layer, mv.ctx, mv.child, weight);
    }
}
