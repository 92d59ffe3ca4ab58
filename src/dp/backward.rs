//!
//! Backward recursion shared by likelihood, Viterbi and Baum-Welch
//!
//! ```text
//! bwd[L][c] = 0         if the last context state is final (else log zero)
//!             merged with the silent continuations of layer L
//! bwd[l][c] = merge over children of bwd[l+adv][target] + e(child, x[l]) + tr
//! ```
//!
//! The merge is `logsumexp` for likelihood and Baum-Welch and `max` for
//! Viterbi, everything else is identical. Contexts are walked in reverse,
//! so the silent targets of a context (later in the same layer) are final
//! before the context itself is merged.
//!
//! The Baum-Welch fill additionally turns every visited move into a
//! posterior weight `exp(fwd[l][c] + child score - total)` and adds it to
//! the sufficient statistics, which needs mutable access to the model and
//! a forward fill of the same sequence, so it has its own entry point.
//!
use crate::dp::forward::log_score_from_forward;
use crate::dp::table::DpTables;
use crate::error::{HmmError, Result};
use crate::hmm::HigherOrderHmm;
use crate::prob::log_sum_exp;
use crate::seq::Sequence;

///
/// Merge rule of the backward recursion.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScoreKind {
    /// logsumexp over all paths
    Likelihood,
    /// max, the score of the single best path
    Viterbi,
    /// logsumexp, with posterior weights gathered as a side effect
    BaumWelch,
}

impl ScoreKind {
    fn merge(self, vals: &[f64]) -> f64 {
        match self {
            ScoreKind::Viterbi => vals.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
            ScoreKind::Likelihood | ScoreKind::BaumWelch => log_sum_exp(vals),
        }
    }
    fn merge_with(self, val: f64, merged: f64) -> f64 {
        match self {
            ScoreKind::Viterbi => val.max(merged),
            ScoreKind::Likelihood | ScoreKind::BaumWelch => log_sum_exp(&[val, merged]),
        }
    }
}

/// Score of ending a path at `(layer, ctx)` without further moves.
pub(crate) fn stop_score(model: &HigherOrderHmm, layer: usize, ctx: usize) -> f64 {
    if model.order() == 0 {
        return 0.0;
    }
    match model.last_context_state(layer, ctx) {
        Some(s) if model.is_final(s) => 0.0,
        _ => f64::NEG_INFINITY,
    }
}

///
/// Fills the backward matrix for `seq`. After the call `bwd[0][0]` holds
/// the total log score of the sequence under the chosen merge.
///
pub fn fill_backward(model: &HigherOrderHmm, t: &mut DpTables, seq: &Sequence, kind: ScoreKind) {
    let len = seq.len();
    t.provide(model, true, len);

    // layer L: stop here or continue through silent moves
    for ctx in (0..model.n_contexts(len)).rev() {
        let val = stop_score(model, len, ctx);
        let mut n = 0;
        for child in 0..model.n_children(len, ctx) {
            let step = model.step(len, ctx, child);
            if step.advance == 0 {
                t.backward_intermediate[n] =
                    t.bwd[len][step.target] + model.transition_log_score(len, ctx, child);
                n += 1;
            }
        }
        t.bwd[len][ctx] = if n == 0 {
            val
        } else {
            let merged = kind.merge(&t.backward_intermediate[..n]);
            kind.merge_with(val, merged)
        };
    }

    for l in (0..len).rev() {
        let rank = seq.rank(l);
        for s in 0..model.n_states() {
            t.log_emission[s] = model.log_emission(s, rank);
        }
        for ctx in (0..model.n_contexts(l)).rev() {
            let mut n = 0;
            for child in 0..model.n_children(l, ctx) {
                let step = model.step(l, ctx, child);
                t.backward_intermediate[n] = t.bwd[l + step.advance][step.target]
                    + t.log_emission[step.state]
                    + model.transition_log_score(l, ctx, child);
                n += 1;
            }
            t.bwd[l][ctx] = if n > 0 {
                kind.merge(&t.backward_intermediate[..n])
            } else {
                f64::NEG_INFINITY
            };
        }
    }
}

///
/// Backward fill that gathers the Baum-Welch sufficient statistics.
///
/// `fill_forward` must have been run on `t` for the same sequence first.
/// Every visited move `(layer, ctx, child)` contributes the posterior
/// weight `weight * exp(fwd[l][ctx] + move score - total)` to the child
/// state's emission statistic and the context's transition statistic.
/// Returns the total log score `bwd[0][0]`.
///
pub fn fill_backward_baum_welch(
    model: &mut HigherOrderHmm,
    t: &mut DpTables,
    seq: &Sequence,
    weight: f64,
) -> Result<f64> {
    let len = seq.len();
    let res = log_score_from_forward(model, t, len);
    if res == f64::NEG_INFINITY {
        return Err(HmmError::computation(
            "the sequence has no valid path through the model",
        ));
    }
    t.provide(model, true, len);

    for ctx in (0..model.n_contexts(len)).rev() {
        let val = stop_score(model, len, ctx);
        let mut n = 0;
        for child in 0..model.n_children(len, ctx) {
            let step = model.step(len, ctx, child);
            if step.advance == 0 {
                let part =
                    t.bwd[len][step.target] + model.transition_log_score(len, ctx, child);
                t.backward_intermediate[n] = part;
                n += 1;
                let w = weight * (t.fwd[len][ctx] + part - res).exp();
                model.add_transition_statistic(len, ctx, child, w);
            }
        }
        t.bwd[len][ctx] = if n == 0 {
            val
        } else {
            log_sum_exp(&[val, log_sum_exp(&t.backward_intermediate[..n])])
        };
    }

    for l in (0..len).rev() {
        let rank = seq.rank(l);
        for s in 0..model.n_states() {
            t.log_emission[s] = model.log_emission(s, rank);
        }
        for ctx in (0..model.n_contexts(l)).rev() {
            let mut n = 0;
            for child in 0..model.n_children(l, ctx) {
                let step = model.step(l, ctx, child);
                let part = t.bwd[l + step.advance][step.target]
                    + t.log_emission[step.state]
                    + model.transition_log_score(l, ctx, child);
                t.backward_intermediate[n] = part;
                n += 1;
                let w = weight * (t.fwd[l][ctx] + part - res).exp();
                model.add_emission_statistic(step.state, rank, w);
                model.add_transition_statistic(l, ctx, child, w);
            }
            t.bwd[l][ctx] = if n > 0 {
                log_sum_exp(&t.backward_intermediate[..n])
            } else {
                f64::NEG_INFINITY
            };
        }
    }
    model.guard_score(t.bwd[0][0])
}
