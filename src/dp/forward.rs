//!
//! Forward algorithm
//!
//! ```text
//! fwd[0][entry] = 0
//! fwd[l][c]     = logsumexp of all incoming pushes
//! push          : fwd[l][c] + e(child, x[l]) + tr(c, child)
//! ```
//!
//! Pushes are buffered per target context: an emitting child pushes into
//! the next layer, a silent child pushes into a later context of the same
//! layer (the context lists are topologically sorted, so every push lands
//! before its target is finalized). A context without any incoming push is
//! unreachable and stays at log zero, it does not push further.
//!
use crate::dp::table::DpTables;
use crate::hmm::HigherOrderHmm;
use crate::prob::log_sum_exp;
use crate::seq::Sequence;

pub fn fill_forward(model: &HigherOrderHmm, t: &mut DpTables, seq: &Sequence) {
    let len = seq.len();
    t.provide(model, false, len);

    for c in t.n_summands[0].iter_mut() {
        *c = 0;
    }
    t.n_summands[0][0] = 1;
    t.forward_intermediate[0][0][0] = 0.0;

    for l in 0..len {
        let rank = seq.rank(l);
        for s in 0..model.n_states() {
            t.log_emission[s] = model.log_emission(s, rank);
        }
        let h = l % 2;
        for c in t.n_summands[1 - h].iter_mut() {
            *c = 0;
        }
        for ctx in 0..model.n_contexts(l) {
            let n = t.n_summands[h][ctx];
            if n > 0 {
                let v = log_sum_exp(&t.forward_intermediate[h][ctx][..n]);
                t.fwd[l][ctx] = v;
                for child in 0..model.n_children(l, ctx) {
                    let step = model.step(l, ctx, child);
                    let log_tr = model.transition_log_score(l, ctx, child);
                    let hh = (h + step.advance) % 2;
                    let slot = t.n_summands[hh][step.target];
                    t.forward_intermediate[hh][step.target][slot] =
                        v + t.log_emission[step.state] + log_tr;
                    t.n_summands[hh][step.target] = slot + 1;
                }
            } else {
                t.fwd[l][ctx] = f64::NEG_INFINITY;
            }
        }
    }

    // last layer, only silent moves remain
    let h = len % 2;
    for ctx in 0..model.n_contexts(len) {
        let n = t.n_summands[h][ctx];
        if n > 0 {
            let v = log_sum_exp(&t.forward_intermediate[h][ctx][..n]);
            t.fwd[len][ctx] = v;
            for child in 0..model.n_children(len, ctx) {
                let step = model.step(len, ctx, child);
                if step.advance == 0 {
                    let log_tr = model.transition_log_score(len, ctx, child);
                    let slot = t.n_summands[h][step.target];
                    t.forward_intermediate[h][step.target][slot] = v + log_tr;
                    t.n_summands[h][step.target] = slot + 1;
                }
            }
        } else {
            t.fwd[len][ctx] = f64::NEG_INFINITY;
        }
    }
}

///
/// Total log score from a filled forward matrix: the logsumexp over the
/// contexts of `layer` whose last state is final.
///
pub fn log_score_from_forward(model: &HigherOrderHmm, t: &DpTables, layer: usize) -> f64 {
    if model.order() > 0 {
        let mut res = f64::NEG_INFINITY;
        for c in 0..model.n_contexts(layer) {
            if let Some(s) = model.last_context_state(layer, c) {
                if model.is_final(s) {
                    res = log_sum_exp(&[res, t.fwd[layer][c]]);
                }
            }
        }
        res
    } else {
        log_sum_exp(&t.fwd[layer])
    }
}
