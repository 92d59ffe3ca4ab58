//!
//! State posterior decoding
//!
//! `post[s][l]` is the log probability that a path is in state `s` after
//! consuming `l` symbols, given the whole sequence. For order zero the
//! positions factorize and the posterior comes straight from the scores;
//! otherwise it is accumulated as `fwd + bwd` over the contexts ending in
//! `s` and normalized by the total log probability.
//!
use crate::dp::backward::{fill_backward, ScoreKind};
use crate::dp::forward::fill_forward;
use crate::dp::no_path;
use crate::dp::table::DpTables;
use crate::error::Result;
use crate::hmm::HigherOrderHmm;
use crate::prob::log_sum_exp;
use crate::seq::Sequence;

///
/// Log state posteriors, sized `[n_states][len + 1]`. Column `l` refers to
/// the point after `l` consumed symbols; column 0 is meaningful only for
/// order zero and stays at log zero otherwise.
///
/// With `silent_zero` the posterior of silent states is left at log zero,
/// so every column `l >= 1` sums to one over the emitting states. Without
/// it, contexts entered through silent moves are accumulated too.
///
/// A sequence without any valid path is a `Computation` error.
///
pub fn fill_log_state_posteriors(
    model: &HigherOrderHmm,
    t: &mut DpTables,
    seq: &Sequence,
    silent_zero: bool,
) -> Result<Vec<Vec<f64>>> {
    let len = seq.len();
    let mut post = vec![vec![f64::NEG_INFINITY; len + 1]; model.n_states()];

    if model.order() == 0 {
        // positions factorize, no matrices needed
        for l in 0..len {
            let rank = seq.rank(l);
            let mut total = f64::NEG_INFINITY;
            for child in 0..model.n_children(l, 0) {
                let step = model.step(l, 0, child);
                let val = model.transition_log_score(l, 0, child)
                    + model.log_emission(step.state, rank);
                post[step.state][l + 1] = log_sum_exp(&[post[step.state][l + 1], val]);
                total = log_sum_exp(&[total, val]);
            }
            if total == f64::NEG_INFINITY {
                return Err(no_path());
            }
            for s in 0..model.n_states() {
                post[s][l + 1] -= total;
            }
        }
        return Ok(post);
    }

    fill_forward(model, t, seq);
    fill_backward(model, t, seq, ScoreKind::Likelihood);
    let log_prob = t.bwd[0][0];
    if log_prob == f64::NEG_INFINITY {
        return Err(no_path());
    }
    for l in 0..=len {
        for ctx in 0..model.n_contexts(l) {
            if let Some(s) = model.last_context_state(l, ctx) {
                if !(silent_zero && model.is_silent(s)) {
                    post[s][l] = log_sum_exp(&[post[s][l], t.fwd[l][ctx] + t.bwd[l][ctx]]);
                }
            }
        }
    }
    for row in post.iter_mut() {
        for v in row.iter_mut() {
            *v -= log_prob;
        }
    }
    Ok(post)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::*;
    use crate::seq::Alphabet;

    fn encode(text: &[u8]) -> Sequence {
        Sequence::encode(text, &Alphabet::binary()).unwrap()
    }

    #[test]
    fn posterior_order0_by_hand() {
        let m = mock_casino();
        let mut t = DpTables::new(&m);
        let post = fill_log_state_posteriors(&m, &mut t, &encode(b"01"), true).unwrap();
        assert_relative_eq!(post[0][1].exp(), 0.30 / 0.66, epsilon = 1e-12);
        assert_relative_eq!(post[1][1].exp(), 0.36 / 0.66, epsilon = 1e-12);
        assert_relative_eq!(post[0][2].exp(), 0.30 / 0.34, epsilon = 1e-12);
        assert_relative_eq!(post[1][2].exp(), 0.04 / 0.34, epsilon = 1e-12);
    }

    #[test]
    fn posterior_columns_sum_to_one() {
        let m = mock_cpg();
        let mut t = DpTables::new(&m);
        let a = Alphabet::dna();
        let seq = Sequence::encode(b"ACGCGTAT", &a).unwrap();
        let post = fill_log_state_posteriors(&m, &mut t, &seq, true).unwrap();
        for l in 1..=seq.len() {
            let total: f64 = (0..m.n_states()).map(|s| post[s][l].exp()).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
        // before the first symbol no state has been visited
        for s in 0..m.n_states() {
            assert_eq!(post[s][0], f64::NEG_INFINITY);
        }
    }

    #[test]
    fn posterior_silent_states() {
        let m = mock_silent_bridge();
        let mut t = DpTables::new(&m);
        let seq = encode(b"00");

        // silent states are zeroed, the emitting columns still sum to one
        let post = fill_log_state_posteriors(&m, &mut t, &seq, true).unwrap();
        assert_relative_eq!(post[0][1].exp(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(post[2][2].exp(), 1.0, epsilon = 1e-12);
        for l in 0..=seq.len() {
            assert_eq!(post[1][l], f64::NEG_INFINITY);
        }

        // without zeroing, the bridge carries its posterior mass of 0.6
        let post = fill_log_state_posteriors(&m, &mut t, &seq, false).unwrap();
        assert_relative_eq!(post[1][1].exp(), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn posterior_impossible_sequence() {
        let m = mock_silent_bridge();
        let mut t = DpTables::new(&m);
        let res = fill_log_state_posteriors(&m, &mut t, &encode(b"0"), true);
        assert!(res.is_err());
    }
}
