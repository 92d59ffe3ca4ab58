//!
//! Viterbi decoding and Viterbi training
//!
//! The backward matrix is filled with the `max` merge, then the best path
//! is read off from the front: at every `(layer, context)` the move whose
//! score is closest to the stored optimum is followed. Closeness is the
//! squared deviation and ties keep the first candidate, so decoding is
//! deterministic. Behind the last layer only silent moves remain and
//! stopping at a final context competes against them the same way.
//!
use crate::dp::backward::{fill_backward, stop_score, ScoreKind};
use crate::dp::table::DpTables;
use crate::dp::{count_moves, no_path, PathMove};
use crate::error::Result;
use crate::hmm::HigherOrderHmm;
use crate::seq::Sequence;

///
/// Reads the best path off a Viterbi-filled backward matrix.
///
fn walk_best_path(model: &HigherOrderHmm, t: &DpTables, seq: &Sequence) -> Result<Vec<PathMove>> {
    let len = seq.len();
    let mut moves = Vec::with_capacity(len + 1);
    let mut layer = 0;
    let mut ctx = 0;
    while layer < len {
        let rank = seq.rank(layer);
        let mut best: Option<(f64, PathMove)> = None;
        for child in 0..model.n_children(layer, ctx) {
            let step = model.step(layer, ctx, child);
            let mut current = t.bwd[layer + step.advance][step.target]
                + model.transition_log_score(layer, ctx, child);
            if step.advance == 1 {
                current += model.log_emission(step.state, rank);
            }
            let dist = (current - t.bwd[layer][ctx]).powi(2);
            if best.map_or(true, |(d, _)| dist < d) {
                best = Some((
                    dist,
                    PathMove {
                        layer,
                        ctx,
                        child,
                        state: step.state,
                        advance: step.advance,
                    },
                ));
            }
        }
        let (_, mv) = best.ok_or_else(no_path)?;
        moves.push(mv);
        layer += mv.advance;
        ctx = model.step(mv.layer, mv.ctx, mv.child).target;
    }
    // behind the last symbol: stopping competes against the silent moves
    loop {
        let stop = stop_score(model, len, ctx);
        let mut best_dist = if stop == f64::NEG_INFINITY {
            f64::INFINITY
        } else {
            (stop - t.bwd[len][ctx]).powi(2)
        };
        let mut best: Option<PathMove> = None;
        for child in 0..model.n_children(len, ctx) {
            let step = model.step(len, ctx, child);
            if step.advance == 0 {
                let current =
                    t.bwd[len][step.target] + model.transition_log_score(len, ctx, child);
                let dist = (current - t.bwd[len][ctx]).powi(2);
                if dist < best_dist {
                    best_dist = dist;
                    best = Some(PathMove {
                        layer: len,
                        ctx,
                        child,
                        state: step.state,
                        advance: 0,
                    });
                }
            }
        }
        match best {
            Some(mv) => {
                moves.push(mv);
                ctx = model.step(len, ctx, mv.child).target;
            }
            None => break,
        }
    }
    Ok(moves)
}

///
/// Best state path for `seq` and its log score.
///
/// A sequence without any valid path is a `Computation` error.
///
pub fn viterbi_decode(
    model: &HigherOrderHmm,
    t: &mut DpTables,
    seq: &Sequence,
) -> Result<(Vec<usize>, f64)> {
    fill_backward(model, t, seq, ScoreKind::Viterbi);
    let score = t.bwd[0][0];
    if score == f64::NEG_INFINITY {
        return Err(no_path());
    }
    let moves = walk_best_path(model, t, seq)?;
    Ok((moves.iter().map(|m| m.state).collect(), score))
}

///
/// One hard-EM pass: decodes the best path and counts its moves into the
/// sufficient statistics with `weight`. Returns the Viterbi log score.
///
pub fn viterbi_training_pass(
    model: &mut HigherOrderHmm,
    t: &mut DpTables,
    seq: &Sequence,
    weight: f64,
) -> Result<f64> {
    fill_backward(model, t, seq, ScoreKind::Viterbi);
    let score = t.bwd[0][0];
    if score == f64::NEG_INFINITY {
        return Err(no_path());
    }
    let moves = walk_best_path(model, t, seq)?;
    count_moves(model, seq, &moves, weight);
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HmmError;
    use crate::hmm::emission::DiscreteEmission;
    use crate::hmm::{Emission, State, TransitionElement};
    use crate::mocks::*;
    use crate::seq::Alphabet;

    fn encode(text: &[u8]) -> Sequence {
        Sequence::encode(text, &Alphabet::binary()).unwrap()
    }

    #[test]
    fn viterbi_order0_by_hand() {
        // position 0 prefers L (0.4*0.9), position 1 prefers F (0.6*0.5)
        let m = mock_casino();
        let mut t = DpTables::new(&m);
        let (path, score) = viterbi_decode(&m, &mut t, &encode(b"01")).unwrap();
        assert_eq!(path, vec![1, 0]);
        assert_relative_eq!(score, (0.36f64 * 0.30).ln(), epsilon = 1e-12);
    }

    #[test]
    fn viterbi_takes_the_silent_bridge() {
        // X S Y scores 0.6*0.3*0.2, the direct X Y only 0.6*0.2*0.2
        let m = mock_silent_bridge();
        let mut t = DpTables::new(&m);
        let (path, score) = viterbi_decode(&m, &mut t, &encode(b"00")).unwrap();
        assert_eq!(path, vec![0, 1, 2]);
        assert_relative_eq!(score, (0.036f64).ln(), epsilon = 1e-12);
    }

    #[test]
    fn viterbi_tie_keeps_first_state() {
        // fully symmetric model, every path ties
        let states = vec![State::new("a", 0), State::new("b", 0)];
        let emissions = vec![Emission::Discrete(DiscreteEmission::from_probs(&[0.5, 0.5]))];
        let elements = vec![TransitionElement::new(&[], &[0, 1], &[]).unwrap()];
        let m = crate::hmm::HigherOrderHmm::new(Alphabet::binary(), states, emissions, elements)
            .unwrap();
        let mut t = DpTables::new(&m);
        let (path, _) = viterbi_decode(&m, &mut t, &encode(b"010")).unwrap();
        assert_eq!(path, vec![0, 0, 0]);
    }

    #[test]
    fn viterbi_empty_sequence() {
        let m = mock_casino();
        let mut t = DpTables::new(&m);
        let (path, score) = viterbi_decode(&m, &mut t, &encode(b"")).unwrap();
        assert!(path.is_empty());
        assert_relative_eq!(score, 0.0);

        // the bridge model cannot stop before reaching Y
        let m = mock_silent_bridge();
        let mut t = DpTables::new(&m);
        let res = viterbi_decode(&m, &mut t, &encode(b""));
        assert!(matches!(res, Err(HmmError::Computation { .. })));
    }

    #[test]
    fn viterbi_impossible_sequence() {
        let m = mock_silent_bridge();
        let mut t = DpTables::new(&m);
        let res = viterbi_decode(&m, &mut t, &encode(b"0"));
        assert!(matches!(res, Err(HmmError::Computation { .. })));
    }

    #[test]
    fn viterbi_training_counts_path_moves() {
        let mut m = mock_casino();
        let mut t = DpTables::new(&m);
        m.reset_statistics();
        let score = viterbi_training_pass(&mut m, &mut t, &encode(b"01"), 2.0).unwrap();
        assert_relative_eq!(score, (0.36f64 * 0.30).ln(), epsilon = 1e-12);
        let snap = m.snapshot_statistics();
        // path is L F: L emitted the 0, F emitted the 1
        assert_eq!(snap.emissions[0], vec![0.0, 2.0]);
        assert_eq!(snap.emissions[1], vec![2.0, 0.0]);
        assert_eq!(snap.transition[0], vec![2.0, 2.0]);
    }

    #[test]
    fn viterbi_training_counts_silent_moves() {
        let mut m = mock_silent_bridge();
        let mut t = DpTables::new(&m);
        m.reset_statistics();
        viterbi_training_pass(&mut m, &mut t, &encode(b"00"), 1.0).unwrap();
        let snap = m.snapshot_statistics();
        // the element behind X counts the move to S, S counts the move to Y
        assert_eq!(snap.transition[1], vec![0.0, 1.0, 0.0]);
        assert_eq!(snap.transition[2], vec![1.0]);
        // the silent state has no emission statistic
        assert_eq!(snap.emissions[1], Vec::<f64>::new());
    }
}
