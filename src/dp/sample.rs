//!
//! Stochastic path sampling
//!
//! Draws a state path from the posterior over paths given the sequence:
//! the backward matrix is filled with the logsumexp merge, then the path
//! is walked from the front, drawing every move from the normalized
//! categorical distribution `exp(move score - bwd[l][c])` over the
//! children. Behind the last symbol the trailing silent moves and an
//! explicit stop option at a final context (log weight 0) are drawn the
//! same way.
//!
use crate::dp::backward::{fill_backward, stop_score, ScoreKind};
use crate::dp::table::DpTables;
use crate::dp::{count_moves, no_path, PathMove};
use crate::error::Result;
use crate::hmm::HigherOrderHmm;
use crate::prob::log_sum_normalize;
use crate::seq::Sequence;
use rand::Rng;

/// Draws an index from normalized weights by inverting the cumulative sum.
fn draw_index<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.gen();
    let mut acc = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        acc += w;
        if u < acc {
            return i;
        }
    }
    weights.len() - 1
}

fn walk_sampled_path<R: Rng>(
    model: &HigherOrderHmm,
    t: &mut DpTables,
    seq: &Sequence,
    rng: &mut R,
) -> Result<Vec<PathMove>> {
    let len = seq.len();
    let mut moves = Vec::with_capacity(len + 1);
    let mut layer = 0;
    let mut ctx = 0;
    while layer < len {
        let rank = seq.rank(layer);
        let n = model.n_children(layer, ctx);
        for child in 0..n {
            let step = model.step(layer, ctx, child);
            t.backward_intermediate[child] = t.bwd[layer + step.advance][step.target]
                + model.log_emission(step.state, rank)
                + model.transition_log_score(layer, ctx, child);
        }
        if n == 0 || log_sum_normalize(&mut t.backward_intermediate[..n]) == f64::NEG_INFINITY {
            return Err(no_path());
        }
        let child = draw_index(&t.backward_intermediate[..n], rng);
        let step = model.step(layer, ctx, child);
        moves.push(PathMove {
            layer,
            ctx,
            child,
            state: step.state,
            advance: step.advance,
        });
        layer += step.advance;
        ctx = step.target;
    }
    // behind the last symbol: silent moves against the stop option
    let mut silent_children = Vec::new();
    loop {
        silent_children.clear();
        let mut n = 0;
        for child in 0..model.n_children(len, ctx) {
            let step = model.step(len, ctx, child);
            if step.advance == 0 {
                t.backward_intermediate[n] =
                    t.bwd[len][step.target] + model.transition_log_score(len, ctx, child);
                n += 1;
                silent_children.push(child);
            }
        }
        let stop = stop_score(model, len, ctx);
        let slots = if stop == f64::NEG_INFINITY {
            n
        } else {
            t.backward_intermediate[n] = stop;
            n + 1
        };
        if slots == 0
            || log_sum_normalize(&mut t.backward_intermediate[..slots]) == f64::NEG_INFINITY
        {
            return Err(no_path());
        }
        let drawn = draw_index(&t.backward_intermediate[..slots], rng);
        if drawn >= n {
            break;
        }
        let child = silent_children[drawn];
        let step = model.step(len, ctx, child);
        moves.push(PathMove {
            layer: len,
            ctx,
            child,
            state: step.state,
            advance: 0,
        });
        ctx = step.target;
    }
    Ok(moves)
}

///
/// Draws a state path for `seq` from the path posterior.
///
/// A sequence without any valid path is a `Computation` error.
///
pub fn sample_path<R: Rng>(
    model: &HigherOrderHmm,
    t: &mut DpTables,
    seq: &Sequence,
    rng: &mut R,
) -> Result<Vec<usize>> {
    fill_backward(model, t, seq, ScoreKind::Likelihood);
    if t.bwd[0][0] == f64::NEG_INFINITY {
        return Err(no_path());
    }
    let moves = walk_sampled_path(model, t, seq, rng)?;
    Ok(moves.iter().map(|m| m.state).collect())
}

///
/// One sampling pass of the Gibbs trainer: draws a path and counts its
/// moves into the sufficient statistics with `weight`. Returns the log
/// likelihood of the sequence.
///
pub fn sample_training_pass<R: Rng>(
    model: &mut HigherOrderHmm,
    t: &mut DpTables,
    seq: &Sequence,
    weight: f64,
    rng: &mut R,
) -> Result<f64> {
    fill_backward(model, t, seq, ScoreKind::Likelihood);
    let score = t.bwd[0][0];
    if score == f64::NEG_INFINITY {
        return Err(no_path());
    }
    let moves = walk_sampled_path(model, t, seq, rng)?;
    count_moves(model, seq, &moves, weight);
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HmmError;
    use crate::mocks::*;
    use crate::seq::Alphabet;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn encode(text: &[u8]) -> Sequence {
        Sequence::encode(text, &Alphabet::binary()).unwrap()
    }

    #[test]
    fn sample_is_deterministic_per_seed() {
        let m = mock_cpg();
        let mut t = DpTables::new(&m);
        let a = Alphabet::dna();
        let seq = Sequence::encode(b"ACGCGTAT", &a).unwrap();
        let mut r1 = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut r2 = Xoshiro256PlusPlus::seed_from_u64(7);
        let p1 = sample_path(&m, &mut t, &seq, &mut r1).unwrap();
        let p2 = sample_path(&m, &mut t, &seq, &mut r2).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(p1.len(), seq.len());
    }

    #[test]
    fn sample_matches_posterior_frequency() {
        // P(L | x=0) = 0.36 / 0.66
        let m = mock_casino();
        let mut t = DpTables::new(&m);
        let seq = encode(b"0");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let n = 3000;
        let mut loaded = 0;
        for _ in 0..n {
            let path = sample_path(&m, &mut t, &seq, &mut rng).unwrap();
            if path == vec![1] {
                loaded += 1;
            }
        }
        let freq = loaded as f64 / n as f64;
        assert!((freq - 0.36 / 0.66).abs() < 0.05, "freq = {}", freq);
    }

    #[test]
    fn sample_draws_both_bridge_paths() {
        // "00" admits X Y (0.4) and X S Y (0.6), nothing else
        let m = mock_silent_bridge();
        let mut t = DpTables::new(&m);
        let seq = encode(b"00");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let n = 1000;
        let mut with_bridge = 0;
        for _ in 0..n {
            let path = sample_path(&m, &mut t, &seq, &mut rng).unwrap();
            match path.len() {
                2 => assert_eq!(path, vec![0, 2]),
                3 => {
                    assert_eq!(path, vec![0, 1, 2]);
                    with_bridge += 1;
                }
                _ => panic!("unexpected path {:?}", path),
            }
        }
        let freq = with_bridge as f64 / n as f64;
        assert!((freq - 0.6).abs() < 0.1, "freq = {}", freq);
    }

    #[test]
    fn sample_empty_and_impossible() {
        let m = mock_casino();
        let mut t = DpTables::new(&m);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let path = sample_path(&m, &mut t, &encode(b""), &mut rng).unwrap();
        assert!(path.is_empty());

        let m = mock_silent_bridge();
        let mut t = DpTables::new(&m);
        let res = sample_path(&m, &mut t, &encode(b"0"), &mut rng);
        assert!(matches!(res, Err(HmmError::Computation { .. })));
    }

    #[test]
    fn sample_training_counts_one_unit_per_position() {
        let mut m = mock_casino();
        let mut t = DpTables::new(&m);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        m.reset_statistics();
        let score = sample_training_pass(&mut m, &mut t, &encode(b"01"), 1.0, &mut rng).unwrap();
        assert_relative_eq!(score, (0.66f64 * 0.34).ln(), epsilon = 1e-12);
        let snap = m.snapshot_statistics();
        let emitted: f64 = snap.emissions.iter().flatten().sum();
        assert_relative_eq!(emitted, 2.0, epsilon = 1e-12);
        let transitions: f64 = snap.transition.iter().flatten().sum();
        assert_relative_eq!(transitions, 2.0, epsilon = 1e-12);
    }
}
