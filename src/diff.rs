//!
//! Differentiable scoring
//!
//! Treats the whole model as one function of its flat parameter vector and
//! computes a log score together with its gradient in a single backward
//! sweep. The recursion template is the one of `crate::dp`, so the score
//! equals the plain backward pass; alongside every merge a per-context
//! gradient row is combined from the rows of the children:
//!
//! ```text
//! score:    res        = logsumexp(val, u_1, .., u_n)
//! gradient: g[context] = sum_i v_i * (g[child_i] + local_i)
//!           v_i        = exp(u_i - res)
//! ```
//!
//! `local_i` are the sparse partial derivatives of the transition and
//! emission scores of the move itself; the stop weight `val` has no
//! parameters and enters only through the normalization. Under the Viterbi
//! kind the merge follows the best branch alone, a subgradient.
//!
//! Per-position state masks restrict the sweep to labelled paths, the
//! supervised objective; the contrastive entry point scores restricted
//! against unrestricted for discriminative training.
//!
use crate::dp::backward::stop_score;
use crate::dp::ScoreKind;
use crate::error::{HmmError, Result};
use crate::hmm::HigherOrderHmm;
use crate::prob::{log_sum_exp, log_sum_normalize};
use crate::seq::Sequence;
use fixedbitset::FixedBitSet;

///
/// Move info and transition partials of the children of one context,
/// indexed by child.
///
struct Slots {
    state: Vec<usize>,
    target: Vec<usize>,
    advance: Vec<usize>,
    tr_indices: Vec<Vec<usize>>,
    tr_partials: Vec<Vec<f64>>,
}

/// Emission scores and partials of every state at the current layer.
struct LayerEmissions {
    log_score: Vec<f64>,
    indices: Vec<Vec<usize>>,
    partials: Vec<Vec<f64>>,
}

///
/// Scratch buffers of the differentiable sweep, sized once per model and
/// reused over sequences.
///
/// Scores and gradient rows are double buffered over the layer parity.
/// Every context of a layer is rewritten before the next layer reads it,
/// so nothing needs clearing between sequences.
///
pub struct DiffTables {
    n_parameters: usize,
    // backward scores, [layer % 2][context]; `full` is the unrestricted
    // companion pass used by contrastive scoring
    score: [Vec<f64>; 2],
    full: [Vec<f64>; 2],
    // accumulated gradient rows, [layer % 2][context][parameter]
    grad: [Vec<Vec<f64>>; 2],
    grad_full: [Vec<Vec<f64>>; 2],
    // packed child scores of one context merge and their child indices
    intermediate: Vec<f64>,
    intermediate_full: Vec<f64>,
    active: Vec<usize>,
    active_full: Vec<usize>,
    slots: Slots,
    em: LayerEmissions,
}

impl DiffTables {
    pub fn new(model: &HigherOrderHmm) -> DiffTables {
        let m = model.transition().max_contexts();
        let p = model.n_parameters();
        let s = model.n_states();
        DiffTables {
            n_parameters: p,
            score: [vec![0.0; m], vec![0.0; m]],
            full: [vec![0.0; m], vec![0.0; m]],
            grad: [vec![vec![0.0; p]; m], vec![vec![0.0; p]; m]],
            grad_full: [vec![vec![0.0; p]; m], vec![vec![0.0; p]; m]],
            intermediate: vec![0.0; s],
            intermediate_full: vec![0.0; s],
            active: vec![0; s],
            active_full: vec![0; s],
            slots: Slots {
                state: vec![0; s],
                target: vec![0; s],
                advance: vec![0; s],
                tr_indices: vec![Vec::new(); s],
                tr_partials: vec![Vec::new(); s],
            },
            em: LayerEmissions {
                log_score: vec![0.0; s],
                indices: vec![Vec::new(); s],
                partials: vec![Vec::new(); s],
            },
        }
    }
}

///
/// Log score of the sequence and, when `grad` is given, the gradient of
/// that score with respect to the flat parameter vector, scaled by
/// `weight` and added onto `grad`.
///
/// `ScoreKind::Likelihood` scores the log-probability of the sequence,
/// `ScoreKind::Viterbi` the best path. A sequence without a valid path
/// scores negative infinity and leaves `grad` unchanged.
///
pub fn score_and_gradient(
    model: &HigherOrderHmm,
    t: &mut DiffTables,
    seq: &Sequence,
    kind: ScoreKind,
    weight: f64,
    grad: Option<&mut [f64]>,
) -> Result<f64> {
    compute(model, t, seq, kind, None, false, weight, grad)
}

///
/// Like `score_and_gradient`, restricted to paths that keep to the allowed
/// states of the per-position masks. One mask per symbol; emitting moves
/// consult the mask of the symbol they consume, silent moves the mask of
/// the symbol consumed last.
///
pub fn restricted_score_and_gradient(
    model: &HigherOrderHmm,
    t: &mut DiffTables,
    seq: &Sequence,
    kind: ScoreKind,
    labels: &[FixedBitSet],
    weight: f64,
    grad: Option<&mut [f64]>,
) -> Result<f64> {
    compute(model, t, seq, kind, Some(labels), false, weight, grad)
}

///
/// Restricted score minus unrestricted log-likelihood, the discriminative
/// objective. Score and gradient are the differences of the two passes,
/// which share one traversal.
///
pub fn contrastive_score_and_gradient(
    model: &HigherOrderHmm,
    t: &mut DiffTables,
    seq: &Sequence,
    kind: ScoreKind,
    labels: &[FixedBitSet],
    weight: f64,
    grad: Option<&mut [f64]>,
) -> Result<f64> {
    compute(model, t, seq, kind, Some(labels), true, weight, grad)
}

fn move_allowed(labels: Option<&[FixedBitSet]>, layer: usize, state: usize, advance: usize) -> bool {
    match labels {
        None => true,
        Some(masks) => {
            if advance == 1 {
                masks[layer].contains(state)
            } else if layer == 0 {
                true
            } else {
                masks[layer - 1].contains(state)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compute(
    model: &HigherOrderHmm,
    t: &mut DiffTables,
    seq: &Sequence,
    kind: ScoreKind,
    labels: Option<&[FixedBitSet]>,
    discriminative: bool,
    weight: f64,
    grad_out: Option<&mut [f64]>,
) -> Result<f64> {
    if let Some(masks) = labels {
        if masks.len() != seq.len() {
            return Err(HmmError::wrong_length(format!(
                "{} position masks given for a sequence of {} symbols",
                masks.len(),
                seq.len()
            )));
        }
    }
    let len = seq.len();
    let with_grad = grad_out.is_some();
    let DiffTables {
        n_parameters,
        score,
        full,
        grad,
        grad_full,
        intermediate,
        intermediate_full,
        active,
        active_full,
        slots,
        em,
    } = t;
    let n_parameters = *n_parameters;

    // last layer, only silent continuations towards a final state
    let h = len % 2;
    for ctx in (0..model.n_contexts(len)).rev() {
        let mut nr = 0;
        let mut nf = 0;
        for child in 0..model.n_children(len, ctx) {
            let step = model.step(len, ctx, child);
            if step.advance == 1 {
                continue;
            }
            let tr = if with_grad {
                slots.tr_indices[child].clear();
                slots.tr_partials[child].clear();
                model.transition_log_score_and_partials(
                    len,
                    ctx,
                    child,
                    &mut slots.tr_indices[child],
                    &mut slots.tr_partials[child],
                )
            } else {
                model.transition_log_score(len, ctx, child)
            };
            slots.state[child] = step.state;
            slots.target[child] = step.target;
            slots.advance[child] = 0;
            if move_allowed(labels, len, step.state, 0) {
                active[nr] = child;
                intermediate[nr] = tr + score[h][step.target];
                nr += 1;
            }
            if discriminative {
                active_full[nf] = child;
                intermediate_full[nf] = tr + full[h][step.target];
                nf += 1;
            }
        }
        let val = stop_score(model, len, ctx);
        score[h][ctx] = merge(
            kind,
            len,
            ctx,
            val,
            &active[..nr],
            intermediate,
            slots,
            em,
            if with_grad { Some(&mut *grad) } else { None },
            n_parameters,
        );
        if discriminative {
            full[h][ctx] = merge(
                ScoreKind::Likelihood,
                len,
                ctx,
                val,
                &active_full[..nf],
                intermediate_full,
                slots,
                em,
                if with_grad {
                    Some(&mut *grad_full)
                } else {
                    None
                },
                n_parameters,
            );
        }
    }

    // emitting layers, consumed from the back
    for layer in (0..len).rev() {
        let h = layer % 2;
        let rank = seq.rank(layer);
        for s in 0..model.n_states() {
            em.indices[s].clear();
            em.partials[s].clear();
            em.log_score[s] = if with_grad {
                model.log_emission_and_partials(s, rank, &mut em.indices[s], &mut em.partials[s])
            } else {
                model.log_emission(s, rank)
            };
        }
        for ctx in (0..model.n_contexts(layer)).rev() {
            let mut nr = 0;
            let mut nf = 0;
            for child in 0..model.n_children(layer, ctx) {
                let step = model.step(layer, ctx, child);
                let tr = if with_grad {
                    slots.tr_indices[child].clear();
                    slots.tr_partials[child].clear();
                    model.transition_log_score_and_partials(
                        layer,
                        ctx,
                        child,
                        &mut slots.tr_indices[child],
                        &mut slots.tr_partials[child],
                    )
                } else {
                    model.transition_log_score(layer, ctx, child)
                };
                let em_tr = if step.advance == 1 {
                    em.log_score[step.state] + tr
                } else {
                    tr
                };
                slots.state[child] = step.state;
                slots.target[child] = step.target;
                slots.advance[child] = step.advance;
                if move_allowed(labels, layer, step.state, step.advance) {
                    active[nr] = child;
                    intermediate[nr] = em_tr + score[(layer + step.advance) % 2][step.target];
                    nr += 1;
                }
                if discriminative {
                    active_full[nf] = child;
                    intermediate_full[nf] = em_tr + full[(layer + step.advance) % 2][step.target];
                    nf += 1;
                }
            }
            score[h][ctx] = merge(
                kind,
                layer,
                ctx,
                f64::NEG_INFINITY,
                &active[..nr],
                intermediate,
                slots,
                em,
                if with_grad { Some(&mut *grad) } else { None },
                n_parameters,
            );
            if discriminative {
                full[h][ctx] = merge(
                    ScoreKind::Likelihood,
                    layer,
                    ctx,
                    f64::NEG_INFINITY,
                    &active_full[..nf],
                    intermediate_full,
                    slots,
                    em,
                    if with_grad {
                        Some(&mut *grad_full)
                    } else {
                        None
                    },
                    n_parameters,
                );
            }
        }
    }

    let res = score[0][0] - if discriminative { full[0][0] } else { 0.0 };
    let res = model.guard_score(res)?;
    if let Some(out) = grad_out {
        for p in 0..n_parameters {
            let v = grad[0][0][p] - if discriminative { grad_full[0][0][p] } else { 0.0 };
            out[p] += weight * v;
        }
    }
    Ok(res)
}

///
/// Merges the packed child scores of one context into the score of the
/// context and, when asked for, its gradient row. `active` maps packed
/// slots back to child indices; `val` is the parameter-free stop weight.
///
#[allow(clippy::too_many_arguments)]
fn merge(
    kind: ScoreKind,
    layer: usize,
    ctx: usize,
    val: f64,
    active: &[usize],
    intermediate: &mut [f64],
    slots: &Slots,
    em: &LayerEmissions,
    grad: Option<&mut [Vec<Vec<f64>>; 2]>,
    n_parameters: usize,
) -> f64 {
    let n = active.len();
    let h = layer % 2;
    if n == 0 {
        if let Some(g) = grad {
            for v in g[h][ctx].iter_mut() {
                *v = 0.0;
            }
        }
        return val;
    }
    match kind {
        ScoreKind::Viterbi => {
            let mut best = 0;
            for i in 1..n {
                if intermediate[i] > intermediate[best] {
                    best = i;
                }
            }
            if intermediate[best] <= val {
                // the stop branch wins and has no parameters
                if let Some(g) = grad {
                    for v in g[h][ctx].iter_mut() {
                        *v = 0.0;
                    }
                }
                return val;
            }
            if let Some(g) = grad {
                let child = active[best];
                let x = (layer + slots.advance[child]) % 2;
                let mut row = std::mem::take(&mut g[h][ctx]);
                row.copy_from_slice(&g[x][slots.target[child]]);
                scatter(&mut row, &slots.tr_indices[child], &slots.tr_partials[child], 1.0);
                let s = slots.state[child];
                scatter(&mut row, &em.indices[s], &em.partials[s], 1.0);
                g[h][ctx] = row;
            }
            intermediate[best]
        }
        ScoreKind::Likelihood | ScoreKind::BaumWelch => {
            let sub = log_sum_normalize(&mut intermediate[..n]);
            let res = log_sum_exp(&[val, sub]);
            if let Some(g) = grad {
                let scale = if sub == f64::NEG_INFINITY {
                    0.0
                } else {
                    (sub - res).exp()
                };
                let mut row = std::mem::take(&mut g[h][ctx]);
                for v in row.iter_mut() {
                    *v = 0.0;
                }
                for (i, &child) in active.iter().enumerate() {
                    let v = intermediate[i] * scale;
                    if v > 0.0 {
                        let x = (layer + slots.advance[child]) % 2;
                        let src = &g[x][slots.target[child]];
                        for p in 0..n_parameters {
                            row[p] += v * src[p];
                        }
                        scatter(&mut row, &slots.tr_indices[child], &slots.tr_partials[child], v);
                        let s = slots.state[child];
                        scatter(&mut row, &em.indices[s], &em.partials[s], v);
                    }
                }
                g[h][ctx] = row;
            }
            res
        }
    }
}

// add sparse partial derivatives with the given weight
fn scatter(row: &mut [f64], indices: &[usize], partials: &[f64], weight: f64) {
    for (&i, &d) in indices.iter().zip(partials.iter()) {
        row[i] += weight * d;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::*;
    use crate::seq::Alphabet;

    fn encode(text: &[u8]) -> Sequence {
        Sequence::encode(text, &Alphabet::binary()).unwrap()
    }

    fn mask(states: &[usize], n_states: usize) -> FixedBitSet {
        let mut m = FixedBitSet::with_capacity(n_states);
        for &s in states {
            m.insert(s);
        }
        m
    }

    /// Central finite difference of the score in parameter `p`.
    fn central_fd(model: &HigherOrderHmm, seq: &Sequence, kind: ScoreKind, p: usize) -> f64 {
        let h = 1e-4;
        let base = model.parameters_as_vec();
        let mut m = model.clone();
        let mut t = DiffTables::new(&m);
        let mut params = base.clone();
        params[p] += h;
        m.set_parameters_from_slice(&params);
        let plus = score_and_gradient(&m, &mut t, seq, kind, 1.0, None).unwrap();
        params[p] = base[p] - h;
        m.set_parameters_from_slice(&params);
        let minus = score_and_gradient(&m, &mut t, seq, kind, 1.0, None).unwrap();
        (plus - minus) / (2.0 * h)
    }

    #[test]
    fn diff_score_matches_log_prob() {
        let m = mock_casino();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"0110");
        let res = score_and_gradient(&m, &mut t, &seq, ScoreKind::Likelihood, 1.0, None).unwrap();
        assert_relative_eq!(res, m.log_prob(&seq).unwrap().to_log_value(), epsilon = 1e-12);

        let m = mock_silent_bridge();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"010");
        let res = score_and_gradient(&m, &mut t, &seq, ScoreKind::Likelihood, 1.0, None).unwrap();
        assert_relative_eq!(res, m.log_prob(&seq).unwrap().to_log_value(), epsilon = 1e-12);

        let m = mock_order2();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"01");
        let res = score_and_gradient(&m, &mut t, &seq, ScoreKind::Likelihood, 1.0, None).unwrap();
        assert_relative_eq!(res, (0.21225f64).ln(), epsilon = 1e-12);
    }

    #[test]
    fn diff_viterbi_score_matches_decoder() {
        let m = mock_silent_bridge();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"00");
        let res = score_and_gradient(&m, &mut t, &seq, ScoreKind::Viterbi, 1.0, None).unwrap();
        let (_, best) = m.viterbi(&seq).unwrap();
        assert_relative_eq!(res, best.to_log_value(), epsilon = 1e-12);
    }

    #[test]
    fn diff_gradient_matches_finite_differences() {
        let m = mock_cpg();
        let mut t = DiffTables::new(&m);
        let a = Alphabet::dna();
        let seq = Sequence::encode(b"ACGT", &a).unwrap();
        let mut grad = vec![0.0; m.n_parameters()];
        score_and_gradient(&m, &mut t, &seq, ScoreKind::Likelihood, 1.0, Some(&mut grad)).unwrap();
        for p in 0..m.n_parameters() {
            let fd = central_fd(&m, &seq, ScoreKind::Likelihood, p);
            assert_abs_diff_eq!(grad[p], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn diff_gradient_with_silent_states_matches_finite_differences() {
        let m = mock_silent_bridge();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"00");
        let mut grad = vec![0.0; m.n_parameters()];
        score_and_gradient(&m, &mut t, &seq, ScoreKind::Likelihood, 1.0, Some(&mut grad)).unwrap();
        for p in 0..m.n_parameters() {
            let fd = central_fd(&m, &seq, ScoreKind::Likelihood, p);
            assert_abs_diff_eq!(grad[p], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn diff_viterbi_gradient_matches_finite_differences() {
        let m = mock_cpg();
        let mut t = DiffTables::new(&m);
        let a = Alphabet::dna();
        let seq = Sequence::encode(b"ACGC", &a).unwrap();
        let mut grad = vec![0.0; m.n_parameters()];
        score_and_gradient(&m, &mut t, &seq, ScoreKind::Viterbi, 1.0, Some(&mut grad)).unwrap();
        for p in 0..m.n_parameters() {
            let fd = central_fd(&m, &seq, ScoreKind::Viterbi, p);
            assert_abs_diff_eq!(grad[p], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn diff_gradient_scales_with_weight() {
        let m = mock_casino();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"01");
        let mut once = vec![0.0; m.n_parameters()];
        let mut twice = vec![0.0; m.n_parameters()];
        score_and_gradient(&m, &mut t, &seq, ScoreKind::Likelihood, 1.0, Some(&mut once)).unwrap();
        score_and_gradient(&m, &mut t, &seq, ScoreKind::Likelihood, 2.0, Some(&mut twice)).unwrap();
        for p in 0..m.n_parameters() {
            assert_relative_eq!(twice[p], 2.0 * once[p], epsilon = 1e-12);
        }
    }

    #[test]
    fn diff_restricted_to_single_path_scores_that_path() {
        let m = mock_casino();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"01");
        let labels = vec![mask(&[1], 2), mask(&[0], 2)];
        let res = restricted_score_and_gradient(
            &m,
            &mut t,
            &seq,
            ScoreKind::Likelihood,
            &labels,
            1.0,
            None,
        )
        .unwrap();
        let path = m.log_prob_for_path(&[1, 0], &seq).unwrap();
        assert_relative_eq!(res, path.to_log_value(), epsilon = 1e-12);
    }

    #[test]
    fn diff_restriction_applies_below_order_one() {
        // the mask gates the move itself, not the context it creates
        let m = mock_casino();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"0");
        let labels = vec![mask(&[0], 2)];
        let res = restricted_score_and_gradient(
            &m,
            &mut t,
            &seq,
            ScoreKind::Likelihood,
            &labels,
            1.0,
            None,
        )
        .unwrap();
        assert_relative_eq!(res, (0.6f64 * 0.5).ln(), epsilon = 1e-12);
    }

    #[test]
    fn diff_contrastive_with_open_masks_is_zero() {
        let m = mock_cpg();
        let mut t = DiffTables::new(&m);
        let a = Alphabet::dna();
        let seq = Sequence::encode(b"ACGT", &a).unwrap();
        let labels = vec![mask(&[0, 1], 2); 4];
        let mut grad = vec![0.0; m.n_parameters()];
        let res = contrastive_score_and_gradient(
            &m,
            &mut t,
            &seq,
            ScoreKind::Likelihood,
            &labels,
            1.0,
            Some(&mut grad),
        )
        .unwrap();
        assert_abs_diff_eq!(res, 0.0, epsilon = 1e-12);
        for &g in grad.iter() {
            assert_abs_diff_eq!(g, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn diff_contrastive_subtracts_the_passes() {
        let m = mock_casino();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"01");
        let labels = vec![mask(&[1], 2), mask(&[0], 2)];
        let res = contrastive_score_and_gradient(
            &m,
            &mut t,
            &seq,
            ScoreKind::Likelihood,
            &labels,
            1.0,
            None,
        )
        .unwrap();
        let restricted = (0.4f64 * 0.9 * 0.6 * 0.5).ln();
        let unrestricted = m.log_prob(&seq).unwrap().to_log_value();
        assert_relative_eq!(res, restricted - unrestricted, epsilon = 1e-12);
    }

    #[test]
    fn diff_rejects_wrong_mask_count() {
        let m = mock_casino();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"01");
        let labels = vec![mask(&[0], 2)];
        let res = restricted_score_and_gradient(
            &m,
            &mut t,
            &seq,
            ScoreKind::Likelihood,
            &labels,
            1.0,
            None,
        );
        assert!(matches!(res, Err(HmmError::WrongLength { .. })));
    }

    #[test]
    fn diff_impossible_sequence_scores_log_zero_and_keeps_gradient() {
        let m = mock_silent_bridge();
        let mut t = DiffTables::new(&m);
        let seq = encode(b"0");
        let mut grad = vec![0.0; m.n_parameters()];
        let res =
            score_and_gradient(&m, &mut t, &seq, ScoreKind::Likelihood, 1.0, Some(&mut grad))
                .unwrap();
        assert_eq!(res, f64::NEG_INFINITY);
        for &g in grad.iter() {
            assert_eq!(g, 0.0);
        }
    }
}
