//!
//! The higher-order hidden Markov model
//!
//! `HigherOrderHmm` ties the pieces together: an alphabet, named states
//! referencing emissions, a variable-order transition and the final-state
//! predicate. It validates sequences at the API boundary and forwards the
//! layered transition lookup to the dynamic programming.
//!
use crate::dp::{self, DpTables, ScoreKind};
use crate::error::{HmmError, Result};
use crate::hmm::emission::Emission;
use crate::hmm::state::State;
use crate::hmm::transition::{Step, Transition, TransitionElement};
use crate::prob::{log_sum_exp, Prob};
use crate::seq::{Alphabet, Sequence};
use petgraph::dot::Dot;
use petgraph::graph::DiGraph;
use rand::Rng;
use serde::{Deserialize, Serialize};

///
/// Sufficient statistics of one E-step, detached from the model so they can
/// be sent between worker threads and joined.
///
#[derive(Clone, Debug, PartialEq)]
pub struct ModelStatistics {
    pub emissions: Vec<Vec<f64>>,
    pub transition: Vec<Vec<f64>>,
}

impl ModelStatistics {
    /// Element-wise sum with another worker's statistics of the same shape.
    pub fn join(&mut self, other: &ModelStatistics) {
        for (mine, theirs) in self.emissions.iter_mut().zip(other.emissions.iter()) {
            for (a, b) in mine.iter_mut().zip(theirs.iter()) {
                *a += b;
            }
        }
        for (mine, theirs) in self.transition.iter_mut().zip(other.transition.iter()) {
            for (a, b) in mine.iter_mut().zip(theirs.iter()) {
                *a += b;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HigherOrderHmm {
    alphabet: Alphabet,
    states: Vec<State>,
    emissions: Vec<Emission>,
    transition: Transition,
    final_states: Vec<bool>,
    fixed_length: Option<usize>,
    n_parameters: usize,
}

impl HigherOrderHmm {
    ///
    /// Builds and validates a model.
    ///
    /// States are silent iff their emission is `Emission::Silent`. A state
    /// is final iff it is absorbing in the transition; if no state absorbs,
    /// all emitting states are final.
    ///
    pub fn new(
        alphabet: Alphabet,
        states: Vec<State>,
        emissions: Vec<Emission>,
        elements: Vec<TransitionElement>,
    ) -> Result<HigherOrderHmm> {
        if states.is_empty() {
            return Err(HmmError::wrong_model("at least one state is required"));
        }
        for s in states.iter() {
            if s.emission_idx >= emissions.len() {
                return Err(HmmError::wrong_model(format!(
                    "state {} references emission {} but only {} emissions were given",
                    s.name,
                    s.emission_idx,
                    emissions.len()
                )));
            }
        }
        for e in emissions.iter() {
            if let Emission::Discrete(d) = e {
                if d.n_parameters() != alphabet.size() {
                    return Err(HmmError::wrong_alphabet(format!(
                        "emission over {} symbols does not match the alphabet of size {}",
                        d.n_parameters(),
                        alphabet.size()
                    )));
                }
            }
        }
        let is_silent: Vec<bool> = states
            .iter()
            .map(|s| emissions[s.emission_idx].is_silent())
            .collect();
        let transition = Transition::new(elements, &is_silent)?;

        let mut final_states = transition.is_absorbing();
        if final_states.iter().all(|&f| !f) {
            for (f, &silent) in final_states.iter_mut().zip(is_silent.iter()) {
                *f = !silent;
            }
        }

        let mut hmm = HigherOrderHmm {
            alphabet,
            states,
            emissions,
            transition,
            final_states,
            fixed_length: None,
            n_parameters: 0,
        };
        hmm.assign_parameter_offsets();
        Ok(hmm)
    }
    fn assign_parameter_offsets(&mut self) {
        let mut offset = 0;
        for e in self.emissions.iter_mut() {
            if let Emission::Discrete(d) = e {
                offset = d.set_parameter_offset(offset);
            }
        }
        offset = self.transition.set_parameter_offset(offset);
        self.n_parameters = offset;
    }
    /// Restricts the model to sequences of exactly `length` symbols.
    pub fn set_fixed_length(&mut self, length: Option<usize>) {
        self.fixed_length = length;
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }
    pub fn n_states(&self) -> usize {
        self.states.len()
    }
    pub fn state(&self, s: usize) -> &State {
        &self.states[s]
    }
    pub fn state_names(&self) -> Vec<&str> {
        self.states.iter().map(|s| s.name.as_str()).collect()
    }
    pub fn is_silent(&self, s: usize) -> bool {
        self.emissions[self.states[s].emission_idx].is_silent()
    }
    pub fn is_final(&self, s: usize) -> bool {
        self.final_states[s]
    }
    pub fn final_states(&self) -> &[bool] {
        &self.final_states
    }
    pub fn order(&self) -> usize {
        self.transition.order()
    }
    pub fn transition(&self) -> &Transition {
        &self.transition
    }
    pub fn emission(&self, idx: usize) -> &Emission {
        &self.emissions[idx]
    }

    ///
    /// Checks a sequence against the model at the API boundary.
    ///
    pub fn check(&self, seq: &Sequence) -> Result<()> {
        if seq.alphabet_size() != self.alphabet.size() {
            return Err(HmmError::wrong_alphabet(format!(
                "the sequence uses an alphabet of size {} but the model expects {}",
                seq.alphabet_size(),
                self.alphabet.size()
            )));
        }
        if let Some(len) = self.fixed_length {
            if seq.len() != len {
                return Err(HmmError::wrong_length(format!(
                    "the sequence has length {} but the model is fixed to length {}",
                    seq.len(),
                    len
                )));
            }
        }
        Ok(())
    }
    /// Internal scores must never leak NaN to the caller.
    pub(crate) fn guard_score(&self, score: f64) -> Result<f64> {
        if score.is_nan() {
            Err(HmmError::computation(
                "the computed score is not a number, the model parameters may be degenerate",
            ))
        } else {
            Ok(score)
        }
    }

    //
    // transition and emission lookup for the dynamic programming
    //
    #[inline]
    pub fn n_contexts(&self, layer: usize) -> usize {
        self.transition.n_contexts(layer)
    }
    #[inline]
    pub fn n_children(&self, layer: usize, ctx: usize) -> usize {
        self.transition.n_children(layer, ctx)
    }
    #[inline]
    pub fn step(&self, layer: usize, ctx: usize, child: usize) -> Step {
        self.transition.step(layer, ctx, child)
    }
    #[inline]
    pub fn transition_log_score(&self, layer: usize, ctx: usize, child: usize) -> f64 {
        self.transition.log_score(layer, ctx, child)
    }
    pub fn transition_log_score_and_partials(
        &self,
        layer: usize,
        ctx: usize,
        child: usize,
        indices: &mut Vec<usize>,
        partials: &mut Vec<f64>,
    ) -> f64 {
        self.transition
            .log_score_and_partials(layer, ctx, child, indices, partials)
    }
    #[inline]
    pub fn last_context_state(&self, layer: usize, ctx: usize) -> Option<usize> {
        self.transition.last_context_state(layer, ctx)
    }
    #[inline]
    pub fn child_idx(&self, layer: usize, ctx: usize, state: usize) -> Option<usize> {
        self.transition.child_idx(layer, ctx, state)
    }
    #[inline]
    pub fn log_emission(&self, state: usize, rank: usize) -> f64 {
        let s = &self.states[state];
        self.emissions[s.emission_idx].log_score(rank, s.forward)
    }
    /// Like `log_emission`, appending the sparse partial derivatives of the
    /// score. Silent states score zero and have no parameters.
    pub fn log_emission_and_partials(
        &self,
        state: usize,
        rank: usize,
        indices: &mut Vec<usize>,
        partials: &mut Vec<f64>,
    ) -> f64 {
        let s = &self.states[state];
        match &self.emissions[s.emission_idx] {
            Emission::Silent => 0.0,
            Emission::Discrete(d) => d.log_score_and_partials(rank, s.forward, indices, partials),
        }
    }

    //
    // statistics
    //
    pub fn reset_statistics(&mut self) {
        for e in self.emissions.iter_mut() {
            e.reset_statistic();
        }
        self.transition.reset_statistic();
    }
    pub fn add_emission_statistic(&mut self, state: usize, rank: usize, weight: f64) {
        let s = &self.states[state];
        let forward = s.forward;
        self.emissions[s.emission_idx].add_to_statistic(rank, forward, weight);
    }
    pub fn add_transition_statistic(&mut self, layer: usize, ctx: usize, child: usize, weight: f64) {
        self.transition.add_to_statistic(layer, ctx, child, weight);
    }
    pub fn estimate_from_statistics(&mut self) {
        for e in self.emissions.iter_mut() {
            if let Emission::Discrete(d) = e {
                d.estimate_from_statistic();
            }
        }
        self.transition.estimate_from_statistic();
    }
    pub fn draw_from_statistics<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        for e in self.emissions.iter_mut() {
            if let Emission::Discrete(d) = e {
                d.draw_from_statistic(rng)?;
            }
        }
        self.transition.draw_from_statistic(rng)
    }
    /// Draws all distributions from their priors and clears the statistics.
    pub fn initialize_randomly<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        for e in self.emissions.iter_mut() {
            if let Emission::Discrete(d) = e {
                d.initialize_randomly(rng)?;
            }
        }
        self.transition.initialize_randomly(rng)
    }
    pub fn snapshot_statistics(&self) -> ModelStatistics {
        ModelStatistics {
            emissions: self
                .emissions
                .iter()
                .map(|e| match e {
                    Emission::Discrete(d) => d.snapshot_statistic(),
                    Emission::Silent => Vec::new(),
                })
                .collect(),
            transition: self.transition.snapshot_statistic(),
        }
    }
    pub fn absorb_statistics(&mut self, stats: &ModelStatistics) {
        for (e, o) in self.emissions.iter_mut().zip(stats.emissions.iter()) {
            if let Emission::Discrete(d) = e {
                d.absorb_statistic(o);
            }
        }
        self.transition.absorb_statistic(&stats.transition);
    }
    pub fn log_prior_term(&self) -> f64 {
        let mut res = self.transition.log_prior_term();
        for e in self.emissions.iter() {
            if let Emission::Discrete(d) = e {
                res += d.log_prior_term();
            }
        }
        res
    }
    /// Parameter-free score of the gathered statistics under the priors.
    pub fn log_gamma_score_from_statistics(&self) -> f64 {
        let mut res = self.transition.log_gamma_score_from_statistic();
        for e in self.emissions.iter() {
            if let Emission::Discrete(d) = e {
                res += d.log_gamma_score_from_statistic();
            }
        }
        res
    }

    //
    // flat parameter vector
    //
    pub fn n_parameters(&self) -> usize {
        self.n_parameters
    }
    pub fn parameters_as_vec(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.n_parameters];
        for e in self.emissions.iter() {
            if let Emission::Discrete(d) = e {
                d.fill_parameters(&mut out);
            }
        }
        self.transition.fill_parameters(&mut out);
        out
    }
    pub fn set_parameters_from_slice(&mut self, params: &[f64]) {
        for e in self.emissions.iter_mut() {
            if let Emission::Discrete(d) = e {
                d.set_parameters(params, 0);
            }
        }
        self.transition.set_parameters(params, 0);
    }
    pub fn add_gradient_of_log_prior(&self, grad: &mut [f64]) {
        for e in self.emissions.iter() {
            if let Emission::Discrete(d) = e {
                d.add_gradient_of_log_prior(grad, 0);
            }
        }
        self.transition.add_gradient_of_log_prior(grad, 0);
    }
    /// Takes over the distributions of `other`, which must share this
    /// model's structure.
    pub fn copy_parameters_from(&mut self, other: &HigherOrderHmm) {
        for (e, o) in self.emissions.iter_mut().zip(other.emissions.iter()) {
            if let (Emission::Discrete(d), Emission::Discrete(od)) = (e, o) {
                *d = od.clone();
            }
        }
        self.transition.copy_parameters_from(&other.transition);
    }

    ///
    /// Graphviz representation of the state graph.
    ///
    /// Edges are drawn from the last state of each context; an extra `start`
    /// node stands for the empty entry context.
    ///
    pub fn to_dot(&self) -> String {
        let mut graph: DiGraph<String, String> = DiGraph::new();
        let nodes: Vec<_> = self
            .states
            .iter()
            .enumerate()
            .map(|(s, state)| {
                if self.is_silent(s) {
                    graph.add_node(format!("{} (silent)", state.name))
                } else {
                    graph.add_node(state.name.clone())
                }
            })
            .collect();
        let start = graph.add_node("start".to_string());
        for t in 0..self.transition.n_elements() {
            let e = self.transition.element(t);
            let from = match e.last_context_state() {
                Some(s) => nodes[s],
                None => start,
            };
            for (i, &child) in e.children().iter().enumerate() {
                let p = (e.log_score(i)).exp();
                graph.add_edge(from, nodes[child], format!("{:.3}", p));
            }
        }
        format!("{}", Dot::new(&graph))
    }
}

///
/// Inference entry points.
///
/// Each call sizes fresh DP buffers for this model. The training loops in
/// `crate::train` reuse one set of buffers per worker through the free
/// functions in `crate::dp` instead.
///
impl HigherOrderHmm {
    ///
    /// Log-probability of the sequence under the model, summed over all
    /// state paths.
    ///
    /// A sequence the model cannot generate yields `Prob::zero()`, not an
    /// error.
    ///
    pub fn log_prob(&self, seq: &Sequence) -> Result<Prob> {
        self.check(seq)?;
        let mut t = DpTables::new(self);
        dp::fill_backward(self, &mut t, seq, ScoreKind::Likelihood);
        let res = self.guard_score(t.backward_total())?;
        Ok(Prob::from_log_prob(res))
    }
    ///
    /// Most probable state path and its joint probability with the
    /// sequence.
    ///
    pub fn viterbi(&self, seq: &Sequence) -> Result<(Vec<usize>, Prob)> {
        self.check(seq)?;
        let mut t = DpTables::new(self);
        let (path, score) = dp::viterbi_decode(self, &mut t, seq)?;
        Ok((path, Prob::from_log_prob(score)))
    }
    /// Draws one state path from the posterior over paths given the
    /// sequence.
    pub fn sample_state_path<R: Rng>(&self, seq: &Sequence, rng: &mut R) -> Result<Vec<usize>> {
        self.check(seq)?;
        let mut t = DpTables::new(self);
        dp::sample_path(self, &mut t, seq, rng)
    }
    ///
    /// Joint log-probability of one concrete state path with the sequence.
    ///
    /// The path must follow existing child links, consume the whole
    /// sequence and end in a final state. A link of probability zero is
    /// allowed and yields `Prob::zero()`.
    ///
    pub fn log_prob_for_path(&self, path: &[usize], seq: &Sequence) -> Result<Prob> {
        self.check(seq)?;
        let mut layer = 0;
        let mut ctx = 0;
        let mut res = 0.0;
        for (i, &state) in path.iter().enumerate() {
            let child = self.child_idx(layer, ctx, state).ok_or_else(|| {
                HmmError::invalid_path(format!(
                    "no transition leads to state {} at step {} of the path",
                    self.states[state].name, i
                ))
            })?;
            let step = self.step(layer, ctx, child);
            res += self.transition_log_score(layer, ctx, child);
            if step.advance == 1 {
                if layer == seq.len() {
                    return Err(HmmError::wrong_length(format!(
                        "the path emits more than the {} symbols of the sequence",
                        seq.len()
                    )));
                }
                res += self.log_emission(state, seq.rank(layer));
            }
            layer += step.advance;
            ctx = step.target;
        }
        if layer != seq.len() {
            return Err(HmmError::wrong_length(format!(
                "the path emits {} of the {} symbols of the sequence",
                layer,
                seq.len()
            )));
        }
        match path.last() {
            Some(&state) if self.is_final(state) => {}
            Some(&state) => {
                return Err(HmmError::invalid_path(format!(
                    "the path ends in state {} which cannot terminate a path",
                    self.states[state].name
                )))
            }
            // the empty path generates the empty sequence below order one
            None if self.order() == 0 => {}
            None => return Err(HmmError::invalid_path("the path is empty")),
        }
        let res = self.guard_score(res)?;
        Ok(Prob::from_log_prob(res))
    }
    ///
    /// Matrix `[state][layer]` of log posterior probabilities that a path
    /// visits `state` after consuming `layer` symbols, `layer` in
    /// `0..=seq.len()`. Emitting states carry mass at the layer behind the
    /// symbol they emit, silent states at the layer they are passed in.
    ///
    pub fn log_state_posterior(&self, seq: &Sequence) -> Result<Vec<Vec<f64>>> {
        self.check(seq)?;
        let mut t = DpTables::new(self);
        dp::fill_log_state_posteriors(self, &mut t, seq, false)
    }
    ///
    /// Most probable emitting state per symbol, the position-wise argmax of
    /// the state posterior over emitting states.
    ///
    pub fn posterior_decode(&self, seq: &Sequence) -> Result<Vec<usize>> {
        self.check(seq)?;
        let mut t = DpTables::new(self);
        let post = dp::fill_log_state_posteriors(self, &mut t, seq, true)?;
        let mut path = Vec::with_capacity(seq.len());
        for layer in 1..=seq.len() {
            let mut best = 0;
            for s in 1..self.n_states() {
                if post[s][layer] > post[best][layer] {
                    best = s;
                }
            }
            path.push(best);
        }
        Ok(path)
    }
    ///
    /// Total log-probability recomputed at every layer cut by joining
    /// forward and backward mass over the contexts a path enters the layer
    /// through. All `seq.len() + 1` entries agree up to round-off, which
    /// makes this a cheap consistency check of the two passes.
    ///
    pub fn log_prob_cuts(&self, seq: &Sequence) -> Result<Vec<f64>> {
        self.check(seq)?;
        let mut t = DpTables::new(self);
        dp::fill_forward(self, &mut t, seq);
        dp::fill_backward(self, &mut t, seq, ScoreKind::Likelihood);
        let mut cuts = Vec::with_capacity(seq.len() + 1);
        for layer in 0..=seq.len() {
            let fwd = t.forward_row(layer);
            let bwd = t.backward_row(layer);
            let mut res = f64::NEG_INFINITY;
            for ctx in 0..self.n_contexts(layer) {
                // a path enters a layer exactly once, through its entry
                // context or through the state emitting the symbol behind
                let entered = match self.last_context_state(layer, ctx) {
                    Some(s) => !self.is_silent(s),
                    None => true,
                };
                if entered {
                    res = log_sum_exp(&[res, fwd[ctx] + bwd[ctx]]);
                }
            }
            cuts.push(self.guard_score(res)?);
        }
        Ok(cuts)
    }
}
