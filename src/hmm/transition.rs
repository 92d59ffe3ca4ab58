//!
//! Variable-order transition over state-history contexts
//!
//! A `TransitionElement` is one conditional distribution: given the recent
//! state history (the context) it scores the moves to its child states.
//! `Transition` links the elements into a layered lookup structure used by
//! the dynamic programming: for each layer it lists the reachable contexts,
//! emitting-entered contexts first, then the contexts entered through silent
//! states in topological order of the silent subgraph.
//!
//! Contexts are maintained as sliding windows: following child `c` from
//! context `[s1, .., sk]` leads to `[s1, .., sk, c]` truncated on the left
//! to the maximal order. Elements for contexts that are reachable but were
//! not given explicitly are created with an empty child set, so paths end
//! there unless the context's last state is final.
//!
use crate::error::{HmmError, Result};
use crate::prob::log_sum_exp;
use fnv::FnvHashMap;
use rand::Rng;
use rand_distr::{Dirichlet, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

///
/// One legal move out of a context.
///
/// `advance == 0` for a silent child (the layer is kept), `advance == 1`
/// for an emitting child (one symbol is consumed). `target` is the context
/// position in layer `layer + advance`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    pub state: usize,
    pub target: usize,
    pub advance: usize,
}

///
/// Conditional transition distribution of a single context.
///
/// Parameters are free log scores; the normalized log probability of child
/// `i` is `params[i] - log_norm`. `hyper` holds the pseudo counts of the
/// Dirichlet prior and `statistic` the weighted counts of one E-step.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionElement {
    context: Vec<usize>,
    children: Vec<usize>,
    descendants: Vec<usize>,
    hyper: Vec<f64>,
    params: Vec<f64>,
    probs: Vec<f64>,
    log_norm: f64,
    statistic: Vec<f64>,
    offset: usize,
}

impl TransitionElement {
    ///
    /// Element for `context` with moves to the states in `children`.
    ///
    /// An empty `hyper` slice means no prior; otherwise one non-negative
    /// pseudo count per child is required. Children must be distinct.
    ///
    pub fn new(context: &[usize], children: &[usize], hyper: &[f64]) -> Result<TransitionElement> {
        let n = children.len();
        let mut sorted = children.to_vec();
        sorted.sort_unstable();
        for w in sorted.windows(2) {
            if w[0] == w[1] {
                return Err(HmmError::wrong_model(format!(
                    "several edges to the same child: {:?} -> {}",
                    context, w[0]
                )));
            }
        }
        let hyper = if hyper.is_empty() {
            vec![0.0; n]
        } else {
            if hyper.len() != n {
                return Err(HmmError::wrong_model(
                    "the numbers of children and hyper parameters differ",
                ));
            }
            if let Some(h) = hyper.iter().find(|&&h| h < 0.0) {
                return Err(HmmError::wrong_model(format!(
                    "negative hyper parameter {} for context {:?}",
                    h, context
                )));
            }
            hyper.to_vec()
        };
        let mut e = TransitionElement {
            context: context.to_vec(),
            children: children.to_vec(),
            descendants: vec![usize::MAX; n],
            hyper,
            params: vec![0.0; n],
            probs: vec![0.0; n],
            log_norm: 0.0,
            statistic: vec![0.0; n],
            offset: 0,
        };
        e.precompute();
        Ok(e)
    }
    fn precompute(&mut self) {
        self.log_norm = log_sum_exp(&self.params);
        for i in 0..self.params.len() {
            self.probs[i] = (self.params[i] - self.log_norm).exp();
        }
    }
    pub fn context(&self) -> &[usize] {
        &self.context
    }
    pub fn children(&self) -> &[usize] {
        &self.children
    }
    pub fn n_children(&self) -> usize {
        self.children.len()
    }
    pub fn child(&self, index: usize) -> usize {
        self.children[index]
    }
    fn descendant(&self, index: usize) -> usize {
        self.descendants[index]
    }
    pub fn last_context_state(&self) -> Option<usize> {
        self.context.last().copied()
    }
    /// Context entered when following child `index`, as a window of length
    /// at most `order`.
    fn next_context(&self, index: usize, order: usize) -> Vec<usize> {
        let len = if self.context.len() < order {
            self.context.len() + 1
        } else {
            order
        };
        let mut next = Vec::with_capacity(len);
        if len > 0 {
            let from = if self.context.len() < order { 0 } else { 1 };
            next.extend_from_slice(&self.context[from..from + len - 1]);
            next.push(self.children[index]);
        }
        next
    }
    pub fn log_score(&self, child_idx: usize) -> f64 {
        self.params[child_idx] - self.log_norm
    }
    pub fn probs(&self) -> &[f64] {
        &self.probs
    }

    //
    // gradient support
    //
    /// Number of free parameters. A context with at most one child has a
    /// fixed distribution and contributes none.
    pub fn n_parameters(&self) -> usize {
        if self.params.len() > 1 {
            self.params.len()
        } else {
            0
        }
    }
    pub fn set_parameter_offset(&mut self, offset: usize) -> usize {
        self.offset = offset;
        offset + self.n_parameters()
    }
    pub fn fill_parameters(&self, out: &mut [f64]) {
        if self.params.len() > 1 {
            out[self.offset..self.offset + self.params.len()].copy_from_slice(&self.params);
        }
    }
    pub fn set_parameters(&mut self, params: &[f64], start: usize) {
        if self.params.len() > 1 {
            let begin = start + self.offset;
            let end = begin + self.params.len();
            self.params.copy_from_slice(&params[begin..end]);
            self.precompute();
        }
    }
    ///
    /// Log score of child `child_idx` together with its partial derivatives,
    /// appended as sparse `(parameter index, value)` pairs. The pairs are
    /// not unique per index, repeated indices add up.
    ///
    pub fn log_score_and_partials(
        &self,
        child_idx: usize,
        indices: &mut Vec<usize>,
        partials: &mut Vec<f64>,
    ) -> f64 {
        if self.params.len() > 1 {
            for i in 0..self.params.len() {
                indices.push(self.offset + i);
                partials.push(-self.probs[i]);
            }
            indices.push(self.offset + child_idx);
            partials.push(1.0);
        }
        self.params[child_idx] - self.log_norm
    }
    pub fn log_prior_term(&self) -> f64 {
        let sum_hyper: f64 = self.hyper.iter().sum();
        if sum_hyper == 0.0 {
            return 0.0;
        }
        let mut res = -sum_hyper * self.log_norm;
        for i in 0..self.hyper.len() {
            res += self.hyper[i] * self.params[i];
        }
        res
    }
    pub fn add_gradient_of_log_prior(&self, grad: &mut [f64], start: usize) {
        if self.hyper.len() > 1 {
            let sum_hyper: f64 = self.hyper.iter().sum();
            for i in 0..self.hyper.len() {
                grad[start + self.offset + i] += self.hyper[i] - sum_hyper * self.probs[i];
            }
        }
    }

    //
    // statistics
    //
    pub fn reset_statistic(&mut self) {
        for s in self.statistic.iter_mut() {
            *s = 0.0;
        }
    }
    pub fn add_to_statistic(&mut self, child_idx: usize, weight: f64) {
        self.statistic[child_idx] += weight;
    }
    ///
    /// Maximum a-posteriori estimate from the gathered statistic. An
    /// all-zero statistic falls back to the uniform distribution.
    ///
    pub fn estimate_from_statistic(&mut self) {
        if !self.children.is_empty() {
            let mut norm = 0.0;
            for i in 0..self.statistic.len() {
                self.statistic[i] += self.hyper[i];
                norm += self.statistic[i];
                self.params[i] = self.statistic[i].ln();
            }
            if norm == 0.0 {
                for p in self.params.iter_mut() {
                    *p = 0.0;
                }
                self.log_norm = (self.params.len() as f64).ln();
            } else {
                self.log_norm = norm.ln();
            }
            for i in 0..self.params.len() {
                self.probs[i] = (self.params[i] - self.log_norm).exp();
            }
        }
    }
    /// Draws the distribution from the posterior Dirichlet
    /// `Dir(statistic + hyper)`, from the symmetric `Dir(1)` when both are
    /// all zero.
    pub fn draw_from_statistic<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        if self.children.len() > 1 {
            let mut alphas: Vec<f64> = self
                .statistic
                .iter()
                .zip(self.hyper.iter())
                .map(|(s, h)| s + h)
                .collect();
            if alphas.iter().sum::<f64>() == 0.0 {
                for a in alphas.iter_mut() {
                    *a = 1.0;
                }
            }
            let dir = Dirichlet::new(&alphas)
                .map_err(|e| HmmError::computation(format!("dirichlet draw failed: {}", e)))?;
            let sample = dir.sample(rng);
            for i in 0..self.params.len() {
                self.params[i] = sample[i].ln();
            }
        } else {
            for p in self.params.iter_mut() {
                *p = 0.0;
            }
        }
        self.precompute();
        Ok(())
    }
    pub fn initialize_randomly<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        self.reset_statistic();
        self.draw_from_statistic(rng)?;
        self.reset_statistic();
        Ok(())
    }
    pub fn log_gamma_score_from_statistic(&self) -> f64 {
        let mut sum = 0.0;
        let mut all = 0.0;
        let mut res = 0.0;
        for i in 0..self.hyper.len() {
            sum += self.hyper[i];
            all += self.statistic[i];
            res += libm::lgamma(self.statistic[i]) - libm::lgamma(self.hyper[i]);
        }
        res + libm::lgamma(sum) - libm::lgamma(all)
    }
    pub fn copy_parameters_from(&mut self, other: &TransitionElement) {
        self.params.copy_from_slice(&other.params);
        self.precompute();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Layer {
    /// Element indices of the reachable contexts, in evaluation order
    elements: Vec<usize>,
    /// Dense element index to context position map, `-1` if absent
    position: Vec<isize>,
}

impl Layer {
    fn build(list: &[usize], n_elements: usize) -> Layer {
        let mut position = vec![-1isize; n_elements];
        for (i, &e) in list.iter().enumerate() {
            position[e] = i as isize;
        }
        Layer {
            elements: list.to_vec(),
            position,
        }
    }
}

///
/// Linked and layered transition of the whole model.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    order: usize,
    is_silent: Vec<bool>,
    elements: Vec<TransitionElement>,
    layers: Vec<Layer>,
    max_in_degree: usize,
}

impl Transition {
    ///
    /// Links the given elements and builds the layer lookup.
    ///
    /// `is_silent[s]` tells whether state `s` is silent. Fails if a context
    /// is given twice, a context other than the entry is unreachable, an
    /// order-zero model contains silent states, or the silent states form
    /// a cycle.
    ///
    pub fn new(elements: Vec<TransitionElement>, is_silent: &[bool]) -> Result<Transition> {
        let mut elements = elements;
        let n_states = is_silent.len();
        if elements.is_empty() {
            return Err(HmmError::wrong_model(
                "at least one transition element is required",
            ));
        }
        let order = elements.iter().map(|e| e.context.len()).max().unwrap_or(0);
        for e in elements.iter() {
            for &s in e.context.iter().chain(e.children.iter()) {
                if s >= n_states {
                    return Err(HmmError::wrong_model(format!(
                        "state {} out of range, the model has {} states",
                        s, n_states
                    )));
                }
            }
        }

        // link the elements, creating childless ones for missing contexts
        let mut index_of: FnvHashMap<Vec<usize>, usize> = FnvHashMap::default();
        for (i, e) in elements.iter().enumerate() {
            if index_of.insert(e.context.clone(), i).is_some() {
                return Err(HmmError::wrong_model(format!(
                    "the context {:?} is used by more than one transition element",
                    e.context
                )));
            }
        }
        let mut t = 0;
        while t < elements.len() {
            for child in 0..elements[t].n_children() {
                let next = elements[t].next_context(child, order);
                let d = match index_of.get(&next) {
                    Some(&d) => d,
                    None => {
                        let d = elements.len();
                        index_of.insert(next.clone(), d);
                        elements.push(TransitionElement::new(&next, &[], &[])?);
                        d
                    }
                };
                elements[t].descendants[child] = d;
            }
            t += 1;
        }

        // reachability: every context except the entry needs an in-edge
        let mut in_deg = vec![0usize; elements.len()];
        for e in elements.iter() {
            for &d in e.descendants.iter() {
                in_deg[d] += 1;
            }
        }
        let entry = if order == 0 {
            0
        } else {
            match elements.iter().position(|e| e.context.is_empty()) {
                Some(t) => t,
                None => {
                    return Err(HmmError::wrong_model(
                        "a transition element with empty context is required",
                    ))
                }
            }
        };
        let mut max_in_degree = 0;
        for t in 0..elements.len() {
            max_in_degree = max_in_degree.max(in_deg[t]);
            if t != entry && in_deg[t] == 0 {
                return Err(HmmError::wrong_model(format!(
                    "the context {:?} is not reachable",
                    elements[t].context
                )));
            }
        }

        let mut layers = Vec::with_capacity(order + 1);
        if order == 0 {
            if let Some(s) = (0..n_states).find(|&s| is_silent[s]) {
                return Err(HmmError::wrong_model(format!(
                    "an order-zero model must not contain silent states, state {} is silent",
                    s
                )));
            }
            layers.push(Layer::build(&[0], elements.len()));
        } else {
            let n = elements.len();
            let mut current_layer = vec![entry];
            let mut next_layer: Vec<usize> = Vec::new();
            let mut next_used = vec![false; n];
            let mut layer_list = vec![entry];
            add_and_topsort(
                &elements,
                is_silent,
                &mut current_layer,
                &mut next_layer,
                &mut next_used,
                &mut layer_list,
            )?;
            layers.push(Layer::build(&layer_list, n));
            std::mem::swap(&mut current_layer, &mut next_layer);

            for _p in 1..order {
                layer_list.clear();
                next_layer.clear();
                for nu in next_used.iter_mut() {
                    *nu = false;
                }
                // emitting-entered contexts of this layer seed the next one
                for i in 0..current_layer.len() {
                    let idx = current_layer[i];
                    layer_list.push(idx);
                    for s in 0..elements[idx].n_children() {
                        let d = elements[idx].descendant(s);
                        if !is_silent[elements[idx].child(s)] && !next_used[d] {
                            next_layer.push(d);
                            next_used[d] = true;
                        }
                    }
                }
                add_and_topsort(
                    &elements,
                    is_silent,
                    &mut current_layer,
                    &mut next_layer,
                    &mut next_used,
                    &mut layer_list,
                )?;
                layers.push(Layer::build(&layer_list, n));
                std::mem::swap(&mut current_layer, &mut next_layer);
            }

            // the maximal-order layer repeats for the rest of the sequence,
            // so it holds every emitting-entered full-length context
            current_layer.clear();
            next_layer.clear();
            layer_list.clear();
            for nu in next_used.iter_mut() {
                *nu = false;
            }
            for t in 0..n {
                if elements[t].context.len() == order {
                    if let Some(last) = elements[t].last_context_state() {
                        if !is_silent[last] {
                            current_layer.push(t);
                            layer_list.push(t);
                        }
                    }
                }
            }
            add_and_topsort(
                &elements,
                is_silent,
                &mut current_layer,
                &mut next_layer,
                &mut next_used,
                &mut layer_list,
            )?;
            layers.push(Layer::build(&layer_list, n));
        }

        Ok(Transition {
            order,
            is_silent: is_silent.to_vec(),
            elements,
            layers,
            max_in_degree,
        })
    }
    pub fn order(&self) -> usize {
        self.order
    }
    pub fn n_states(&self) -> usize {
        self.is_silent.len()
    }
    pub fn n_elements(&self) -> usize {
        self.elements.len()
    }
    pub fn element(&self, t: usize) -> &TransitionElement {
        &self.elements[t]
    }
    pub fn max_in_degree(&self) -> usize {
        self.max_in_degree
    }
    fn layer_index(&self, layer: usize) -> usize {
        layer.min(self.order)
    }
    fn element_index(&self, layer: usize, ctx: usize) -> usize {
        self.layers[self.layer_index(layer)].elements[ctx]
    }
    /// Number of reachable contexts at `layer`. Layers behind the maximal
    /// order share the maximal-order context set.
    pub fn n_contexts(&self, layer: usize) -> usize {
        self.layers[self.layer_index(layer)].elements.len()
    }
    /// Largest context count over all layers, used for buffer sizing.
    pub fn max_contexts(&self) -> usize {
        self.layers.iter().map(|l| l.elements.len()).max().unwrap_or(0)
    }
    pub fn n_children(&self, layer: usize, ctx: usize) -> usize {
        self.elements[self.element_index(layer, ctx)].n_children()
    }
    ///
    /// Resolves child `child` of context `ctx` at `layer` into the state
    /// visited, the layer advance and the target context position.
    ///
    pub fn step(&self, layer: usize, ctx: usize, child: usize) -> Step {
        let e = &self.elements[self.element_index(layer, ctx)];
        let state = e.child(child);
        let advance = if self.is_silent[state] { 0 } else { 1 };
        let pos = self.layers[self.layer_index(layer + advance)].position[e.descendant(child)];
        debug_assert!(pos >= 0);
        Step {
            state,
            target: pos as usize,
            advance,
        }
    }
    pub fn log_score(&self, layer: usize, ctx: usize, child: usize) -> f64 {
        self.elements[self.element_index(layer, ctx)].log_score(child)
    }
    pub fn log_score_and_partials(
        &self,
        layer: usize,
        ctx: usize,
        child: usize,
        indices: &mut Vec<usize>,
        partials: &mut Vec<f64>,
    ) -> f64 {
        self.elements[self.element_index(layer, ctx)].log_score_and_partials(
            child, indices, partials,
        )
    }
    /// Last state of the context at position `ctx` of `layer`, `None` for
    /// the empty entry context.
    pub fn last_context_state(&self, layer: usize, ctx: usize) -> Option<usize> {
        self.elements[self.element_index(layer, ctx)].last_context_state()
    }
    /// Child index of `state` in the context at `(layer, ctx)`.
    pub fn child_idx(&self, layer: usize, ctx: usize, state: usize) -> Option<usize> {
        self.elements[self.element_index(layer, ctx)]
            .children
            .iter()
            .position(|&c| c == state)
    }
    ///
    /// A state is absorbing if no context ending in it has outgoing moves,
    /// so every path reaching it must stop there.
    ///
    pub fn is_absorbing(&self) -> Vec<bool> {
        let mut absorbing = vec![true; self.is_silent.len()];
        for e in self.elements.iter() {
            if !e.children.is_empty() {
                if let Some(last) = e.last_context_state() {
                    absorbing[last] = false;
                }
            }
        }
        absorbing
    }

    //
    // parameters
    //
    pub fn n_parameters(&self) -> usize {
        self.elements.iter().map(|e| e.n_parameters()).sum()
    }
    pub fn set_parameter_offset(&mut self, offset: usize) -> usize {
        let mut offset = offset;
        for e in self.elements.iter_mut() {
            offset = e.set_parameter_offset(offset);
        }
        offset
    }
    pub fn fill_parameters(&self, out: &mut [f64]) {
        for e in self.elements.iter() {
            e.fill_parameters(out);
        }
    }
    pub fn set_parameters(&mut self, params: &[f64], start: usize) {
        for e in self.elements.iter_mut() {
            e.set_parameters(params, start);
        }
    }
    pub fn copy_parameters_from(&mut self, other: &Transition) {
        for (e, o) in self.elements.iter_mut().zip(other.elements.iter()) {
            e.copy_parameters_from(o);
        }
    }
    pub fn log_prior_term(&self) -> f64 {
        self.elements.iter().map(|e| e.log_prior_term()).sum()
    }
    pub fn add_gradient_of_log_prior(&self, grad: &mut [f64], start: usize) {
        for e in self.elements.iter() {
            e.add_gradient_of_log_prior(grad, start);
        }
    }

    //
    // statistics
    //
    pub fn reset_statistic(&mut self) {
        for e in self.elements.iter_mut() {
            e.reset_statistic();
        }
    }
    pub fn add_to_statistic(&mut self, layer: usize, ctx: usize, child: usize, weight: f64) {
        let idx = self.element_index(layer, ctx);
        self.elements[idx].add_to_statistic(child, weight);
    }
    pub fn estimate_from_statistic(&mut self) {
        for e in self.elements.iter_mut() {
            e.estimate_from_statistic();
        }
    }
    pub fn draw_from_statistic<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        for e in self.elements.iter_mut() {
            e.draw_from_statistic(rng)?;
        }
        Ok(())
    }
    pub fn initialize_randomly<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        for e in self.elements.iter_mut() {
            e.initialize_randomly(rng)?;
        }
        Ok(())
    }
    pub fn log_gamma_score_from_statistic(&self) -> f64 {
        self.elements
            .iter()
            .map(|e| e.log_gamma_score_from_statistic())
            .sum()
    }
    pub fn snapshot_statistic(&self) -> Vec<Vec<f64>> {
        self.elements.iter().map(|e| e.statistic.clone()).collect()
    }
    pub fn absorb_statistic(&mut self, other: &[Vec<f64>]) {
        assert_eq!(other.len(), self.elements.len());
        for (e, o) in self.elements.iter_mut().zip(other.iter()) {
            for (s, v) in e.statistic.iter_mut().zip(o.iter()) {
                *s += v;
            }
        }
    }
}

///
/// Completes one layer list and seeds the next one.
///
/// `current_layer` starts with the emitting-entered contexts of the layer;
/// contexts reachable from them through silent moves are discovered, sorted
/// topologically with Kahn's algorithm and appended to `layer_list`.
/// Emitting descendants of all walked contexts are collected into
/// `next_layer` (deduplicated through `next_used`). A silent cycle leaves
/// unsorted contexts behind and fails construction.
///
fn add_and_topsort(
    elements: &[TransitionElement],
    is_silent: &[bool],
    current_layer: &mut Vec<usize>,
    next_layer: &mut Vec<usize>,
    next_used: &mut [bool],
    layer_list: &mut Vec<usize>,
) -> Result<()> {
    let n = elements.len();
    let mut can_be_used = vec![false; n];
    let mut used = vec![false; n];
    let mut in_deg = vec![0usize; n];
    let thresh = current_layer.len();

    let mut i = 0;
    while i < current_layer.len() {
        let idx = current_layer[i];
        for s in 0..elements[idx].n_children() {
            let d = elements[idx].descendant(s);
            if is_silent[elements[idx].child(s)] {
                if !can_be_used[d] {
                    current_layer.push(d);
                    can_be_used[d] = true;
                }
                // in-degree within the silent part only, edges from the
                // emitting-entered seeds do not constrain the order
                if i >= thresh {
                    in_deg[d] += 1;
                }
            } else if !next_used[d] {
                next_layer.push(d);
                next_used[d] = true;
            }
        }
        i += 1;
    }

    let mut roots = VecDeque::new();
    for t in 0..n {
        if can_be_used[t] {
            if in_deg[t] == 0 {
                roots.push_back(t);
            }
        } else {
            used[t] = true;
        }
    }
    while let Some(idx) = roots.pop_front() {
        used[idx] = true;
        layer_list.push(idx);
        for s in 0..elements[idx].n_children() {
            let d = elements[idx].descendant(s);
            if can_be_used[d] {
                in_deg[d] -= 1;
                if in_deg[d] == 0 {
                    roots.push_back(d);
                }
            }
        }
    }
    for t in 0..n {
        if can_be_used[t] && !used[t] {
            return Err(HmmError::wrong_model(format!(
                "the silent states form a cycle through context {:?}",
                elements[t].context
            )));
        }
    }
    Ok(())
}
