//!
//! Reusable working storage of the dynamic programming
//!
use crate::hmm::HigherOrderHmm;

///
/// Matrices and scratch buffers sized for one model.
///
/// A table is tied to the model shape it was created for and must not be
/// shared between models. It is cheap to reuse across sequences; rows grow
/// to the longest sequence seen so far. Each worker thread owns its own
/// table.
///
#[derive(Clone, Debug)]
pub struct DpTables {
    pub(crate) fwd: Vec<Vec<f64>>,
    pub(crate) bwd: Vec<Vec<f64>>,
    /// Incoming summands per parity and target context, the extra slot
    /// holds the start value of the entry context
    pub(crate) forward_intermediate: [Vec<Vec<f64>>; 2],
    pub(crate) n_summands: [Vec<usize>; 2],
    pub(crate) backward_intermediate: Vec<f64>,
    pub(crate) log_emission: Vec<f64>,
}

impl DpTables {
    pub fn new(model: &HigherOrderHmm) -> DpTables {
        let m = model.transition().max_contexts();
        let slots = model.transition().max_in_degree() + 1;
        DpTables {
            fwd: Vec::new(),
            bwd: Vec::new(),
            forward_intermediate: [vec![vec![0.0; slots]; m], vec![vec![0.0; slots]; m]],
            n_summands: [vec![0; m], vec![0; m]],
            backward_intermediate: vec![0.0; model.n_states() + 1],
            log_emission: vec![0.0; model.n_states()],
        }
    }
    /// Grows the matrix to `len + 1` layers and resets the used rows.
    pub(crate) fn provide(&mut self, model: &HigherOrderHmm, backward: bool, len: usize) {
        let rows = if backward { &mut self.bwd } else { &mut self.fwd };
        while rows.len() < len + 1 {
            let l = rows.len();
            rows.push(vec![f64::NEG_INFINITY; model.n_contexts(l)]);
        }
        for row in rows.iter_mut().take(len + 1) {
            for v in row.iter_mut() {
                *v = f64::NEG_INFINITY;
            }
        }
    }
    pub fn forward_row(&self, layer: usize) -> &[f64] {
        &self.fwd[layer]
    }
    pub fn backward_row(&self, layer: usize) -> &[f64] {
        &self.bwd[layer]
    }
    /// Total log score of the last backward fill.
    pub fn backward_total(&self) -> f64 {
        self.bwd[0][0]
    }
}
