//!
//! Gradient-based numerical training
//!
//! The model becomes one differentiable function of its flat parameter
//! vector: `value = log prior + sum_i weight_i * score(seq_i)` with the
//! matching analytic gradient from `crate::diff`. An external optimizer
//! only needs [`HmmObjective::evaluate`] and
//! [`HmmObjective::evaluate_gradient`]; the [`GradientAscent`] driver
//! below is a simple such optimizer with step halving.
//!
use crate::diff::{score_and_gradient, DiffTables};
use crate::dp::ScoreKind;
use crate::error::{HmmError, Result};
use crate::hmm::HigherOrderHmm;
use crate::seq::Dataset;
use crate::train::em::TrainResult;
use log::{debug, info};

///
/// The training objective over a data set, owning a private model copy
/// and the gradient scratch buffers.
///
pub struct HmmObjective<'a> {
    model: HigherOrderHmm,
    tables: DiffTables,
    data: &'a Dataset,
    kind: ScoreKind,
}

impl<'a> HmmObjective<'a> {
    /// Full-likelihood objective, the default for numerical training.
    pub fn new(model: &HigherOrderHmm, data: &'a Dataset) -> HmmObjective<'a> {
        HmmObjective::with_kind(model, data, ScoreKind::Likelihood)
    }
    /// `ScoreKind::Viterbi` scores the best path instead of the full sum.
    pub fn with_kind(model: &HigherOrderHmm, data: &'a Dataset, kind: ScoreKind) -> HmmObjective<'a> {
        let model = model.clone();
        let tables = DiffTables::new(&model);
        HmmObjective {
            model,
            tables,
            data,
            kind,
        }
    }
    pub fn n_parameters(&self) -> usize {
        self.model.n_parameters()
    }

    /// Objective value at `params`.
    pub fn evaluate(&mut self, params: &[f64]) -> Result<f64> {
        self.model.set_parameters_from_slice(params);
        let mut res = self.model.log_prior_term();
        for i in 0..self.data.len() {
            let weight = self.data.weight(i);
            if weight == 0.0 {
                continue;
            }
            let score = score_and_gradient(
                &self.model,
                &mut self.tables,
                self.data.get(i),
                self.kind,
                1.0,
                None,
            )?;
            res += weight * score;
        }
        self.model.guard_score(res)
    }

    ///
    /// Objective value at `params` with the gradient written to `grad`
    /// (overwritten, not accumulated).
    ///
    pub fn evaluate_gradient(&mut self, params: &[f64], grad: &mut [f64]) -> Result<f64> {
        self.model.set_parameters_from_slice(params);
        for g in grad.iter_mut() {
            *g = 0.0;
        }
        let mut res = self.model.log_prior_term();
        self.model.add_gradient_of_log_prior(grad);
        for i in 0..self.data.len() {
            let weight = self.data.weight(i);
            if weight == 0.0 {
                continue;
            }
            let score = score_and_gradient(
                &self.model,
                &mut self.tables,
                self.data.get(i),
                self.kind,
                weight,
                Some(grad),
            )?;
            res += weight * score;
        }
        self.model.guard_score(res)
    }
}

///
/// Maximizes an objective along its gradient.
///
/// Each iteration walks from the current point in the gradient direction,
/// halving the step until the value improves; an accepted step doubles
/// the step again for the next iteration. The run stops when no step
/// improves, when the improvement falls below the threshold, or at the
/// iteration limit.
///
pub struct GradientAscent {
    max_iteration: usize,
    initial_step: f64,
    threshold: f64,
}

impl GradientAscent {
    pub fn new(max_iteration: usize, initial_step: f64, threshold: f64) -> GradientAscent {
        assert!(initial_step > 0.0);
        GradientAscent {
            max_iteration,
            initial_step,
            threshold,
        }
    }
    /// Runs the ascent in place and returns the per-iteration values.
    pub fn run(&self, objective: &mut HmmObjective, params: &mut Vec<f64>) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut candidate = params.clone();
        let mut step = self.initial_step;
        let mut value = objective.evaluate_gradient(params, &mut grad)?;
        let mut history = vec![value];
        for iteration in 0..self.max_iteration {
            let mut accepted = false;
            while step > 1e-12 {
                for (c, (p, g)) in candidate
                    .iter_mut()
                    .zip(params.iter().zip(grad.iter()))
                {
                    *c = p + step * g;
                }
                let v = objective.evaluate(&candidate)?;
                if v > value {
                    accepted = true;
                    break;
                }
                step *= 0.5;
            }
            if !accepted {
                debug!("no improving step at iteration {}", iteration);
                break;
            }
            params.copy_from_slice(&candidate);
            let new_value = objective.evaluate_gradient(params, &mut grad)?;
            history.push(new_value);
            info!(
                "ascent it={} step={:.3e} value={:.6} diff={:+.3e}",
                iteration,
                step,
                new_value,
                new_value - value
            );
            let diff = new_value - value;
            value = new_value;
            step *= 2.0;
            if diff.abs() < self.threshold {
                break;
            }
        }
        Ok(history)
    }
}

///
/// Configuration of [`train_numerical`].
///
#[derive(Clone, Copy, Debug)]
pub struct NumericalConfig {
    pub max_iterations: usize,
    pub step_size: f64,
    pub threshold: f64,
}

impl Default for NumericalConfig {
    fn default() -> NumericalConfig {
        NumericalConfig {
            max_iterations: 50,
            step_size: 0.1,
            threshold: 1e-6,
        }
    }
}

impl std::fmt::Display for NumericalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "max_iterations={} step_size={} threshold={}",
            self.max_iterations, self.step_size, self.threshold
        )
    }
}

///
/// Trains `model` by gradient ascent on the joint objective and leaves
/// the best parameters installed.
///
pub fn train_numerical(
    model: &mut HigherOrderHmm,
    data: &Dataset,
    config: &NumericalConfig,
) -> Result<TrainResult> {
    if data.is_empty() {
        return Err(HmmError::wrong_length("the data set is empty"));
    }
    info!("numerical training with {}", config);
    let mut objective = HmmObjective::new(model, data);
    let mut params = model.parameters_as_vec();
    let ascent = GradientAscent::new(config.max_iterations, config.step_size, config.threshold);
    let history = ascent.run(&mut objective, &mut params)?;
    model.set_parameters_from_slice(&params);
    Ok(TrainResult {
        objective: *history.last().unwrap(),
        history,
        best_start: 0,
    })
}
