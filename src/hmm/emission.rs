//!
//! Emission distributions of states
//!
//! Emitting states carry a `DiscreteEmission` over symbol ranks, silent
//! states carry no distribution at all. Scores are natural-log probabilities.
//!
use crate::error::{HmmError, Result};
use crate::prob::log_sum_exp;
use rand::Rng;
use rand_distr::{Dirichlet, Distribution};
use serde::{Deserialize, Serialize};

///
/// Emission of a state.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Emission {
    /// No emission. The state consumes no symbol and its score is `ln 1 = 0`.
    Silent,
    /// Discrete distribution over the symbol ranks of the alphabet.
    Discrete(DiscreteEmission),
}

impl Emission {
    pub fn is_silent(&self) -> bool {
        match self {
            Emission::Silent => true,
            Emission::Discrete(_) => false,
        }
    }
    ///
    /// Log score of emitting the symbol with rank `rank`.
    ///
    /// For a reverse strand state the complement rank
    /// `alphabet_size - 1 - rank` is looked up instead.
    ///
    pub fn log_score(&self, rank: usize, forward: bool) -> f64 {
        match self {
            Emission::Silent => 0.0,
            Emission::Discrete(e) => e.log_score(rank, forward),
        }
    }
    pub fn add_to_statistic(&mut self, rank: usize, forward: bool, weight: f64) {
        if let Emission::Discrete(e) = self {
            e.add_to_statistic(rank, forward, weight);
        }
    }
    pub fn reset_statistic(&mut self) {
        if let Emission::Discrete(e) = self {
            e.reset_statistic();
        }
    }
    pub fn n_parameters(&self) -> usize {
        match self {
            Emission::Silent => 0,
            Emission::Discrete(e) => e.n_parameters(),
        }
    }
}

///
/// Discrete emission distribution with a Dirichlet prior.
///
/// Parameters are free log scores `params[i]`; the normalized log
/// probability of rank `i` is `params[i] - log_norm` with
/// `log_norm = logsumexp(params)`. `hyper` holds the pseudo counts of the
/// prior and `statistic` the weighted counts gathered during one E-step.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscreteEmission {
    alphabet_size: usize,
    params: Vec<f64>,
    probs: Vec<f64>,
    log_norm: f64,
    hyper: Vec<f64>,
    statistic: Vec<f64>,
    offset: usize,
}

impl DiscreteEmission {
    ///
    /// Uniform emission over `alphabet_size` ranks with equivalent sample
    /// size `ess` spread evenly over the hyper parameters.
    ///
    pub fn new(alphabet_size: usize, ess: f64) -> DiscreteEmission {
        assert!(alphabet_size > 0);
        assert!(ess >= 0.0);
        let mut e = DiscreteEmission {
            alphabet_size,
            params: vec![0.0; alphabet_size],
            probs: vec![0.0; alphabet_size],
            log_norm: 0.0,
            hyper: vec![ess / alphabet_size as f64; alphabet_size],
            statistic: vec![0.0; alphabet_size],
            offset: 0,
        };
        e.precompute();
        e
    }
    ///
    /// Emission with the given probabilities (must sum to one) and zero ess.
    ///
    pub fn from_probs(probs: &[f64]) -> DiscreteEmission {
        let mut e = DiscreteEmission::new(probs.len(), 0.0);
        for (i, &p) in probs.iter().enumerate() {
            e.params[i] = p.ln();
        }
        e.precompute();
        e
    }
    fn precompute(&mut self) {
        self.log_norm = log_sum_exp(&self.params);
        for i in 0..self.alphabet_size {
            self.probs[i] = (self.params[i] - self.log_norm).exp();
        }
    }
    fn index(&self, rank: usize, forward: bool) -> usize {
        debug_assert!(rank < self.alphabet_size);
        if forward {
            rank
        } else {
            self.alphabet_size - 1 - rank
        }
    }
    pub fn log_score(&self, rank: usize, forward: bool) -> f64 {
        self.params[self.index(rank, forward)] - self.log_norm
    }
    pub fn probs(&self) -> &[f64] {
        &self.probs
    }
    pub fn ess(&self) -> f64 {
        self.hyper.iter().sum()
    }

    //
    // gradient support
    //
    pub fn n_parameters(&self) -> usize {
        self.alphabet_size
    }
    /// Assigns this emission the parameter range starting at `offset` and
    /// returns the offset behind it.
    pub fn set_parameter_offset(&mut self, offset: usize) -> usize {
        self.offset = offset;
        offset + self.alphabet_size
    }
    pub fn fill_parameters(&self, out: &mut [f64]) {
        out[self.offset..self.offset + self.alphabet_size].copy_from_slice(&self.params);
    }
    pub fn set_parameters(&mut self, params: &[f64], start: usize) {
        let begin = start + self.offset;
        self.params
            .copy_from_slice(&params[begin..begin + self.alphabet_size]);
        self.precompute();
    }
    ///
    /// Log score together with its partial derivatives with respect to the
    /// free parameters, appended as sparse `(parameter index, value)` pairs.
    ///
    pub fn log_score_and_partials(
        &self,
        rank: usize,
        forward: bool,
        indices: &mut Vec<usize>,
        partials: &mut Vec<f64>,
    ) -> f64 {
        let index = self.index(rank, forward);
        for i in 0..self.alphabet_size {
            indices.push(self.offset + i);
            partials.push(if i == index { 1.0 } else { 0.0 } - self.probs[i]);
        }
        self.params[index] - self.log_norm
    }
    /// `sum_i hyper[i] * params[i] - ess * log_norm`, zero without a prior.
    pub fn log_prior_term(&self) -> f64 {
        let ess = self.ess();
        if ess > 0.0 {
            let mut res = -ess * self.log_norm;
            for i in 0..self.alphabet_size {
                res += self.hyper[i] * self.params[i];
            }
            res
        } else {
            0.0
        }
    }
    pub fn add_gradient_of_log_prior(&self, grad: &mut [f64], start: usize) {
        let ess = self.ess();
        if ess > 0.0 {
            for i in 0..self.alphabet_size {
                grad[start + self.offset + i] += self.hyper[i] - ess * self.probs[i];
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
    pub fn add_to_statistic(&mut self, rank: usize, forward: bool, weight: f64) {
        let index = self.index(rank, forward);
        self.statistic[index] += weight;
    }
    pub fn snapshot_statistic(&self) -> Vec<f64> {
        self.statistic.clone()
    }
    pub fn absorb_statistic(&mut self, other: &[f64]) {
        assert_eq!(other.len(), self.statistic.len());
        for (s, o) in self.statistic.iter_mut().zip(other.iter()) {
            *s += o;
        }
    }
    ///
    /// Maximum a-posteriori estimate from the gathered statistic.
    ///
    /// The hyper parameters are added onto the statistic first. An all-zero
    /// statistic falls back to the uniform distribution.
    ///
    pub fn estimate_from_statistic(&mut self) {
        for i in 0..self.alphabet_size {
            self.statistic[i] += self.hyper[i];
        }
        let mut sum: f64 = self.statistic.iter().sum();
        if sum == 0.0 {
            for s in self.statistic.iter_mut() {
                *s = 1.0;
            }
            sum = self.alphabet_size as f64;
        }
        for i in 0..self.alphabet_size {
            self.probs[i] = self.statistic[i] / sum;
            self.params[i] = self.probs[i].ln();
        }
        self.log_norm = 0.0;
    }
    ///
    /// Draws the distribution from the posterior Dirichlet
    /// `Dir(statistic + hyper)`; an all-zero posterior falls back to the
    /// symmetric `Dir(1)`.
    ///
    pub fn draw_from_statistic<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
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
        self.draw_dirichlet_log(&alphas, rng)
    }
    ///
    /// Draws the distribution from the prior, falling back to the symmetric
    /// `Dir(1)` when no prior is set. Resets the statistic.
    ///
    pub fn initialize_randomly<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        self.reset_statistic();
        let mut alphas = self.hyper.clone();
        if self.ess() == 0.0 {
            for a in alphas.iter_mut() {
                *a = 1.0;
            }
        }
        self.draw_dirichlet_log(&alphas, rng)
    }
    fn draw_dirichlet_log<R: Rng>(&mut self, alphas: &[f64], rng: &mut R) -> Result<()> {
        if self.alphabet_size > 1 {
            let dir = Dirichlet::new(alphas).map_err(|e| {
                HmmError::computation(format!("dirichlet draw failed: {}", e))
            })?;
            let sample = dir.sample(rng);
            for i in 0..self.alphabet_size {
                self.params[i] = sample[i].ln();
            }
        } else {
            self.params[0] = 0.0;
        }
        self.precompute();
        Ok(())
    }
    ///
    /// `sum_i (ln G(statistic[i]) - ln G(hyper[i])) + ln G(sum hyper) - ln G(sum statistic)`
    /// with `G` the gamma function. Used by the sampling trainer to score a
    /// gathered statistic under the prior.
    ///
    pub fn log_gamma_score_from_statistic(&self) -> f64 {
        let sum_hyper: f64 = self.hyper.iter().sum();
        let sum_stat: f64 = self.statistic.iter().sum();
        let mut res = libm::lgamma(sum_hyper) - libm::lgamma(sum_stat);
        for i in 0..self.alphabet_size {
            res += libm::lgamma(self.statistic[i]) - libm::lgamma(self.hyper[i]);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn emission_silent() {
        let e = Emission::Silent;
        assert!(e.is_silent());
        assert_eq!(e.log_score(0, true), 0.0);
        assert_eq!(e.n_parameters(), 0);
    }

    #[test]
    fn emission_scores() {
        let e = DiscreteEmission::from_probs(&[0.3, 0.7]);
        assert_relative_eq!(e.log_score(0, true), (0.3f64).ln(), epsilon = 1e-12);
        assert_relative_eq!(e.log_score(1, true), (0.7f64).ln(), epsilon = 1e-12);
        // reverse strand looks up the complement rank
        assert_relative_eq!(e.log_score(1, false), (0.3f64).ln(), epsilon = 1e-12);
        assert_relative_eq!(e.log_score(0, false), (0.7f64).ln(), epsilon = 1e-12);
    }

    #[test]
    fn emission_uniform_new() {
        let e = DiscreteEmission::new(4, 2.0);
        for r in 0..4 {
            assert_relative_eq!(e.log_score(r, true), (0.25f64).ln(), epsilon = 1e-12);
        }
        assert_relative_eq!(e.ess(), 2.0);
    }

    #[test]
    fn emission_estimate_from_counts() {
        let mut e = DiscreteEmission::new(2, 0.0);
        e.add_to_statistic(0, true, 3.0);
        e.add_to_statistic(1, true, 1.0);
        e.estimate_from_statistic();
        assert_relative_eq!(e.log_score(0, true), (0.75f64).ln(), epsilon = 1e-12);
        assert_relative_eq!(e.log_score(1, true), (0.25f64).ln(), epsilon = 1e-12);
    }

    #[test]
    fn emission_estimate_empty_statistic_is_uniform() {
        let mut e = DiscreteEmission::new(3, 0.0);
        e.estimate_from_statistic();
        for r in 0..3 {
            assert_relative_eq!(e.log_score(r, true), (1.0f64 / 3.0).ln(), epsilon = 1e-12);
        }
    }

    #[test]
    fn emission_estimate_uses_hyper() {
        // counts 3:1 plus hyper 1:1 gives 4:2
        let mut e = DiscreteEmission::new(2, 2.0);
        e.add_to_statistic(0, true, 3.0);
        e.add_to_statistic(1, true, 1.0);
        e.estimate_from_statistic();
        assert_relative_eq!(e.log_score(0, true), (4.0f64 / 6.0).ln(), epsilon = 1e-12);
    }

    #[test]
    fn emission_partials_sum_to_zero() {
        let mut e = DiscreteEmission::from_probs(&[0.2, 0.3, 0.5]);
        e.set_parameter_offset(0);
        let mut indices = Vec::new();
        let mut partials = Vec::new();
        let score = e.log_score_and_partials(1, true, &mut indices, &mut partials);
        assert_relative_eq!(score, (0.3f64).ln(), epsilon = 1e-12);
        let mut dense = vec![0.0; 3];
        for (&i, &p) in indices.iter().zip(partials.iter()) {
            dense[i] += p;
        }
        assert_relative_eq!(dense[0], -0.2, epsilon = 1e-12);
        assert_relative_eq!(dense[1], 1.0 - 0.3, epsilon = 1e-12);
        assert_relative_eq!(dense[2], -0.5, epsilon = 1e-12);
        assert_relative_eq!(dense.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn emission_draw_is_normalized() {
        let mut e = DiscreteEmission::new(4, 1.0);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        e.initialize_randomly(&mut rng).unwrap();
        let total: f64 = (0..4).map(|r| e.log_score(r, true).exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn emission_prior_term_uniform_maximum() {
        // with a symmetric prior the uniform distribution maximizes the prior
        let ess = 2.0;
        let uniform = DiscreteEmission::new(2, ess);
        let skewed = {
            let mut e = DiscreteEmission::new(2, ess);
            e.params = vec![(0.9f64).ln(), (0.1f64).ln()];
            e.precompute();
            e
        };
        assert!(uniform.log_prior_term() > skewed.log_prior_term());
    }

    #[test]
    fn emission_parameter_roundtrip() {
        let mut e = DiscreteEmission::from_probs(&[0.1, 0.9]);
        let next = e.set_parameter_offset(3);
        assert_eq!(next, 5);
        let mut flat = vec![0.0; 5];
        e.fill_parameters(&mut flat);
        let mut e2 = DiscreteEmission::new(2, 0.0);
        e2.set_parameter_offset(3);
        e2.set_parameters(&flat, 0);
        assert_relative_eq!(e2.log_score(0, true), e.log_score(0, true), epsilon = 1e-12);
    }
}
