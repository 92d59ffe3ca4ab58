//!
//! Bayesian training by Gibbs sampling
//!
//! Instead of a point estimate the trainer walks a Markov chain over
//! parameter sets: each iteration draws one state path per sequence from
//! the path posterior, counts the paths into the sufficient statistics
//! and draws fresh parameters from the posterior those statistics imply.
//! A burn-in test watches the per-iteration scores; once the chain is
//! considered stationary the drawn parameter sets are recorded.
//!
//! Inference on a [`SampledHmm`] replays the recorded parameter sets and
//! averages over them, so queries answer under the posterior rather than
//! under a single trained model.
//!
use crate::dp::{self, DpTables};
use crate::error::{HmmError, Result};
use crate::hmm::HigherOrderHmm;
use crate::prob::{log_sum_exp, Prob};
use crate::seq::{Dataset, Sequence};
use derive_new::new;
use log::{debug, info};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::path::Path;

///
/// Watches the per-iteration scores of the sampling chains and decides
/// when the burn-in phase is over.
///
/// Chains report in lockstep: every chain adds exactly one score per
/// iteration, chain `0` first.
///
pub trait BurnInTest {
    fn add_score(&mut self, chain: usize, score: f64);
    fn is_burned_in(&self) -> bool;
}

///
/// Declares the chain stationary after a fixed number of iterations.
///
#[derive(Clone, Debug)]
pub struct FixedLengthBurnIn {
    length: usize,
    iterations: usize,
}

impl FixedLengthBurnIn {
    pub fn new(length: usize) -> FixedLengthBurnIn {
        FixedLengthBurnIn {
            length,
            iterations: 0,
        }
    }
}

impl BurnInTest for FixedLengthBurnIn {
    fn add_score(&mut self, chain: usize, _: f64) {
        if chain == 0 {
            self.iterations += 1;
        }
    }
    fn is_burned_in(&self) -> bool {
        self.iterations >= self.length
    }
}

/// Iterations every chain must have reported before the variance ratio
/// is meaningful.
const MIN_ITERATIONS: usize = 10;

///
/// Multi-chain potential scale reduction over the per-iteration scores.
///
/// The ratio compares the within-chain score variance `W` to the
/// between-chain variance `B` over the later half of each chain; chains
/// started from overdispersed points have mixed once the ratio drops to
/// around one. Needs at least two chains.
///
#[derive(Clone, Debug)]
pub struct VarianceRatioBurnIn {
    threshold: f64,
    scores: Vec<Vec<f64>>,
}

impl VarianceRatioBurnIn {
    pub fn new(threshold: f64, n_chains: usize) -> VarianceRatioBurnIn {
        assert!(threshold >= 1.0);
        assert!(n_chains >= 2);
        VarianceRatioBurnIn {
            threshold,
            scores: vec![Vec::new(); n_chains],
        }
    }

    /// The current ratio, or `None` while the chains are still too short.
    pub fn potential_scale_reduction(&self) -> Option<f64> {
        let shortest = self.scores.iter().map(|s| s.len()).min().unwrap();
        if shortest < MIN_ITERATIONS {
            return None;
        }
        // later half of every chain, truncated to a common length
        let n = shortest / 2;
        let halves: Vec<&[f64]> = self
            .scores
            .iter()
            .map(|s| &s[s.len() - n..])
            .collect();
        let means: Vec<f64> = halves
            .iter()
            .map(|h| h.iter().sum::<f64>() / n as f64)
            .collect();
        let within = halves
            .iter()
            .zip(means.iter())
            .map(|(h, m)| h.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (n - 1) as f64)
            .sum::<f64>()
            / halves.len() as f64;
        let grand = means.iter().sum::<f64>() / means.len() as f64;
        let between = n as f64 * means.iter().map(|m| (m - grand) * (m - grand)).sum::<f64>()
            / (means.len() - 1) as f64;
        if within <= f64::EPSILON {
            // frozen chains, stationary iff they froze at the same value
            return Some(if between <= f64::EPSILON { 1.0 } else { f64::INFINITY });
        }
        let n = n as f64;
        let pooled = (n - 1.0) / n * within + between / n;
        Some((pooled / within).sqrt())
    }
}

impl BurnInTest for VarianceRatioBurnIn {
    fn add_score(&mut self, chain: usize, score: f64) {
        self.scores[chain].push(score);
    }
    fn is_burned_in(&self) -> bool {
        match self.potential_scale_reduction() {
            Some(r) => r <= self.threshold,
            None => false,
        }
    }
}

///
/// Configuration of the Gibbs trainer.
///
#[derive(Clone, Copy, Debug)]
pub struct GibbsConfig {
    /// independent chains; chains beyond the first start from random
    /// parameters drawn from the priors
    pub n_chains: usize,
    /// parameter sets recorded per chain after burn-in
    pub n_samples: usize,
    /// burn-in iterations after which sampling starts regardless of the
    /// burn-in test
    pub max_burn_in: usize,
    pub seed: u64,
}

impl Default for GibbsConfig {
    fn default() -> GibbsConfig {
        GibbsConfig {
            n_chains: 3,
            n_samples: 100,
            max_burn_in: 500,
            seed: 0,
        }
    }
}

impl std::fmt::Display for GibbsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "chains={} samples={} max_burn_in={} seed={}",
            self.n_chains, self.n_samples, self.max_burn_in, self.seed
        )
    }
}

///
/// One recorded parameter set of the stationary phase.
///
#[derive(Clone, Debug, Serialize, Deserialize, new)]
pub struct ParameterSample {
    pub chain: usize,
    pub iteration: usize,
    /// joint objective of the iteration the set was drawn in
    pub score: f64,
    pub parameters: Vec<f64>,
}

struct Chain {
    model: HigherOrderHmm,
    tables: DpTables,
    rng: Xoshiro256PlusPlus,
}

impl Chain {
    ///
    /// One Gibbs iteration: sample a path per sequence into the
    /// statistics, then draw new parameters from their posterior.
    /// Returns the joint objective under the parameters the paths were
    /// drawn with.
    ///
    fn step(&mut self, data: &Dataset) -> Result<f64> {
        self.model.reset_statistics();
        let mut score = 0.0;
        for i in 0..data.len() {
            let weight = data.weight(i);
            if weight == 0.0 {
                continue;
            }
            let s = dp::sample_training_pass(
                &mut self.model,
                &mut self.tables,
                data.get(i),
                weight,
                &mut self.rng,
            )?;
            score += weight * s;
        }
        let objective = self.model.guard_score(self.model.log_prior_term() + score)?;
        debug!(
            "gibbs step value={:.6} gamma={:.6}",
            objective,
            self.model.log_gamma_score_from_statistics()
        );
        self.model.draw_from_statistics(&mut self.rng)?;
        Ok(objective)
    }
}

///
/// A model together with parameter sets drawn from the posterior.
///
/// Every query replays the recorded sets and averages the per-set
/// answers, so the result marginalizes over the parameter uncertainty.
/// Queries before any set was recorded are a `NotTrained` error.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SampledHmm {
    model: HigherOrderHmm,
    samples: Vec<ParameterSample>,
}

impl SampledHmm {
    ///
    /// Runs the sampler with the default burn-in test: the variance
    /// ratio over the chains, or a fixed length when there is only one
    /// chain.
    ///
    pub fn train(model: &HigherOrderHmm, data: &Dataset, config: &GibbsConfig) -> Result<SampledHmm> {
        if config.n_chains > 1 {
            let mut burn_in = VarianceRatioBurnIn::new(1.2, config.n_chains);
            SampledHmm::train_with(model, data, config, &mut burn_in)
        } else {
            let mut burn_in = FixedLengthBurnIn::new(config.max_burn_in);
            SampledHmm::train_with(model, data, config, &mut burn_in)
        }
    }

    /// Runs the sampler with a caller-provided burn-in test.
    pub fn train_with(
        model: &HigherOrderHmm,
        data: &Dataset,
        config: &GibbsConfig,
        burn_in: &mut dyn BurnInTest,
    ) -> Result<SampledHmm> {
        if data.is_empty() {
            return Err(HmmError::wrong_length("the data set is empty"));
        }
        info!("gibbs training with {}", config);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
        let mut chains = Vec::with_capacity(config.n_chains.max(1));
        for c in 0..config.n_chains.max(1) {
            let mut chain_model = model.clone();
            if c > 0 {
                chain_model.initialize_randomly(&mut rng)?;
            }
            let tables = DpTables::new(&chain_model);
            let chain_rng = rng.clone();
            rng.jump();
            chains.push(Chain {
                model: chain_model,
                tables,
                rng: chain_rng,
            });
        }

        let mut iteration = 0;
        while iteration < config.max_burn_in {
            for (c, chain) in chains.iter_mut().enumerate() {
                let objective = chain.step(data)?;
                burn_in.add_score(c, objective);
            }
            iteration += 1;
            if burn_in.is_burned_in() {
                break;
            }
        }
        info!("burn-in finished after {} iterations", iteration);

        let mut samples = Vec::with_capacity(config.n_samples * chains.len());
        for s in 0..config.n_samples {
            for (c, chain) in chains.iter_mut().enumerate() {
                let objective = chain.step(data)?;
                burn_in.add_score(c, objective);
                samples.push(ParameterSample::new(
                    c,
                    s,
                    objective,
                    chain.model.parameters_as_vec(),
                ));
            }
        }
        info!("recorded {} parameter samples", samples.len());
        Ok(SampledHmm {
            model: model.clone(),
            samples,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }
    pub fn samples(&self) -> &[ParameterSample] {
        &self.samples
    }
    pub fn model(&self) -> &HigherOrderHmm {
        &self.model
    }

    fn require_samples(&self) -> Result<()> {
        if self.samples.is_empty() {
            return Err(HmmError::not_trained("no parameter samples recorded"));
        }
        Ok(())
    }

    /// Collects `f` under every recorded parameter set.
    fn map_samples<T>(
        &self,
        mut f: impl FnMut(&HigherOrderHmm) -> Result<T>,
    ) -> Result<Vec<T>> {
        self.require_samples()?;
        let mut model = self.model.clone();
        let mut res = Vec::with_capacity(self.samples.len());
        for sample in self.samples.iter() {
            model.set_parameters_from_slice(&sample.parameters);
            res.push(f(&model)?);
        }
        Ok(res)
    }

    /// Marginal likelihood of `seq`, averaged over the recorded sets.
    pub fn log_prob(&self, seq: &Sequence) -> Result<Prob> {
        let scores = self.map_samples(|m| Ok(m.log_prob(seq)?.to_log_value()))?;
        Ok(Prob::from_log_prob(
            log_sum_exp(&scores) - (scores.len() as f64).ln(),
        ))
    }

    /// Marginal likelihood of walking `path` while emitting `seq`.
    pub fn log_prob_for_path(&self, path: &[usize], seq: &Sequence) -> Result<Prob> {
        let scores = self.map_samples(|m| Ok(m.log_prob_for_path(path, seq)?.to_log_value()))?;
        Ok(Prob::from_log_prob(
            log_sum_exp(&scores) - (scores.len() as f64).ln(),
        ))
    }

    ///
    /// Best path under the marginal likelihood: decodes `seq` under every
    /// recorded set and keeps the candidate with the best averaged path
    /// score.
    ///
    pub fn viterbi(&self, seq: &Sequence) -> Result<(Vec<usize>, Prob)> {
        let mut candidates: Vec<Vec<usize>> = Vec::new();
        for path in self.map_samples(|m| Ok(m.viterbi(seq)?.0))? {
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        }
        let mut best: Option<(Vec<usize>, Prob)> = None;
        for path in candidates {
            let score = self.log_prob_for_path(&path, seq)?;
            if best.as_ref().map_or(true, |(_, b)| score > *b) {
                best = Some((path, score));
            }
        }
        // train_with records at least one sample before inference is allowed
        Ok(best.unwrap())
    }

    ///
    /// Marginal state posteriors `[state][layer]`, cell-wise averaged
    /// over the recorded sets.
    ///
    pub fn log_state_posterior(&self, seq: &Sequence) -> Result<Vec<Vec<f64>>> {
        let mats = self.map_samples(|m| m.log_state_posterior(seq))?;
        let norm = (mats.len() as f64).ln();
        let mut res = Vec::with_capacity(mats[0].len());
        let mut buf = vec![0.0; mats.len()];
        for state in 0..mats[0].len() {
            let mut row = Vec::with_capacity(mats[0][state].len());
            for layer in 0..mats[0][state].len() {
                for (b, m) in buf.iter_mut().zip(mats.iter()) {
                    *b = m[state][layer];
                }
                row.push(log_sum_exp(&buf) - norm);
            }
            res.push(row);
        }
        Ok(res)
    }

    /// Most probable emitting state per symbol under the marginal
    /// posterior.
    pub fn posterior_decode(&self, seq: &Sequence) -> Result<Vec<usize>> {
        let posterior = self.log_state_posterior(seq)?;
        let mut path = Vec::with_capacity(seq.len());
        for layer in 1..=seq.len() {
            let mut best: Option<usize> = None;
            for s in 0..posterior.len() {
                if self.model.is_silent(s) {
                    continue;
                }
                match best {
                    Some(b) if posterior[s][layer] <= posterior[b][layer] => {}
                    _ => best = Some(s),
                }
            }
            // every model holds at least one emitting state
            path.push(best.unwrap());
        }
        Ok(path)
    }

    /// Writes the model and the recorded sets as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Reads a sampled model back from JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SampledHmm> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}
