//!
//! Expectation-maximization training
//!
//! One outer loop serves both point-estimate regimes: per iteration the
//! sufficient statistics are reset, every sequence is scored with the
//! matching pass (full posterior for Baum-Welch, the single best path for
//! Viterbi training), the weighted scores are summed into the objective
//! `log prior + log likelihood`, and the parameters are re-estimated in
//! closed form from the joined statistics. A termination condition is
//! consulted between iterations.
//!
//! With more than one thread the E-step runs on a [`WorkerPool`]; the
//! loop itself is unchanged and sees only the joined totals. With more
//! than one start the loop is repeated from random initializations and
//! the best final objective wins; the first start always trains from the
//! parameters the model came with.
//!
use crate::dp::DpTables;
use crate::error::{HmmError, Result};
use crate::hmm::HigherOrderHmm;
use crate::seq::Dataset;
use crate::train::parallel::{compute_range, WorkerPool};
use crate::train::termination::{SmallDifference, TerminationCondition};
use log::info;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;
use std::time::Instant;

///
/// The two point-estimate passes of the shared EM loop.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmKind {
    /// soft assignments from the full path posterior
    BaumWelch,
    /// hard assignments from the single best path
    Viterbi,
}

impl std::fmt::Display for EmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EmKind::BaumWelch => write!(f, "baum-welch"),
            EmKind::Viterbi => write!(f, "viterbi"),
        }
    }
}

///
/// Configuration of the EM driver.
///
#[derive(Clone, Debug)]
pub struct EmConfig {
    pub kind: EmKind,
    /// independent starts; starts beyond the first draw the parameters
    /// from the priors
    pub n_starts: usize,
    pub n_threads: usize,
    /// seed of the random restarts
    pub seed: u64,
    pub max_iterations: usize,
    /// objective improvement below which an iteration counts as converged
    pub threshold: f64,
}

impl EmConfig {
    pub fn new(kind: EmKind) -> EmConfig {
        EmConfig {
            kind,
            n_starts: 1,
            n_threads: 1,
            seed: 0,
            max_iterations: 100,
            threshold: 1e-6,
        }
    }
}

impl std::fmt::Display for EmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "kind={} starts={} threads={} seed={} max_iterations={} threshold={}",
            self.kind, self.n_starts, self.n_threads, self.seed, self.max_iterations, self.threshold
        )
    }
}

///
/// Outcome of a training run.
///
#[derive(Clone, Debug)]
pub struct TrainResult {
    /// final objective `log prior + log likelihood`
    pub objective: f64,
    /// per-iteration objectives of the winning start
    pub history: Vec<f64>,
    /// index of the winning start
    pub best_start: usize,
}

///
/// Trains `model` on `data` and leaves the best parameters installed.
///
pub fn train_em(
    model: &mut HigherOrderHmm,
    data: &Dataset,
    config: &EmConfig,
) -> Result<TrainResult> {
    if data.is_empty() {
        return Err(HmmError::wrong_length("the data set is empty"));
    }
    info!("em training with {}", config);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
    let mut best: Option<(TrainResult, HigherOrderHmm)> = None;
    for start in 0..config.n_starts.max(1) {
        let mut current = model.clone();
        if start > 0 {
            current.initialize_randomly(&mut rng)?;
        }
        let history = run_one_start(&mut current, data, config)?;
        let objective = *history.last().unwrap();
        info!(
            "start {} finished after {} iterations with objective {:.6}",
            start,
            history.len(),
            objective
        );
        if best.as_ref().map_or(true, |(b, _)| objective > b.objective) {
            best = Some((
                TrainResult {
                    objective,
                    history,
                    best_start: start,
                },
                current,
            ));
        }
    }
    let (result, winner) = best.unwrap();
    model.copy_parameters_from(&winner);
    Ok(result)
}

fn run_one_start(model: &mut HigherOrderHmm, data: &Dataset, config: &EmConfig) -> Result<Vec<f64>> {
    let n_workers = config.n_threads.min(data.len());
    if n_workers > 1 {
        let shared = Arc::new(data.clone());
        let pool = WorkerPool::new(model, &shared, n_workers);
        let res = run_iterations(model, data, config, Some(&pool));
        // join the workers before any error propagates
        let stopped = pool.shutdown();
        let history = res?;
        stopped?;
        Ok(history)
    } else {
        run_iterations(model, data, config, None)
    }
}

fn run_iterations(
    model: &mut HigherOrderHmm,
    data: &Dataset,
    config: &EmConfig,
    pool: Option<&WorkerPool>,
) -> Result<Vec<f64>> {
    let started = Instant::now();
    let mut termination = SmallDifference::new(config.threshold, config.max_iterations);
    let mut tables = DpTables::new(model);
    let mut history = Vec::new();
    let mut old = f64::NEG_INFINITY;
    let mut iteration = 0;
    loop {
        let score = match pool {
            Some(pool) => {
                let (score, stats) = pool.compute(config.kind)?;
                model.reset_statistics();
                model.absorb_statistics(&stats);
                score
            }
            None => {
                let (score, _) =
                    compute_range(model, &mut tables, data, 0..data.len(), config.kind)?;
                score
            }
        };
        // the prior is evaluated at the parameters the E-step used
        let objective = model.guard_score(model.log_prior_term() + score)?;
        let elapsed = started.elapsed();
        info!(
            "em it={} elapsed={:.2}s value={:.6} diff={:+.3e}",
            iteration,
            elapsed.as_secs_f64(),
            objective,
            objective - old
        );
        history.push(objective);
        model.estimate_from_statistics();
        if let Some(pool) = pool {
            pool.broadcast_parameters(model.parameters_as_vec())?;
        }
        if !termination.do_next_iteration(iteration, old, objective, elapsed) {
            break;
        }
        old = objective;
        iteration += 1;
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::*;
    use test_case::test_case;

    #[test_case(EmKind::BaumWelch; "baum welch")]
    #[test_case(EmKind::Viterbi; "viterbi")]
    fn em_objective_is_monotone(kind: EmKind) {
        let mut model = mock_casino();
        let data = mock_binary_dataset();
        let mut config = EmConfig::new(kind);
        config.max_iterations = 8;
        config.threshold = 0.0;
        let res = train_em(&mut model, &data, &config).unwrap();
        assert!(res.history.len() >= 3);
        for pair in res.history.windows(2) {
            assert!(
                pair[1] >= pair[0] - 1e-9,
                "objective dropped from {} to {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn em_improves_over_initial_likelihood() {
        let mut model = mock_cpg_prior(0.1);
        let data = mock_dna_dataset();
        let before: f64 = data
            .iter()
            .map(|s| model.log_prob(s).unwrap().to_log_value())
            .sum();
        let config = EmConfig::new(EmKind::BaumWelch);
        train_em(&mut model, &data, &config).unwrap();
        let after: f64 = data
            .iter()
            .map(|s| model.log_prob(s).unwrap().to_log_value())
            .sum();
        assert!(after > before);
    }

    #[test]
    fn em_converges_under_threshold() {
        let mut model = mock_casino();
        let data = mock_binary_dataset();
        let mut config = EmConfig::new(EmKind::BaumWelch);
        config.max_iterations = 1000;
        config.threshold = 1e-4;
        let res = train_em(&mut model, &data, &config).unwrap();
        assert!(res.history.len() < 1000);
        let n = res.history.len();
        assert!((res.history[n - 1] - res.history[n - 2]).abs() <= 1e-4);
    }

    #[test_case(2; "two workers")]
    #[test_case(3; "three workers")]
    #[test_case(4; "four workers")]
    fn em_parallel_matches_sequential(n_threads: usize) {
        let data = mock_binary_dataset();
        let mut config = EmConfig::new(EmKind::BaumWelch);
        config.max_iterations = 5;
        config.threshold = 0.0;

        let mut sequential = mock_casino_prior(0.5);
        let res_seq = train_em(&mut sequential, &data, &config).unwrap();

        let mut parallel = mock_casino_prior(0.5);
        config.n_threads = n_threads;
        let res_par = train_em(&mut parallel, &data, &config).unwrap();

        assert_eq!(res_seq.history.len(), res_par.history.len());
        for (a, b) in res_seq.history.iter().zip(res_par.history.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        for (a, b) in sequential
            .parameters_as_vec()
            .iter()
            .zip(parallel.parameters_as_vec().iter())
        {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn em_multi_start_keeps_the_best() {
        let mut model = mock_casino_prior(0.5);
        let data = mock_binary_dataset();
        let mut config = EmConfig::new(EmKind::BaumWelch);
        config.n_starts = 3;
        config.seed = 7;
        config.max_iterations = 10;
        let res = train_em(&mut model, &data, &config).unwrap();
        // the winner's parameters are installed: one E-step on them scores
        // at least the winning objective (one more M-step was applied)
        let mut check = EmConfig::new(EmKind::BaumWelch);
        check.max_iterations = 1;
        let reran = train_em(&mut model.clone(), &data, &check).unwrap();
        assert!(reran.history[0] >= res.objective - 1e-9);
    }

    #[test]
    fn em_rejects_empty_dataset() {
        let mut model = mock_casino();
        let data = crate::seq::Dataset::from_seqs(Vec::new());
        let res = train_em(&mut model, &data, &EmConfig::new(EmKind::BaumWelch));
        assert!(matches!(res, Err(HmmError::WrongLength { .. })));
    }

    #[test]
    fn em_propagates_impossible_sequences() {
        let mut model = mock_silent_bridge();
        let a = crate::seq::Alphabet::binary();
        let data = crate::seq::Dataset::from_seqs(vec![
            crate::seq::Sequence::encode(b"00", &a).unwrap(),
            crate::seq::Sequence::encode(b"0", &a).unwrap(),
        ]);
        let res = train_em(&mut model, &data, &EmConfig::new(EmKind::BaumWelch));
        assert!(matches!(res, Err(HmmError::Computation { .. })));
    }
}
