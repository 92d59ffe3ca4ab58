//!
//! Training strategies
//!
//! All strategies work on the same model and dynamic programming:
//!
//! * `em` — the point-estimate loop shared by Baum-Welch (soft assignments)
//!   and Viterbi training (hard assignments), with optional random restarts
//! * `parallel` — the worker pool the EM loop uses to split a data set
//!   over threads with barrier-synchronized iterations
//! * `numerical` — the model as a differentiable objective plus a gradient
//!   ascent driver
//! * `gibbs` — the Bayesian variant drawing parameter sets from the
//!   posterior, with burn-in diagnostics and sample replay
//! * `termination` — the stopping conditions consulted between iterations
//!
pub mod em;
pub mod gibbs;
pub mod numerical;
pub mod parallel;
pub mod termination;

pub use em::{train_em, EmConfig, EmKind, TrainResult};
pub use gibbs::{
    BurnInTest, FixedLengthBurnIn, GibbsConfig, ParameterSample, SampledHmm, VarianceRatioBurnIn,
};
pub use numerical::{train_numerical, GradientAscent, HmmObjective, NumericalConfig};
pub use parallel::WorkerPool;
pub use termination::{
    CombinedCondition, MaxIterations, SmallDifference, TerminationCondition, TimeLimit,
};
