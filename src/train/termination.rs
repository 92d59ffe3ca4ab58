//!
//! Stopping conditions of the outer training loops
//!
//! A condition is consulted once per finished iteration with the previous
//! and the current objective; training continues while it returns `true`.
//! Conditions are stateful so a time limit can be measured from the first
//! call and combined conditions can keep their own bookkeeping.
//!
use std::time::Duration;

pub trait TerminationCondition {
    ///
    /// Whether another iteration should run after iteration `iteration`
    /// moved the objective from `old` to `new` with `elapsed` total
    /// training time so far.
    ///
    fn do_next_iteration(&mut self, iteration: usize, old: f64, new: f64, elapsed: Duration)
        -> bool;
}

///
/// Stops after a fixed number of iterations.
///
#[derive(Clone, Copy, Debug)]
pub struct MaxIterations(pub usize);

impl TerminationCondition for MaxIterations {
    fn do_next_iteration(&mut self, iteration: usize, _: f64, _: f64, _: Duration) -> bool {
        iteration + 1 < self.0
    }
}

///
/// Stops once the objective improves by less than `threshold`, with
/// `max_iterations` as a guard against oscillation.
///
/// The first iteration always continues since there is no previous value
/// to compare against.
///
#[derive(Clone, Copy, Debug)]
pub struct SmallDifference {
    threshold: f64,
    max_iterations: usize,
}

impl SmallDifference {
    pub fn new(threshold: f64, max_iterations: usize) -> SmallDifference {
        assert!(threshold >= 0.0);
        SmallDifference {
            threshold,
            max_iterations,
        }
    }
}

impl TerminationCondition for SmallDifference {
    fn do_next_iteration(&mut self, iteration: usize, old: f64, new: f64, _: Duration) -> bool {
        if iteration + 1 >= self.max_iterations {
            return false;
        }
        if old == f64::NEG_INFINITY {
            return true;
        }
        (new - old).abs() > self.threshold
    }
}

///
/// Stops when the total training time exceeds the limit.
///
#[derive(Clone, Copy, Debug)]
pub struct TimeLimit(pub Duration);

impl TerminationCondition for TimeLimit {
    fn do_next_iteration(&mut self, _: usize, _: f64, _: f64, elapsed: Duration) -> bool {
        elapsed < self.0
    }
}

///
/// Continues only while every inner condition continues.
///
pub struct CombinedCondition {
    conditions: Vec<Box<dyn TerminationCondition>>,
}

impl CombinedCondition {
    pub fn new(conditions: Vec<Box<dyn TerminationCondition>>) -> CombinedCondition {
        CombinedCondition { conditions }
    }
}

impl TerminationCondition for CombinedCondition {
    fn do_next_iteration(&mut self, iteration: usize, old: f64, new: f64, elapsed: Duration) -> bool {
        self.conditions
            .iter_mut()
            .all(|c| c.do_next_iteration(iteration, old, new, elapsed))
    }
}
