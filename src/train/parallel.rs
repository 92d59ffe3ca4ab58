//!
//! Worker pool of the parallel EM loop
//!
//! The data set is split into contiguous index ranges, one per worker.
//! Every worker owns a private duplicate of the model and its own DP
//! buffers; the shared data set is read-only behind an `Arc`. Workers
//! block on their task channel while idle; the coordinator blocks until
//! it has received exactly one report per worker, so no worker can enter
//! the next iteration before all statistics of the current one are joined
//! and the re-estimated parameters are broadcast.
//!
//! A failed worker reports its error like a result; the coordinator still
//! drains the remaining reports before it propagates a single error, and
//! the joined statistics of a failed iteration are discarded unused.
//!
use crate::dp::{self, DpTables};
use crate::error::{HmmError, Result};
use crate::hmm::model::ModelStatistics;
use crate::hmm::HigherOrderHmm;
use crate::seq::Dataset;
use crate::train::em::EmKind;
use log::{debug, info};
use std::ops::Range;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

enum Task {
    /// run one pass over the worker's range and report score + statistics
    Compute(EmKind),
    /// install re-estimated parameters before the next pass
    SetParameters(Arc<Vec<f64>>),
    Stop,
}

type Report = std::result::Result<(f64, ModelStatistics), HmmError>;

///
/// A fixed set of worker threads for barrier-synchronized EM iterations.
///
/// The pool must be shut down with [`WorkerPool::shutdown`] to join the
/// threads; dropping it only closes the task channels, which also ends
/// the workers but swallows their panics.
///
pub struct WorkerPool {
    tasks: Vec<Sender<Task>>,
    reports: Receiver<Report>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    ///
    /// Spawns `n_workers` threads, each with a private duplicate of
    /// `model` and the contiguous slice `i*n/k..(i+1)*n/k` of the data.
    ///
    pub fn new(model: &HigherOrderHmm, data: &Arc<Dataset>, n_workers: usize) -> WorkerPool {
        assert!(n_workers >= 1);
        let n = data.len();
        let (report_tx, reports) = channel();
        let mut tasks = Vec::with_capacity(n_workers);
        let mut handles = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            let (task_tx, task_rx) = channel();
            let range = i * n / n_workers..(i + 1) * n / n_workers;
            debug!("worker {} takes sequences {:?}", i, range);
            let worker_model = model.clone();
            let worker_data = Arc::clone(data);
            let worker_reports = report_tx.clone();
            handles.push(std::thread::spawn(move || {
                worker_loop(worker_model, worker_data, range, task_rx, worker_reports)
            }));
            tasks.push(task_tx);
        }
        info!("worker pool started with {} workers", n_workers);
        WorkerPool {
            tasks,
            reports,
            handles,
        }
    }

    pub fn n_workers(&self) -> usize {
        self.tasks.len()
    }

    ///
    /// Runs one pass on every worker and blocks until all have reported.
    ///
    /// Returns the summed log score and the joined sufficient statistics.
    /// If any worker failed the first error is returned after every report
    /// was collected, so all workers are idle again.
    ///
    pub fn compute(&self, kind: EmKind) -> Result<(f64, ModelStatistics)> {
        for task in self.tasks.iter() {
            task.send(Task::Compute(kind)).map_err(worker_gone)?;
        }
        let mut score = 0.0;
        let mut joined: Option<ModelStatistics> = None;
        let mut failure: Option<HmmError> = None;
        for _ in 0..self.tasks.len() {
            match self.reports.recv() {
                Ok(Ok((s, stats))) => {
                    score += s;
                    match joined.as_mut() {
                        Some(j) => j.join(&stats),
                        None => joined = Some(stats),
                    }
                }
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(_) => {
                    if failure.is_none() {
                        failure = Some(worker_gone(()));
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            // the pool holds at least one worker, so joined is set
            None => Ok((score, joined.unwrap())),
        }
    }

    /// Installs the given flat parameter vector on every worker's model.
    pub fn broadcast_parameters(&self, params: Vec<f64>) -> Result<()> {
        let params = Arc::new(params);
        for task in self.tasks.iter() {
            task.send(Task::SetParameters(Arc::clone(&params)))
                .map_err(worker_gone)?;
        }
        Ok(())
    }

    /// Stops and joins every worker. A worker panic surfaces here.
    pub fn shutdown(self) -> Result<()> {
        for task in self.tasks.iter() {
            // a worker that already exited cannot receive the stop signal
            let _ = task.send(Task::Stop);
        }
        let mut res = Ok(());
        for handle in self.handles {
            if handle.join().is_err() && res.is_ok() {
                res = Err(HmmError::computation("a worker thread panicked"));
            }
        }
        info!("worker pool stopped");
        res
    }
}

fn worker_gone<T>(_: T) -> HmmError {
    HmmError::computation("a worker thread exited unexpectedly")
}

fn worker_loop(
    mut model: HigherOrderHmm,
    data: Arc<Dataset>,
    range: Range<usize>,
    tasks: Receiver<Task>,
    reports: Sender<Report>,
) {
    let mut tables = DpTables::new(&model);
    while let Ok(task) = tasks.recv() {
        match task {
            Task::SetParameters(params) => model.set_parameters_from_slice(&params),
            Task::Compute(kind) => {
                let report = compute_range(&mut model, &mut tables, &data, range.clone(), kind);
                if reports.send(report).is_err() {
                    break;
                }
            }
            Task::Stop => break,
        }
    }
}

///
/// One E-step over `range`: resets the private statistics, scores every
/// sequence with its weight and returns the weighted score sum together
/// with a snapshot of the gathered statistics.
///
pub(crate) fn compute_range(
    model: &mut HigherOrderHmm,
    tables: &mut DpTables,
    data: &Dataset,
    range: Range<usize>,
    kind: EmKind,
) -> Result<(f64, ModelStatistics)> {
    model.reset_statistics();
    let mut score = 0.0;
    for i in range {
        let seq = data.get(i);
        let weight = data.weight(i);
        let res = match kind {
            EmKind::BaumWelch => {
                dp::fill_forward(model, tables, seq);
                dp::fill_backward_baum_welch(model, tables, seq, weight)?
            }
            EmKind::Viterbi => dp::viterbi_training_pass(model, tables, seq, weight)?,
        };
        score += weight * res;
    }
    Ok((score, model.snapshot_statistics()))
}
