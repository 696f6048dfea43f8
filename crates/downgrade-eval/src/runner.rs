//! Parallel Monte-Carlo execution shared by the open-loop and feedback
//! sweeps. Runs are split into shards, shards fan out across a bounded pool,
//! and per-instance mergers fold shard data back together. Results are
//! written as newline-delimited JSON in instance completion order.

use std::io::{self, Write};
use std::thread;

use crossbeam::channel;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::{FeedbackInstance, Instance};
use crate::feedback::FeedbackInstanceResult;
use crate::sim::InstanceResult;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("error writing result: {0}")]
    WriteResult(#[source] serde_json::Error),
    #[error("error flushing results: {0}")]
    Flush(#[source] io::Error),
    #[error("worker pool shut down unexpectedly")]
    WorkerLost,
}

/// Per-system data accumulated within a shard and merged across shards.
pub(crate) trait ShardData: Clone + Default + Send {
    fn merge_from(&mut self, o: &Self);
}

/// One instance's worth of simulation work.
pub(crate) trait EvalJob: Sync {
    type ShardData: ShardData;
    type Output: Serialize + Send;

    fn num_sys(&self) -> usize;
    fn shard_size(&self) -> usize;
    fn run_shard(&self, shard_runs: usize, seed: u64) -> Vec<Self::ShardData>;
    fn summarize(&self, num_runs: usize, data: Vec<Self::ShardData>) -> Vec<Self::Output>;
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub num_runs: usize,
    pub parallelism: usize,
    pub base_seed: u64,
}

impl RunOptions {
    pub fn new(num_runs: usize, base_seed: u64) -> Self {
        RunOptions {
            num_runs,
            parallelism: default_parallelism(),
            base_seed,
        }
    }
}

pub fn default_parallelism() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Evaluates sampler/selector instances and writes one JSON record per
/// (instance, sampler, selector) to `w`.
pub fn eval_multi_to_json<W: Write>(
    instances: &[Instance],
    opts: &RunOptions,
    w: W,
) -> Result<(), EvalError> {
    eval_to_json::<Instance, InstanceResult, W>(instances, opts, w)
}

/// Evaluates feedback-control instances and writes one JSON record per
/// (instance, scenario) to `w`.
pub fn eval_multi_feedback_to_json<W: Write>(
    instances: &[FeedbackInstance],
    opts: &RunOptions,
    w: W,
) -> Result<(), EvalError> {
    eval_to_json::<FeedbackInstance, FeedbackInstanceResult, W>(instances, opts, w)
}

fn eval_to_json<J, O, W>(jobs: &[J], opts: &RunOptions, w: W) -> Result<(), EvalError>
where
    J: EvalJob<Output = O>,
    O: Serialize + Send,
    W: Write,
{
    let mut w = io::BufWriter::new(w);
    let total = jobs.len();
    let num_runs = opts.num_runs;
    let base_seed = opts.base_seed;

    // Channels outlive the scope closure's locals, so create them up front
    // and hand clones to the scoped threads.
    let (res_tx, res_rx) = channel::unbounded::<Vec<O>>();
    // Bounded channel as a counting semaphore: a buffered token is a running
    // shard. Send acquires, recv releases.
    let (sem_tx, sem_rx) = channel::bounded::<()>(opts.parallelism.max(1));

    thread::scope(|s| {
        let spawner_res_tx = res_tx.clone();
        s.spawn(move || {
            let mut global_shard: u64 = 0;
            for job in jobs {
                let shard_size = job.shard_size().max(1);
                let num_shards = num_runs.div_ceil(shard_size);
                let (shard_tx, shard_rx) = channel::unbounded::<Vec<J::ShardData>>();

                let res_tx = spawner_res_tx.clone();
                s.spawn(move || {
                    let mut merged = vec![J::ShardData::default(); job.num_sys()];
                    for _ in 0..num_shards {
                        let Ok(part) = shard_rx.recv() else { return };
                        for (m, p) in merged.iter_mut().zip(part.iter()) {
                            m.merge_from(p);
                        }
                    }
                    let _ = res_tx.send(job.summarize(num_runs, merged));
                });

                let mut remaining = num_runs;
                for _ in 0..num_shards {
                    let shard_runs = remaining.min(shard_size);
                    remaining -= shard_runs;
                    let seed = splitmix64(base_seed.wrapping_add(global_shard));
                    global_shard += 1;

                    if sem_tx.send(()).is_err() {
                        return;
                    }
                    let shard_tx = shard_tx.clone();
                    let sem_rx = sem_rx.clone();
                    s.spawn(move || {
                        let data = job.run_shard(shard_runs, seed);
                        let _ = shard_tx.send(data);
                        let _ = sem_rx.recv();
                    });
                }
            }
        });
        drop(res_tx);

        let mut done = 0;
        while done < total {
            let results = res_rx.recv().map_err(|_| EvalError::WorkerLost)?;
            done += 1;
            for r in &results {
                serde_json::to_writer(&mut w, r).map_err(EvalError::WriteResult)?;
                w.write_all(b"\n").map_err(io_write_err)?;
            }
            info!("finished {done}/{total} instances");
        }
        w.flush().map_err(EvalError::Flush)
    })
}

fn io_write_err(e: io::Error) -> EvalError {
    EvalError::WriteResult(serde_json::Error::io(e))
}

/// Mixes a shard index into a well-distributed RNG seed.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}
