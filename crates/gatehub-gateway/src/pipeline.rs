//! Pipeline multiplexer.
//!
//! Requests that name a pipeline must be executed and answered in arrival
//! order, irrespective of backend latency. The multiplexer keeps one
//! channel-backed FIFO worker per pipeline name: the first request for a new
//! pipeline spawns its worker, a sweep evicts workers idle for too long, and
//! dropping a worker's sender lets it drain its queue and exit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// How often idle workers are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type Task = BoxFuture<'static, ()>;

struct PipelineTask {
    pipeline: String,
    task: Task,
}

struct PipeWorker {
    tx: mpsc::Sender<Task>,
    active: Instant,
}

/// Per-session multiplexer of ordered execution lanes.
#[derive(Clone)]
pub struct PipelineMux {
    tx: mpsc::Sender<PipelineTask>,
}

impl PipelineMux {
    /// Spawns the multiplexer loop.
    ///
    /// The loop exits when the `done` signal fires or every dispatch handle
    /// is dropped; either way worker senders are dropped, and each worker
    /// drains what it already accepted before exiting.
    pub fn spawn(
        buffer: usize,
        idle_timeout: Duration,
        done: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run(rx, buffer, idle_timeout, done));
        Self { tx }
    }

    /// Enqueues a task onto its pipeline's FIFO lane.
    ///
    /// Returns `false` when the multiplexer has shut down.
    pub async fn dispatch(&self, pipeline: String, task: Task) -> bool {
        self.tx.send(PipelineTask { pipeline, task }).await.is_ok()
    }
}

async fn run(
    mut rx: mpsc::Receiver<PipelineTask>,
    buffer: usize,
    idle_timeout: Duration,
    mut done: watch::Receiver<bool>,
) {
    let mut workers: HashMap<String, PipeWorker> = HashMap::new();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = done.changed() => return,
            _ = sweep.tick() => {
                let before = workers.len();
                workers.retain(|_, worker| worker.active.elapsed() <= idle_timeout);
                if workers.len() < before {
                    debug!(evicted = before - workers.len(), "idle pipeline workers evicted");
                }
            }
            task = rx.recv() => {
                let Some(PipelineTask { pipeline, task }) = task else { return };

                let worker = workers.entry(pipeline).or_insert_with(|| {
                    let (tx, mut tasks) = mpsc::channel::<Task>(buffer);
                    tokio::spawn(async move {
                        // Serial execution is the ordering guarantee.
                        while let Some(task) = tasks.recv().await {
                            task.await;
                        }
                    });
                    PipeWorker { tx, active: Instant::now() }
                });
                worker.active = Instant::now();
                let _ = worker.tx.send(task).await;
            }
        }
    }
}
