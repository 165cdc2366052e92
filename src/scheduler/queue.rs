//! Bounded hand-off between the scheduler and the orchestrator.
//!
//! A fixed number of workers pull execution ids from one channel. A full
//! channel makes `submit` wait, which throttles the scheduler instead of
//! piling up tasks.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::model::ExecutionId;
use crate::orchestrator::Orchestrator;

pub struct WorkerPool {
    tx: mpsc::Sender<ExecutionId>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(orchestrator: Arc<Orchestrator>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(execution_id) = next else { break };
                        debug!(worker, execution_id, "worker picked execution");
                        if let Err(e) = orchestrator.run(execution_id).await {
                            error!(worker, execution_id, error = %format!("{e:#}"), "execution failed");
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self { tx, workers }
    }

    /// Queue an execution, waiting while the queue is full.
    pub async fn submit(&self, execution_id: ExecutionId) -> Result<()> {
        self.tx
            .send(execution_id)
            .await
            .map_err(|_| anyhow::anyhow!("worker pool is shut down"))
    }

    /// Stop accepting work and wait for queued executions to finish.
    pub async fn shutdown(self) {
        let Self { tx, workers } = self;
        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("worker pool drained");
    }
}
