//! Stand-in for the host name-server task system: single-threaded FIFO
//! queues, one per zone plus one per instance. All mutations of a zone are
//! totally ordered by posting them to that zone's task.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::error::Result;

type Job = BoxFuture<'static, ()>;

/// Handle to a FIFO task queue; cheap to clone.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
}

impl Task {
    /// Spawns the worker draining this task's queue.
    pub fn spawn(name: &str) -> Task {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_name = name.to_string();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            log::debug!(target: "task", "task '{}' drained and stopped", worker_name);
        });
        Task {
            name: name.to_string(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues work; returns `Shutdown` once the worker is gone.
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(job.boxed())
            .map_err(|_| error!(Shutdown => "task '{}' no longer accepts work", self.name))
    }

}
