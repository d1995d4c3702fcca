// Channel worker pool.
//
// An affinity-tagged job always runs on worker `hash % worker_count`, which
// yields per-key processing order; untagged jobs spread round-robin. Each
// worker drains its queue serially, so application callbacks may block
// without stalling I/O tasks.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

type Job = BoxFuture<'static, ()>;

pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            senders.push(tx);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                tracing::trace!(worker = index, "worker drained");
            });
        }
        Self {
            senders,
            next: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Enqueues a job, pinning affinity-tagged work to its worker.
    pub fn execute(&self, affinity: Option<i32>, job: impl Future<Output = ()> + Send + 'static) {
        let index = match affinity {
            Some(hash) => (hash as u32 as usize) % self.senders.len(),
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len(),
        };
        if self.senders[index].send(Box::pin(job)).is_err() {
            tracing::warn!(worker = index, "worker gone, dropping job");
        }
    }
}
