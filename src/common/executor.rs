//! Bounded task executor for connection handlers
//!
//! Accept loops hand every connection to `TaskExecutor::execute`, which
//! returns immediately. At most `workers` handlers run at once; the rest wait
//! for a permit inside their own task.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct TaskExecutor {
    name: &'static str,
    permits: Arc<Semaphore>,
}

impl TaskExecutor {
    pub fn new(name: &'static str, workers: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Queue `task`; it runs once a worker slot frees up.
    pub fn execute<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let name = self.name;
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!(executor = name, "Executor closed, dropping task");
                    return;
                }
            };
            task.await;
        })
    }

    /// Free worker slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop admitting queued tasks.
    pub fn close(&self) {
        self.permits.close();
    }
}
