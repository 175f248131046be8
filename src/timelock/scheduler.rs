//! Cancellable task scheduler
//!
//! One abstraction behind every timer in the orchestrator: the coarse
//! phase-expiry sweep, the exclusive-boundary check, and delayed secret
//! reveals all register here, so shutdown and per-order cleanup have a
//! single place to cancel outstanding work.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct Scheduler {
    jobs: Arc<DashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Register a recurring job. Re-registering a key cancels the old job.
    pub fn spawn_recurring<F, Fut>(&self, key: &str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so a job registered
            // at startup does not race component wiring.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                task().await;
            }
        });

        if let Some(old) = self.jobs.insert(key.to_string(), handle) {
            old.abort();
        }
        debug!("Scheduled recurring job {} every {:?}", key, period);
    }

    /// Register a one-shot job that runs after `delay` and then deregisters
    /// itself.
    pub fn spawn_delayed<Fut>(&self, key: &str, delay: Duration, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let jobs = self.jobs.clone();
        let job_key = key.to_string();

        let handle = tokio::spawn({
            let job_key = job_key.clone();
            async move {
                tokio::time::sleep(delay).await;
                task.await;
                jobs.remove(&job_key);
            }
        });

        if let Some(old) = self.jobs.insert(job_key, handle) {
            old.abort();
        }
        debug!("Scheduled delayed job {} in {:?}", key, delay);
    }

    /// Cancel a single job
    pub fn cancel(&self, key: &str) -> bool {
        if let Some((_, handle)) = self.jobs.remove(key) {
            handle.abort();
            true
        } else {
            false
        }
    }

    /// Cancel every job whose key starts with `prefix` (per-order cleanup)
    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if self.cancel(&key) {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancel everything (shutdown)
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
