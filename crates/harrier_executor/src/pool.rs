//! Bounded worker pools for phase execution.
//!
//! Two pools exist per node, mirroring the two request classes of the
//! collect core:
//!
//! | Pool | Use Case | Queue |
//! |------|----------|-------|
//! | **get** | short-lived node/shard system-table collects | bounded |
//! | **search** | doc tables, information schema, cluster-level collects | bounded |
//!
//! Submission never blocks: when a queue is full (or the pool is shut
//! down), `submit` hands the job back to the caller so it can decide to run
//! it inline or fail. Page-completion dispatch relies on that to guarantee
//! forward progress under saturation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use harrier_common::config::CollectConfig;

/// A unit of work submitted to a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Name of a request-class pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadPoolName {
    /// Short-request pool for node/shard granularity collects.
    Get,
    /// Long-running pool for everything else.
    Search,
}

impl fmt::Display for ThreadPoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadPoolName::Get => write!(f, "get"),
            ThreadPoolName::Search => write!(f, "search"),
        }
    }
}

struct PoolShared {
    sender: Option<mpsc::SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

/// A fixed-size worker pool with a bounded submission queue.
pub struct ThreadPool {
    name: ThreadPoolName,
    shared: Mutex<PoolShared>,
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl ThreadPool {
    pub fn new(name: ThreadPoolName, threads: usize, queue_capacity: usize) -> Arc<Self> {
        let threads = threads.max(1);
        let (tx, rx) = mpsc::sync_channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(std::sync::Mutex::new(rx));
        let completed = Arc::new(AtomicU64::new(0));

        let workers = (0..threads)
            .map(|i| {
                let rx = Arc::clone(&rx);
                let completed = Arc::clone(&completed);
                std::thread::Builder::new()
                    .name(format!("harrier-{name}-{i}"))
                    .spawn(move || loop {
                        let job = {
                            let guard = rx.lock().unwrap_or_else(|p| p.into_inner());
                            guard.recv()
                        };
                        match job {
                            Ok(job) => {
                                job();
                                completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => break,
                        }
                    })
                    .unwrap_or_else(|e| panic!("failed to spawn pool worker: {e}"))
            })
            .collect();

        Arc::new(Self {
            name,
            shared: Mutex::new(PoolShared {
                sender: Some(tx),
                workers,
            }),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed,
        })
    }

    pub fn name(&self) -> ThreadPoolName {
        self.name
    }

    /// Submit a job. On rejection (full queue or shut-down pool) the job is
    /// handed back so the caller can run it inline or drop it.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        let shared = self.shared.lock();
        let Some(sender) = shared.sender.as_ref() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(job);
        };
        match sender.try_send(job) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(job)
            }
        }
    }

    /// Drain the queue and join the workers. Idempotent.
    pub fn shutdown(&self) {
        let workers = {
            let mut shared = self.shared.lock();
            shared.sender = None;
            std::mem::take(&mut shared.workers)
        };
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(pool = %self.name, "pool worker panicked");
            }
        }
    }

    pub fn snapshot(&self) -> ThreadPoolSnapshot {
        ThreadPoolSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Counter snapshot for observability.
#[derive(Debug, Clone)]
pub struct ThreadPoolSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
}

/// The per-node pool registry.
pub struct ThreadPools {
    get: Arc<ThreadPool>,
    search: Arc<ThreadPool>,
}

impl ThreadPools {
    pub fn new(config: &CollectConfig) -> Arc<Self> {
        Arc::new(Self {
            get: ThreadPool::new(
                ThreadPoolName::Get,
                config.get_pool_threads,
                config.pool_queue_capacity,
            ),
            search: ThreadPool::new(
                ThreadPoolName::Search,
                config.search_pool_threads,
                config.pool_queue_capacity,
            ),
        })
    }

    pub fn pool(&self, name: ThreadPoolName) -> &Arc<ThreadPool> {
        match name {
            ThreadPoolName::Get => &self.get,
            ThreadPoolName::Search => &self.search,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let pool = ThreadPool::new(ThreadPoolName::Get, 2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_or_else(|_| panic!("submit rejected"));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.snapshot().completed, 10);
    }

    #[test]
    fn test_full_queue_hands_job_back() {
        let pool = ThreadPool::new(ThreadPoolName::Search, 1, 1);
        let (block_tx, block_rx) = mpsc::channel::<()>();
        // Occupy the single worker.
        pool.submit(Box::new(move || {
            let _ = block_rx.recv();
        }))
        .unwrap_or_else(|_| panic!("submit rejected"));

        // Fill the queue, then overflow it.
        let mut rejected = None;
        for i in 0..4 {
            if pool.submit(Box::new(|| {})).is_err() {
                rejected = Some(i);
                break;
            }
        }
        assert!(rejected.is_some(), "queue never rejected");
        assert!(pool.snapshot().rejected >= 1);
        block_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_rejected_job_can_run_inline() {
        let pool = ThreadPool::new(ThreadPoolName::Get, 1, 1);
        pool.shutdown();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        match pool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })) {
            Ok(()) => panic!("shut-down pool accepted a job"),
            Err(job) => job(),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_idempotent() {
        let pool = ThreadPool::new(ThreadPoolName::Get, 2, 4);
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_registry_maps_names() {
        let pools = ThreadPools::new(&CollectConfig::default());
        assert_eq!(pools.pool(ThreadPoolName::Get).name(), ThreadPoolName::Get);
        assert_eq!(pools.pool(ThreadPoolName::Search).name(), ThreadPoolName::Search);
    }

    #[test]
    fn test_concurrent_submitters() {
        let pool = ThreadPool::new(ThreadPoolName::Search, 4, 256);
        let counter = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let pool = &pool;
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    for _ in 0..50 {
                        let c = Arc::clone(&counter);
                        let mut job: Job = Box::new(move || {
                            c.fetch_add(1, Ordering::SeqCst);
                        });
                        // Run inline when the queue is momentarily full.
                        loop {
                            match pool.submit(job) {
                                Ok(()) => break,
                                Err(j) => {
                                    std::thread::sleep(Duration::from_millis(1));
                                    job = j;
                                }
                            }
                        }
                    }
                });
            }
        });
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }
}
