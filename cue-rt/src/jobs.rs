//! Job execution collaborator
//!
//! Decode work is launched through [`JobExecutor`] so hosts can plug in
//! their own job system. Three executors ship with the runtime:
//! - [`WorkerPool`]: std threads fed from a condvar-guarded queue (default)
//! - [`InlineExecutor`]: runs the job on the calling thread
//! - [`TokioExecutor`]: hands jobs to `spawn_blocking`

use crate::error::{Error, Result};
use crate::sync::{lock, wait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Unit of background work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs off the calling thread
pub trait JobExecutor: Send + Sync {
    /// Queue `job`; `false` when the executor is shutting down
    fn launch(&self, job: Job) -> bool;
}

/// Shared state between pool handle and workers
struct SharedPoolState {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    stop_flag: AtomicBool,
}

/// Fixed pool of worker threads
pub struct WorkerPool {
    state: Arc<SharedPoolState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let state = Arc::new(SharedPoolState {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop_flag: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(workers);
        for worker_id in 0..workers.max(1) {
            let state_clone = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name(format!("cue-decode-{}", worker_id))
                .spawn(move || Self::worker_loop(worker_id, state_clone))
                .map_err(|e| Error::Resource(format!("failed to spawn decode worker: {}", e)))?;
            threads.push(handle);
        }

        info!("Decode worker pool started with {} threads", threads.len());

        Ok(Self {
            state,
            threads: Mutex::new(threads),
        })
    }

    fn worker_loop(worker_id: usize, state: Arc<SharedPoolState>) {
        debug!("Worker {} started", worker_id);

        loop {
            let job = {
                let mut queue = lock(&state.queue);

                // Wait for work or shutdown signal
                while queue.is_empty() && !state.stop_flag.load(Ordering::Relaxed) {
                    queue = wait(&state.condvar, queue);
                }

                if state.stop_flag.load(Ordering::Relaxed) {
                    debug!("Worker {} received shutdown signal", worker_id);
                    break;
                }

                queue.pop_front()
            };

            if let Some(job) = job {
                job();
            }
        }

        debug!("Worker {} exiting", worker_id);
    }

    /// Jobs waiting for a worker
    pub fn queue_len(&self) -> usize {
        lock(&self.state.queue).len()
    }

    /// Stop the workers; queued jobs that have not started are dropped
    pub fn shutdown(&self) {
        if self.state.stop_flag.swap(true, Ordering::Relaxed) {
            return;
        }
        {
            let _queue = lock(&self.state.queue);
            self.state.condvar.notify_all();
        }

        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("Decode worker panicked");
            }
        }

        let dropped = lock(&self.state.queue).len();
        if dropped > 0 {
            warn!("Decode pool shut down with {} queued jobs", dropped);
        }
        info!("Decode worker pool stopped");
    }
}

impl JobExecutor for WorkerPool {
    fn launch(&self, job: Job) -> bool {
        if self.state.stop_flag.load(Ordering::Relaxed) {
            return false;
        }
        lock(&self.state.queue).push_back(job);
        self.state.condvar.notify_one();
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs each job to completion inside `launch`
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl JobExecutor for InlineExecutor {
    fn launch(&self, job: Job) -> bool {
        job();
        true
    }
}

/// Runs jobs on tokio's blocking thread pool
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Executor on the runtime of the calling task
    ///
    /// # Panics
    /// Panics outside a tokio runtime
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl JobExecutor for TokioExecutor {
    fn launch(&self, job: Job) -> bool {
        drop(self.handle.spawn_blocking(job));
        true
    }
}
