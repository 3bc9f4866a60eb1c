//! Fixed-size worker pool fed by a bounded job queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info};

use crate::error::{Result, SftpError};

/// Resources scoped to one worker thread plus the work it performs.
///
/// `setup` runs on the worker thread before it takes any job, `teardown`
/// after it has taken its last one.
pub trait WorkerScope: Send + Sync + 'static {
    /// Work item type
    type Job: Send + 'static;
    /// Per-worker state
    type State;

    /// Creates the per-worker state.
    fn setup(&self) -> Result<Self::State>;

    /// Runs one job to completion.
    fn process(&self, state: &mut Self::State, job: Self::Job);

    /// Releases the per-worker state.
    fn teardown(&self, state: Self::State) {
        drop(state);
    }
}

/// A running worker pool.
pub struct WorkQueue<S: WorkerScope> {
    sender: Option<Sender<S::Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: WorkerScope> WorkQueue<S> {
    /// Spawns `workers` threads and waits until every one has finished
    /// `setup`. Any setup failure shuts the pool down and is returned.
    pub fn start(scope: Arc<S>, workers: usize, depth: usize) -> Result<Self> {
        if workers == 0 {
            return Err(SftpError::Config {
                reason: "worker pool needs at least one worker".to_string(),
            });
        }
        let (sender, receiver) = bounded::<S::Job>(depth);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(workers);
        let mut queue = Self {
            sender: Some(sender),
            workers: Vec::with_capacity(workers),
        };

        for n in 0..workers {
            let scope = Arc::clone(&scope);
            let receiver = receiver.clone();
            let ready_tx = ready_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("sftp-worker-{}", n))
                .spawn(move || {
                    let mut state = match scope.setup() {
                        Ok(state) => {
                            let _ = ready_tx.send(Ok(()));
                            state
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    drop(ready_tx);
                    while let Ok(job) = receiver.recv() {
                        scope.process(&mut state, job);
                    }
                    scope.teardown(state);
                    debug!(worker = n, "worker stopped");
                });
            match spawned {
                Ok(handle) => queue.workers.push(handle),
                Err(e) => {
                    queue.shutdown();
                    return Err(SftpError::Setup {
                        reason: format!("spawning worker {}: {}", n, e),
                    });
                }
            }
        }
        drop(ready_tx);

        for _ in 0..workers {
            let outcome = ready_rx.recv().unwrap_or_else(|_| {
                Err(SftpError::Setup {
                    reason: "worker exited during setup".to_string(),
                })
            });
            if let Err(e) = outcome {
                error!(error = %e, "worker setup failed");
                queue.shutdown();
                return Err(e);
            }
        }
        info!(workers, depth, "worker pool started");
        Ok(queue)
    }

    /// Queues a job, blocking while the queue is full.
    pub fn submit(&self, job: S::Job) -> Result<()> {
        let sender = self.sender.as_ref().ok_or_else(|| SftpError::Setup {
            reason: "work queue already destroyed".to_string(),
        })?;
        sender.send(job).map_err(|_| SftpError::Setup {
            reason: "all workers have exited".to_string(),
        })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting jobs, lets workers drain what is queued, joins them.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Closing the channel ends each worker's recv loop once it is empty.
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl<S: WorkerScope> Drop for WorkQueue<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        setups: AtomicUsize,
        teardowns: AtomicUsize,
        processed: Mutex<Vec<u32>>,
        threads: Mutex<Vec<thread::ThreadId>>,
        fail_setup: bool,
    }

    impl WorkerScope for Counting {
        type Job = u32;
        type State = usize;

        fn setup(&self) -> Result<usize> {
            if self.fail_setup {
                return Err(SftpError::Setup {
                    reason: "no charset".to_string(),
                });
            }
            Ok(self.setups.fetch_add(1, Ordering::SeqCst))
        }

        fn process(&self, _state: &mut usize, job: u32) {
            thread::sleep(Duration::from_millis(1));
            self.processed.lock().unwrap().push(job);
            self.threads.lock().unwrap().push(thread::current().id());
        }

        fn teardown(&self, _state: usize) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_setup_and_teardown_per_worker() {
        let scope = Arc::new(Counting::default());
        let queue = WorkQueue::start(Arc::clone(&scope), 4, 8).unwrap();
        assert_eq!(queue.workers(), 4);
        assert_eq!(scope.setups.load(Ordering::SeqCst), 4);
        queue.destroy();
        assert_eq!(scope.teardowns.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_destroy_drains_queued_jobs() {
        let scope = Arc::new(Counting::default());
        let queue = WorkQueue::start(Arc::clone(&scope), 2, 4).unwrap();
        for job in 0..50 {
            queue.submit(job).unwrap();
        }
        queue.destroy();
        let mut processed = scope.processed.lock().unwrap().clone();
        processed.sort();
        assert_eq!(processed, (0..50).collect::<Vec<u32>>());
    }

    #[test]
    fn test_jobs_run_off_the_submitting_thread() {
        let scope = Arc::new(Counting::default());
        let queue = WorkQueue::start(Arc::clone(&scope), 4, 4).unwrap();
        for job in 0..8 {
            queue.submit(job).unwrap();
        }
        queue.destroy();
        let me = thread::current().id();
        assert!(scope.threads.lock().unwrap().iter().all(|t| *t != me));
    }

    #[test]
    fn test_setup_failure_is_reported() {
        let scope = Arc::new(Counting {
            fail_setup: true,
            ..Default::default()
        });
        let result = WorkQueue::start(scope, 3, 4);
        assert!(matches!(result, Err(SftpError::Setup { .. })));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let scope = Arc::new(Counting::default());
        assert!(matches!(
            WorkQueue::start(scope, 0, 4),
            Err(SftpError::Config { .. })
        ));
    }
}
