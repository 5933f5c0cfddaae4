//! A fixed-size worker pool for resolver jobs.
//!
//! Jobs go through a bounded queue, so [`WorkerPool::submit`] blocks once
//! the queue is full. [`WorkerPool::finish`] waits for every job until the
//! token is cancelled or its deadline passes, and returns successes and
//! failures in submission order, independent of completion order.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::ResolveError;

pub const DEFAULT_WORKERS: usize = 16;

/// Queue slots per worker before `submit` blocks.
const QUEUE_PER_WORKER: usize = 4;

/// How often `finish` looks at the token while jobs are outstanding.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Shared cancellation flag with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

type Job<T> = Box<dyn FnOnce(&CancelToken) -> Result<T, ResolveError> + Send>;

struct Task<T> {
    index: usize,
    label: String,
    job: Job<T>,
}

struct Outcome<T> {
    index: usize,
    result: Result<T, ResolveError>,
}

/// The partition of a pool's jobs into successes and failures.
#[derive(Debug)]
pub struct Resolution<T> {
    pub resolved: Vec<T>,
    pub errors: Vec<ResolveError>,
}

impl<T> Resolution<T> {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// All successes, or every failure joined into one error.
    pub fn into_result(self) -> Result<Vec<T>, ResolveError> {
        if self.errors.is_empty() {
            Ok(self.resolved)
        } else {
            Err(ResolveError::Aggregate(self.errors))
        }
    }
}

pub struct WorkerPool<T: Send + 'static> {
    sender: Option<Sender<Task<T>>>,
    results: Receiver<Outcome<T>>,
    workers: Vec<thread::JoinHandle<()>>,
    token: CancelToken,
    pending: BTreeMap<usize, String>,
    next: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(workers: usize, token: CancelToken) -> Self {
        let count = workers.max(1);
        let (sender, tasks) = bounded::<Task<T>>(count * QUEUE_PER_WORKER);
        let (done, results) = unbounded();
        let workers = (0..count)
            .map(|_| {
                let tasks = tasks.clone();
                let done = done.clone();
                let token = token.clone();
                thread::spawn(move || run_worker(&tasks, &done, &token))
            })
            .collect();
        Self {
            sender: Some(sender),
            results,
            workers,
            token,
            pending: BTreeMap::new(),
            next: 0,
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Queue a job. Blocks while the queue is full.
    pub fn submit<F>(&mut self, label: impl Into<String>, job: F)
    where
        F: FnOnce(&CancelToken) -> Result<T, ResolveError> + Send + 'static,
    {
        let label = label.into();
        let index = self.next;
        self.next += 1;
        debug!(job = %label, index, "dispatching resolver job");
        let task = Task {
            index,
            label: label.clone(),
            job: Box::new(job),
        };
        self.pending.insert(index, label.clone());
        let sent = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(task).is_ok());
        if !sent {
            // Workers are gone; `finish` reports the job as cancelled.
            warn!(job = %label, "resolver pool is shut down");
        }
    }

    /// Wait for all jobs. When the token is cancelled or its deadline
    /// passes first, the jobs still outstanding are reported as cancelled.
    pub fn finish(mut self) -> Resolution<T> {
        self.sender.take();
        let mut outcomes = Vec::with_capacity(self.pending.len());
        while !self.pending.is_empty() {
            if self.token.is_cancelled() {
                self.token.cancel();
                break;
            }
            match self.results.recv_timeout(CANCEL_POLL) {
                Ok(outcome) => {
                    self.pending.remove(&outcome.index);
                    outcomes.push(outcome);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if !self.pending.is_empty() {
            debug!(outstanding = self.pending.len(), "resolver pool cancelled");
        }
        for (index, job) in std::mem::take(&mut self.pending) {
            outcomes.push(Outcome {
                index,
                result: Err(ResolveError::Cancelled { job }),
            });
        }
        if !self.token.is_cancelled() {
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
        outcomes.sort_by_key(|o| o.index);

        let mut resolution = Resolution {
            resolved: Vec::new(),
            errors: Vec::new(),
        };
        for outcome in outcomes {
            match outcome.result {
                Ok(value) => resolution.resolved.push(value),
                Err(err) => resolution.errors.push(err),
            }
        }
        debug!(
            resolved = resolution.resolved.len(),
            failed = resolution.errors.len(),
            "resolver pool finished"
        );
        resolution
    }
}

fn run_worker<T>(tasks: &Receiver<Task<T>>, done: &Sender<Outcome<T>>, token: &CancelToken) {
    while let Ok(task) = tasks.recv() {
        let Task { index, label, job } = task;
        let result = if token.is_cancelled() {
            Err(ResolveError::Cancelled { job: label })
        } else {
            match catch_unwind(AssertUnwindSafe(|| job(token))) {
                Ok(result) => result,
                Err(_) => Err(ResolveError::Panicked { job: label }),
            }
        };
        if let Err(err) = &result {
            debug!(index, error = %err, "resolver job failed");
        }
        if done.send(Outcome { index, result }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn results_follow_submission_order() {
        let mut pool = WorkerPool::new(4, CancelToken::new());
        for i in 0..20u64 {
            pool.submit(format!("job-{i}"), move |_| {
                // later jobs finish first
                thread::sleep(Duration::from_millis(20 - i));
                Ok(i)
            });
        }
        let resolution = pool.finish();
        assert!(resolution.is_ok());
        assert_eq!(resolution.resolved, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn failures_are_aggregated() {
        let mut pool = WorkerPool::new(2, CancelToken::new());
        for i in 0..6u32 {
            pool.submit(format!("job-{i}"), move |_| {
                if i % 3 == 0 {
                    Err(ResolveError::Container {
                        reference: format!("ref-{i}"),
                        reason: "not found".into(),
                    })
                } else {
                    Ok(i)
                }
            });
        }
        let resolution = pool.finish();
        assert_eq!(resolution.resolved, [1, 2, 4, 5]);
        let err = resolution.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("ref-0") && text.contains("ref-3"), "{text}");
    }

    #[test]
    fn panics_become_errors() {
        let mut pool = WorkerPool::<u32>::new(1, CancelToken::new());
        pool.submit("boom", |_| panic!("resolver bug"));
        pool.submit("fine", |_| Ok(1));
        let resolution = pool.finish();
        assert_eq!(resolution.resolved, [1]);
        assert_eq!(
            resolution.errors,
            [ResolveError::Panicked { job: "boom".into() }]
        );
    }

    #[test]
    fn deadline_cancels_outstanding_jobs() {
        let token = CancelToken::with_timeout(Duration::from_millis(100));
        let mut pool = WorkerPool::new(1, token);
        pool.submit("quick", |_| Ok("quick"));
        pool.submit("slow", |token: &CancelToken| {
            while !token.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            thread::sleep(Duration::from_millis(200));
            Ok("slow")
        });
        pool.submit("queued", |_| Ok("queued"));
        let resolution = pool.finish();
        assert_eq!(resolution.resolved, ["quick"]);
        let cancelled: Vec<_> = resolution
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(cancelled, ["slow: cancelled", "queued: cancelled"]);
    }

    #[test]
    fn external_cancel_abandons_jobs_that_ignore_the_token() {
        let token = CancelToken::new();
        let mut pool = WorkerPool::new(2, token.clone());
        pool.submit("one", |_| Ok(1));
        pool.submit("two", |_| Ok(2));
        pool.submit("blocked-io", |_| {
            thread::sleep(Duration::from_secs(3));
            Ok(3)
        });
        // let the quick jobs land first
        thread::sleep(Duration::from_millis(100));

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let started = Instant::now();
        let resolution = pool.finish();
        canceller.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert_eq!(resolution.resolved, [1, 2]);
        assert_eq!(
            resolution.errors,
            [ResolveError::Cancelled { job: "blocked-io".into() }]
        );
    }

    #[test]
    fn cancelled_token_skips_jobs() {
        let token = CancelToken::new();
        token.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(2, token);
        for i in 0..3 {
            let ran = ran.clone();
            pool.submit(format!("job-{i}"), move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            });
        }
        let resolution = pool.finish();
        assert!(resolution.resolved.is_empty());
        assert_eq!(resolution.errors.len(), 3);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
