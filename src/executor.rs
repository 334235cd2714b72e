//! The worker pool.
//!
//! A fixed set of named threads, each owning its own [`Worker`] value, pull
//! requests from a shared two-class FIFO queue. Workers share nothing with
//! the caller except the request going in and the result coming out, which
//! is handed to a per-request callback.
//!
//! ## Crashes
//!
//! A panic inside [`Worker::run`] is treated the way a dead child process
//! would be: the worker value is dropped, a fresh one is spawned into the
//! same slot, and the request that was running is retried. A request gets at
//! most [`MAX_ATTEMPTS`] tries; after that the crash is reported as
//! [`JobError::Fault`] so one poisoned input cannot keep killing workers.
//!
//! ## Shutdown
//!
//! [`WorkerPool::shutdown`] cancels everything still queued, lets in-flight
//! requests finish within a grace period, and then walks away from any
//! worker that is still busy. Results that arrive after that point are
//! delivered as [`JobError::Cancelled`].

pub mod cpu;

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::diagnostic::{Diagnostic, ThrowableDiagnostic};
use crate::plugin::{WorkerRequest, WorkerResponse};

/// Total number of times a request is attempted when its worker keeps
/// crashing.
pub const MAX_ATTEMPTS: u32 = 2;

/// Grace period used when a pool is dropped without an explicit shutdown.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Origin stamped on diagnostics produced by the pool itself.
pub const POOL_ORIGIN: &str = "tsumiki-worker";

/// An isolated execution context living on one pool thread.
pub trait Worker: Send {
    fn run(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, ThrowableDiagnostic>;

    /// Called once before a worker thread exits normally. Crashed workers are
    /// dropped without it.
    fn release(&mut self) {}
}

/// Builds the worker for a given slot; called again whenever a slot respawns.
pub type WorkerFactory = Arc<dyn Fn(usize) -> Box<dyn Worker> + Send + Sync>;

/// Scheduling class. Entry work is always served before speculative work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Entry,
    Speculative,
}

#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The plugin reported diagnostics. Never retried.
    #[error(transparent)]
    Failed(ThrowableDiagnostic),

    /// The worker crashed on every attempt.
    #[error("worker fault: {0}")]
    Fault(ThrowableDiagnostic),

    /// The request was dropped before it produced a result.
    #[error("request cancelled")]
    Cancelled,
}

pub type JobResult = Result<WorkerResponse, JobError>;

type Callback = Box<dyn FnOnce(JobResult) + Send>;

struct Job {
    request: WorkerRequest,
    priority: Priority,
    tag: u64,
    attempts: u32,
    callback: Callback,
}

#[derive(Default)]
struct Queue {
    entry: VecDeque<Job>,
    speculative: VecDeque<Job>,
}

impl Queue {
    fn push_back(&mut self, job: Job) {
        match job.priority {
            Priority::Entry => self.entry.push_back(job),
            Priority::Speculative => self.speculative.push_back(job),
        }
    }

    fn push_front(&mut self, job: Job) {
        match job.priority {
            Priority::Entry => self.entry.push_front(job),
            Priority::Speculative => self.speculative.push_front(job),
        }
    }

    fn pop(&mut self) -> Option<Job> {
        self.entry
            .pop_front()
            .or_else(|| self.speculative.pop_front())
    }

    fn len(&self) -> usize {
        self.entry.len() + self.speculative.len()
    }

    fn drain_where(&mut self, pred: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut out = Vec::new();
        for queue in [&mut self.entry, &mut self.speculative] {
            let (matched, kept): (VecDeque<Job>, VecDeque<Job>) =
                queue.drain(..).partition(|job| pred(job));
            *queue = kept;
            out.extend(matched);
        }
        out
    }
}

#[derive(Default)]
struct State {
    queue: Queue,
    active: usize,
    closed: bool,
    terminated: bool,
    completed: u64,
    crashes: u64,
    respawns: u64,
    workers: Vec<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when a job is queued or the pool closes.
    available: Condvar,
    /// Signalled when an in-flight job finishes.
    idle: Condvar,
    factory: WorkerFactory,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn next_job(&self) -> Option<Job> {
        let mut state = self.lock();
        loop {
            if let Some(job) = state.queue.pop() {
                state.active += 1;
                return Some(job);
            }
            if state.closed {
                return None;
            }
            state = self.available.wait(state).unwrap();
        }
    }

    fn finish(&self, job: Job, result: JobResult) {
        let terminated = {
            let mut state = self.lock();
            state.active -= 1;
            state.completed += 1;
            state.terminated
        };
        self.idle.notify_all();

        (job.callback)(if terminated {
            Err(JobError::Cancelled)
        } else {
            result
        });
    }

    fn crashed(self: &Arc<Self>, slot: usize, mut job: Job, message: String) {
        job.attempts += 1;

        let mut state = self.lock();
        state.active -= 1;
        state.crashes += 1;

        if state.closed {
            drop(state);
            self.idle.notify_all();
            (job.callback)(Err(JobError::Cancelled));
            return;
        }

        tracing::warn!(
            "worker {slot} crashed on {} (attempt {}/{MAX_ATTEMPTS}): {message}",
            job.request.label(),
            job.attempts,
        );

        let respawned = match spawn_worker(self, slot) {
            Ok(handle) => {
                state.workers[slot] = Some(handle);
                state.respawns += 1;
                true
            }
            Err(err) => {
                tracing::error!("could not respawn worker {slot}: {err}");
                false
            }
        };

        if respawned && job.attempts < MAX_ATTEMPTS {
            state.queue.push_front(job);
            drop(state);
            self.available.notify_one();
            self.idle.notify_all();
            return;
        }

        drop(state);
        self.idle.notify_all();

        tracing::error!(
            "giving up on {} after {} crashed attempt(s)",
            job.request.label(),
            job.attempts
        );

        let diagnostic = Diagnostic::error(format!(
            "Worker crashed while handling {}: {message}",
            job.request.label()
        ))
        .with_origin(POOL_ORIGIN)
        .with_hint(format!(
            "worker fault: the request crashed its worker {} time(s) and was not retried again",
            job.attempts
        ));

        (job.callback)(Err(JobError::Fault(diagnostic.into())));
    }
}

fn spawn_worker(shared: &Arc<Shared>, slot: usize) -> std::io::Result<JoinHandle<()>> {
    let shared = shared.clone();
    thread::Builder::new()
        .name(format!("tsumiki-worker-{slot}"))
        .spawn(move || worker_main(shared, slot))
}

fn worker_main(shared: Arc<Shared>, slot: usize) {
    let mut worker = (shared.factory)(slot);

    while let Some(job) = shared.next_job() {
        let outcome = catch_unwind(AssertUnwindSafe(|| worker.run(&job.request)));

        match outcome {
            Ok(result) => shared.finish(job, result.map_err(JobError::Failed)),
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("worker panicked with unknown payload")
                };

                drop(worker);
                shared.crashed(slot, job, message);
                return;
            }
        }
    }

    worker.release();
}

/// Counters describing a pool at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: u64,
    pub crashes: u64,
    pub respawns: u64,
}

/// Handle to a running pool. Share it between builders with an `Arc`.
pub struct WorkerPool {
    shared: Arc<Shared>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one), each built by `factory`.
    pub fn start(size: usize, factory: WorkerFactory) -> std::io::Result<Self> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            idle: Condvar::new(),
            factory,
        });

        for slot in 0..size {
            match spawn_worker(&shared, slot) {
                Ok(handle) => shared.lock().workers.push(Some(handle)),
                Err(err) => {
                    shared.lock().closed = true;
                    shared.available.notify_all();
                    return Err(err);
                }
            }
        }

        tracing::debug!("started worker pool with {size} worker(s)");
        Ok(Self { shared, size })
    }

    /// Spawns a pool sized by [`cpu::default_pool_size`].
    pub fn with_default_size(factory: WorkerFactory) -> std::io::Result<Self> {
        Self::start(cpu::default_pool_size(), factory)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues a request. `callback` runs exactly once, on a worker thread or
    /// on the calling thread if the pool is already shut down.
    pub fn submit<F>(&self, request: WorkerRequest, priority: Priority, tag: u64, callback: F)
    where
        F: FnOnce(JobResult) + Send + 'static,
    {
        let job = Job {
            request,
            priority,
            tag,
            attempts: 0,
            callback: Box::new(callback),
        };

        let mut state = self.shared.lock();
        if state.closed {
            drop(state);
            (job.callback)(Err(JobError::Cancelled));
            return;
        }

        state.queue.push_back(job);
        drop(state);
        self.shared.available.notify_one();
    }

    /// Submits a request and blocks until its result arrives.
    pub fn run(&self, request: WorkerRequest, priority: Priority) -> JobResult {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(request, priority, 0, move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap_or(Err(JobError::Cancelled))
    }

    /// Cancels every queued request submitted with `tag`. Requests already
    /// running are left alone. Returns how many were cancelled.
    pub fn cancel(&self, tag: u64) -> usize {
        let cancelled = self.shared.lock().queue.drain_where(|job| job.tag == tag);
        let count = cancelled.len();

        for job in cancelled {
            (job.callback)(Err(JobError::Cancelled));
        }

        if count > 0 {
            tracing::debug!("cancelled {count} queued request(s) for session {tag}");
        }
        count
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            size: self.size,
            queued: state.queue.len(),
            active: state.active,
            completed: state.completed,
            crashes: state.crashes,
            respawns: state.respawns,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stops the pool. Safe to call more than once and while requests are
    /// still running; only the first call does anything.
    pub fn shutdown(&self, grace: Duration) {
        let cancelled = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.drain_where(|_| true)
        };
        self.shared.available.notify_all();

        for job in cancelled {
            (job.callback)(Err(JobError::Cancelled));
        }

        let deadline = Instant::now() + grace;
        let mut state = self.shared.lock();
        while state.active > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self.shared.idle.wait_timeout(state, deadline - now).unwrap().0;
        }

        let forced = state.active > 0;
        if forced {
            state.terminated = true;
            tracing::warn!(
                "{} worker(s) still busy after {grace:?}, abandoning them",
                state.active
            );
        }

        let handles: Vec<_> = state.workers.iter_mut().filter_map(Option::take).collect();
        drop(state);

        // The last handle to a pool can be dropped from a callback running on
        // one of its own workers.
        let current = thread::current().id();

        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if !forced || handle.is_finished() {
                let _ = handle.join();
            }
        }

        tracing::debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_GRACE);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8PathBuf;

    use super::*;
    use crate::core::BuildOptions;
    use crate::plugin::{Resolution, ResolveRequest};

    /// Resolves every specifier to itself, with a few hooks for misbehaving.
    struct Echo {
        calls: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        delay: Duration,
        crash_budget: Arc<Mutex<HashMap<String, usize>>>,
    }

    impl Worker for Echo {
        fn run(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, ThrowableDiagnostic> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);

            let WorkerRequest::Resolve(req) = request else {
                panic!("unexpected request");
            };

            let crash = match self.crash_budget.lock().unwrap().get_mut(&req.specifier) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if crash {
                panic!("simulated crash");
            }

            if req.specifier.starts_with("fail:") {
                return Err(Diagnostic::error("cannot resolve").into());
            }

            Ok(WorkerResponse::Resolved(Resolution::File(Utf8PathBuf::from(
                &req.specifier,
            ))))
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        pool: WorkerPool,
        calls: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        crash_budget: Arc<Mutex<HashMap<String, usize>>>,
    }

    fn harness(size: usize, delay: Duration) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let crash_budget = Arc::new(Mutex::new(HashMap::new()));

        let factory: WorkerFactory = {
            let calls = calls.clone();
            let released = released.clone();
            let crash_budget = crash_budget.clone();
            Arc::new(move |_| {
                Box::new(Echo {
                    calls: calls.clone(),
                    released: released.clone(),
                    delay,
                    crash_budget: crash_budget.clone(),
                }) as Box<dyn Worker>
            })
        };

        Harness {
            pool: WorkerPool::start(size, factory).unwrap(),
            calls,
            released,
            crash_budget,
        }
    }

    fn resolve(specifier: &str) -> WorkerRequest {
        WorkerRequest::Resolve(ResolveRequest {
            specifier: specifier.into(),
            resolve_from: None,
            is_entry: true,
            options: Arc::new(BuildOptions::default()),
        })
    }

    #[test]
    fn test_run_roundtrip() {
        let h = harness(2, Duration::ZERO);
        let result = h.pool.run(resolve("./a.js"), Priority::Entry).unwrap();
        assert!(matches!(
            result,
            WorkerResponse::Resolved(Resolution::File(ref path)) if path == "./a.js"
        ));
    }

    #[test]
    fn test_plugin_failure_not_retried() {
        let h = harness(1, Duration::ZERO);
        let result = h.pool.run(resolve("fail:x"), Priority::Entry);
        assert!(matches!(result, Err(JobError::Failed(_))));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_crash_is_retried_once() {
        let h = harness(1, Duration::ZERO);
        h.crash_budget.lock().unwrap().insert("flaky".into(), 1);

        let result = h.pool.run(resolve("flaky"), Priority::Entry);
        assert!(result.is_ok());

        let stats = h.pool.stats();
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.respawns, 1);
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);

        // The respawned worker keeps serving.
        assert!(h.pool.run(resolve("after"), Priority::Entry).is_ok());
    }

    #[test]
    fn test_second_crash_escalates() {
        let h = harness(1, Duration::ZERO);
        h.crash_budget.lock().unwrap().insert("poison".into(), 10);

        let result = h.pool.run(resolve("poison"), Priority::Entry);
        let Err(JobError::Fault(bundle)) = result else {
            panic!("expected a worker fault");
        };

        let diagnostic = bundle.first();
        assert_eq!(diagnostic.origin.as_deref(), Some(POOL_ORIGIN));
        assert!(diagnostic.message.contains("simulated crash"));
        assert!(diagnostic.hints.iter().any(|h| h.contains("worker fault")));
        assert_eq!(h.calls.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
        assert_eq!(h.pool.stats().crashes, MAX_ATTEMPTS as u64);
    }

    #[test]
    fn test_entry_priority_first() {
        let h = harness(1, Duration::from_millis(20));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only worker so the rest queue up.
        let (tx, rx) = crossbeam_channel::unbounded();
        for (name, priority) in [
            ("blocker", Priority::Entry),
            ("spec-1", Priority::Speculative),
            ("spec-2", Priority::Speculative),
            ("entry-1", Priority::Entry),
        ] {
            let order = order.clone();
            let tx = tx.clone();
            h.pool.submit(resolve(name), priority, 0, move |_| {
                order.lock().unwrap().push(name);
                let _ = tx.send(());
            });
        }

        for _ in 0..4 {
            rx.recv().unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["blocker", "entry-1", "spec-1", "spec-2"]
        );
    }

    #[test]
    fn test_cancel_by_tag() {
        let h = harness(1, Duration::from_millis(50));
        let (tx, rx) = crossbeam_channel::unbounded();

        for (name, tag) in [("busy", 1), ("a", 7), ("b", 8), ("c", 7)] {
            let tx = tx.clone();
            h.pool
                .submit(resolve(name), Priority::Entry, tag, move |r| {
                    let _ = tx.send((name, r.is_err()));
                });
        }

        let cancelled = h.pool.cancel(7);
        assert_eq!(cancelled, 2);

        let mut results: Vec<_> = (0..4).map(|_| rx.recv().unwrap()).collect();
        results.sort();
        assert_eq!(
            results,
            vec![("a", true), ("b", false), ("busy", false), ("c", true)]
        );
    }

    #[test]
    fn test_shutdown_is_idempotent_and_releases() {
        let h = harness(3, Duration::ZERO);
        h.pool.run(resolve("x"), Priority::Entry).unwrap();

        h.pool.shutdown(Duration::from_secs(1));
        h.pool.shutdown(Duration::from_secs(1));

        assert!(h.pool.is_shut_down());
        assert_eq!(h.released.load(Ordering::SeqCst), 3);
        assert!(matches!(
            h.pool.run(resolve("late"), Priority::Entry),
            Err(JobError::Cancelled)
        ));
    }

    #[test]
    fn test_shutdown_cancels_queue_and_abandons_slow_workers() {
        let h = harness(1, Duration::from_millis(300));
        let (tx, rx) = crossbeam_channel::unbounded();

        for name in ["running", "queued"] {
            let tx = tx.clone();
            h.pool.submit(resolve(name), Priority::Entry, 0, move |r| {
                let _ = tx.send((name, r));
            });
        }

        // Give the worker a moment to pick up the first request.
        thread::sleep(Duration::from_millis(50));
        h.pool.shutdown(Duration::from_millis(10));

        let (first, result) = rx.recv().unwrap();
        assert_eq!(first, "queued");
        assert!(matches!(result, Err(JobError::Cancelled)));

        let (second, result) = rx.recv().unwrap();
        assert_eq!(second, "running");
        assert!(matches!(result, Err(JobError::Cancelled)));
    }
}
