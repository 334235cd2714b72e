//! Request coalescing.
//!
//! Every unit of work the builder sends to the pool has a [`RequestKey`].
//! While a request with some key is running, asking for the same key again
//! does not reach the pool: the caller is parked next to the running request
//! and receives a copy of its result.
//!
//! Executions remember the session tag that started them. When a session is
//! aborted its executions are detached from the table, so a later session
//! asking for the same key starts over instead of inheriting a result
//! computed from inputs that may have changed since.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::Hash32;
use crate::executor::{JobResult, Priority, WorkerPool};
use crate::plugin::WorkerRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Resolve,
    Transform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub kind: RequestKind,
    pub identity: Hash32,
}

impl RequestKey {
    pub fn resolve(identity: Hash32) -> Self {
        Self {
            kind: RequestKind::Resolve,
            identity,
        }
    }

    pub fn transform(identity: Hash32) -> Self {
        Self {
            kind: RequestKind::Transform,
            identity,
        }
    }
}

type Waiter = Box<dyn FnOnce(JobResult) + Send>;

struct Execution {
    id: u64,
    tag: u64,
    waiters: Vec<Waiter>,
}

/// The in-flight table sitting in front of a [`WorkerPool`].
pub struct RequestTracker {
    pool: Arc<WorkerPool>,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<RequestKey, Execution>>,
}

impl RequestTracker {
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            next_id: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Runs `request` unless a request with the same key is already running,
    /// in which case `callback` waits for that one instead.
    ///
    /// Returns `true` when a new execution was started.
    pub fn request<F>(
        self: &Arc<Self>,
        key: RequestKey,
        request: WorkerRequest,
        priority: Priority,
        tag: u64,
        callback: F,
    ) -> bool
    where
        F: FnOnce(JobResult) + Send + 'static,
    {
        let id = {
            let mut table = self.in_flight.lock().unwrap();
            if let Some(execution) = table.get_mut(&key) {
                execution.waiters.push(Box::new(callback));
                return false;
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            table.insert(
                key,
                Execution {
                    id,
                    tag,
                    waiters: vec![Box::new(callback)],
                },
            );
            id
        };

        let this = self.clone();
        self.pool
            .submit(request, priority, tag, move |result| this.complete(key, id, result));
        true
    }

    fn complete(&self, key: RequestKey, id: u64, result: JobResult) {
        let waiters = {
            let mut table = self.in_flight.lock().unwrap();
            if !table.get(&key).is_some_and(|execution| execution.id == id) {
                tracing::trace!("dropping result of a detached request");
                return;
            }
            table.remove(&key).map(|execution| execution.waiters)
        };

        for waiter in waiters.unwrap_or_default() {
            waiter(result.clone());
        }
    }

    /// Detaches every execution started under `tag`. Their results are
    /// dropped when they arrive, and their waiters are dropped right away.
    /// Returns how many executions were detached.
    pub fn abandon(&self, tag: u64) -> usize {
        let detached: Vec<Execution> = {
            let mut table = self.in_flight.lock().unwrap();
            let keys: Vec<RequestKey> = table
                .iter()
                .filter(|(_, execution)| execution.tag == tag)
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| table.remove(key)).collect()
        };

        detached.len()
    }

    /// Number of distinct requests currently running or queued.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, mpsc};
    use std::thread;
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::core::BuildOptions;
    use crate::diagnostic::ThrowableDiagnostic;
    use crate::executor::{JobError, Worker, WorkerFactory};
    use crate::plugin::{Resolution, ResolveRequest, WorkerResponse};

    struct Slow(Arc<AtomicUsize>);

    impl Worker for Slow {
        fn run(&mut self, _: &WorkerRequest) -> Result<WorkerResponse, ThrowableDiagnostic> {
            self.0.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            Ok(WorkerResponse::Resolved(Resolution::File(Utf8PathBuf::from(
                "a.js",
            ))))
        }
    }

    fn tracker(size: usize) -> (Arc<RequestTracker>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory: WorkerFactory = {
            let calls = calls.clone();
            Arc::new(move |_| Box::new(Slow(calls.clone())) as Box<dyn Worker>)
        };
        let pool = Arc::new(WorkerPool::start(size, factory).unwrap());
        (RequestTracker::new(pool), calls)
    }

    fn request() -> WorkerRequest {
        WorkerRequest::Resolve(ResolveRequest {
            specifier: "./a".into(),
            resolve_from: None,
            is_entry: true,
            options: Arc::new(BuildOptions::default()),
        })
    }

    #[test]
    fn test_concurrent_requests_run_once() {
        let (tracker, calls) = tracker(4);
        let key = RequestKey::resolve(Hash32::hash("./a"));
        let barrier = Arc::new(Barrier::new(2));
        let (tx, rx) = mpsc::channel();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let tracker = tracker.clone();
                let barrier = barrier.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    barrier.wait();
                    tracker.request(key, request(), Priority::Entry, 0, move |result| {
                        let _ = tx.send(result);
                    })
                })
            })
            .collect();

        let started: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(started.iter().filter(|s| **s).count(), 1);

        for _ in 0..2 {
            let result = rx.recv().unwrap();
            assert!(matches!(
                result,
                Ok(WorkerResponse::Resolved(Resolution::File(ref path))) if path == "a.js"
            ));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_distinct_keys_run_separately() {
        let (tracker, calls) = tracker(2);
        let (tx, rx) = mpsc::channel();

        for identity in ["./a", "./b"] {
            let tx = tx.clone();
            let key = RequestKey::resolve(Hash32::hash(identity));
            assert!(tracker.request(key, request(), Priority::Entry, 0, move |r| {
                let _ = tx.send(r);
            }));
        }

        // Same identity, different kind.
        let key = RequestKey::transform(Hash32::hash("./a"));
        assert!(tracker.request(key, request(), Priority::Entry, 0, move |r| {
            let _ = tx.send(r);
        }));

        for _ in 0..3 {
            assert!(rx.recv().unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancellation_reaches_every_waiter() {
        let (tracker, _) = tracker(1);
        let (tx, rx) = mpsc::channel();

        // Keep the only worker busy.
        let busy = RequestKey::resolve(Hash32::hash("busy"));
        tracker.request(busy, request(), Priority::Entry, 1, |_| {});

        let key = RequestKey::resolve(Hash32::hash("./a"));
        for _ in 0..2 {
            let tx = tx.clone();
            tracker.request(key, request(), Priority::Entry, 2, move |r| {
                let _ = tx.send(r);
            });
        }

        assert_eq!(tracker.pool().cancel(2), 1);
        for _ in 0..2 {
            assert!(matches!(rx.recv().unwrap(), Err(JobError::Cancelled)));
        }
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn test_abandoned_execution_is_not_shared() {
        let (tracker, calls) = tracker(2);
        let key = RequestKey::resolve(Hash32::hash("./a"));

        let (old_tx, old_rx) = mpsc::channel();
        assert!(tracker.request(key, request(), Priority::Entry, 1, move |r| {
            let _ = old_tx.send(r);
        }));
        assert_eq!(tracker.abandon(1), 1);
        assert_eq!(tracker.in_flight(), 0);

        let (tx, rx) = mpsc::channel();
        assert!(tracker.request(key, request(), Priority::Entry, 2, move |r| {
            let _ = tx.send(r);
        }));

        assert!(rx.recv().unwrap().is_ok());
        // The detached waiter was dropped, never called.
        assert!(old_rx.recv().is_err());

        thread::sleep(Duration::from_millis(150));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.abandon(2), 0);
    }
}
