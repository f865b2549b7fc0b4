//! The local thread-pool `Evaluator`: a memoized function registry driven
//! over a `Store`, matching `Evaluator::createLocal` in the original — the
//! remote/client variant lives in `memo-client` and drives the same `Future`
//! type via its own job source.

use memo_core::{Call, Cid, Name, Node};
use memo_store::{Store, StoreError, StoreExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EvalError {
    #[error("{0}")]
    Store(Arc<StoreError>),
    #[error("no function registered for {0:?}, and no cached result exists")]
    MissingImplementation(String),
    #[error("function {0:?} failed: {1}")]
    Func(String, Arc<dyn std::error::Error + Send + Sync>),
}

impl From<StoreError> for EvalError {
    fn from(e: StoreError) -> EvalError {
        EvalError::Store(Arc::new(e))
    }
}

/// A registered func: takes the evaluator (so it can recursively `evaluate`
/// or `evaluateAsync` other calls) and the call being evaluated.
pub type Func = Arc<dyn Fn(&dyn Evaluator, &Call) -> Result<Node, EvalError> + Send + Sync>;

/// The result of a finished call: the CID every `Store` indexes it under,
/// plus (unless `free_node` has been used) the `Node` it resolves to.
#[derive(Debug, Clone)]
pub struct Link {
    cid: Cid,
    node: Option<Node>,
}

impl Link {
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn cached_node(&self) -> Option<&Node> {
        self.node.as_ref()
    }
}

pub trait Evaluator: Send + Sync {
    fn store(&self) -> &dyn Store;

    /// Blocks until a result is available: resolves the cached call if
    /// present, otherwise runs the registered func, stores its result, and
    /// records the call. Fails fatally (process abort) if no func is
    /// registered and nothing is cached.
    fn evaluate(&self, call: &Call) -> Result<Cid, EvalError>;

    /// Schedules the call for background evaluation and returns a `Future`
    /// observing it.
    fn evaluate_async(&self, call: Call) -> Future;
}

fn fatal_missing_implementation(call: &Call) -> ! {
    let name = Name::Call(call.clone());
    tracing::error!(target: "memo_eval", call = %name, "no implementation registered, and no cached result exists");
    eprintln!("memo-eval: fatal: no implementation registered for call {}", name);
    std::process::exit(101);
}

enum JobState {
    NotStarted(Call),
    Running,
    Done(Result<Link, Arc<EvalError>>),
}

struct JobInner {
    state: Mutex<JobState>,
    condvar: Condvar,
    inner: Arc<Inner>,
}

/// A move-only (by convention; Rust can't forbid `Clone` being re-added by a
/// caller holding the `Arc` directly, but nothing in this crate clones one)
/// handle to a call's in-flight or finished evaluation.
pub struct Future {
    job: Arc<JobInner>,
}

impl Future {
    /// Waits for the result and returns its CID.
    pub fn get(&self) -> Result<Cid, Arc<EvalError>> {
        self.drive().map(|link| link.cid)
    }

    /// Waits for the result.
    pub fn wait(&self) -> Result<(), Arc<EvalError>> {
        self.drive().map(|_| ())
    }

    /// Waits for the result and returns the resolved `Node`, fetching it
    /// from the store if `free_node` discarded the cached copy.
    pub fn node(&self) -> Result<Node, Arc<EvalError>> {
        let link = self.drive()?;
        if let Some(node) = link.node {
            return Ok(node);
        }
        self.job
            .inner
            .store
            .get(&link.cid)
            .map_err(|e| Arc::new(EvalError::from(e)))
    }

    pub fn get_cid(&self) -> Result<Cid, Arc<EvalError>> {
        self.get()
    }

    /// Waits for the result, then drops the cached `Node` body (keeping the
    /// CID) to reduce memory use.
    pub fn free_node(&self) {
        if self.drive().is_ok() {
            let mut state = self.job.state.lock().unwrap();
            if let JobState::Done(Ok(link)) = &mut *state {
                link.node = None;
            }
        }
    }

    /// Checks whether the result is already available, without driving
    /// evaluation. With a zero-thread pool, a `Future` may never finish
    /// until `get`/`wait`/`node` is called at least once.
    pub fn check_for_result(&self) -> bool {
        matches!(&*self.job.state.lock().unwrap(), JobState::Done(_))
    }

    fn drive(&self) -> Result<Link, Arc<EvalError>> {
        drive_job(&self.job)
    }
}

enum NextStep {
    Wait,
    Run(Call),
}

fn drive_job(job: &Arc<JobInner>) -> Result<Link, Arc<EvalError>> {
    let mut guard = job.state.lock().unwrap();
    loop {
        let next = match &*guard {
            JobState::Done(result) => return result.clone(),
            JobState::Running => NextStep::Wait,
            JobState::NotStarted(call) => NextStep::Run(call.clone()),
        };
        match next {
            NextStep::Wait => {
                guard = job.condvar.wait(guard).unwrap();
            }
            NextStep::Run(call) => {
                *guard = JobState::Running;
                drop(guard);
                let evaluator = ThreadPoolEvaluator {
                    inner: job.inner.clone(),
                    shutdown: None,
                };
                let result = evaluator.evaluate_deferred(&call).map_err(Arc::new);
                let mut guard = job.state.lock().unwrap();
                *guard = JobState::Done(result.clone());
                job.condvar.notify_all();
                return result;
            }
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    funcs: Mutex<HashMap<String, Func>>,
    queue: Mutex<VecDeque<Arc<JobInner>>>,
    work_available: Condvar,
    work_done: AtomicBool,
    num_threads: usize,
    queued: AtomicU64,
    started: AtomicU64,
    finished: AtomicU64,
    log_lock: Mutex<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Joins the worker pool and signals it to exit. Each worker thread holds
/// an `Arc<Inner>` clone of its own (so it can drive a job's store/funcs
/// access while running), which means `Inner`'s own strong count never
/// reaches zero while a worker is alive — a `Drop for Inner` would never
/// fire. Shutdown is instead driven explicitly by this guard, held only by
/// the "real" owning `ThreadPoolEvaluator` (not by the transient per-job
/// views `drive_job` reconstructs, nor by the worker threads themselves),
/// so it runs exactly once, when the last such owner goes away.
struct PoolGuard {
    inner: Arc<Inner>,
}

impl Drop for PoolGuard {
    /// Signals workers to exit. Outstanding futures are not cancelled — see
    /// the drain performed on `work_done` in `worker_loop`, which only exits
    /// once the queue is empty.
    fn drop(&mut self) {
        self.inner.work_done.store(true, Ordering::SeqCst);
        self.inner.work_available.notify_all();
        let threads = std::mem::take(&mut *self.inner.threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

/// Local/thread-pool `Evaluator`, per spec.md §4.6: submissions are pushed
/// to a mutex-protected queue and worker threads pop and drive the deferred
/// evaluation. With `num_threads == 0`, nothing is created, and a `Future`
/// is instead driven lazily by whichever caller invokes `get`/`wait`/`node`.
#[derive(Clone)]
pub struct ThreadPoolEvaluator {
    inner: Arc<Inner>,
    /// `Some` only on handles that own the pool's lifetime; cloning this
    /// handle shares the same guard, so the pool shuts down once every
    /// clone of the owning handle has been dropped.
    shutdown: Option<Arc<PoolGuard>>,
}

impl ThreadPoolEvaluator {
    pub fn new(store: Arc<dyn Store>, num_threads: usize) -> ThreadPoolEvaluator {
        let inner = Arc::new(Inner {
            store,
            funcs: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            work_done: AtomicBool::new(false),
            num_threads,
            queued: AtomicU64::new(0),
            started: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            log_lock: Mutex::new(()),
            threads: Mutex::new(Vec::new()),
        });
        let mut threads = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let inner = inner.clone();
            threads.push(std::thread::spawn(move || worker_loop(inner)));
        }
        *inner.threads.lock().unwrap() = threads;
        let shutdown = Arc::new(PoolGuard {
            inner: inner.clone(),
        });
        ThreadPoolEvaluator {
            inner,
            shutdown: Some(shutdown),
        }
    }

    /// Registers a func that can be evaluated locally and cached. Not
    /// thread-safe; must happen before any `evaluate`/`evaluate_async` call.
    pub fn register_func(&self, name: impl Into<String>, func: Func) {
        self.inner.funcs.lock().unwrap().insert(name.into(), func);
    }

    fn log_progress(&self, verb: &str, call: &Call) {
        if let Ok(_guard) = self.inner.log_lock.try_lock() {
            let queued = self.inner.queued.load(Ordering::SeqCst);
            let started = self.inner.started.load(Ordering::SeqCst);
            let finished = self.inner.finished.load(Ordering::SeqCst);
            tracing::info!(
                target: "memo_eval::progress",
                "{} -> {} -> {}  {}  {}",
                queued.saturating_sub(started),
                started.saturating_sub(finished),
                finished,
                verb,
                Name::Call(call.clone()),
            );
        }
    }

    fn evaluate_deferred(&self, call: &Call) -> Result<Link, EvalError> {
        if let Some(cid) = self.inner.store.resolve_optional(&Name::Call(call.clone()))? {
            return Ok(Link { cid, node: None });
        }
        self.inner.started.fetch_add(1, Ordering::SeqCst);
        self.log_progress("starting", call);

        let func = self.inner.funcs.lock().unwrap().get(&call.name).cloned();
        let node = match func {
            Some(func) => func(self, call)?,
            None => {
                // Re-check under the possibility another thread raced us to
                // the same call and already cached a result.
                if let Some(cid) = self.inner.store.resolve_optional(&Name::Call(call.clone()))? {
                    self.inner.finished.fetch_add(1, Ordering::SeqCst);
                    self.log_progress("finished", call);
                    return Ok(Link { cid, node: None });
                }
                fatal_missing_implementation(call);
            }
        };
        let cid = self.inner.store.put(&node)?;
        self.inner.store.call_set(&call.name, &call.args, &cid)?;

        self.inner.finished.fetch_add(1, Ordering::SeqCst);
        self.log_progress("finished", call);
        Ok(Link {
            cid,
            node: Some(node),
        })
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if inner.work_done.load(Ordering::SeqCst) {
                    break None;
                }
                queue = inner.work_available.wait(queue).unwrap();
            }
        };
        match job {
            Some(job) => {
                let _ = drive_job(&job);
            }
            None => break,
        }
    }
}

impl Evaluator for ThreadPoolEvaluator {
    fn store(&self) -> &dyn Store {
        &*self.inner.store
    }

    fn evaluate(&self, call: &Call) -> Result<Cid, EvalError> {
        self.evaluate_deferred(call).map(|link| link.cid)
    }

    fn evaluate_async(&self, call: Call) -> Future {
        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        let job = Arc::new(JobInner {
            state: Mutex::new(JobState::NotStarted(call)),
            condvar: Condvar::new(),
            inner: self.inner.clone(),
        });
        if self.inner.num_threads > 0 {
            self.inner.queue.lock().unwrap().push_back(job.clone());
            self.inner.work_available.notify_one();
        }
        Future { job }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> Arc<dyn Store> {
        Arc::from(memo_store::open("sqlite::memory:?mode=memory", true).unwrap())
    }

    fn square_func() -> Func {
        Arc::new(|evaluator: &dyn Evaluator, call: &Call| -> Result<Node, EvalError> {
            let arg = evaluator.store().get(&call.args[0])?;
            let x = arg.as_integer().unwrap();
            Ok(Node::Integer(x * x))
        })
    }

    #[test]
    fn evaluate_memoizes_a_call() {
        let store = memory_store();
        let evaluator = ThreadPoolEvaluator::new(store.clone(), 0);
        evaluator.register_func("square", square_func());
        let arg = store.put(&Node::Integer(3)).unwrap();
        let call = Call::new("square", vec![arg]);
        let cid1 = evaluator.evaluate(&call).unwrap();
        let cid2 = evaluator.evaluate(&call).unwrap();
        assert_eq!(cid1, cid2);
        assert_eq!(store.get(&cid1).unwrap().as_integer(), Some(9));
        assert_eq!(store.list_calls("square").unwrap().len(), 1);
    }

    #[test]
    fn evaluate_async_with_zero_threads_drives_lazily() {
        let store = memory_store();
        let evaluator = ThreadPoolEvaluator::new(store.clone(), 0);
        evaluator.register_func("square", square_func());
        let arg = store.put(&Node::Integer(4)).unwrap();
        let call = Call::new("square", vec![arg]);
        let future = evaluator.evaluate_async(call);
        assert!(!future.check_for_result());
        let cid = future.get().unwrap();
        assert_eq!(store.get(&cid).unwrap().as_integer(), Some(16));
    }

    #[test]
    fn evaluate_async_with_worker_threads_completes() {
        let store = memory_store();
        let evaluator = ThreadPoolEvaluator::new(store.clone(), 2);
        evaluator.register_func("square", square_func());
        let arg = store.put(&Node::Integer(5)).unwrap();
        let call = Call::new("square", vec![arg]);
        let future = evaluator.evaluate_async(call);
        let cid = future.get().unwrap();
        assert_eq!(store.get(&cid).unwrap().as_integer(), Some(25));
    }

    #[test]
    fn free_node_keeps_cid_but_drops_cached_node() {
        let store = memory_store();
        let evaluator = ThreadPoolEvaluator::new(store.clone(), 0);
        evaluator.register_func("square", square_func());
        let arg = store.put(&Node::Integer(6)).unwrap();
        let future = evaluator.evaluate_async(Call::new("square", vec![arg]));
        let cid_before = future.get().unwrap();
        future.free_node();
        let cid_after = future.get_cid().unwrap();
        assert_eq!(cid_before, cid_after);
        assert_eq!(future.node().unwrap().as_integer(), Some(36));
    }

    #[test]
    fn dropping_the_evaluator_joins_its_worker_threads() {
        let store = memory_store();
        let evaluator = ThreadPoolEvaluator::new(store, 3);
        evaluator.register_func("square", square_func());
        drop(evaluator);
        // If the pool's worker threads were never signalled to exit, this
        // test would hang rather than fail loudly.
    }
}
