//! Single-assignment futures and the promises that settle them.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use crate::{
    combinator,
    error::TaskFailure,
    sync::{Condvar, Mutex},
};

/// The terminal state of a settled [`Future`].
pub type Outcome<T> = Result<T, TaskFailure>;

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

/// Creates a connected pair of [`Promise`] and [`Future`].
///
/// The [`Promise`] is the write side: whoever holds it settles the [`Future`] exactly once. The
/// [`Future`] can be cloned and handed to any number of observers.
pub fn promise<T: 'static>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared {
        outcome: OnceLock::new(),
        continuations: Mutex::new(Vec::new()),
        condvar: Condvar::new(),
    });
    (
        Promise {
            shared: shared.clone(),
            settled: false,
        },
        Future { shared },
    )
}

struct Shared<T> {
    /// Written once, by [`Shared::settle`]. Readable without locking afterwards.
    outcome: OnceLock<Outcome<T>>,
    /// Continuations registered while the future was pending.
    ///
    /// This is also the mutex that `condvar` waits on. Registration checks `outcome` while
    /// holding it, and settling takes the list while holding it, so no continuation is missed.
    continuations: Mutex<Vec<Continuation<T>>>,
    condvar: Condvar,
}

impl<T: 'static> Shared<T> {
    fn settle(self: &Arc<Self>, outcome: Outcome<T>) {
        self.outcome.get_or_init(move || outcome);
        let continuations = {
            let mut continuations = self.continuations.lock();
            self.condvar.notify_all();
            mem::take(&mut *continuations)
        };
        if continuations.is_empty() {
            return;
        }

        let shared = self.clone();
        run_or_defer(Box::new(move || {
            if let Some(outcome) = shared.outcome.get() {
                for continuation in continuations {
                    run_continuation(continuation, outcome);
                }
            }
        }));
    }
}

impl<T> Shared<T> {
    fn register(&self, continuation: Continuation<T>) {
        let mut continuations = self.continuations.lock();
        match self.outcome.get() {
            Some(outcome) => {
                drop(continuations);
                run_continuation(continuation, outcome);
            }
            None => continuations.push(continuation),
        }
    }

    fn wait(&self) -> &Outcome<T> {
        if let Some(outcome) = self.outcome.get() {
            return outcome;
        }
        run_deferred_until(|| self.outcome.get().is_some());
        let mut guard = self.continuations.lock();
        loop {
            if let Some(outcome) = self.outcome.get() {
                return outcome;
            }
            guard = self.condvar.wait(guard);
        }
    }

    fn wait_timeout(&self, dur: Duration) -> Option<&Outcome<T>> {
        let Some(deadline) = Instant::now().checked_add(dur) else {
            return Some(self.wait());
        };
        run_deferred_until(|| self.outcome.get().is_some());
        let mut guard = self.continuations.lock();
        loop {
            if let Some(outcome) = self.outcome.get() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = self.condvar.wait_timeout(guard, deadline - now);
        }
    }
}

type Batch = Box<dyn FnOnce()>;

thread_local! {
    /// Continuation batches waiting to run on this thread. `Some` while the thread is draining.
    ///
    /// A continuation usually settles another future, whose continuations settle the next one,
    /// and so on. Queueing those batches instead of running them in place keeps the stack flat
    /// no matter how long the chain of derived futures is.
    static DEFERRED: RefCell<Option<VecDeque<Batch>>> = const { RefCell::new(None) };
}

/// Runs `batch`, or queues it if this thread is already running continuations further up the
/// stack. In both cases it runs on the current thread before the outermost settlement returns.
fn run_or_defer(batch: Batch) {
    let batch = DEFERRED.with(|deferred| {
        let mut deferred = deferred.borrow_mut();
        match &mut *deferred {
            Some(queue) => {
                queue.push_back(batch);
                None
            }
            None => {
                *deferred = Some(VecDeque::new());
                Some(batch)
            }
        }
    });
    let Some(batch) = batch else {
        return;
    };

    let _draining = Draining;
    batch();
    while let Some(batch) =
        DEFERRED.with(|deferred| deferred.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        batch();
    }
}

/// Runs batches queued on this thread until `done` returns `true` or the queue is empty.
///
/// A continuation that blocks on a future settled further down the same chain would otherwise
/// wait for a batch that only runs after it returns.
fn run_deferred_until(done: impl Fn() -> bool) {
    while !done() {
        let Some(batch) =
            DEFERRED.with(|deferred| deferred.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        else {
            break;
        };
        batch();
    }
}

/// Ends the drain, even when unwinding.
struct Draining;

impl Drop for Draining {
    fn drop(&mut self) {
        // Dropped outside the borrow: dropping a batch may drop promises, which settle again.
        let rest = DEFERRED.with(|deferred| deferred.borrow_mut().take());
        drop(rest);
    }
}

fn run_continuation<T>(continuation: Continuation<T>, outcome: &Outcome<T>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| continuation(outcome))) {
        log::error!(
            "continuation panicked: {}",
            TaskFailure::from_panic(payload)
        );
    }
}

/// Runs `f`, turning a panic into [`TaskFailure::Panicked`].
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Outcome<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(TaskFailure::from_panic)
}

/// The write side of a [`Future`].
///
/// Settling consumes the [`Promise`], so a [`Future`] transitions out of its pending state at
/// most once. If the [`Promise`] is dropped without being settled (for example because the task
/// that owned it was discarded), the [`Future`] settles to [`TaskFailure::Interrupted`] instead of
/// leaving its observers waiting forever.
pub struct Promise<T: 'static> {
    shared: Arc<Shared<T>>,
    settled: bool,
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        self.shared.settle(Err(TaskFailure::Interrupted));
    }
}

impl<T: 'static> Promise<T> {
    /// Settles the connected [`Future`] with `outcome`.
    ///
    /// Threads blocked in [`Future::wait`] are woken up, and all continuations registered via
    /// [`Future::on_settle`] run on the calling thread. If the calling thread is itself running a
    /// continuation, they are queued and run once that continuation returns, so arbitrarily long
    /// chains of derived futures settle without growing the stack.
    pub fn settle(mut self, outcome: Outcome<T>) {
        self.shared.settle(outcome);
        self.settled = true;
    }

    #[inline]
    pub fn fulfill(self, value: T) {
        self.settle(Ok(value));
    }

    #[inline]
    pub fn fail(self, failure: TaskFailure) {
        self.settle(Err(failure));
    }
}

impl<T: 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// A handle to the eventual outcome of a task.
///
/// A [`Future`] starts out pending and settles exactly once, either to a value or to a
/// [`TaskFailure`]. Cloning a [`Future`] is cheap and yields another handle to the same outcome.
///
/// [`Future`]s are obtained from [`WorkerPool::submit`][crate::WorkerPool::submit], from
/// [`promise`], or from the combinators in this crate.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Future<T> {
    /// Creates a [`Future`] that has already succeeded with `value`.
    pub fn ready(value: T) -> Self
    where
        T: 'static,
    {
        let (promise, future) = promise();
        promise.fulfill(value);
        future
    }

    /// Creates a [`Future`] that has already failed with `failure`.
    pub fn failed(failure: TaskFailure) -> Self
    where
        T: 'static,
    {
        let (promise, future) = promise();
        promise.fail(failure);
        future
    }

    /// Returns `true` if [`Future::wait`] would return without blocking.
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.shared.outcome.get().is_some()
    }

    /// Returns the outcome if the [`Future`] has settled, or [`None`] if it is still pending.
    pub fn try_get(&self) -> Option<Result<&T, TaskFailure>> {
        self.shared.outcome.get().map(borrow_outcome)
    }

    /// Blocks the calling thread until the [`Future`] settles.
    ///
    /// Any number of threads may wait on the same [`Future`], and waiting again after it has
    /// settled returns the same value without re-running anything.
    pub fn wait(&self) -> Result<&T, TaskFailure> {
        borrow_outcome(self.shared.wait())
    }

    /// Like [`Future::wait`], but gives up after `dur`, returning [`None`].
    pub fn wait_timeout(&self, dur: Duration) -> Option<Result<&T, TaskFailure>> {
        self.shared.wait_timeout(dur).map(borrow_outcome)
    }

    /// Blocks until the [`Future`] settles and returns an owned outcome.
    ///
    /// If this is the last handle to the outcome, the value is moved out; otherwise it is cloned.
    pub fn join(self) -> Outcome<T>
    where
        T: Clone,
    {
        self.shared.wait();
        match Arc::try_unwrap(self.shared) {
            Ok(shared) => shared
                .outcome
                .into_inner()
                .unwrap_or(Err(TaskFailure::Interrupted)),
            Err(shared) => shared.wait().clone(),
        }
    }

    /// Registers `continuation` to be called with the outcome once the [`Future`] settles.
    ///
    /// If the [`Future`] is still pending, `continuation` runs on the thread that settles it
    /// (typically a pool thread). If it has already settled, `continuation` runs right away on
    /// the calling thread. Either way it runs exactly once.
    ///
    /// Failures are delivered as `Err` values, not raised. A panic inside `continuation` is
    /// caught and logged.
    pub fn on_settle<F>(&self, continuation: F)
    where
        T: Clone + 'static,
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.shared
            .register(Box::new(move |outcome: &Outcome<T>| {
                continuation(outcome.clone())
            }));
    }

    /// Returns a [`Future`] that settles to `f` applied to this future's value.
    ///
    /// Failures are passed through without calling `f`. A panic in `f` settles the returned
    /// [`Future`] to [`TaskFailure::Panicked`].
    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        T: Clone + Send + Sync + 'static,
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (promise, mapped) = promise();
        self.on_settle(move |outcome| {
            promise.settle(outcome.and_then(|value| catch_panic(move || f(value))));
        });
        mapped
    }

    /// Method form of [`compose`][crate::compose].
    pub fn and_then<U, F>(&self, next: F) -> Future<U>
    where
        T: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        combinator::compose(self.clone(), next)
    }
}

fn borrow_outcome<T>(outcome: &Outcome<T>) -> Result<&T, TaskFailure> {
    outcome.as_ref().map_err(Clone::clone)
}

impl<T: fmt::Debug> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Future");
        match self.shared.outcome.get() {
            Some(outcome) => s.field("outcome", outcome),
            None => s.field("outcome", &"<pending>"),
        }
        .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
    };

    use super::*;
    use crate::{test::assert_send, WorkerPool};

    #[test]
    fn fulfill_then_wait() {
        let (promise, future) = promise();
        assert!(!future.is_settled());
        assert!(future.try_get().is_none());
        promise.fulfill(7);
        assert!(future.is_settled());
        assert_eq!(future.wait().unwrap(), &7);
        assert_eq!(future.try_get().unwrap().unwrap(), &7);
    }

    #[test]
    fn dropped_promise_interrupts() {
        let (promise, future) = promise::<()>();
        drop(promise);
        assert!(future.wait().unwrap_err().is_interrupted());
    }

    #[test]
    fn failure_is_delivered_to_every_observer() {
        let future = Future::<u32>::failed(TaskFailure::failed("no quote"));
        let other = future.clone();
        assert_eq!(
            future.wait().unwrap_err().to_string(),
            "task failed: no quote"
        );
        assert_eq!(
            other.join().unwrap_err().to_string(),
            "task failed: no quote"
        );
    }

    #[test]
    fn waiting_twice_returns_the_same_value() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (promise, future) = promise();
        let r = runs.clone();
        let worker = thread::spawn(move || {
            r.fetch_add(1, Ordering::SeqCst);
            promise.fulfill(String::from("Server B"));
        });

        let first = future.wait().unwrap() as *const String;
        let second = future.wait().unwrap() as *const String;
        assert_eq!(first, second);
        assert_eq!(future.wait().unwrap(), "Server B");
        worker.join().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn many_waiters() {
        let (promise, future) = promise();
        let barrier = Arc::new(Barrier::new(9));
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let future = future.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    *future.wait().unwrap()
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        promise.fulfill(42);

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 42);
        }
    }

    #[test]
    fn wait_timeout_expires() {
        let (promise, future) = promise::<u8>();
        assert!(future.wait_timeout(Duration::from_millis(20)).is_none());
        promise.fulfill(1);
        assert_eq!(
            future
                .wait_timeout(Duration::from_millis(20))
                .unwrap()
                .unwrap(),
            &1
        );
    }

    #[test]
    fn join_moves_out_of_last_handle() {
        let future = Future::ready(vec![1, 2, 3]);
        assert_eq!(future.join().unwrap(), vec![1, 2, 3]);

        let future = Future::ready(5);
        let other = future.clone();
        assert_eq!(future.join().unwrap(), 5);
        assert_eq!(other.join().unwrap(), 5);
    }

    #[test]
    fn continuation_on_settled_future_runs_inline() {
        let future = Future::ready(3);
        let caller = thread::current().id();
        let (tx, rx) = crossbeam_channel::unbounded();
        future.on_settle(move |outcome| {
            tx.send((thread::current().id(), outcome.unwrap())).unwrap();
        });
        // Already ran, before `on_settle` returned.
        assert_eq!(rx.try_recv().unwrap(), (caller, 3));
    }

    #[test]
    fn continuation_on_pending_future_runs_on_settling_thread() {
        let (promise, future) = promise();
        let (tx, rx) = crossbeam_channel::unbounded();
        future.on_settle(move |outcome: Outcome<u32>| {
            tx.send((thread::current().id(), outcome.unwrap())).unwrap();
        });
        assert!(rx.try_recv().is_err());

        let settler = thread::spawn(move || {
            promise.fulfill(9);
            thread::current().id()
        });
        let settler_id = settler.join().unwrap();
        assert_eq!(rx.recv().unwrap(), (settler_id, 9));
    }

    #[test]
    fn each_continuation_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (promise, future) = promise();
        for _ in 0..4 {
            let calls = calls.clone();
            future.on_settle(move |_: Outcome<()>| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        promise.fulfill(());
        let c = calls.clone();
        future.on_settle(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn panicking_continuation_does_not_stop_others() {
        let (promise, future) = promise();
        let (tx, rx) = crossbeam_channel::unbounded();
        future.on_settle(|_: Outcome<u8>| panic::resume_unwind(Box::new("continuation panic")));
        future.on_settle(move |outcome| tx.send(outcome.unwrap()).unwrap());
        promise.fulfill(1);
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn map_applies_and_passes_failures_through() {
        let doubled = Future::ready(21).map(|v| v * 2);
        assert_eq!(doubled.wait().unwrap(), &42);

        let failed = Future::<i32>::failed(TaskFailure::Interrupted).map(|v| v * 2);
        assert!(failed.wait().unwrap_err().is_interrupted());

        let panicked = Future::ready(0).map(|_: i32| -> i32 {
            panic::resume_unwind(Box::new("map panic"))
        });
        match panicked.wait().unwrap_err() {
            TaskFailure::Panicked(msg) => assert_eq!(msg, "map panic"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn long_map_chain_settles_without_recursing() {
        let pool = WorkerPool::builder().fixed(1).build().unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let mut future = pool.spawn(move || {
            gate_rx.recv().unwrap();
            0u64
        });
        for _ in 0..10_000 {
            future = future.map(|v| v + 1);
        }
        assert!(!future.is_settled());

        gate_tx.send(()).unwrap();
        assert_eq!(future.wait().unwrap(), &10_000);
    }

    #[test]
    fn long_and_then_chain_settles_without_recursing() {
        let pool = WorkerPool::builder().fixed(1).build().unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let mut future = pool.spawn(move || {
            gate_rx.recv().unwrap();
            0u64
        });
        for _ in 0..10_000 {
            future = future.and_then(|v| Future::ready(v + 1));
        }

        gate_tx.send(()).unwrap();
        assert_eq!(future.wait().unwrap(), &10_000);
    }

    #[test]
    fn continuation_can_wait_on_a_future_it_settles() {
        let (outer, future) = promise();
        let (tx, rx) = crossbeam_channel::unbounded();
        future.on_settle(move |outcome: Outcome<u32>| {
            let (inner, derived) = promise();
            let doubled = derived.map(|v: u32| v * 2);
            inner.settle(outcome);
            tx.send(*doubled.wait().unwrap()).unwrap();
        });
        outer.fulfill(21);
        assert_eq!(rx.try_recv().unwrap(), 42);
    }

    #[test]
    fn debug_shows_state() {
        let (promise, future) = promise::<u8>();
        assert_eq!(format!("{future:?}"), r#"Future { outcome: "<pending>" }"#);
        promise.fulfill(4);
        assert_eq!(format!("{future:?}"), "Future { outcome: Ok(4) }");
    }

    #[test]
    fn handles_are_send() {
        assert_send::<Promise<()>>();
        assert_send::<Future<()>>();
    }
}
