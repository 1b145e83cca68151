//! Worker pools that run tasks off the calling thread.

use std::{
    convert::Infallible,
    error::Error,
    io, mem,
    num::NonZeroUsize,
    panic::resume_unwind,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, SendError, Sender};

use crate::{
    future::{catch_panic, promise, Future},
    sync::Mutex,
    TaskFailure,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How many threads a [`WorkerPool`] runs tasks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSize {
    /// Every submitted task gets a thread of its own.
    Unbounded,
    /// A fixed number of threads share a FIFO queue. Submissions beyond that number wait in the
    /// queue until a thread becomes free.
    Fixed(NonZeroUsize),
}

impl Default for PoolSize {
    fn default() -> Self {
        Self::Fixed(thread::available_parallelism().unwrap_or(NonZeroUsize::MIN))
    }
}

/// What to do with queued tasks when shutting down a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shutdown {
    /// Run every task that was submitted before the shutdown.
    #[default]
    Drain,
    /// Drop tasks that haven't started yet. Their [`Future`]s settle to
    /// [`TaskFailure::Interrupted`]. Tasks that are already running are allowed to finish.
    Discard,
}

/// A builder object that can be used to configure and build a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    name: Option<String>,
    size: PoolSize,
}

impl PoolBuilder {
    /// Sets the base name of the pool's threads.
    ///
    /// Each thread is named according to this base name and an index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    #[inline]
    pub fn size(self, size: PoolSize) -> Self {
        Self { size, ..self }
    }

    /// Uses a fixed number of threads.
    ///
    /// # Panics
    ///
    /// Panics if `count` is 0.
    pub fn fixed(self, count: usize) -> Self {
        match NonZeroUsize::new(count) {
            Some(count) => self.size(PoolSize::Fixed(count)),
            None => panic!("count must be at least 1"),
        }
    }

    /// Spawns one thread per submitted task.
    #[inline]
    pub fn unbounded(self) -> Self {
        self.size(PoolSize::Unbounded)
    }

    /// Builds the [`WorkerPool`], spawning its threads right away if it has a fixed size.
    pub fn build(self) -> io::Result<WorkerPool> {
        let shared = Arc::new(PoolShared {
            name: self.name.unwrap_or_else(|| String::from("settle-worker")),
            size: self.size,
            discard: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
            queue: Mutex::new(None),
            threads: Mutex::new(PerTask {
                open: true,
                handles: Vec::new(),
            }),
        });

        let mut workers = Vec::new();
        if let PoolSize::Fixed(count) = self.size {
            let (sender, recv) = crossbeam_channel::unbounded();
            for i in 0..count.get() {
                let handle = thread::Builder::new()
                    .name(format!("{}-{i}", shared.name))
                    .spawn({
                        let recv = recv.clone();
                        let shared = shared.clone();
                        move || shared.work(recv)
                    });
                match handle {
                    Ok(handle) => workers.push(handle),
                    Err(e) => {
                        // Dropping `sender` closes the channel, letting the already spawned
                        // threads exit. Join them before reporting the error.
                        drop(sender);
                        for handle in workers {
                            let _ = handle.join();
                        }
                        return Err(e);
                    }
                }
            }
            *shared.queue.lock() = Some(sender);
        }

        log::debug!("built pool '{}' with {:?}", shared.name, self.size);
        Ok(WorkerPool {
            spawner: Spawner { shared },
            workers,
        })
    }
}

struct PoolShared {
    name: String,
    size: PoolSize,
    /// Set by [`Shutdown::Discard`]. Workers drop queued jobs instead of running them.
    discard: AtomicBool,
    /// Used to number per-task threads.
    spawned: AtomicUsize,
    /// Job queue of a fixed-size pool. `None` once shut down, and always `None` when unbounded.
    queue: Mutex<Option<Sender<Job>>>,
    /// Per-task threads of an unbounded pool.
    threads: Mutex<PerTask>,
}

struct PerTask {
    open: bool,
    handles: Vec<JoinHandle<()>>,
}

impl PoolShared {
    fn work(&self, recv: Receiver<Job>) {
        log::trace!("worker '{}' starting", thread_name());
        for job in recv {
            if self.discard.load(Ordering::Acquire) {
                // Dropping the job drops its `Promise`, which interrupts the `Future`.
                drop(job);
                continue;
            }
            job();
        }
        log::trace!("worker '{}' exiting", thread_name());
    }

    fn dispatch(&self, job: Job) {
        let rejected = match self.size {
            PoolSize::Fixed(_) => self.enqueue(job),
            PoolSize::Unbounded => self.spawn_thread(job),
        };
        // Dropping a job interrupts its `Future` and runs its continuations, which may submit more
        // tasks, so this must happen after the locks above have been released.
        drop(rejected);
    }

    fn enqueue(&self, job: Job) -> Option<Job> {
        let queue = self.queue.lock();
        let Some(sender) = &*queue else {
            log::warn!("pool '{}' is shut down, refusing task", self.name);
            return Some(job);
        };
        match sender.send(job) {
            Ok(()) => None,
            Err(SendError(job)) => {
                log::error!("pool '{}' has no workers left", self.name);
                Some(job)
            }
        }
    }

    fn spawn_thread(&self, job: Job) -> Option<Job> {
        let mut threads = self.threads.lock();
        if !threads.open {
            log::warn!("pool '{}' is shut down, refusing task", self.name);
            return Some(job);
        }
        threads.handles.retain(|handle| !handle.is_finished());

        // Lets us get the job back if the thread can't be spawned.
        let slot = Arc::new(Mutex::new(Some(job)));
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("{}-{index}", self.name))
            .spawn({
                let slot = slot.clone();
                move || {
                    let job = slot.lock().take();
                    if let Some(job) = job {
                        log::trace!("running task on '{}'", thread_name());
                        job();
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                threads.handles.push(handle);
                None
            }
            Err(e) => {
                log::error!("failed to spawn thread for pool '{}': {e}", self.name);
                let job = slot.lock().take();
                job
            }
        }
    }

    /// Stops accepting tasks and returns the threads that have to be joined.
    fn close(&self, mode: Shutdown) -> Vec<JoinHandle<()>> {
        log::debug!("shutting down pool '{}' ({mode:?})", self.name);
        if mode == Shutdown::Discard {
            self.discard.store(true, Ordering::Release);
        }
        // Dropping the sender closes the channel. Workers exit once the queue is empty.
        drop(self.queue.lock().take());

        let mut threads = self.threads.lock();
        threads.open = false;
        mem::take(&mut threads.handles)
    }
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("<unnamed>").to_string()
}

fn run_task<T, E, F>(task: F) -> Result<T, TaskFailure>
where
    F: FnOnce() -> Result<T, E>,
    E: Into<Box<dyn Error + Send + Sync>>,
{
    catch_panic(task)?.map_err(TaskFailure::failed)
}

/// A cloneable handle for submitting tasks to a [`WorkerPool`].
///
/// Unlike the [`WorkerPool`] itself, a [`Spawner`] does not own the pool's threads, so it can be
/// moved into continuations and other threads freely. Tasks submitted after the pool has been shut
/// down are not run; their [`Future`]s settle to [`TaskFailure::Interrupted`].
#[derive(Clone)]
pub struct Spawner {
    shared: Arc<PoolShared>,
}

impl Spawner {
    /// Submits a fallible task and returns a [`Future`] for its outcome.
    ///
    /// This never blocks. The returned [`Future`] is pending until a pool thread has run `task`:
    /// - `Ok(value)` settles it to `value`,
    /// - `Err(e)` settles it to [`TaskFailure::Failed`] wrapping `e`,
    /// - a panic settles it to [`TaskFailure::Panicked`].
    ///
    /// A failing task never affects other tasks or the pool.
    pub fn submit<T, E, F>(&self, task: F) -> Future<T>
    where
        T: Send + Sync + 'static,
        E: Into<Box<dyn Error + Send + Sync>>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (promise, future) = promise();
        self.shared
            .dispatch(Box::new(move || promise.settle(run_task(task))));
        future
    }

    /// Submits a task that cannot fail (other than by panicking).
    pub fn spawn<T, F>(&self, task: F) -> Future<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(move || Ok::<_, Infallible>(task()))
    }

    /// Returns `true` once the pool has started shutting down.
    pub fn is_shut_down(&self) -> bool {
        match self.shared.size {
            PoolSize::Fixed(_) => self.shared.queue.lock().is_none(),
            PoolSize::Unbounded => !self.shared.threads.lock().open,
        }
    }
}

/// An owned pool of threads that run submitted tasks.
///
/// This type enforces structured concurrency: when it is shut down or dropped, it stops accepting
/// work and joins all of its threads. Dropping a [`WorkerPool`] is the same as calling
/// [`WorkerPool::shutdown`] with [`Shutdown::Drain`].
///
/// Do not drop or shut down a [`WorkerPool`] from one of its own tasks or continuations; the
/// thread would wait for itself to exit.
pub struct WorkerPool {
    spawner: Spawner,
    /// Threads of a fixed-size pool.
    workers: Vec<JoinHandle<()>>,
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close(Shutdown::Drain);
    }
}

impl WorkerPool {
    /// Returns a builder that can be used to configure and build a [`WorkerPool`].
    #[inline]
    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            name: None,
            size: PoolSize::default(),
        }
    }

    /// Submits a fallible task. See [`Spawner::submit`].
    #[inline]
    pub fn submit<T, E, F>(&self, task: F) -> Future<T>
    where
        T: Send + Sync + 'static,
        E: Into<Box<dyn Error + Send + Sync>>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.spawner.submit(task)
    }

    /// Submits an infallible task. See [`Spawner::spawn`].
    #[inline]
    pub fn spawn<T, F>(&self, task: F) -> Future<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.spawner.spawn(task)
    }

    /// Returns a [`Spawner`] that submits tasks to this pool.
    #[inline]
    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    #[inline]
    pub fn size(&self) -> PoolSize {
        self.spawner.shared.size
    }

    /// Returns the number of tasks waiting for a thread in a fixed-size pool.
    ///
    /// Always 0 for unbounded pools, since they never queue.
    pub fn queued(&self) -> usize {
        self.spawner
            .shared
            .queue
            .lock()
            .as_ref()
            .map_or(0, Sender::len)
    }

    /// Stops accepting tasks and joins all threads.
    ///
    /// If a pool thread has panicked, the panic is propagated to the calling thread.
    pub fn shutdown(mut self, mode: Shutdown) {
        self.close(mode);
    }

    fn close(&mut self, mode: Shutdown) {
        if self.workers.is_empty() && self.spawner.is_shut_down() {
            return;
        }
        let mut handles = self.spawner.shared.close(mode);
        handles.append(&mut self.workers);

        // Wait for all threads to exit and propagate a panic if one of them panicked.
        let mut payload = None;
        for handle in handles {
            if let Err(pl) = handle.join() {
                payload = Some(pl);
            }
        }
        if let Some(payload) = payload {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }
}
