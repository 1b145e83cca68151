//! Thread-backed futures, worker pools, and a handful of combinators to orchestrate them.
//!
//! (this is *not* an `async` runtime: [`Future`] here is a plain blocking handle filled in by a
//! worker thread, not a [`std::future::Future`] that needs polling)
//!
//! # Overview
//!
//! This library features two main types: [`WorkerPool`] and [`Future`].
//!
//! ## Worker pools
//!
//! A [`WorkerPool`] runs submitted tasks on background threads. It either keeps a fixed number of
//! threads that share a FIFO queue, or spawns a fresh thread for every task (see [`PoolSize`]).
//! Like any owned thread in this crate, a [`WorkerPool`] enforces *structured concurrency*: when
//! it is shut down or dropped, it stops accepting work and joins its threads.
//!
//! A task is any `FnOnce() -> Result<T, E>` (or `FnOnce() -> T` for [`WorkerPool::spawn`]). It is
//! run at most once. A task that fails or panics only fails its own [`Future`].
//!
//! ## Futures
//!
//! A [`Future`] is a single-assignment handle to the outcome of a task. It starts out pending and
//! settles exactly once, to either a value or a [`TaskFailure`]. The outcome can be retrieved by
//! blocking ([`Future::wait`], [`Future::join`]) or by registering a continuation
//! ([`Future::on_settle`]).
//!
//! ## Combinators
//!
//! [`all`], [`any`], [`combine`] and [`compose`] derive new [`Future`]s from existing ones without
//! blocking. Derived futures can be combined further, building a graph of dependent computations.
//!
//! # Usage
//!
//! Fetch three quotes concurrently and pick the cheapest one:
//!
//! ```
//! use settle::{all, WorkerPool};
//!
//! let pool = WorkerPool::builder().name("quotes").fixed(4).build().unwrap();
//!
//! let quotes = [("Server A", 54), ("Server B", 47), ("Server C", 61)]
//!     .map(|quote| pool.spawn(move || quote));
//!
//! let best = all(quotes).map(|quotes| quotes.into_iter().min_by_key(|(_, amount)| *amount));
//! assert_eq!(best.join().unwrap(), Some(("Server B", 47)));
//! ```
//!
//! Race several sources, then chain a dependent task onto the winner:
//!
//! ```
//! use settle::{any, compose, WorkerPool};
//!
//! let pool = WorkerPool::builder().unbounded().build().unwrap();
//! let spawner = pool.spawner();
//!
//! let weather = any([
//!     pool.spawn(|| "Sunny"),
//!     pool.spawn(|| "Sunny"),
//! ]).unwrap();
//!
//! let report = compose(weather, move |weather| {
//!     spawner.spawn(move || format!("Travel page: {weather}"))
//! });
//! assert_eq!(report.wait().unwrap(), "Travel page: Sunny");
//! ```
//!
//! Failures are values, not panics:
//!
//! ```
//! use settle::{combine, TaskFailure, WorkerPool};
//!
//! let pool = WorkerPool::builder().fixed(2).build().unwrap();
//! let quote = pool.submit(|| Err::<u32, _>("quote server unreachable"));
//! let weather = pool.spawn(|| "Rainy");
//!
//! let page = combine(quote, weather, |quote, weather| format!("{quote} / {weather}"));
//! match page.wait() {
//!     Err(TaskFailure::Failed(cause)) => assert_eq!(cause.to_string(), "quote server unreachable"),
//!     other => panic!("unexpected outcome {other:?}"),
//! }
//! ```

mod combinator;
mod error;
mod future;
mod pool;
mod sync;

pub use combinator::{all, any, combine, compose};
pub use error::{InvalidArgument, TaskFailure};
pub use future::{promise, Future, Outcome, Promise};
pub use pool::{PoolBuilder, PoolSize, Shutdown, Spawner, WorkerPool};
