//! Functions that derive a new [`Future`] from existing ones.
//!
//! None of these block or run any work of their own. They register continuations on their inputs
//! (see [`Future::on_settle`]) and settle the derived [`Future`] from whichever thread settles the
//! input that completes the combinator's condition.
//!
//! Inputs that lose a race or finish after a failure has already been reported keep running;
//! their outcome is simply ignored.

use std::sync::Arc;

use crate::{
    error::{InvalidArgument, TaskFailure},
    future::{catch_panic, promise, Future, Promise},
    sync::{Mutex, MutexGuard},
};

/// Waits for every input to succeed.
///
/// The values are returned in input order, regardless of the order in which the inputs settled.
/// If any input fails, the returned [`Future`] fails with the first failure to occur. An empty
/// input settles immediately to an empty [`Vec`].
pub fn all<T, I>(futures: I) -> Future<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    struct Join<T: 'static> {
        values: Vec<Option<T>>,
        remaining: usize,
        /// Taken by whichever continuation settles the joined future.
        promise: Option<Promise<Vec<T>>>,
    }

    let futures: Vec<_> = futures.into_iter().collect();
    if futures.is_empty() {
        return Future::ready(Vec::new());
    }

    let (promise, joined) = promise();
    let join = Arc::new(Mutex::new(Join {
        values: vec![None; futures.len()],
        remaining: futures.len(),
        promise: Some(promise),
    }));
    for (index, future) in futures.iter().enumerate() {
        let join = join.clone();
        future.on_settle(move |outcome| {
            let mut join = join.lock();
            match outcome {
                Ok(value) => {
                    if join.promise.is_none() {
                        return;
                    }
                    join.values[index] = Some(value);
                    join.remaining -= 1;
                    if join.remaining == 0 {
                        let values: Vec<T> = join.values.drain(..).flatten().collect();
                        let promise = join.promise.take();
                        drop(join);
                        if let Some(promise) = promise {
                            promise.fulfill(values);
                        }
                    }
                }
                Err(failure) => {
                    let promise = join.promise.take();
                    join.values.clear();
                    drop(join);
                    if let Some(promise) = promise {
                        promise.fail(failure);
                    }
                }
            }
        });
    }
    joined
}

/// Races the inputs against each other.
///
/// The returned [`Future`] settles to the outcome of whichever input settles first, whether that
/// is a value or a failure. Position in `futures` plays no role.
///
/// Returns [`InvalidArgument`] if `futures` is empty, since such a race could never finish.
pub fn any<T, I>(futures: I) -> Result<Future<T>, InvalidArgument>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let futures: Vec<_> = futures.into_iter().collect();
    if futures.is_empty() {
        return Err(InvalidArgument("any() requires at least one future"));
    }

    let (promise, winner) = promise();
    let slot = Arc::new(Mutex::new(Some(promise)));
    for future in &futures {
        let slot = slot.clone();
        future.on_settle(move |outcome| {
            let promise = slot.lock().take();
            if let Some(promise) = promise {
                promise.settle(outcome);
            }
        });
    }
    Ok(winner)
}

/// Combines the values of two futures with `merge` once both have succeeded.
///
/// If either input fails, the returned [`Future`] fails with the first failure to occur and
/// `merge` is never called. A panic in `merge` settles it to [`TaskFailure::Panicked`].
pub fn combine<A, B, R, F>(a: Future<A>, b: Future<B>, merge: F) -> Future<R>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: FnOnce(A, B) -> R + Send + 'static,
{
    struct Pair<A, B, R: 'static, F> {
        a: Option<A>,
        b: Option<B>,
        merge: Option<F>,
        promise: Option<Promise<R>>,
    }

    impl<A, B, R: 'static, F: FnOnce(A, B) -> R> Pair<A, B, R, F> {
        /// Settles the promise if this is the last missing piece.
        fn complete(mut pair: MutexGuard<'_, Self>) {
            if pair.a.is_none() || pair.b.is_none() {
                return;
            }
            let (Some(a), Some(b), Some(merge), Some(promise)) = (
                pair.a.take(),
                pair.b.take(),
                pair.merge.take(),
                pair.promise.take(),
            ) else {
                return;
            };
            drop(pair);
            promise.settle(catch_panic(move || merge(a, b)));
        }

        fn fail(mut pair: MutexGuard<'_, Self>, failure: TaskFailure) {
            let promise = pair.promise.take();
            let merge = pair.merge.take();
            drop(pair);
            drop(merge);
            if let Some(promise) = promise {
                promise.fail(failure);
            }
        }
    }

    let (promise, combined) = promise();
    let pair = Arc::new(Mutex::new(Pair {
        a: None,
        b: None,
        merge: Some(merge),
        promise: Some(promise),
    }));

    let left = pair.clone();
    a.on_settle(move |outcome| {
        let mut pair = left.lock();
        match outcome {
            Ok(value) => {
                pair.a = Some(value);
                Pair::complete(pair);
            }
            Err(failure) => Pair::fail(pair, failure),
        }
    });
    b.on_settle(move |outcome| {
        let mut pair = pair.lock();
        match outcome {
            Ok(value) => {
                pair.b = Some(value);
                Pair::complete(pair);
            }
            Err(failure) => Pair::fail(pair, failure),
        }
    });
    combined
}

/// Chains a dependent task onto `a`.
///
/// Once `a` succeeds, `next` is called with its value to obtain a second [`Future`], and the
/// returned [`Future`] settles with that second future's outcome. If `a` fails, `next` is never
/// called and the failure is passed through. A panic in `next` settles the returned [`Future`] to
/// [`TaskFailure::Panicked`].
pub fn compose<A, B, F>(a: Future<A>, next: F) -> Future<B>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    F: FnOnce(A) -> Future<B> + Send + 'static,
{
    let (promise, chained) = promise();
    a.on_settle(move |outcome| match outcome.and_then(|value| catch_panic(move || next(value))) {
        Ok(inner) => inner.on_settle(move |outcome| promise.settle(outcome)),
        Err(failure) => promise.fail(failure),
    });
    chained
}
