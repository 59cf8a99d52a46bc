//! Promises built from other promises, and already-settled promises.
use crate::{
    executor::after,
    promise::{Builder, Promise},
    Error, SharedExecutor,
};
use std::{
    mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Values collected by `all`, one slot per input.
struct Gather<T> {
    slots: Mutex<Vec<Option<T>>>,
    remaining: AtomicUsize,
}

fn empty_input<T: Send + 'static>(
    combinator: &'static str,
    executor: SharedExecutor,
    name: Option<&str>,
) -> Promise<T> {
    log::error!("{combinator} called without any promises");
    Builder::new()
        .executor(executor)
        .maybe_name(name)
        .build(|handler| handler.reject(Error::EmptyInput(combinator)))
}

impl<T: Send + 'static> Promise<T> {
    /// A promise fulfilled with `value`. The fulfillment still goes through
    /// `executor`.
    pub fn resolved(value: T, executor: SharedExecutor) -> Self {
        Self::with_executor(executor, move |handler| handler.resolve(value))
    }

    pub fn resolved_named(value: T, executor: SharedExecutor, name: &str) -> Self {
        Builder::new()
            .executor(executor)
            .name(name)
            .build(move |handler| handler.resolve(value))
    }

    /// A promise rejected with [`Error::Rejected`] carrying `message`.
    pub fn rejected(message: impl Into<String>, executor: SharedExecutor) -> Self {
        let err = Error::msg(message);
        Self::with_executor(executor, move |handler| handler.reject(err))
    }

    pub fn rejected_named(message: impl Into<String>, executor: SharedExecutor, name: &str) -> Self {
        let err = Error::msg(message);
        Builder::new()
            .executor(executor)
            .name(name)
            .build(move |handler| handler.reject(err))
    }

    /// Fulfilled with every value once all `promises` are fulfilled, in the
    /// order the promises were given. The first rejection rejects it and
    /// everything settling afterwards is ignored.
    ///
    /// An empty `promises` rejects with [`Error::EmptyInput`].
    pub fn all<I>(executor: SharedExecutor, promises: I) -> Promise<Vec<T>>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        Self::gather(executor, None, promises)
    }

    pub fn all_named<I>(executor: SharedExecutor, name: &str, promises: I) -> Promise<Vec<T>>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        Self::gather(executor, Some(name), promises)
    }

    fn gather<I>(executor: SharedExecutor, name: Option<&str>, promises: I) -> Promise<Vec<T>>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        let promises: Vec<Promise<T>> = promises.into_iter().collect();
        if promises.is_empty() {
            return empty_input("all", executor, name);
        }
        let combined = Promise::pending(executor, name);
        let gather = Arc::new(Gather {
            slots: Mutex::new(promises.iter().map(|_| None).collect()),
            remaining: AtomicUsize::new(promises.len()),
        });
        for (index, promise) in promises.into_iter().enumerate() {
            let target = combined.cell().clone();
            let gather = gather.clone();
            promise.into_cell().attach(Box::new(move |outcome: Result<T, Error>| match outcome {
                Ok(value) => {
                    if target.is_claimed() {
                        return;
                    }
                    gather.slots.lock().unwrap()[index] = Some(value);
                    if gather.remaining.fetch_sub(1, Ordering::AcqRel) == 1 && target.try_claim() {
                        let slots = mem::take(&mut *gather.slots.lock().unwrap());
                        target.settle(Ok(slots.into_iter().flatten().collect()));
                    }
                }
                Err(err) => {
                    if target.try_claim() {
                        target.settle(Err(err));
                    }
                }
            }));
        }
        combined
    }

    /// Settles like whichever of `promises` settles first.
    ///
    /// An empty `promises` rejects with [`Error::EmptyInput`].
    pub fn race<I>(executor: SharedExecutor, promises: I) -> Promise<T>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        Self::first(executor, None, promises)
    }

    pub fn race_named<I>(executor: SharedExecutor, name: &str, promises: I) -> Promise<T>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        Self::first(executor, Some(name), promises)
    }

    fn first<I>(executor: SharedExecutor, name: Option<&str>, promises: I) -> Promise<T>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        let promises: Vec<Promise<T>> = promises.into_iter().collect();
        if promises.is_empty() {
            return empty_input("race", executor, name);
        }
        let winner = Promise::pending(executor, name);
        for promise in promises {
            let target = winner.cell().clone();
            promise.into_cell().attach(Box::new(move |outcome: Result<T, Error>| {
                if target.try_claim() {
                    target.settle(outcome);
                }
            }));
        }
        winner
    }
}

impl Promise<()> {
    /// Fulfilled once `duration` has passed.
    pub fn delay(duration: Duration, executor: SharedExecutor) -> Self {
        Self::with_executor(executor, move |handler| {
            after(duration, Box::new(move || handler.resolve(())))
        })
    }
}
