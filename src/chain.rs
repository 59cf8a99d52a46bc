//! Continuations: `then`, `try_then`, `then_promise` and `catch`.
use crate::{cell::Cell, panic_message, promise::Promise, Error};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// What to do with the predecessor's value.
pub(crate) enum Cont<T, R> {
    Map(Box<dyn FnOnce(T) -> R + Send>),
    Try(Box<dyn FnOnce(T) -> Result<R, Error> + Send>),
    FlatMap(Box<dyn FnOnce(T) -> Promise<R> + Send>),
}

/// What to do with the predecessor's rejection.
pub(crate) enum Recover {
    Forward,
    Catch(Box<dyn FnOnce(Error) + Send>),
}

enum Step<R> {
    Settle(Result<R, Error>),
    Adopt(Promise<R>),
}

impl<T: Send + 'static> Promise<T> {
    /// Run `on_fulfilled` with the value once this promise is fulfilled.
    ///
    /// A rejection skips `on_fulfilled` and rejects the returned promise
    /// with the same error. A panic in `on_fulfilled` rejects it with
    /// [`Error::Panicked`].
    pub fn then<R, F>(self, on_fulfilled: F) -> Promise<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.chain("then", Cont::Map(Box::new(on_fulfilled)), Recover::Forward)
    }

    /// Like [`Promise::then`], but a rejection goes to `on_rejected` and
    /// stops there: the returned promise never settles.
    pub fn then_catch<R, F, C>(self, on_fulfilled: F, on_rejected: C) -> Promise<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        C: FnOnce(Error) + Send + 'static,
    {
        self.chain(
            "then",
            Cont::Map(Box::new(on_fulfilled)),
            Recover::Catch(Box::new(on_rejected)),
        )
    }

    /// A continuation that can fail. `Err` rejects the returned promise.
    pub fn try_then<R, E, F>(self, on_fulfilled: F) -> Promise<R>
    where
        R: Send + 'static,
        E: Into<Error>,
        F: FnOnce(T) -> Result<R, E> + Send + 'static,
    {
        self.chain(
            "then",
            Cont::Try(Box::new(move |value: T| -> Result<R, Error> {
                on_fulfilled(value).map_err(Into::into)
            })),
            Recover::Forward,
        )
    }

    /// A continuation that returns another promise. The returned promise
    /// settles the way that promise does.
    pub fn then_promise<R, F>(self, on_fulfilled: F) -> Promise<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Promise<R> + Send + 'static,
    {
        self.chain(
            "then_promise",
            Cont::FlatMap(Box::new(on_fulfilled)),
            Recover::Forward,
        )
    }

    pub fn then_promise_catch<R, F, C>(self, on_fulfilled: F, on_rejected: C) -> Promise<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Promise<R> + Send + 'static,
        C: FnOnce(Error) + Send + 'static,
    {
        self.chain(
            "then_promise",
            Cont::FlatMap(Box::new(on_fulfilled)),
            Recover::Catch(Box::new(on_rejected)),
        )
    }

    /// Handle a rejection. The value of a fulfilled promise passes through;
    /// after a rejection the returned promise stays pending.
    pub fn catch<C>(self, on_rejected: C) -> Promise<T>
    where
        C: FnOnce(Error) + Send + 'static,
    {
        self.chain(
            "catch",
            Cont::Map(Box::new(|value: T| value)),
            Recover::Catch(Box::new(on_rejected)),
        )
    }

    fn chain<R>(self, suffix: &str, cont: Cont<T, R>, recover: Recover) -> Promise<R>
    where
        R: Send + 'static,
    {
        let predecessor = self.into_cell();
        let name = predecessor
            .name()
            .filter(|name| !name.is_empty())
            .map(|name| format!("{name}-{suffix}"));
        let successor = Cell::new(
            predecessor.executor().clone(),
            predecessor.abort().clone(),
            name,
        );
        let target = successor.clone();
        predecessor.attach(Box::new(move |outcome: Result<T, Error>| match outcome {
            Ok(value) => fulfill(&target, cont, value),
            Err(err) => reject(&target, recover, err),
        }));
        Promise::from_cell(successor)
    }
}

fn fulfill<T, R: Send + 'static>(target: &Arc<Cell<R>>, cont: Cont<T, R>, value: T) {
    if target.is_claimed() || target.abort().is_raised() {
        return;
    }
    let step = panic::catch_unwind(AssertUnwindSafe(move || match cont {
        Cont::Map(f) => Step::Settle(Ok(f(value))),
        Cont::Try(f) => Step::Settle(f(value)),
        Cont::FlatMap(f) => Step::Adopt(f(value)),
    }));
    match step {
        Ok(step) if target.try_claim() => match step {
            Step::Settle(outcome) => target.settle(outcome),
            Step::Adopt(promise) => target.adopt(promise),
        },
        Ok(_) => log::warn!(
            "promise {} settled while its continuation ran, dropping the result",
            target.label()
        ),
        Err(payload) => {
            if target.try_claim() {
                target.settle(Err(Error::from_panic(payload.as_ref())));
            } else {
                panic::resume_unwind(payload);
            }
        }
    }
}

fn reject<R: Send + 'static>(target: &Arc<Cell<R>>, recover: Recover, err: Error) {
    if target.is_claimed() || target.abort().is_raised() {
        return;
    }
    match recover {
        Recover::Forward => {
            if target.try_claim() {
                target.settle(Err(err));
            }
        }
        Recover::Catch(on_rejected) => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || on_rejected(err))) {
                log::error!(
                    "rejection handler after promise {} panicked: {}",
                    target.label(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{executor::Looper, Error, Promise, State};
    use std::sync::{Arc, Mutex};

    fn record<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(vec![]));
        let out = seen.clone();
        (seen, move |value| out.lock().unwrap().push(value))
    }

    #[test]
    fn test_then_maps_values() {
        let looper = Looper::new();
        let (seen, push) = record();
        Promise::with_executor(looper.executor(), |handler| handler.resolve(100))
            .then(|x| x + 0)
            .then(|x| x * 2)
            .then(move |x| push(x));
        looper.run_until_idle();
        assert_eq!(*seen.lock().unwrap(), vec![200]);
    }

    #[test]
    fn test_rejection_skips_then_and_is_forwarded() {
        let looper = Looper::new();
        let (mapped, push) = record::<i32>();
        let (caught, catch) = record::<String>();
        Promise::<i32>::with_executor(looper.executor(), |handler| handler.reject("broken"))
            .then(move |x| {
                push(x);
                x
            })
            .then(|x| x + 1)
            .catch(move |err| catch(err.to_string()));
        looper.run_until_idle();
        assert!(mapped.lock().unwrap().is_empty());
        assert_eq!(*caught.lock().unwrap(), vec![String::from("broken")]);
    }

    #[test]
    fn test_catch_absorbs_rejection() {
        let looper = Looper::new();
        let (caught, catch) = record::<String>();
        let (after, push) = record::<i32>();
        let tail = Promise::<i32>::with_executor(looper.executor(), |handler| handler.reject("nope"))
            .then_catch(|x| x, move |err| catch(err.to_string()));
        let last = tail.then(move |x| push(x));
        looper.run_until_idle();
        assert_eq!(caught.lock().unwrap().len(), 1);
        assert!(after.lock().unwrap().is_empty());
        assert_eq!(last.state(), State::Pending);
    }

    #[test]
    fn test_catch_passes_value_through() {
        let looper = Looper::new();
        let (caught, catch) = record::<String>();
        let (seen, push) = record::<i32>();
        Promise::with_executor(looper.executor(), |handler| handler.resolve(100))
            .then(|x| x)
            .catch(move |err| catch(err.to_string()))
            .then(move |x| push(x));
        looper.run_until_idle();
        assert!(caught.lock().unwrap().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }

    #[test]
    fn test_panic_in_then_rejects_successor() {
        let looper = Looper::new();
        let (caught, catch) = record::<String>();
        Promise::with_executor(looper.executor(), |handler| handler.resolve(1))
            .then(|_x: i32| -> i32 { panic!("bad continuation") })
            .catch(move |err| catch(err.to_string()));
        looper.run_until_idle();
        assert_eq!(
            *caught.lock().unwrap(),
            vec![String::from("callback panicked: bad continuation")]
        );
    }

    #[test]
    fn test_try_then_error_rejects_successor() {
        let looper = Looper::new();
        let (caught, catch) = record::<String>();
        Promise::with_executor(looper.executor(), |handler| handler.resolve("12x"))
            .try_then(|text| text.parse::<i32>().map_err(Error::new))
            .catch(move |err| catch(err.to_string()));
        looper.run_until_idle();
        assert_eq!(
            *caught.lock().unwrap(),
            vec![String::from("invalid digit found in string")]
        );
    }

    #[test]
    fn test_panic_in_rejection_handler_is_swallowed() {
        let looper = Looper::new();
        let tail = Promise::<i32>::with_executor(looper.executor(), |handler| handler.reject("nope"))
            .catch(|_err| panic!("handler blew up"));
        looper.run_until_idle();
        assert_eq!(tail.state(), State::Pending);
    }

    #[test]
    fn test_then_promise_adopts() {
        let looper = Looper::new();
        let executor = looper.executor();
        let (seen, push) = record();
        Promise::with_executor(looper.executor(), |handler| handler.resolve(60))
            .then_promise(move |x| {
                Promise::with_executor(executor, move |handler| handler.resolve(x + 140))
            })
            .then(move |x| push(x));
        looper.run_until_idle();
        assert_eq!(*seen.lock().unwrap(), vec![200]);
    }

    #[test]
    fn test_then_promise_adopts_rejection() {
        let looper = Looper::new();
        let executor = looper.executor();
        let (caught, catch) = record::<String>();
        Promise::with_executor(looper.executor(), |handler| handler.resolve(1))
            .then_promise(move |_x| Promise::<i32>::rejected("inner failed", executor))
            .catch(move |err| catch(err.to_string()));
        looper.run_until_idle();
        assert_eq!(*caught.lock().unwrap(), vec![String::from("inner failed")]);
    }

    #[test]
    fn test_then_promise_catch_consumes_rejection() {
        let looper = Looper::new();
        let executor = looper.executor();
        let (caught, catch) = record::<String>();
        let tail = Promise::<i32>::with_executor(looper.executor(), |handler| handler.reject("outer"))
            .then_promise_catch(
                move |x| Promise::resolved(x, executor),
                move |err| catch(err.to_string()),
            );
        looper.run_until_idle();
        assert_eq!(*caught.lock().unwrap(), vec![String::from("outer")]);
        assert_eq!(tail.state(), State::Pending);
    }

    #[test]
    fn test_successor_names() {
        let looper = Looper::new();
        let root = crate::Builder::new()
            .executor(looper.executor())
            .name("load")
            .build(|handler| handler.resolve(1));
        let mapped = root.then(|x| x);
        assert_eq!(mapped.name().as_deref(), Some("load-then"));
        let executor = looper.executor();
        let adopted = mapped.then_promise(move |x| Promise::resolved(x, executor));
        assert_eq!(adopted.name().as_deref(), Some("load-then-then_promise"));
        let caught = adopted.catch(|_err| {});
        assert_eq!(caught.name().as_deref(), Some("load-then-then_promise-catch"));
        let anonymous = Promise::resolved(1, looper.executor()).then(|x| x);
        assert_eq!(anonymous.name(), None);
        looper.run_until_idle();
    }

    #[test]
    fn test_successor_shares_executor_and_abort() {
        let looper = Looper::new();
        let root = Promise::<i32>::with_executor(looper.executor(), |_handler| {});
        let executor = root.executor();
        let next = root.then(|x| x);
        assert!(Arc::ptr_eq(&executor, &next.executor()));
        next.broke();
        let last = next.then(|x| x);
        assert!(last.is_broken());
    }
}
