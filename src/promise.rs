use crate::{
    abort::AbortToken,
    cell::{Cell, PromiseHandler, State},
    executor::{self, SharedExecutor},
    waiter::{Consumer, Producer},
    Error,
};
use futures::executor::block_on;
use std::{
    any::type_name,
    fmt,
    future::IntoFuture,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// The eventual outcome of a computation.
///
/// A promise is pending until its handler settles it, then it is either
/// fulfilled with a `T` or rejected with an [`Error`], and it never changes
/// again. Chaining a continuation consumes the promise and hands back the
/// promise of the continuation's result; every promise in a chain shares one
/// executor and one [`AbortToken`].
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

/// Options for a new root promise.
///
/// ```
/// use thenable::{executor, Builder};
///
/// let promise = Builder::new()
///     .executor(executor::immediate())
///     .name("answer")
///     .build(|handler| handler.resolve(42));
/// assert_eq!(promise.name().as_deref(), Some("answer"));
/// assert_eq!(promise.wait().unwrap(), 42);
/// ```
#[derive(Default)]
pub struct Builder {
    executor: Option<SharedExecutor>,
    name: Option<String>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor for settlement and every callback of the chain. Defaults to
    /// [`executor::immediate`].
    pub fn executor(mut self, executor: SharedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Label used in logs and panics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn maybe_name(mut self, name: Option<&str>) -> Self {
        self.name = name.map(String::from);
        self
    }

    fn pending<T: Send + 'static>(self) -> Promise<T> {
        let executor = self.executor.unwrap_or_else(executor::immediate);
        Promise::from_cell(Cell::new(executor, AbortToken::new(), self.name))
    }

    /// Create the promise and run `initializer` with its handler.
    ///
    /// If `initializer` panics before settling the promise, the promise is
    /// rejected with [`Error::Panicked`]. A panic after it settled is
    /// resumed.
    pub fn build<T, F>(self, initializer: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(PromiseHandler<T>),
    {
        let promise = self.pending();
        let handler = PromiseHandler::new(promise.cell.clone());
        let probe = handler.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || initializer(handler))) {
            if !probe.try_reject(Error::from_panic(payload.as_ref())) {
                panic::resume_unwind(payload);
            }
        }
        promise
    }

    /// Like [`Builder::build`] for initializers that can fail. An error
    /// returned before the promise settled rejects it; one returned after
    /// is logged and dropped.
    pub fn try_build<T, E, F>(self, initializer: F) -> Promise<T>
    where
        T: Send + 'static,
        E: Into<Error>,
        F: FnOnce(PromiseHandler<T>) -> Result<(), E>,
    {
        self.build(move |handler| {
            let probe = handler.clone();
            if let Err(err) = initializer(handler) {
                let err = err.into();
                if !probe.try_reject(err.clone()) {
                    log::warn!("initializer failed after settling its promise: {err}");
                }
            }
        })
    }
}

impl<T> Promise<T> {
    pub(crate) fn from_cell(cell: Arc<Cell<T>>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Arc<Cell<T>> {
        &self.cell
    }

    pub(crate) fn into_cell(self) -> Arc<Cell<T>> {
        self.cell
    }

    pub fn state(&self) -> State {
        self.cell.state()
    }

    pub fn name(&self) -> Option<String> {
        self.cell.name()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.cell.set_name(Some(name.into()));
    }

    pub fn executor(&self) -> SharedExecutor {
        self.cell.executor().clone()
    }

    /// Break the whole chain this promise belongs to: no callback of the
    /// chain that has not run yet will ever run.
    pub fn broke(&self) {
        log::debug!("breaking the chain of promise {}", self.cell.label());
        self.cell.abort().raise();
    }

    pub fn is_broken(&self) -> bool {
        self.cell.abort().is_raised()
    }
}

impl<T: Send + 'static> Promise<T> {
    /// A promise on the immediate executor.
    pub fn new<F>(initializer: F) -> Self
    where
        F: FnOnce(PromiseHandler<T>),
    {
        Builder::new().build(initializer)
    }

    pub fn with_executor<F>(executor: SharedExecutor, initializer: F) -> Self
    where
        F: FnOnce(PromiseHandler<T>),
    {
        Builder::new().executor(executor).build(initializer)
    }

    pub fn try_new<E, F>(executor: SharedExecutor, initializer: F) -> Self
    where
        E: Into<Error>,
        F: FnOnce(PromiseHandler<T>) -> Result<(), E>,
    {
        Builder::new().executor(executor).try_build(initializer)
    }

    /// A pending root that only the crate can settle.
    pub(crate) fn pending(executor: SharedExecutor, name: Option<&str>) -> Self {
        Builder::new().executor(executor).maybe_name(name).pending()
    }

    /// Block the calling thread until the promise settles.
    ///
    /// Do not call this from the thread that drains the promise's own
    /// [`Looper`](crate::executor::Looper), or from inside a task of the
    /// immediate executor; nothing would ever run.
    pub fn wait(self) -> Result<T, Error> {
        block_on(self.into_future())
    }
}

impl<T: Send + 'static> Promise<Promise<T>> {
    /// Adopt the outcome of the inner promise. This removes one level of
    /// nesting; call it again for each further level.
    pub fn flatten(self) -> Promise<T> {
        self.then_promise(|inner| inner)
    }
}

impl<T: Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Consumer<T>;

    /// Resolves once the promise settles. If the promise is dropped without
    /// ever delivering, resolves with [`Error::ProducerDropped`].
    fn into_future(self) -> Consumer<T> {
        let (producer, consumer) = Producer::new();
        self.cell
            .attach(Box::new(move |outcome| producer.resolve(outcome)));
        consumer
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("name", &self.cell.name())
            .field("state", &self.cell.state())
            .field("broken", &self.cell.abort().is_raised())
            .finish()
    }
}

/// Whether `T` is some `Promise<_>` of this crate.
///
/// The format of `type_name` is not guaranteed to stay the same across
/// compiler versions, so this is a best-effort check for a misuse that would
/// otherwise go unnoticed. `test_is_promise` pins it to the current format.
pub(crate) fn is_promise<T>() -> bool {
    let marker = type_name::<Promise<()>>();
    let prefix = marker.strip_suffix("()>").unwrap_or(marker);
    type_name::<T>().starts_with(prefix)
}
