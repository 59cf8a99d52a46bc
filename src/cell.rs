//! The state machine behind a single promise.
//!
//! Both settling a cell and attaching its continuation are submitted to the
//! cell's executor. Each of those tasks takes the cell lock, makes its change
//! and then tries to deliver, so whichever task runs second sees the other's
//! effect and the continuation runs exactly once.
use crate::{abort::AbortToken, executor::SharedExecutor, promise::Promise, Error};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

/// Where a promise is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

/// Both branches of a continuation, folded into one callback.
pub(crate) type Reaction<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

struct Slot<T> {
    state: State,
    outcome: Option<Result<T, Error>>,
    reaction: Option<Reaction<T>>,
    attached: bool,
}

pub(crate) struct Cell<T> {
    slot: Mutex<Slot<T>>,
    // Set as soon as a settlement is scheduled, before the state changes.
    claimed: AtomicBool,
    executor: SharedExecutor,
    abort: AbortToken,
    name: Mutex<Option<String>>,
}

fn label(name: &Option<String>) -> &str {
    name.as_deref().unwrap_or("<anonymous>")
}

impl<T> Cell<T> {
    pub(crate) fn executor(&self) -> &SharedExecutor {
        &self.executor
    }

    pub(crate) fn abort(&self) -> &AbortToken {
        &self.abort
    }

    pub(crate) fn name(&self) -> Option<String> {
        self.name.lock().unwrap().clone()
    }

    pub(crate) fn set_name(&self, name: Option<String>) {
        *self.name.lock().unwrap() = name;
    }

    pub(crate) fn label(&self) -> String {
        label(&self.name.lock().unwrap()).to_owned()
    }

    pub(crate) fn state(&self) -> State {
        self.slot.lock().unwrap().state
    }

    /// Take the right to settle this cell. Only the first caller wins.
    pub(crate) fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Cell<T> {
    pub(crate) fn new(
        executor: SharedExecutor,
        abort: AbortToken,
        name: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                state: State::Pending,
                outcome: None,
                reaction: None,
                attached: false,
            }),
            claimed: AtomicBool::new(false),
            executor,
            abort,
            name: Mutex::new(name),
        })
    }

    /// Schedule the transition out of `Pending`. The caller must hold the
    /// claim.
    pub(crate) fn settle(self: &Arc<Self>, outcome: Result<T, Error>) {
        let cell = self.clone();
        self.executor
            .submit(Box::new(move || cell.transition(outcome)));
    }

    fn transition(&self, outcome: Result<T, Error>) {
        let next = match outcome {
            Ok(_) => State::Fulfilled,
            Err(_) => State::Rejected,
        };
        let mut slot = self.slot.lock().unwrap();
        if slot.state != State::Pending {
            let current = slot.state;
            drop(slot);
            panic!(
                "promise {} cannot move from {:?} to {:?}: a promise settles only once",
                self.label(),
                current,
                next
            );
        }
        slot.state = next;
        slot.outcome = Some(outcome);
        log::trace!("promise {} is {:?}", self.label(), next);
        self.deliver(slot);
    }

    /// Schedule installing the continuation of this cell.
    pub(crate) fn attach(self: &Arc<Self>, reaction: Reaction<T>) {
        let cell = self.clone();
        self.executor
            .submit(Box::new(move || cell.install(reaction)));
    }

    fn install(&self, reaction: Reaction<T>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.attached {
            drop(slot);
            panic!("promise {} already has a continuation", self.label());
        }
        slot.attached = true;
        slot.reaction = Some(reaction);
        log::trace!("continuation attached to promise {}", self.label());
        self.deliver(slot);
    }

    fn deliver(&self, mut slot: MutexGuard<'_, Slot<T>>) {
        if slot.state == State::Pending || slot.reaction.is_none() {
            return;
        }
        if self.abort.is_raised() {
            log::debug!("chain of promise {} was broken, not delivering", self.label());
            return;
        }
        let (Some(reaction), Some(outcome)) = (slot.reaction.take(), slot.outcome.take()) else {
            return;
        };
        drop(slot);
        reaction(outcome);
    }

    /// Settle this cell with whatever `source` settles with. The caller must
    /// hold the claim.
    pub(crate) fn adopt(self: &Arc<Self>, source: Promise<T>) {
        let target = self.clone();
        source
            .into_cell()
            .attach(Box::new(move |outcome| target.settle(outcome)));
    }
}

impl<T> Drop for Cell<T> {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(Err(err)) = &slot.outcome {
            if !self.abort.is_raised() {
                let name = self.name.get_mut().unwrap_or_else(PoisonError::into_inner);
                log::warn!("unobserved rejection in promise {}: {err}", label(name));
            }
        }
    }
}

/// Settles the promise it was handed out for.
///
/// A handler is given to the initializer of every new promise. It can be
/// cloned and sent to other threads; the first `resolve`, `reject` or
/// `resolve_with_promise` wins and any later call panics.
pub struct PromiseHandler<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for PromiseHandler<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for PromiseHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseHandler")
            .field("name", &self.cell.name())
            .field("settled", &self.cell.is_claimed())
            .finish()
    }
}

impl<T: Send + 'static> PromiseHandler<T> {
    pub(crate) fn new(cell: Arc<Cell<T>>) -> Self {
        Self { cell }
    }

    fn claim(&self, operation: &str) {
        if !self.cell.try_claim() {
            panic!(
                "promise {} was already settled, cannot {operation}",
                self.cell.label()
            );
        }
    }

    /// Fulfill the promise with `value`.
    ///
    /// # Panics
    ///
    /// If the promise was already settled, or if `value` is itself a
    /// promise. Use [`PromiseHandler::resolve_with_promise`] for that.
    pub fn resolve(&self, value: T) {
        assert!(
            !crate::promise::is_promise::<T>(),
            "promise {} was resolved with a promise, use resolve_with_promise",
            self.cell.label()
        );
        self.claim("resolve");
        self.cell.settle(Ok(value));
    }

    /// Settle the promise the same way `promise` eventually settles.
    pub fn resolve_with_promise(&self, promise: Promise<T>) {
        self.claim("resolve_with_promise");
        self.cell.adopt(promise);
    }

    /// Reject the promise with `err`.
    pub fn reject(&self, err: impl Into<Error>) {
        self.claim("reject");
        self.cell.settle(Err(err.into()));
    }

    /// Reject unless a settlement was already requested. Returns whether
    /// this call settled the promise.
    pub(crate) fn try_reject(&self, err: Error) -> bool {
        if !self.cell.try_claim() {
            return false;
        }
        self.cell.settle(Err(err));
        true
    }

    /// Whether a settlement has already been requested.
    pub fn is_settled(&self) -> bool {
        self.cell.is_claimed()
    }
}

#[cfg(test)]
mod tests {
    use super::{Cell, State};
    use crate::{abort::AbortToken, executor::Looper, Error};
    use std::sync::{Arc, Mutex};

    fn recorder<T: Send + 'static>() -> (
        Arc<Mutex<Vec<Result<T, Error>>>>,
        Box<dyn FnOnce(Result<T, Error>) + Send>,
    ) {
        let seen = Arc::new(Mutex::new(vec![]));
        let out = seen.clone();
        (seen, Box::new(move |outcome| out.lock().unwrap().push(outcome)))
    }

    #[test]
    fn test_settle_then_attach() {
        let looper = Looper::new();
        let cell = Cell::new(looper.executor(), AbortToken::new(), None);
        let (seen, reaction) = recorder::<i32>();
        assert!(cell.try_claim());
        cell.settle(Ok(100));
        looper.run_until_idle();
        assert_eq!(cell.state(), State::Fulfilled);
        assert!(seen.lock().unwrap().is_empty());

        cell.attach(reaction);
        looper.run_until_idle();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(*seen[0].as_ref().unwrap(), 100);
    }

    #[test]
    fn test_attach_then_settle() {
        let looper = Looper::new();
        let cell = Cell::new(looper.executor(), AbortToken::new(), None);
        let (seen, reaction) = recorder::<i32>();
        cell.attach(reaction);
        looper.run_until_idle();
        assert_eq!(cell.state(), State::Pending);

        assert!(cell.try_claim());
        cell.settle(Err(Error::msg("nope")));
        looper.run_until_idle();
        assert_eq!(cell.state(), State::Rejected);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap_err().to_string(), "nope");
    }

    #[test]
    fn test_attach_and_settle_queued_together() {
        for attach_first in [true, false] {
            let looper = Looper::new();
            let cell = Cell::new(looper.executor(), AbortToken::new(), None);
            let (seen, reaction) = recorder::<&str>();
            assert!(cell.try_claim());
            if attach_first {
                cell.attach(reaction);
                cell.settle(Ok("done"));
            } else {
                cell.settle(Ok("done"));
                cell.attach(reaction);
            }
            assert_eq!(looper.run_until_idle(), 2);
            assert_eq!(seen.lock().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let looper = Looper::new();
        let cell = Cell::<()>::new(looper.executor(), AbortToken::new(), None);
        assert!(!cell.is_claimed());
        assert!(cell.try_claim());
        assert!(!cell.try_claim());
        assert!(cell.is_claimed());
    }

    #[test]
    fn test_abort_suppresses_delivery() {
        let looper = Looper::new();
        let abort = AbortToken::new();
        let cell = Cell::new(looper.executor(), abort.clone(), None);
        let (seen, reaction) = recorder::<i32>();
        cell.attach(reaction);
        assert!(cell.try_claim());
        cell.settle(Ok(1));
        abort.raise();
        looper.run_until_idle();
        assert_eq!(cell.state(), State::Fulfilled);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "settles only once")]
    fn test_second_transition_panics() {
        let looper = Looper::new();
        let cell = Cell::new(looper.executor(), AbortToken::new(), Some("twice".into()));
        cell.settle(Ok(1));
        cell.settle(Ok(2));
        looper.run_until_idle();
    }

    #[test]
    #[should_panic(expected = "already has a continuation")]
    fn test_second_attach_panics() {
        let looper = Looper::new();
        let cell = Cell::<i32>::new(looper.executor(), AbortToken::new(), None);
        cell.attach(Box::new(|_| {}));
        cell.attach(Box::new(|_| {}));
        looper.run_until_idle();
    }

    #[test]
    fn test_name() {
        let looper = Looper::new();
        let cell = Cell::<()>::new(looper.executor(), AbortToken::new(), None);
        assert_eq!(cell.name(), None);
        assert_eq!(cell.label(), "<anonymous>");
        cell.set_name(Some("load".into()));
        assert_eq!(cell.name().as_deref(), Some("load"));
    }
}
