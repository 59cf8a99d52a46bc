//! A one-shot `Producer`/`Consumer` pair. Awaiting a [`Promise`] hands its
//! outcome to the producer; the consumer is the future you await.
//!
//! [`Promise`]: crate::Promise
use crate::Error;
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

/// The sending half. It can only be resolved once.
///
/// # Examples
///
/// ```
/// use thenable::waiter::Producer;
/// use futures::executor::block_on;
/// use std::thread;
/// let (producer, consumer) = Producer::<String>::new();
///
/// let task1 = thread::spawn(move || block_on(consumer));
/// producer.resolve(Ok("Hi".into()));
/// assert_eq!(task1.join().expect("The task1 thread has panicked.").unwrap(), "Hi");
/// ```
#[derive(Debug)]
pub struct Producer<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

/// Resolves with whatever the producer sent, or with
/// [`Error::ProducerDropped`] if it went away first.
#[derive(Debug)]
pub struct Consumer<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

#[derive(Debug)]
struct Shared<T> {
    outcome: Option<Result<T, Error>>,
    waker: Option<Waker>,
    // The producer has resolved or gone away.
    finished: bool,
}

impl<T> Producer<T> {
    pub fn new() -> (Self, Consumer<T>) {
        let shared = Arc::new(Mutex::new(Shared {
            outcome: None,
            waker: None,
            finished: false,
        }));
        (
            Self {
                shared: shared.clone(),
            },
            Consumer { shared },
        )
    }

    pub fn resolve(self, outcome: Result<T, Error>) {
        self.finish(Some(outcome));
    }

    /// Record the outcome, `None` if there is none, and wake the consumer.
    /// Only the first call has any effect.
    fn finish(&self, outcome: Option<Result<T, Error>>) {
        let waker = {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.finished {
                return;
            }
            shared.finished = true;
            shared.outcome = outcome;
            shared.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.finish(None);
    }
}

impl<T> Future for Consumer<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(outcome) = shared.outcome.take() {
            Poll::Ready(outcome)
        } else if shared.finished {
            Poll::Ready(Err(Error::ProducerDropped))
        } else {
            shared.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
