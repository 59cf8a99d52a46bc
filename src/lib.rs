//! Promises whose callbacks run on an executor of your choosing.
//!
//! A [`Promise`] starts out pending and settles exactly once, either
//! fulfilled with a value or rejected with an [`Error`]. Continuations
//! attached with [`Promise::then`] and friends are never run on the caller's
//! stack: settlement and attachment are both submitted to the promise's
//! [`Executor`], and delivery happens from there.
//!
//! # Examples
//!
//! ```
//! use thenable::{executor::Looper, Promise};
//! use std::sync::{Arc, Mutex};
//!
//! let looper = Looper::new();
//! let seen = Arc::new(Mutex::new(None));
//! let out = seen.clone();
//!
//! Promise::with_executor(looper.executor(), |handler| handler.resolve(20))
//!     .then(|x| x + 1)
//!     .then(|x| x * 2)
//!     .then(move |x| *out.lock().unwrap() = Some(x));
//!
//! looper.run_until_idle();
//! assert_eq!(*seen.lock().unwrap(), Some(42));
//! ```
use std::{any::Any, error::Error as StdError, sync::Arc};

pub mod abort;
mod cell;
mod chain;
mod combinators;
pub mod executor;
pub mod promise;
pub mod waiter;

pub use abort::AbortToken;
pub use cell::{PromiseHandler, State};
pub use executor::{Executor, SharedExecutor, Task};
pub use promise::{Builder, Promise};

/// Why a promise was rejected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Rejected(String),
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Custom(Arc<dyn StdError + Send + Sync>),
    #[error("promise was dropped before it settled")]
    ProducerDropped,
    #[error("{0} needs at least one promise")]
    EmptyInput(&'static str),
    #[error("executor unavailable: {0}")]
    ExecutorUnavailable(String),
}

impl Error {
    /// A rejection that carries only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Rejected(message.into())
    }

    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Custom(Arc::new(err))
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Error::Panicked(panic_message(payload))
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Rejected(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Rejected(message.to_owned())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::io;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::msg("nope").to_string(), "nope");
        assert_eq!(Error::from("nope").to_string(), "nope");
        assert_eq!(
            Error::EmptyInput("all").to_string(),
            "all needs at least one promise"
        );
        let io = Error::new(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        assert_eq!(io.to_string(), "disk on fire");
    }

    #[test]
    fn test_error_from_panic() {
        let payload = std::panic::catch_unwind(|| panic!("bad {}", 42)).unwrap_err();
        match Error::from_panic(payload.as_ref()) {
            Error::Panicked(message) => assert_eq!(message, "bad 42"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
