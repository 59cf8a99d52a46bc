use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Kill switch shared by every promise chained off the same root.
///
/// Raising it never stops work that is already running; it only keeps
/// callbacks that have not been delivered yet from ever running.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    raised: Arc<AtomicBool>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the token. Calling this more than once has no further effect.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Whether both tokens guard the same chain.
    pub fn same_chain(&self, other: &AbortToken) -> bool {
        Arc::ptr_eq(&self.raised, &other.raised)
    }
}
