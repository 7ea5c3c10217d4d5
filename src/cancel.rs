use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a caller and a running
/// `encode` / `decode`.  Cloning shares the same underlying flag.
///
/// Work is only abandoned at block boundaries; nothing partial is ever
/// handed back as complete.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// `true` when an optional flag is present and raised.
#[inline]
pub(crate) fn is_cancelled(flag: Option<&CancelFlag>) -> bool {
    flag.map_or(false, CancelFlag::is_cancelled)
}
