//! Cancellation signal handed to deferred actions.
//!
//! Built on a `watch` channel so a single handle can fan the signal out to
//! every in-flight request.

use tokio::sync::watch;

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Idempotent; tokens created before or after the call all observe it.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken { rx: self.tx.subscribe() }
    }
}

impl Default for CancelHandle {
    fn default() -> Self { Self::new() }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_seen_by_existing_and_new_tokens() {
        let handle = CancelHandle::new();
        let before = handle.token();
        assert!(!before.is_cancelled());

        handle.cancel();
        handle.cancel();
        assert!(before.is_cancelled());
        assert!(handle.token().is_cancelled());
    }

    #[test]
    fn test_never_token() {
        assert!(!CancelToken::never().is_cancelled());
    }
}
