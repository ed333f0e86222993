//! Cooperative cancellation token
//!
//! Cancellation is checked at iteration boundaries and never interrupts
//! work in flight. Blocking queue operations wait on
//! [`CancelToken::as_receiver`] inside a `crossbeam::select!`: the receiver
//! disconnects (and therefore becomes ready) the moment `cancel` is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{CapflowError, Result};

struct TokenState {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Clonable cancellation signal shared between a caller and workers
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = channel::bounded(0);
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            // Dropping the only sender wakes every select! waiting on the signal
            self.state.trigger.lock().take();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once cancellation has been requested
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CapflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Receiver that becomes ready (disconnected) when the token is cancelled
    pub fn as_receiver(&self) -> &Receiver<()> {
        &self.state.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        assert!(token.check().is_ok());

        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_receiver_wakes_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || {
            // Blocks until disconnect
            waiter.as_receiver().recv().is_err()
        });
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_receiver_not_ready_before_cancel() {
        let token = CancelToken::new();
        assert!(token
            .as_receiver()
            .recv_timeout(Duration::from_millis(10))
            .unwrap_err()
            .is_timeout());
    }
}
