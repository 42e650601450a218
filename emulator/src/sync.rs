//! Locking and signalling primitives shared by the processor, clock and device threads.

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

const LOCK_POLL: Duration = Duration::from_micros(200);

/// A mutex that can be acquired with a bounded wait
#[derive(Debug, Default)]
pub struct ControlLock<T> {
    inner: Mutex<T>,
}

impl<T> ControlLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Block until the lock is acquired
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to acquire the lock until `timeout` elapses
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(LOCK_POLL.min(deadline - now));
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A binary semaphore.
///
/// Notifying an already signalled semaphore does nothing; a wait consumes
/// the signal.
#[derive(Debug, Clone)]
pub struct Signal {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = bounded(1);
        Self { sender, receiver }
    }

    pub fn notify(&self) {
        // Full means it is already signalled
        let _ = self.sender.try_send(());
    }

    /// Wait for a signal, returning false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.receiver.recv_timeout(timeout).is_ok()
    }

    /// Consume a pending signal without waiting
    pub fn try_take(&self) -> bool {
        self.receiver.try_recv().is_ok()
    }
}
