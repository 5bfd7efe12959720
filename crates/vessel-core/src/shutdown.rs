use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// One-shot "teardown finished" signal that both threads and tasks can wait on.
///
/// The flag is always read under the lock before waiting, so a signal that
/// lands between a waiter's check and its wait is never lost.
pub struct ShutdownCoordinator {
    signaled: Mutex<bool>,
    done: Condvar,
    notify: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            done: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Arm for a new teardown.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Mark teardown complete and wake every waiter. Returns false when the
    /// signal had already been given.
    pub fn signal(&self) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            return false;
        }
        *signaled = true;
        self.done.notify_all();
        self.notify.notify_waiters();
        true
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block the calling thread until signaled.
    pub fn wait_blocking(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.done.wait(&mut signaled);
        }
    }

    /// Block up to `timeout`. Returns whether the signal was observed.
    pub fn wait_blocking_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.done.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        *signaled
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent signal is not missed.
            notified.as_mut().enable();
            if *self.signaled.lock() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
