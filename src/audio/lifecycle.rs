//! Process lifecycle and worker wake protocol
//!
//! Tracks Starting → Running → ShuttingDown (terminal) and owns the condvar
//! the worker sleeps on between iterations. The realtime callback wakes the
//! worker with a non-blocking try-lock so it is never delayed by contention;
//! a missed wake is recovered on the next period.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

/// Process state. ShuttingDown is terminal: no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Starting = 0,
    Running = 1,
    ShuttingDown = 2,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Starting,
            1 => LifecycleState::Running,
            _ => LifecycleState::ShuttingDown,
        }
    }
}

/// Shared lifecycle state plus the worker's wake condition.
pub struct Lifecycle {
    state: AtomicU8,
    wake: Mutex<()>,
    cond: Condvar,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Starting as u8),
            wake: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` unless already shutting down.
    pub fn advance(&self, next: LifecycleState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if cur == LifecycleState::ShuttingDown as u8 {
                    None
                } else {
                    Some(next as u8)
                }
            });
    }

    /// Request cooperative shutdown and wake a waiting worker.
    ///
    /// Safe from a signal-handler context in the flag-plus-notify sense:
    /// no lock is taken, only the state store and a condvar notify.
    pub fn request_shutdown(&self) {
        self.advance(LifecycleState::ShuttingDown);
        self.cond.notify_all();
    }

    /// Opportunistic wake from the realtime callback: notify only if the
    /// wake lock can be acquired without blocking. The worker holds this
    /// lock while busy, so contention here just means it is already awake.
    pub fn try_wake(&self) {
        if let Ok(_guard) = self.wake.try_lock() {
            self.cond.notify_one();
        }
    }

    /// Acquire the wake lock for the worker loop.
    pub fn worker_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.wake.lock().map_err(|_| anyhow!("wake lock poisoned"))
    }

    /// Block the worker until the next wake or shutdown notification.
    pub fn wait<'a>(&self, guard: MutexGuard<'a, ()>) -> Result<MutexGuard<'a, ()>> {
        self.cond
            .wait(guard)
            .map_err(|_| anyhow!("wake lock poisoned"))
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_starts_in_starting() {
        let lc = Lifecycle::new();
        assert_eq!(lc.state(), LifecycleState::Starting);
    }

    #[test]
    fn test_normal_progression() {
        let lc = Lifecycle::new();
        lc.advance(LifecycleState::Running);
        assert_eq!(lc.state(), LifecycleState::Running);
        lc.request_shutdown();
        assert_eq!(lc.state(), LifecycleState::ShuttingDown);
    }

    #[test]
    fn test_shutting_down_is_terminal() {
        let lc = Lifecycle::new();
        lc.request_shutdown();
        lc.advance(LifecycleState::Running);
        assert_eq!(
            lc.state(),
            LifecycleState::ShuttingDown,
            "no transition may leave ShuttingDown"
        );
    }

    #[test]
    fn test_try_wake_skips_while_worker_busy() {
        let lc = Lifecycle::new();
        // Simulate a busy worker holding the wake lock
        let _busy = lc.worker_guard().unwrap();
        // Must return immediately without deadlocking
        lc.try_wake();
    }

    #[test]
    fn test_shutdown_wakes_waiting_worker() {
        let lc = Arc::new(Lifecycle::new());
        lc.advance(LifecycleState::Running);

        let lc2 = Arc::clone(&lc);
        let worker = std::thread::spawn(move || {
            let mut guard = lc2.worker_guard().unwrap();
            while lc2.state() == LifecycleState::Running {
                guard = lc2.wait(guard).unwrap();
            }
        });

        std::thread::sleep(Duration::from_millis(50));
        lc.request_shutdown();
        worker.join().unwrap();
    }
}
