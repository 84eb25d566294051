//! The process-wide recursive hardware state lock.
//!
//! Serializes clock-registry and interface-registry mutations and any reads
//! that need cross-module consistency. Re-entrant: the hotplug rebind path
//! re-enters through registry calls that take the lock themselves.

use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A recursive mutex with RAII guards.
pub struct HardwareLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl HardwareLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Acquire, re-entering if the calling thread already holds it.
    pub fn lock(&self) -> HardwareGuard<'_> {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    break;
                }
                Some(_) => {
                    state = self.released.wait(state).unwrap();
                }
            }
        }
        HardwareGuard { lock: self }
    }

    /// Whether the calling thread currently holds the lock. Debug aid.
    pub fn held_by_current(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.owner == Some(std::thread::current().id())
    }

    fn unlock(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.owner, Some(std::thread::current().id()));
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
    }
}

impl Default for HardwareLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held proof of the hardware lock. Dropping releases one level.
pub struct HardwareGuard<'a> {
    lock: &'a HardwareLock,
}

impl Drop for HardwareGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reentrant_on_same_thread() {
        let lock = HardwareLock::new();
        let g1 = lock.lock();
        let g2 = lock.lock();
        assert!(lock.held_by_current());
        drop(g2);
        assert!(lock.held_by_current());
        drop(g1);
        assert!(!lock.held_by_current());
    }

    #[test]
    fn test_excludes_other_threads() {
        let lock = Arc::new(HardwareLock::new());
        let guard = lock.lock();
        let lock2 = Arc::clone(&lock);
        let (tx, rx) = std::sync::mpsc::channel();
        let t = std::thread::spawn(move || {
            let _g = lock2.lock();
            tx.send(()).unwrap();
        });
        // The other thread must not acquire while we hold.
        assert!(rx
            .recv_timeout(std::time::Duration::from_millis(50))
            .is_err());
        drop(guard);
        rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        t.join().unwrap();
    }
}
