use std::sync::{Condvar, Mutex};

/// A level-triggered flag with `set`, `reset`, and blocking `wait`.
///
/// Safe for one waiter and many setters: the worker thread waits, and any
/// number of caller-context threads call `set` to wake it. `set` is
/// idempotent and `wait` returns immediately if the flag is already set,
/// matching `original_source`'s `set_event`/`reset_event`/`wait_event`
/// contract for driving the FS worker loop.
#[derive(Debug)]
pub struct WaitableFlag {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl WaitableFlag {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Sets the flag and wakes the single waiter, if any. Idempotent.
    pub fn set(&self) {
        let mut guard = self.state.lock().unwrap();
        if !*guard {
            *guard = true;
            self.condvar.notify_one();
        }
    }

    /// Clears the flag without waiting.
    pub fn reset(&self) {
        let mut guard = self.state.lock().unwrap();
        *guard = false;
    }

    /// Blocks until the flag is set, then returns without clearing it.
    /// Callers that loop on this are expected to `reset` once they've
    /// drained whatever the flag was signaling.
    pub fn wait(&self) {
        let mut guard = self.state.lock().unwrap();
        while !*guard {
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

impl Default for WaitableFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_if_already_set() {
        let flag = WaitableFlag::new();
        flag.set();
        flag.wait();
    }

    #[test]
    fn set_wakes_a_blocked_waiter() {
        let flag = Arc::new(WaitableFlag::new());
        let waiter = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            waiter.wait();
        });

        thread::sleep(Duration::from_millis(20));
        flag.set();
        handle.join().unwrap();
    }
}
