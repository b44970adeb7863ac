//! Process-wide lock table with per-thread ownership.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// A lock resource: variable name plus raw subscripts.
pub type LockName = (Vec<u8>, Vec<Vec<u8>>);

#[derive(Debug)]
struct Holder {
    owner: ThreadId,
    count: u32,
}

/// Reentrant named locks that block other threads until released.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashMap<LockName, Holder>>,
    released: Condvar,
}

impl LockTable {
    /// Increments `name` for `owner`, waiting up to `timeout` while another thread holds it.
    ///
    /// Returns false on timeout.
    pub fn incr(&self, owner: ThreadId, name: LockName, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        loop {
            match held.get_mut(&name) {
                None => {
                    held.insert(name, Holder { owner, count: 1 });
                    return true;
                }
                Some(h) if h.owner == owner => {
                    h.count += 1;
                    return true;
                }
                Some(_) => {
                    if self.released.wait_until(&mut held, deadline).timed_out() {
                        return false;
                    }
                }
            }
        }
    }

    /// Decrements `name` if `owner` holds it; unheld locks are ignored.
    pub fn decr(&self, owner: ThreadId, name: &LockName) {
        let mut held = self.held.lock();
        if let Some(h) = held.get_mut(name) {
            if h.owner != owner {
                return;
            }
            h.count -= 1;
            if h.count == 0 {
                held.remove(name);
                self.released.notify_all();
            }
        }
    }

    /// Releases everything `owner` holds, then acquires all of `names` at count one.
    ///
    /// Acquisition is all-or-nothing; returns false if the set could not be
    /// acquired before `timeout`.
    pub fn replace_all(&self, owner: ThreadId, names: Vec<LockName>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|_, h| h.owner != owner);
        if held.len() != before {
            self.released.notify_all();
        }
        loop {
            let blocked = names
                .iter()
                .any(|n| held.get(n).is_some_and(|h| h.owner != owner));
            if !blocked {
                for name in names {
                    held.entry(name).or_insert(Holder { owner, count: 0 }).count = 1;
                }
                return true;
            }
            if self.released.wait_until(&mut held, deadline).timed_out() {
                return false;
            }
        }
    }

    /// Returns the count `owner` holds on `name`.
    pub fn count(&self, owner: ThreadId, name: &LockName) -> u32 {
        self.held
            .lock()
            .get(name)
            .filter(|h| h.owner == owner)
            .map_or(0, |h| h.count)
    }
}
