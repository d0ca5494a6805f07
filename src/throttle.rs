use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::HttpError;
use crate::progress::CancelToken;
use crate::util::lock_unpoisoned;

// Waiters wake on this cadence to observe cancellation even when nobody
// releases the gate.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Mutual exclusion over string keys. A key is either free or held by exactly
/// one caller; waiters block cooperatively and respond to cancellation.
struct KeyedGate {
    busy: Mutex<HashSet<String>>,
    condvar: Condvar,
}

impl KeyedGate {
    fn new() -> Self {
        Self {
            busy: Mutex::new(HashSet::new()),
            condvar: Condvar::new(),
        }
    }

    fn acquire(self: &Arc<Self>, key: &str, cancel: &CancelToken) -> Result<KeyGuard, HttpError> {
        let mut busy = lock_unpoisoned(&self.busy);
        loop {
            if cancel.is_cancelled() {
                return Err(HttpError::Disconnected);
            }
            if !busy.contains(key) {
                busy.insert(key.to_owned());
                return Ok(KeyGuard {
                    gate: Arc::clone(self),
                    key: key.to_owned(),
                    released: false,
                });
            }
            busy = match self.condvar.wait_timeout(busy, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn release(&self, key: &str) {
        let mut busy = lock_unpoisoned(&self.busy);
        busy.remove(key);
        self.condvar.notify_all();
    }
}

struct KeyGuard {
    gate: Arc<KeyedGate>,
    key: String,
    released: bool,
}

impl KeyGuard {
    fn release(&mut self) {
        if !self.released {
            self.gate.release(&self.key);
            self.released = true;
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Holds a destination's single-connection slot. Dropping the guard frees the
/// slot and wakes blocked waiters.
pub(crate) struct SlotGuard {
    _guard: KeyGuard,
}

/// Serializes connection acquisition per logical destination and spaces
/// consecutive requests to the same host authority.
#[derive(Clone)]
pub(crate) struct ConnectionThrottle {
    slots: Arc<KeyedGate>,
    delays: Arc<KeyedGate>,
}

impl ConnectionThrottle {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(KeyedGate::new()),
            delays: Arc::new(KeyedGate::new()),
        }
    }

    /// Blocks until the destination's single connection slot is free, then
    /// claims it for the caller.
    pub(crate) fn acquire_slot(
        &self,
        destination: &str,
        cancel: &CancelToken,
    ) -> Result<SlotGuard, HttpError> {
        let guard = self.slots.acquire(destination, cancel)?;
        Ok(SlotGuard { _guard: guard })
    }

    /// Enforces the minimum inter-request delay for a host. The per-host lock
    /// is held across the sleep, so concurrent callers to the same host are
    /// spaced by at least `delay` even when they belong to different logical
    /// destinations.
    pub(crate) fn wait_delay(
        &self,
        authority: &str,
        delay: Duration,
        cancel: &CancelToken,
    ) -> Result<(), HttpError> {
        if delay.is_zero() {
            return Ok(());
        }
        let mut guard = self.delays.acquire(authority, cancel)?;
        let deadline = Instant::now() + delay;
        loop {
            if cancel.is_cancelled() {
                guard.release();
                return Err(HttpError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(WAIT_SLICE.min(deadline - now));
        }
        guard.release();
        Ok(())
    }
}
