//! Shrinkable admission gate.
//!
//! A counting semaphore that bounds how many loads run at once. Capacity
//! starts at a configured maximum and may only be reduced afterward, never
//! increased. Shrinks never revoke a token already on loan: when every
//! token is loaned out, the reduction is applied the next time a token
//! would be returned.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// Snapshot of the gate for monitoring.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    /// Current maximum concurrency.
    pub max_capacity: usize,
    /// Tokens on loan (acquired, not yet released).
    pub in_use: usize,
}

struct GateState {
    /// Current capacity ceiling. Only ever decreases.
    max_capacity: usize,
    /// Tokens available for acquisition.
    free: usize,
    /// Shrink requests waiting for a token to be returned.
    pending_shrink: usize,
}

/// Bounded admission gate with lazy capacity shrink.
///
/// `acquire` waits until a token is free and hands back an RAII
/// [`GatePermit`]; dropping the permit returns the token. There is no
/// timeout and no failure mode other than waiting — the gate applies
/// backpressure instead of failing fast. Callers that need a deadline
/// must wrap `acquire` themselves.
pub struct Gate {
    state: Mutex<GateState>,
    available: Notify,
}

impl Gate {
    /// Create a gate with `max_capacity` tokens, all free.
    ///
    /// A capacity of zero is allowed; every `acquire` on such a gate
    /// waits forever.
    pub fn new(max_capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                max_capacity,
                free: max_capacity,
                pending_shrink: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Wait for a free token and consume it.
    pub async fn acquire(&self) -> GatePermit<'_> {
        loop {
            if self.try_take() {
                return GatePermit { gate: self };
            }
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // A token may have been released between the check and
            // registration above; re-check before sleeping.
            if self.try_take() {
                return GatePermit { gate: self };
            }
            notified.await;
        }
    }

    fn try_take(&self) -> bool {
        let mut state = self.state.lock();
        if state.free > 0 {
            state.free -= 1;
            true
        } else {
            false
        }
    }

    /// Return a token. Called from [`GatePermit::drop`] only, so it runs
    /// exactly once per acquire, on every exit path of the protected work.
    fn release(&self) {
        let mut state = self.state.lock();
        if state.pending_shrink > 0 {
            // The returned token is consumed by a queued shrink instead
            // of becoming free again.
            state.pending_shrink -= 1;
            state.max_capacity -= 1;
            let max_capacity = state.max_capacity;
            drop(state);
            tracing::debug!(max_capacity, "gate capacity reduced");
        } else {
            state.free += 1;
            drop(state);
            self.available.notify_one();
        }
    }

    /// Permanently remove one token of capacity.
    ///
    /// If a token is free it is consumed immediately; otherwise the
    /// reduction takes effect the next time a token is released. Requests
    /// beyond zero remaining capacity are ignored.
    pub fn request_shrink(&self) {
        let mut state = self.state.lock();
        if state.free > 0 {
            state.free -= 1;
            state.max_capacity -= 1;
            let max_capacity = state.max_capacity;
            drop(state);
            tracing::debug!(max_capacity, "gate capacity reduced");
        } else if state.pending_shrink < state.max_capacity {
            state.pending_shrink += 1;
        }
        // else: capacity already headed to zero, nothing left to shrink
    }

    /// Atomic snapshot of capacity and occupancy.
    pub fn status(&self) -> GateStatus {
        let state = self.state.lock();
        GateStatus {
            max_capacity: state.max_capacity,
            in_use: state.max_capacity - state.free,
        }
    }
}

/// RAII admission token. Dropping it returns the token to the gate.
pub struct GatePermit<'a> {
    gate: &'a Gate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
