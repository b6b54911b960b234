//! Thread-safe mailbox for dynamically arriving requests
//!
//! A producer thread submits requests as they "arrive"; the scheduling loop
//! drains them between ticks. `mark_done` signals that no more arrivals are
//! coming, so the loop can distinguish "idle for now" from "finished".

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::serving::request::Request;

struct QueueState {
    pending: Vec<Request>,
    done: bool,
}

pub struct ArrivalQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl Default for ArrivalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrivalQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                done: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a request and wake one waiter. Non-blocking.
    pub fn submit(&self, request: Request) {
        self.lock().pending.push(request);
        self.cv.notify_one();
    }

    /// Atomically take every pending request.
    pub fn drain(&self) -> Vec<Request> {
        std::mem::take(&mut self.lock().pending)
    }

    /// Block until work arrives, the producer signals done, or the timeout
    /// elapses. Returns true when woken by work or completion.
    pub fn wait_for_arrivals(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, result) = self
            .cv
            .wait_timeout_while(state, timeout, |s| s.pending.is_empty() && !s.done)
            .unwrap_or_else(|e| e.into_inner());
        drop(state);
        !result.timed_out()
    }

    /// Producer is finished; wakes every waiter.
    pub fn mark_done(&self) {
        self.lock().done = true;
        self.cv.notify_all();
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Clear queued requests and the done flag for reuse.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.done = false;
    }
}
