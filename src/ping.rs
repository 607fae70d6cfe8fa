//! Ping/pong liveness tracking (spec §4.5).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::channel::Executor;
use crate::error::Status;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result handed to a ping callback: the measured round-trip time, or a
/// status explaining why the ping could not complete.
pub type PingResult = Result<Duration, Status>;

struct PendingPing {
    callback: Box<dyn FnOnce(PingResult) + Send>,
    executor: Arc<dyn Executor>,
    started_at: Instant,
}

/// Correlates outbound pings with their responses and invokes user
/// callbacks on completion.
#[derive(Default)]
pub struct PingTracker {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingPing>>,
}

impl PingTracker {
    /// A fresh tracker with no pings in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and record a pending ping. The caller is responsible
    /// for actually sending `PING(id)` on the wire; if that send fails, call
    /// [`PingTracker::fail`] to invoke the callback with an error instead of
    /// leaking the pending entry.
    pub fn start(
        &self,
        callback: Box<dyn FnOnce(PingResult) + Send>,
        executor: Arc<dyn Executor>,
    ) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(
            id,
            PendingPing {
                callback,
                executor,
                started_at: Instant::now(),
            },
        );
        id
    }

    /// Fail a pending ping immediately (e.g. because the send itself
    /// failed), dispatching its callback on its executor.
    pub fn fail(&self, id: u32, status: Status) {
        if let Some(pending) = self.pending.lock().remove(&id) {
            dispatch(pending, Err(status));
        }
    }

    /// Handle an inbound `PING_RESPONSE(id)`. Unknown ids are ignored, per
    /// spec §4.5.
    pub fn on_response(&self, id: u32) {
        let Some(pending) = self.pending.lock().remove(&id) else {
            debug!(id, "ignoring PING_RESPONSE for unknown id");
            return;
        };
        let rtt = pending.started_at.elapsed();
        dispatch(pending, Ok(rtt));
    }

    /// Fail every pending ping with `status`, e.g. on transport shutdown.
    pub fn fail_all(&self, status: &Status) {
        let pending: Vec<_> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            dispatch(p, Err(status.clone()));
        }
    }
}

fn dispatch(pending: PendingPing, result: PingResult) {
    let PendingPing {
        callback, executor, ..
    } = pending;
    executor.execute(Box::new(move || callback(result)));
}

/// Reflect an inbound `PING(id)` back as a `PING_RESPONSE(id)` via `send`.
/// `send` is expected to be a best-effort, errors-ignored emission per spec
/// §4.5; failures are logged, not propagated.
pub fn reflect_ping(id: u32, send: impl FnOnce(u32) -> Result<(), Status>) {
    if let Err(status) = send(id) {
        warn!(id, %status, "failed to echo PING_RESPONSE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InlineExecutor;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn unknown_response_is_ignored() {
        let tracker = PingTracker::new();
        tracker.on_response(999); // must not panic
    }

    #[test]
    fn response_invokes_callback_with_rtt() {
        let tracker = PingTracker::new();
        let got = Arc::new(AtomicBool::new(false));
        let got2 = Arc::clone(&got);
        let id = tracker.start(
            Box::new(move |result| {
                assert!(result.is_ok());
                got2.store(true, Ordering::SeqCst);
            }),
            Arc::new(InlineExecutor),
        );
        tracker.on_response(id);
        assert!(got.load(Ordering::SeqCst));
    }

    #[test]
    fn fail_all_invokes_every_pending_callback() {
        let tracker = PingTracker::new();
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        for _ in 0..3 {
            let count2 = Arc::clone(&count);
            tracker.start(
                Box::new(move |result| {
                    assert!(result.is_err());
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
                Arc::new(InlineExecutor),
            );
        }
        tracker.fail_all(&Status::unavailable("shutting down"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
