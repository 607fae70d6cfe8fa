//! Per-call collaborator interfaces (spec §3, §6).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `Inbound`/`Outbound` frame per-stream payloads; that framing is out of
//! scope for this crate (spec §1). What lives here is the capability
//! surface the transport core drives them through, plus a minimal
//! queue-backed `Inbound` implementation for tests and simple consumers.

use crate::error::Status;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Receives framed transaction payloads for one call, and is told about
/// transport-level events that matter to a stalled writer.
pub trait Inbound: Send + Sync {
    /// Deliver one inbound stream transaction's payload (after the flag
    /// header has been stripped) and the flags it carried.
    fn handle_transaction(&self, flags: i32, payload: Bytes);

    /// The transport's transmit window has just opened up; wake whatever
    /// was waiting to write.
    fn on_transport_ready(&self);

    /// The call is being closed out from under its owner (transport
    /// shutdown, peer reset, dropped channel). No further transactions
    /// will be delivered after this.
    fn close_abnormal(&self, status: Status);
}

/// Produces outbound framed transactions for one call.
pub trait Outbound: Send + Sync {
    /// Send one stream transaction's payload.
    fn send(&self, payload: Bytes) -> Result<(), Status>;

    /// Send an abnormal close, out of band, for this call.
    fn send_out_of_band_close(&self, status: &Status);
}

/// A simple FIFO-backed `Inbound`: every delivered transaction is pushed
/// onto a queue a consumer can drain. Used by the integration tests and
/// suitable as a minimal real implementation for callers that don't need
/// their own framing.
#[derive(Debug, Default)]
pub struct QueueInbound {
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<(i32, Bytes)>,
    closed: Option<Status>,
    ready_count: u64,
}

impl QueueInbound {
    /// A fresh, empty queue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pop the oldest undelivered `(flags, payload)` pair, if any.
    pub fn pop(&self) -> Option<(i32, Bytes)> {
        self.state.lock().queue.pop_front()
    }

    /// The abnormal-close status, if the call was closed.
    pub fn closed_status(&self) -> Option<Status> {
        self.state.lock().closed.clone()
    }

    /// How many times `on_transport_ready` has fired.
    pub fn ready_count(&self) -> u64 {
        self.state.lock().ready_count
    }
}

impl Inbound for QueueInbound {
    fn handle_transaction(&self, flags: i32, payload: Bytes) {
        self.state.lock().queue.push_back((flags, payload));
    }

    fn on_transport_ready(&self) {
        self.state.lock().ready_count += 1;
    }

    fn close_abnormal(&self, status: Status) {
        let mut state = self.state.lock();
        if state.closed.is_none() {
            state.closed = Some(status);
        }
    }
}
