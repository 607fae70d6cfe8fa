//! Credit-based flow control over the shared transport window (spec §4.2).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cap on unacknowledged outbound bytes.
pub const W_OUT: u64 = 128 * 1024;
/// Received-byte delta that forces emission of an acknowledgement.
pub const W_ACK: u64 = 16 * 1024;

/// `a` advanced to `b` unless that would be a regression, tolerating
/// out-of-order ack delivery while never letting the counter go backwards.
///
/// Uses a wrapping signed subtraction so a 64-bit counter wraparound (never
/// reached in practice, but part of the stated contract) doesn't falsely
/// read as a regression.
#[inline]
#[must_use]
pub fn wrap_aware_max(a: u64, b: u64) -> u64 {
    if (a.wrapping_sub(b) as i64) < 0 {
        b
    } else {
        a
    }
}

/// Tracks the four byte counters for one transport and decides when the
/// send path must stall or an ack must be emitted.
///
/// All four counters are atomics so `transmit_window_full` and the raw byte
/// totals can be read from stream code without acquiring the transport
/// lock (per spec §5's "unlocked reads" requirement); the convention is
/// that `bytes_sent_acked`/`bytes_received_acked` are only ever *written*
/// while holding the transport lock, matching `on_peer_ack`/`emit_ack`'s
/// documented call sites.
#[derive(Debug, Default)]
pub struct FlowController {
    bytes_sent: AtomicU64,
    bytes_sent_acked: AtomicU64,
    bytes_received: AtomicU64,
    bytes_received_acked: AtomicU64,
    transmit_window_full: AtomicBool,
}

impl FlowController {
    /// New controller, all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that we sent `n` more bytes. Returns the new `bytes_sent`
    /// total. Sets `transmit_window_full` if the unacked gap now exceeds
    /// [`W_OUT`].
    pub fn record_sent(&self, n: u64) -> u64 {
        let new = self.bytes_sent.fetch_add(n, Ordering::Relaxed) + n;
        let acked = self.bytes_sent_acked.load(Ordering::Relaxed);
        if new.saturating_sub(acked) > W_OUT {
            self.transmit_window_full.store(true, Ordering::Relaxed);
        }
        new
    }

    /// Record that we received `n` more bytes from the peer. Returns
    /// whether an ack should now be sent.
    pub fn record_received(&self, n: u64) -> bool {
        let new = self.bytes_received.fetch_add(n, Ordering::Relaxed) + n;
        let acked = self.bytes_received_acked.load(Ordering::Relaxed);
        new.saturating_sub(acked) > W_ACK
    }

    /// Apply a peer-reported `bytes_sent_acked` value. Must be called while
    /// holding the transport lock. Returns `true` if the transmit window
    /// was full and has just become not-full, meaning every call in the
    /// table should be woken via `on_transport_ready`.
    pub fn on_peer_ack(&self, peer_reported: u64) -> bool {
        let current = self.bytes_sent_acked.load(Ordering::Relaxed);
        let updated = wrap_aware_max(current, peer_reported);
        self.bytes_sent_acked.store(updated, Ordering::Relaxed);
        let sent = self.bytes_sent.load(Ordering::Relaxed);
        let now_full = sent.saturating_sub(updated) > W_OUT;
        let was_full = self.transmit_window_full.swap(now_full, Ordering::Relaxed);
        was_full && !now_full
    }

    /// Snapshot `bytes_received` into `bytes_received_acked` and return the
    /// snapshot to encode into an `ACKNOWLEDGE_BYTES` transaction. Must be
    /// called while holding the transport lock.
    pub fn emit_ack(&self) -> u64 {
        let snapshot = self.bytes_received.load(Ordering::Relaxed);
        self.bytes_received_acked.store(snapshot, Ordering::Relaxed);
        snapshot
    }

    /// Whether the transmit window currently has room; readable without the
    /// transport lock.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.transmit_window_full.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_aware_max_tolerates_reordering() {
        assert_eq!(wrap_aware_max(100, 50), 100);
        assert_eq!(wrap_aware_max(100, 150), 150);
        assert_eq!(wrap_aware_max(100, 100), 100);
    }

    #[test]
    fn window_fills_and_drains() {
        let flow = FlowController::new();
        flow.record_sent(W_OUT - 1);
        assert!(flow.is_ready());
        flow.record_sent(2);
        assert!(!flow.is_ready());
        assert_eq!(flow.bytes_sent(), W_OUT + 1);

        // A partial ack that doesn't close the gap keeps us stalled.
        let woke = flow.on_peer_ack(10);
        assert!(!woke);
        assert!(!flow.is_ready());

        // Full ack drains the window and reports the wakeup edge exactly once.
        let woke = flow.on_peer_ack(W_OUT + 1);
        assert!(woke);
        assert!(flow.is_ready());

        // A later ack for the same (or a stale) total does not re-report.
        let woke_again = flow.on_peer_ack(W_OUT + 1);
        assert!(!woke_again);
    }

    #[test]
    fn ack_threshold_triggers_once_crossed() {
        let flow = FlowController::new();
        assert!(!flow.record_received(W_ACK));
        assert!(flow.record_received(1));
        let snapshot = flow.emit_ack();
        assert_eq!(snapshot, W_ACK + 1);
        assert!(!flow.record_received(10));
    }

    #[test]
    fn stale_ack_does_not_regress_acked_counter() {
        let flow = FlowController::new();
        flow.record_sent(1000);
        flow.on_peer_ack(900);
        // A reordered, older ack report must not move us backwards.
        flow.on_peer_ack(100);
        assert_eq!(
            flow.bytes_sent_acked.load(std::sync::atomic::Ordering::Relaxed),
            900
        );
    }
}
