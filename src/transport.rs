//! The transport core: owns lifecycle, flow control, the call table and the
//! ping tracker; dispatches inbound transactions and serializes outbound
//! ones (spec §4.6, §4.7, §4.8).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::attributes::{Attributes, ParcelablePolicy};
use crate::call::Inbound;
use crate::call_table::CallTable;
use crate::channel::{Channel, DeathWatcher, Executor, ObjectRef, SecurityPolicy, TransactionReceiver};
use crate::error::Status;
use crate::flow::FlowController;
use crate::lifecycle::TransportState;
use crate::ping::{PingResult, PingTracker};
use crate::wire::{self, ControlPayload};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Role-specific behavior `TransportCore` calls back into. Both
/// `ClientTransport` and `ServerTransport` provide one of these; it is the
/// seam that keeps `TransportCore` itself role-agnostic.
pub trait RoleHooks: Send + Sync {
    /// Setup completed; attributes are final. Corresponds to
    /// `ManagedClientTransport.Listener::transport_ready` /
    /// `ServerTransportListener::transport_ready`.
    fn notify_ready(&self, attrs: &Attributes);
    /// The transport has begun shutting down.
    fn notify_shutdown(&self, status: &Status);
    /// The transport has fully terminated.
    fn notify_terminated(&self);
    /// A stream transaction arrived for `call_id` with no existing table
    /// entry. The server allocates an `Inbound` on first receipt; the
    /// client never does (it only ever receives for ids it allocated
    /// itself), so it returns `None`.
    fn create_inbound(&self, call_id: i32) -> Option<Arc<dyn Inbound>>;
    /// Only the client runs the inbound-`SETUP_TRANSPORT` handshake
    /// completion algorithm (spec §4.4); the server ignores it entirely.
    /// Returning `None` here is what makes that ignoring happen generically.
    fn security_policy(&self) -> Option<Arc<dyn SecurityPolicy>>;
    /// Client-only in-use accounting edge (spec §4.8); the server is a
    /// no-op here.
    fn on_unregistered(&self) {}
}

/// Construction-time configuration. The window constants are not here:
/// they are crate-level constants per spec §3/§4.2 in production; tests
/// that want different thresholds construct a `FlowController` directly.
pub struct TransportConfig {
    /// This process's own uid, used to derive the security level attribute.
    pub local_uid: i32,
    /// Executor used for `SecurityPolicy::check_authorization`, which may
    /// block and must never run under the transport lock.
    pub blocking_executor: Arc<dyn Executor>,
    /// Executor used to run role notification callbacks and deferred call
    /// closes off the transport lock.
    pub callback_executor: Arc<dyn Executor>,
}

struct LockedState {
    transport_state: TransportState,
    peer_sender: Option<ObjectRef>,
    shutdown_status: Option<Status>,
    terminated: bool,
    attributes: Attributes,
    death_watcher: Option<Arc<DeathRelay>>,
    receiver_detached: bool,
}

/// The transport core itself.
pub struct TransportCore {
    state: Mutex<LockedState>,
    flow: FlowController,
    calls: CallTable,
    ping: PingTracker,
    config: TransportConfig,
    next_call_id: AtomicI32,
    hooks: Arc<dyn RoleHooks>,
}

/// Relays a `Channel`'s death notification back into `shutdown`, the same
/// funnel every other transition goes through (spec §9).
struct DeathRelay {
    transport: Weak<TransportCore>,
}

impl DeathWatcher for DeathRelay {
    fn on_peer_death(&self) {
        if let Some(core) = self.transport.upgrade() {
            debug!("peer process died");
            core.shutdown(Status::unavailable("peer died"), true);
        }
    }
}

impl TransportCore {
    /// Construct a new transport core in `NotStarted`.
    pub fn new(
        config: TransportConfig,
        hooks: Arc<dyn RoleHooks>,
        local_address: Option<String>,
        remote_address: Option<String>,
        parcelable_policy: ParcelablePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockedState {
                transport_state: TransportState::NotStarted,
                peer_sender: None,
                shutdown_status: None,
                terminated: false,
                attributes: Attributes::initial(local_address, remote_address, parcelable_policy),
                death_watcher: None,
                receiver_detached: false,
            }),
            flow: FlowController::new(),
            calls: CallTable::new(),
            ping: PingTracker::new(),
            config,
            next_call_id: AtomicI32::new(wire::FIRST_CALL_ID),
            hooks,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn current_state(&self) -> TransportState {
        self.state.lock().transport_state
    }

    /// A snapshot of the current attributes.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        self.state.lock().attributes.clone()
    }

    /// Whether the transmit window currently has room. Readable without
    /// the transport lock (spec §4.2).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.flow.is_ready()
    }

    /// Access to the call table, for role layers that need to enumerate or
    /// probe it directly (e.g. client `new_stream`).
    #[must_use]
    pub fn calls(&self) -> &CallTable {
        &self.calls
    }

    /// Transition the FSM, panicking if the transition is not legal per
    /// spec §3 — any other transition is a programming error.
    pub fn transition_to(&self, next: TransportState) {
        let mut state = self.state.lock();
        Self::transition_locked(&mut state, next);
    }

    fn transition_locked(state: &mut LockedState, next: TransportState) {
        assert!(
            state.transport_state.can_transition_to(next),
            "illegal transport state transition {:?} -> {:?}",
            state.transport_state,
            next
        );
        debug!(from = ?state.transport_state, to = ?next, "transport state transition");
        state.transport_state = next;
    }

    /// Install the peer's sender reference and register a peer-death
    /// watcher. Called once setup has validated the peer. Returns
    /// `Unavailable` if the peer is already dead by the time we try to
    /// link to its death.
    pub fn install_peer_sender(self: &Arc<Self>, sender: ObjectRef) -> Result<(), Status> {
        let watcher = Arc::new(DeathRelay {
            transport: Arc::downgrade(self),
        });
        sender.link_to_death(Arc::clone(&watcher) as Arc<dyn DeathWatcher>)?;
        let mut state = self.state.lock();
        state.peer_sender = Some(sender);
        state.death_watcher = Some(watcher);
        Ok(())
    }

    fn peer_sender(&self) -> Option<ObjectRef> {
        self.state.lock().peer_sender.clone()
    }

    /// Allocate a fresh client-side call-id, wrapping per spec §3. Returns
    /// `Internal` if every id in the range is currently in flight (a
    /// pathological amount of concurrency, or a bug).
    pub fn allocate_call_id(&self) -> Result<i32, Status> {
        for _ in 0..=(wire::LAST_CALL_ID - wire::FIRST_CALL_ID) {
            // `current + 1` only ever executes when `current < LAST_CALL_ID`
            // (== i32::MAX), so the addition itself can never overflow; the
            // wrap back to FIRST_CALL_ID happens instead of the increment
            // whenever we're about to hand out the last id in the range.
            let id = self
                .next_call_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(if current >= wire::LAST_CALL_ID {
                        wire::FIRST_CALL_ID + 1
                    } else {
                        current + 1
                    })
                })
                .expect("update closure always returns Some");
            if self.calls.get(id).is_none() {
                return Ok(id);
            }
        }
        Err(Status::internal("no free call-id available"))
    }

    /// Register a new call, used by both the client (on `new_stream`) and
    /// the server (on first stream receipt). `Internal` on an id collision.
    pub fn register_call(&self, id: i32, inbound: Arc<dyn Inbound>) -> Result<(), Status> {
        if self.calls.put_if_absent(id, inbound).is_some() {
            return Err(Status::internal(format!("call-id {id} collision")));
        }
        Ok(())
    }

    /// Remove a call from the table (spec §4.8). If the table is now empty
    /// and we are `Shutdown`, schedule termination off this stack so we
    /// never acquire the transport lock while a call lock could still be
    /// held by the caller.
    pub fn unregister(self: &Arc<Self>, call_id: i32) {
        self.calls.remove(call_id);
        let now_empty = self.calls.is_empty();
        let should_terminate = {
            let state = self.state.lock();
            now_empty && state.transport_state == TransportState::Shutdown
        };
        self.hooks.on_unregistered();
        if should_terminate {
            let status = self
                .state
                .lock()
                .shutdown_status
                .clone()
                .unwrap_or_else(|| Status::unavailable("transport shut down"));
            let this = Arc::clone(self);
            self.config.callback_executor.execute(Box::new(move || {
                this.shutdown(status, true);
            }));
        }
    }

    /// Send one stream transaction's payload for `call_id`. Called by
    /// `Outbound` with no transport lock held (spec §4.7).
    pub fn send_stream(&self, call_id: i32, payload: Bytes) -> Result<(), Status> {
        self.send_stream_flagged(call_id, 0, payload)
    }

    /// Send an out-of-band abnormal close for `call_id`. Emission failures
    /// are logged, not propagated: the call is being closed regardless.
    pub fn send_out_of_band_close(&self, call_id: i32, status: &Status) {
        let body = Bytes::from(status.message.clone());
        if let Err(e) =
            self.send_stream_flagged(call_id, wire::FLAG_OUT_OF_BAND_CLOSE, body)
        {
            warn!(call_id, error = %e, "failed to send out-of-band close");
        }
    }

    fn send_stream_flagged(&self, call_id: i32, flags: i32, body: Bytes) -> Result<(), Status> {
        let sender = self
            .peer_sender()
            .ok_or_else(|| Status::failed_precondition("transport has no peer sender yet"))?;
        let header = wire::encode_stream_flags(flags);
        let mut buf = BytesMut::with_capacity(header.len() + body.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&body);
        // Count the same bytes `handle_stream` counts on the receive side
        // (the full transaction payload, flag header included), so the
        // peer's acks reconcile against what we actually recorded as sent.
        let len = buf.len() as u64;
        sender.transact(call_id, buf.freeze(), true)?;
        self.flow.record_sent(len);
        Ok(())
    }

    /// Send a control transaction. Used internally and by role layers for
    /// the setup handshake's outbound `SETUP_TRANSPORT`.
    pub fn send_control(&self, payload: &ControlPayload) -> Result<(), Status> {
        let sender = self
            .peer_sender()
            .ok_or_else(|| Status::failed_precondition("transport has no peer sender yet"))?;
        Self::send_control_to(&sender, payload)
    }

    /// Send a control transaction to an explicit peer reference, used
    /// before `peer_sender` is installed (the client's first
    /// `SETUP_TRANSPORT`, the server's reply).
    pub fn send_control_to(peer: &ObjectRef, payload: &ControlPayload) -> Result<(), Status> {
        match payload {
            ControlPayload::Setup {
                wire_version,
                peer_receiver,
            } => peer.transact_setup(*wire_version, Arc::clone(peer_receiver)),
            other => peer.transact(other.code(), other.encode(), true),
        }
    }

    /// Start a ping. `FailedPrecondition` if not `Ready`.
    pub fn ping(
        &self,
        callback: Box<dyn FnOnce(PingResult) + Send>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), Status> {
        if self.current_state() != TransportState::Ready {
            return Err(Status::failed_precondition("transport is not ready"));
        }
        let id = self.ping.start(callback, executor);
        if let Err(e) = self.send_control(&ControlPayload::Ping(id)) {
            self.ping.fail(id, e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// The single inbound dispatch entry point (spec §4.6). Once the local
    /// receiver has been detached (spec §4.1 step 2, on reaching
    /// `ShutdownTerminated`), every further inbound transaction is dropped
    /// here instead of being handed to `handle_control`/`handle_stream`.
    fn dispatch(self: &Arc<Self>, code: i32, raw_payload: Bytes, setup: Option<ControlPayload>) {
        if self.state.lock().receiver_detached {
            trace!(code, "dropping transaction; receiver is detached");
            return;
        }
        if !wire::is_call_id(code) {
            self.handle_control(code, raw_payload, setup);
        } else {
            self.handle_stream(code, raw_payload);
        }
    }

    fn handle_control(self: &Arc<Self>, code: i32, raw_payload: Bytes, setup: Option<ControlPayload>) {
        match code {
            wire::SETUP_TRANSPORT => self.handle_setup(setup),
            wire::SHUTDOWN_TRANSPORT => {
                self.shutdown(Status::unavailable("transport shutdown by peer"), true);
            }
            wire::ACKNOWLEDGE_BYTES => match wire::decode_acknowledge_bytes(raw_payload) {
                Ok(n) => {
                    if self.flow.on_peer_ack(n) {
                        self.calls.notify_all_ready();
                    }
                }
                Err(e) => warn!(error = %e, "malformed ACKNOWLEDGE_BYTES"),
            },
            wire::PING => match wire::decode_ping_id(raw_payload) {
                Ok(id) => {
                    if self.current_state() == TransportState::Ready {
                        crate::ping::reflect_ping(id, |id| {
                            self.send_control(&ControlPayload::PingResponse(id))
                        });
                    } else {
                        trace!(id, "dropping PING outside Ready");
                    }
                }
                Err(e) => warn!(error = %e, "malformed PING"),
            },
            wire::PING_RESPONSE => match wire::decode_ping_id(raw_payload) {
                Ok(id) => self.ping.on_response(id),
                Err(e) => warn!(error = %e, "malformed PING_RESPONSE"),
            },
            _ => trace!(code, "unhandled control transaction"),
        }
    }

    fn handle_setup(self: &Arc<Self>, setup: Option<ControlPayload>) {
        let Some(policy) = self.hooks.security_policy() else {
            trace!("ignoring inbound SETUP_TRANSPORT (not expected by this role)");
            return;
        };
        let Some(ControlPayload::Setup {
            wire_version,
            peer_receiver,
        }) = setup
        else {
            self.shutdown(Status::unavailable("malformed SETUP_TRANSPORT"), true);
            return;
        };
        let remote_uid = match peer_receiver.caller_uid() {
            Some(uid) => uid,
            None => {
                self.shutdown(Status::unauthenticated("peer caller uid unavailable"), true);
                return;
            }
        };
        {
            let mut state = self.state.lock();
            state.attributes.remote_uid = Some(remote_uid);
        }
        if !wire::is_supported_version(wire_version) {
            self.shutdown(wire::version_mismatch_status(), true);
            return;
        }
        let local_uid = self.config.local_uid;
        let this = Arc::clone(self);
        self.config.blocking_executor.execute(Box::new(move || {
            let decision = policy.check_authorization(remote_uid);
            this.finish_setup(decision, remote_uid, local_uid, peer_receiver);
        }));
    }

    fn finish_setup(
        self: &Arc<Self>,
        decision: Status,
        remote_uid: i32,
        local_uid: i32,
        peer_receiver: ObjectRef,
    ) {
        if self.current_state() != TransportState::Setup {
            // Shut down (or torn down) while authorization was in flight.
            return;
        }
        if !decision.is_ok() {
            self.shutdown(decision, true);
            return;
        }
        if let Err(e) = self.install_peer_sender(peer_receiver) {
            self.shutdown(e, true);
            return;
        }
        {
            let mut state = self.state.lock();
            state.attributes.apply_setup_identity(remote_uid, local_uid);
            Self::transition_locked(&mut state, TransportState::Ready);
        }
        let attrs = self.attributes();
        self.hooks.notify_ready(&attrs);
    }

    fn handle_stream(self: &Arc<Self>, call_id: i32, raw_payload: Bytes) {
        let len = raw_payload.len() as u64;
        let inbound = match self.calls.get(call_id) {
            Some(inbound) => Some(inbound),
            None => {
                let state_ok = {
                    let state = self.state.lock();
                    !state.transport_state.is_shutdown()
                };
                if !state_ok {
                    None
                } else if let Some(created) = self.hooks.create_inbound(call_id) {
                    match self.calls.put_if_absent(call_id, created) {
                        Some(existing) => Some(existing),
                        None => self.calls.get(call_id),
                    }
                } else {
                    None
                }
            }
        };
        if let Some(inbound) = inbound {
            match wire::decode_stream_flags(raw_payload) {
                Ok((flags, body)) => inbound.handle_transaction(flags, body),
                Err(e) => warn!(call_id, error = %e, "malformed stream transaction"),
            }
        } else {
            trace!(call_id, "dropping stream transaction for unknown call");
        }
        if self.flow.record_received(len) {
            if let Err(e) = self.send_control(&ControlPayload::AcknowledgeBytes(
                self.flow.emit_ack(),
            )) {
                warn!(error = %e, "failed to emit ACKNOWLEDGE_BYTES");
            }
        }
    }

    /// Shut the transport down (spec §4.1). The first call's status is
    /// canonical; later calls advance termination but never overwrite it.
    pub fn shutdown(self: &Arc<Self>, status: Status, force_terminate: bool) {
        let first_time = {
            let mut state = self.state.lock();
            if state.shutdown_status.is_none() {
                state.shutdown_status = Some(status.clone());
                Self::transition_locked(&mut state, TransportState::Shutdown);
                true
            } else {
                false
            }
        };
        if first_time {
            let canonical = self.state.lock().shutdown_status.clone().unwrap();
            self.hooks.notify_shutdown(&canonical);
            self.ping.fail_all(&canonical);
        }
        self.maybe_terminate(force_terminate);
    }

    /// Named, public alias for a forced shutdown (supplemented per
    /// SPEC_FULL.md's "shutdown_now").
    pub fn shutdown_now(self: &Arc<Self>, status: Status) {
        self.shutdown(status, true);
    }

    fn maybe_terminate(self: &Arc<Self>, force_terminate: bool) {
        let should_terminate = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            if force_terminate || self.calls.is_empty() {
                state.terminated = true;
                state.receiver_detached = true;
                true
            } else {
                false
            }
        };
        if !should_terminate {
            return;
        }
        {
            let mut state = self.state.lock();
            Self::transition_locked(&mut state, TransportState::ShutdownTerminated);
            if let (Some(sender), Some(watcher)) =
                (state.peer_sender.clone(), state.death_watcher.clone())
            {
                sender.unlink_to_death(&(watcher as Arc<dyn DeathWatcher>));
            }
        }
        // Best-effort notice to the peer; errors ignored.
        if let Err(e) = self.send_control(&ControlPayload::Shutdown) {
            trace!(error = %e, "failed to notify peer of shutdown (ignored)");
        }
        let snapshot = self.calls.snapshot_and_clear();
        let status = self
            .state
            .lock()
            .shutdown_status
            .clone()
            .unwrap_or_else(|| Status::unavailable("transport shut down"));
        let this = Arc::clone(self);
        self.config.callback_executor.execute(Box::new(move || {
            for (_, inbound) in snapshot {
                inbound.close_abnormal(status.clone());
            }
            this.hooks.notify_terminated();
        }));
    }
}

/// An `Arc<TransportCore>`-holding adapter implementing
/// [`TransactionReceiver`], the object actually registered with a
/// [`Channel`] as the local receiver.
#[derive(Clone)]
pub struct TransactionReceiverHandle(pub Arc<TransportCore>);

impl TransactionReceiver for TransactionReceiverHandle {
    fn on_transaction(&self, code: i32, raw_payload: Bytes, setup: Option<ControlPayload>) {
        self.0.dispatch(code, raw_payload, setup);
    }
}
