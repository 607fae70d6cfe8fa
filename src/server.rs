//! The server role: accepts an already-supplied peer sender reference,
//! emits `SETUP_TRANSPORT` on `set_listener`, and creates `Inbound`s for
//! stream transactions arriving with unknown call-ids (spec §4.4 server
//! order, §4.6).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::attributes::{Attributes, ParcelablePolicy};
use crate::call::Inbound;
use crate::channel::{ObjectRef, SecurityPolicy};
use crate::error::Status;
use crate::lifecycle::TransportState;
use crate::transport::{RoleHooks, TransactionReceiverHandle, TransportConfig, TransportCore};
use crate::wire::ControlPayload;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Notified of server transport lifecycle events and new streams (spec §6,
/// `ServerTransportListener`).
pub trait ServerTransportListener: Send + Sync {
    /// Setup completed. The listener may adjust and return the final
    /// attribute set (mirroring the source's `transport_ready(attrs) ->
    /// attrs`).
    fn transport_ready(&self, attrs: Attributes) -> Attributes;
    /// A new stream arrived: the freshly-created `Inbound`'s call-id, plus
    /// whatever framing metadata the stream-framing collaborator already
    /// peeled off (method name, headers) before this point. Out of scope
    /// for this crate (spec §1); the call-id is all the core itself knows.
    fn stream_created(&self, call_id: i32);
    /// The transport has fully terminated.
    fn transport_terminated(&self);
}

/// A factory for the per-stream `Inbound` the server creates on first
/// receipt of a stream transaction for a given call-id. Supplied by the
/// higher-level RPC framework (spec §1: per-stream framing is out of
/// scope here).
pub trait InboundFactory: Send + Sync {
    /// Create the `Inbound` for a freshly-observed `call_id`.
    fn create(&self, call_id: i32) -> Arc<dyn Inbound>;
}

struct ServerHooks {
    listener: Mutex<Option<Arc<dyn ServerTransportListener>>>,
    inbound_factory: Arc<dyn InboundFactory>,
    pending_attrs: Mutex<Option<Attributes>>,
}

impl RoleHooks for ServerHooks {
    fn notify_ready(&self, _attrs: &Attributes) {
        // The server's own `handle_setup` path is never taken (its
        // `security_policy()` is `None`); readiness is driven directly by
        // `ServerTransport::set_listener` instead.
    }

    fn notify_shutdown(&self, _status: &Status) {
        // No standalone "shutdown started" callback on the server listener
        // interface (spec §6); only `transport_terminated` is exposed.
    }

    fn notify_terminated(&self) {
        if let Some(listener) = self.listener.lock().clone() {
            listener.transport_terminated();
        }
    }

    fn create_inbound(&self, call_id: i32) -> Option<Arc<dyn Inbound>> {
        let inbound = self.inbound_factory.create(call_id);
        if let Some(listener) = self.listener.lock().clone() {
            listener.stream_created(call_id);
        }
        Some(inbound)
    }

    fn security_policy(&self) -> Option<Arc<dyn SecurityPolicy>> {
        // The server never processes an inbound SETUP_TRANSPORT; it only
        // ever sends one (spec §4.4).
        None
    }
}

/// The server-side transport. Constructed with the peer's sender reference
/// already supplied by the binding front door (spec §4.4).
pub struct ServerTransport {
    core: Arc<TransportCore>,
    hooks: Arc<ServerHooks>,
    peer_receiver: ObjectRef,
    wire_version: i32,
}

impl ServerTransport {
    /// Construct a server transport. `peer_receiver` is the client's
    /// receiver object, already acquired by the binding layer. The
    /// transport stays in `NotStarted` until [`ServerTransport::set_listener`]
    /// is called.
    pub fn new(
        config: TransportConfig,
        peer_receiver: ObjectRef,
        inbound_factory: Arc<dyn InboundFactory>,
        local_address: Option<String>,
        remote_address: Option<String>,
        parcelable_policy: ParcelablePolicy,
        wire_version: i32,
    ) -> Arc<Self> {
        let hooks = Arc::new(ServerHooks {
            listener: Mutex::new(None),
            inbound_factory,
            pending_attrs: Mutex::new(None),
        });
        let core = TransportCore::new(
            config,
            Arc::clone(&hooks) as Arc<dyn RoleHooks>,
            local_address,
            remote_address,
            parcelable_policy,
        );
        Arc::new(Self {
            core,
            hooks,
            peer_receiver,
            wire_version,
        })
    }

    /// The local receiver adapter to register with whatever channel
    /// implementation accepts inbound transactions for this transport.
    #[must_use]
    pub fn receiver(self: &Arc<Self>) -> TransactionReceiverHandle {
        TransactionReceiverHandle(Arc::clone(&self.core))
    }

    /// Install the listener, emit our `SETUP_TRANSPORT` to the peer, and
    /// become `Ready` (spec §4.4 server order). If the transport was
    /// already shut down before the listener arrived, go straight to
    /// terminated instead.
    pub fn set_listener(
        self: &Arc<Self>,
        listener: Arc<dyn ServerTransportListener>,
        local_receiver: ObjectRef,
    ) {
        *self.hooks.listener.lock() = Some(Arc::clone(&listener));
        if self.core.current_state().is_shutdown() {
            self.core.shutdown_now(Status::unavailable("already shut down"));
            return;
        }
        debug!("listener installed; sending SETUP_TRANSPORT");
        let payload = ControlPayload::Setup {
            wire_version: self.wire_version,
            peer_receiver: local_receiver,
        };
        if let Err(e) = TransportCore::send_control_to(&self.peer_receiver, &payload) {
            self.core.shutdown(e, true);
            return;
        }
        if let Err(e) = self.core.install_peer_sender(Arc::clone(&self.peer_receiver)) {
            self.core.shutdown(e, true);
            return;
        }
        self.core.transition_to(TransportState::Ready);
        let attrs = listener.transport_ready(self.core.attributes());
        self.hooks.pending_attrs.lock().replace(attrs);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn current_state(&self) -> TransportState {
        self.core.current_state()
    }

    /// The final attribute set, once `transport_ready` has run.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        self.hooks
            .pending_attrs
            .lock()
            .clone()
            .unwrap_or_else(|| self.core.attributes())
    }

    /// Graceful shutdown: waits for the call table to drain before
    /// terminating.
    pub fn shutdown(&self, status: Status) {
        self.core.shutdown(status, false);
    }

    /// Forced shutdown: terminates immediately.
    pub fn shutdown_now(&self, status: Status) {
        self.core.shutdown_now(status);
    }

    /// Deregister a call that has closed (spec §4.8).
    pub fn unregister(self: &Arc<Self>, call_id: i32) {
        self.core.unregister(call_id);
    }
}
