//! The client role: binds to a peer, drives the client side of setup,
//! allocates call-ids (spec §4.4 client order, §3, §4.8).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::attributes::{Attributes, ParcelablePolicy};
use crate::call::Inbound;
use crate::channel::{
    BindingObserver, Executor, ObjectRef, SecurityPolicy, ServiceBinding,
};
use crate::error::Status;
use crate::lifecycle::TransportState;
use crate::ping::PingResult;
use crate::transport::{RoleHooks, TransactionReceiverHandle, TransportConfig, TransportCore};
use crate::wire::ControlPayload;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Notified of client transport lifecycle events (spec §6,
/// `ManagedClientTransport.Listener`).
pub trait ClientTransportListener: Send + Sync {
    /// Setup completed; the transport may now be used for new streams.
    fn transport_ready(&self, attrs: &Attributes);
    /// The transport has begun shutting down.
    fn transport_shutdown(&self, status: &Status);
    /// The transport has fully terminated.
    fn transport_terminated(&self);
    /// The in-use count (spec §4.8, §8 property 9) crossed an edge: `true`
    /// when it went 0->1, `false` when it went 1->0.
    fn transport_in_use(&self, in_use: bool);
}

struct ClientHooks {
    listener: Arc<dyn ClientTransportListener>,
    security_policy: Arc<dyn SecurityPolicy>,
    in_use: AtomicU32,
}

impl RoleHooks for ClientHooks {
    fn notify_ready(&self, attrs: &Attributes) {
        self.listener.transport_ready(attrs);
    }

    fn notify_shutdown(&self, status: &Status) {
        self.listener.transport_shutdown(status);
    }

    fn notify_terminated(&self) {
        self.listener.transport_terminated();
    }

    fn create_inbound(&self, _call_id: i32) -> Option<Arc<dyn Inbound>> {
        // The client only ever receives transactions for ids it allocated
        // itself; a server-initiated stream id is unexpected.
        None
    }

    fn security_policy(&self) -> Option<Arc<dyn SecurityPolicy>> {
        Some(Arc::clone(&self.security_policy))
    }

    fn on_unregistered(&self) {
        let previous = self.in_use.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "in-use count must never go negative");
        if previous == 1 {
            self.listener.transport_in_use(false);
        }
    }
}

/// The client-side transport.
pub struct ClientTransport {
    core: Arc<TransportCore>,
    hooks: Arc<ClientHooks>,
    binding: Arc<dyn ServiceBinding>,
    /// This transport's own receiver, wrapped as an `ObjectRef` the peer can
    /// hand transactions to. Constructing this wrapper is a channel/binding
    /// concern (spec §1's "binding layer... out of scope"), so it is
    /// supplied by the caller rather than built here.
    local_receiver: ObjectRef,
    wire_version: i32,
}

struct BindObserver {
    transport: std::sync::Weak<ClientTransport>,
}

impl BindingObserver for BindObserver {
    fn on_bound(&self, peer_receiver: ObjectRef) {
        if let Some(transport) = self.transport.upgrade() {
            transport.send_initial_setup(peer_receiver);
        }
    }

    fn on_unbound(&self, status: Status) {
        if let Some(transport) = self.transport.upgrade() {
            transport.core.shutdown(status, true);
        }
    }
}

impl ClientTransport {
    /// Construct a client transport and immediately start the setup
    /// handshake: transition `NotStarted -> Setup` and initiate binding
    /// (spec §4.4 step 1).
    pub fn start(
        config: TransportConfig,
        binding: Arc<dyn ServiceBinding>,
        security_policy: Arc<dyn SecurityPolicy>,
        listener: Arc<dyn ClientTransportListener>,
        local_receiver: ObjectRef,
        local_address: Option<String>,
        remote_address: Option<String>,
        parcelable_policy: ParcelablePolicy,
        wire_version: i32,
    ) -> Arc<Self> {
        let hooks = Arc::new(ClientHooks {
            listener,
            security_policy,
            in_use: AtomicU32::new(0),
        });
        let core = TransportCore::new(
            config,
            Arc::clone(&hooks) as Arc<dyn RoleHooks>,
            local_address,
            remote_address,
            parcelable_policy,
        );
        let transport = Arc::new(Self {
            core,
            hooks,
            binding,
            local_receiver,
            wire_version,
        });
        transport.core.transition_to(TransportState::Setup);
        let observer: Arc<dyn BindingObserver> = Arc::new(BindObserver {
            transport: Arc::downgrade(&transport),
        });
        transport.binding.bind(observer);
        transport
    }

    /// The local receiver adapter to register with whatever channel
    /// implementation accepts inbound transactions for this transport.
    #[must_use]
    pub fn receiver(self: &Arc<Self>) -> TransactionReceiverHandle {
        TransactionReceiverHandle(Arc::clone(&self.core))
    }

    fn send_initial_setup(self: &Arc<Self>, peer_receiver: ObjectRef) {
        debug!("bound; sending initial SETUP_TRANSPORT");
        let payload = ControlPayload::Setup {
            wire_version: self.wire_version,
            peer_receiver: Arc::clone(&self.local_receiver),
        };
        if let Err(e) = TransportCore::send_control_to(&peer_receiver, &payload) {
            self.core.shutdown(e, true);
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn current_state(&self) -> TransportState {
        self.core.current_state()
    }

    /// Open a new stream: allocate a call-id, register `inbound`, and hand
    /// back the id plus the outbound capability. Increments the in-use
    /// counter on the 0->1 edge (spec §4.8, §8 property 9).
    pub fn new_stream(&self, inbound: Arc<dyn Inbound>) -> Result<i32, Status> {
        if self.core.current_state() != TransportState::Ready {
            return Err(Status::failed_precondition("transport is not ready"));
        }
        let id = self.core.allocate_call_id()?;
        self.core.register_call(id, inbound)?;
        let was = self
            .hooks
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v == 0 {
                    Some(1)
                } else {
                    Some(v + 1)
                }
            });
        if was == Ok(0) {
            self.hooks.listener.transport_in_use(true);
        }
        Ok(id)
    }

    /// Send a ping; invokes `callback` on `executor` with the measured
    /// round-trip time, or `FailedPrecondition` if not `Ready`.
    pub fn ping(
        &self,
        callback: Box<dyn FnOnce(PingResult) + Send>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), Status> {
        self.core.ping(callback, executor)
    }

    /// Graceful shutdown: waits for the call table to drain before
    /// terminating.
    pub fn shutdown(&self, status: Status) {
        self.core.shutdown(status, false);
    }

    /// Forced shutdown: terminates immediately, abnormally closing every
    /// in-flight call.
    pub fn shutdown_now(&self, status: Status) {
        self.core.shutdown_now(status);
    }

    /// Deregister a call that has closed (spec §4.8).
    pub fn unregister(self: &Arc<Self>, call_id: i32) {
        self.core.unregister(call_id);
    }
}
