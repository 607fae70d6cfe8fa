//! Collaborator interfaces consumed by the transport core (spec §6).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! These traits are the seams the transport core is built against; the
//! higher-level RPC framework, the binding layer and the security-policy
//! implementation all live outside this crate. A loopback implementation for
//! tests lives under `tests/`.

use crate::error::Status;
use crate::wire::ControlPayload;
use bytes::Bytes;
use std::sync::Arc;

/// A reference to the peer's receiver object, handed across the channel
/// during setup. Cloning is cheap (it's a capability, not data).
pub type ObjectRef = Arc<dyn Channel>;

/// The underlying one-way message-passing primitive: an ordered channel to
/// one specific peer process, identified by a kernel-assigned uid.
///
/// A transaction sent with `one_way = true` never blocks for a reply; this
/// transport core only ever sends one-way transactions, but the flag is
/// part of the interface because some underlying primitives (binder) also
/// support synchronous transactions for other use cases.
pub trait Channel: Send + Sync {
    /// Send a one-way transaction to the peer identified by this reference.
    /// Returns `Err` if the peer is dead or the channel rejected the
    /// transaction (oversized payload, etc).
    fn transact(&self, code: i32, payload: Bytes, one_way: bool) -> Result<(), Status>;

    /// Send `SETUP_TRANSPORT`, carrying `peer_receiver` as a live object
    /// capability alongside the scalar payload rather than flattened into
    /// it, mirroring how a real IPC primitive hands over an object
    /// reference inline with a transaction's bytes.
    fn transact_setup(&self, wire_version: i32, peer_receiver: ObjectRef) -> Result<(), Status>;

    /// Register `watcher` to be notified if the process on the other end of
    /// this reference dies. Fails if the peer is already dead.
    fn link_to_death(&self, watcher: Arc<dyn DeathWatcher>) -> Result<(), Status>;

    /// Unregister a previously-linked watcher. No-op if not registered.
    fn unlink_to_death(&self, watcher: &Arc<dyn DeathWatcher>);

    /// The kernel-reported uid of the process that sent us this reference,
    /// if known.
    fn caller_uid(&self) -> Option<i32>;
}

/// Callback invoked when the peer process behind a [`Channel`] reference
/// dies, observed via `link_to_death`.
pub trait DeathWatcher: Send + Sync {
    /// The peer died.
    fn on_peer_death(&self);
}

/// The local receiver-object: accepts inbound transactions dispatched by
/// the channel implementation. `TransportCore` implements this.
pub trait TransactionReceiver: Send + Sync {
    /// Dispatch one inbound transaction. `code < FIRST_CALL_ID` is a control
    /// transaction; `ControlPayload` is only populated for codes this
    /// receiver understands enough to pre-decode (setup needs the object
    /// reference out of band), everything else arrives as raw bytes via
    /// `raw_payload`.
    fn on_transaction(&self, code: i32, raw_payload: Bytes, setup: Option<ControlPayload>);
}

/// Acquires the initial peer-channel reference for the client role.
/// Out of scope per spec §1; only the interface is defined here.
pub trait ServiceBinding: Send + Sync {
    /// Begin binding. `observer` is notified asynchronously.
    fn bind(&self, observer: Arc<dyn BindingObserver>);
    /// Release the binding.
    fn unbind(&self);
}

/// Observer callbacks for [`ServiceBinding`].
pub trait BindingObserver: Send + Sync {
    /// The binding completed; `peer_receiver` is the remote receiver object
    /// to send `SETUP_TRANSPORT` to.
    fn on_bound(&self, peer_receiver: ObjectRef);
    /// The binding failed or was torn down.
    fn on_unbound(&self, status: Status);
}

/// Security-policy evaluation, out of scope per spec §1. `check_authorization`
/// may block; the transport core never calls it while holding its lock.
pub trait SecurityPolicy: Send + Sync {
    /// Decide whether `uid` is authorized to use this transport.
    fn check_authorization(&self, uid: i32) -> Status;
}

/// Abstraction over "dispatch this work off the calling thread", used both
/// for the blocking-capable executor that runs `SecurityPolicy::check` and
/// for per-callback executors such as the one passed to `ping`.
pub trait Executor: Send + Sync {
    /// Schedule `job` to run, possibly blocking, off the caller's stack.
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// An [`Executor`] backed by `tokio::task::spawn_blocking`, for work that may
/// itself block (e.g. `SecurityPolicy::check_authorization`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingExecutor;

impl Executor for BlockingExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        tokio::task::spawn_blocking(job);
    }
}

/// An [`Executor`] backed by `tokio::spawn`, for callbacks that are themselves
/// async-friendly (ping completion, listener notifications dispatched off
/// the transport lock) and must not occupy a blocking-pool thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move { job() });
    }
}

/// An [`Executor`] that runs the job inline on the calling thread.
/// Only appropriate in tests where there is no lock held to worry about.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}
