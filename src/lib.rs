//! Transport core for a streaming RPC layer multiplexed over a single
//! duplex pair of ordered, one-way IPC message channels.
//!
//! This crate owns the setup handshake, credit-based flow control, ping/pong
//! liveness, the call table and the transport lifecycle state machine. It
//! does not open sockets, frame application messages, or implement a
//! security policy: those are collaborator traits supplied by the host
//! framework (see [`channel`]).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod attributes;
mod call;
mod call_table;
mod channel;
mod client;
mod dupe;
mod error;
mod flow;
mod lifecycle;
mod ping;
mod server;
mod transport;
mod wire;

pub use attributes::{Attributes, ParcelablePolicy, SecurityLevel};
pub use call::{Inbound, Outbound, QueueInbound};
pub use channel::{
    BindingObserver, BlockingExecutor, Channel, DeathWatcher, Executor, InlineExecutor, ObjectRef,
    SecurityPolicy, ServiceBinding, TokioExecutor, TransactionReceiver,
};
pub use client::{ClientTransport, ClientTransportListener};
pub use dupe::Dupe;
pub use error::{Code, Error, Result, Status};
pub use flow::{W_ACK, W_OUT};
pub use lifecycle::TransportState;
pub use ping::PingResult;
pub use server::{InboundFactory, ServerTransport, ServerTransportListener};
pub use transport::{RoleHooks, TransactionReceiverHandle, TransportConfig};
pub use wire::{ControlPayload, FIRST_CALL_ID, FIRST_TRANSACTION_CODE, WIRE_FORMAT_VERSION};
