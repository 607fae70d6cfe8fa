//! Wire transaction codes and the codec for control-transaction payloads.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! See spec §6 for the transaction table this mirrors.

use crate::channel::ObjectRef;
use crate::error::{Error, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// First transaction code; 1000 codes starting here are reserved for
/// control transactions, the remainder identify stream (call) transactions.
pub const FIRST_TRANSACTION_CODE: i32 = 1;

/// `BASE+0`: version + receiver-object exchange.
pub const SETUP_TRANSPORT: i32 = FIRST_TRANSACTION_CODE;
/// `BASE+1`: peer is telling us it is going away.
pub const SHUTDOWN_TRANSPORT: i32 = FIRST_TRANSACTION_CODE + 1;
/// `BASE+2`: flow-control acknowledgement.
pub const ACKNOWLEDGE_BYTES: i32 = FIRST_TRANSACTION_CODE + 2;
/// `BASE+3`: liveness probe.
pub const PING: i32 = FIRST_TRANSACTION_CODE + 3;
/// `BASE+4`: liveness probe reply.
pub const PING_RESPONSE: i32 = FIRST_TRANSACTION_CODE + 4;

/// First call-id; `FIRST_TRANSACTION_CODE + 1000`, i.e. 1000 codes are
/// reserved for control transactions.
pub const FIRST_CALL_ID: i32 = FIRST_TRANSACTION_CODE + 1000;
/// Last call-id (inclusive). The client's allocator wraps back to
/// [`FIRST_CALL_ID`] after reaching this.
pub const LAST_CALL_ID: i32 = i32::MAX;

/// The only wire format version this implementation speaks.
pub const WIRE_FORMAT_VERSION: i32 = 1;
/// The oldest wire format version this implementation still accepts.
pub const EARLIEST_SUPPORTED_VERSION: i32 = 1;

/// Set on a stream transaction's flag header when the payload is an
/// out-of-band abnormal close rather than ordinary stream data.
pub const FLAG_OUT_OF_BAND_CLOSE: i32 = 1 << 0;

/// Whether `code` identifies a stream (call) transaction rather than a
/// control transaction.
#[inline]
#[must_use]
pub fn is_call_id(code: i32) -> bool {
    code >= FIRST_CALL_ID
}

/// The decoded payload of a control transaction.
///
/// `Setup` carries a live reference to the peer's receiver object rather
/// than flattened bytes: on the underlying channel this travels alongside
/// the byte payload the same way a real IPC primitive hands over an object
/// capability, so there is nothing to "decode" for that part other than
/// accepting the reference the channel handed us.
#[derive(Clone)]
pub enum ControlPayload {
    /// `SETUP_TRANSPORT`.
    Setup {
        /// The sender's wire format version.
        wire_version: i32,
        /// A reference to the sender's receiver object.
        peer_receiver: ObjectRef,
    },
    /// `SHUTDOWN_TRANSPORT`.
    Shutdown,
    /// `ACKNOWLEDGE_BYTES`.
    AcknowledgeBytes(u64),
    /// `PING`.
    Ping(u32),
    /// `PING_RESPONSE`.
    PingResponse(u32),
}

impl ControlPayload {
    /// The transaction code this payload is sent/received under.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Setup { .. } => SETUP_TRANSPORT,
            Self::Shutdown => SHUTDOWN_TRANSPORT,
            Self::AcknowledgeBytes(_) => ACKNOWLEDGE_BYTES,
            Self::Ping(_) => PING,
            Self::PingResponse(_) => PING_RESPONSE,
        }
    }

    /// Encode the scalar part of this payload to bytes. `Setup`'s receiver
    /// reference is carried out of band by the caller; only the version
    /// field is encoded here.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Setup { wire_version, .. } => buf.put_i32(*wire_version),
            Self::Shutdown => {}
            Self::AcknowledgeBytes(n) => buf.put_u64(*n),
            Self::Ping(id) | Self::PingResponse(id) => buf.put_u32(*id),
        }
        buf.freeze()
    }
}

/// Decode an `ACKNOWLEDGE_BYTES` payload.
pub fn decode_acknowledge_bytes(mut payload: Bytes) -> Result<u64, Error> {
    if payload.len() < 8 {
        return Err(Error::MalformedPayload(
            "ACKNOWLEDGE_BYTES payload too short".into(),
        ));
    }
    Ok(payload.get_u64())
}

/// Decode a `PING`/`PING_RESPONSE` payload.
pub fn decode_ping_id(mut payload: Bytes) -> Result<u32, Error> {
    if payload.len() < 4 {
        return Err(Error::MalformedPayload("PING payload too short".into()));
    }
    Ok(payload.get_u32())
}

/// Whether `version` is one this implementation can speak to.
#[inline]
#[must_use]
pub fn is_supported_version(version: i32) -> bool {
    (EARLIEST_SUPPORTED_VERSION..=WIRE_FORMAT_VERSION).contains(&version)
}

/// Stream transaction flag header: a 4-byte big-endian `i32` prefix before
/// the stream-framed body.
#[must_use]
pub fn encode_stream_flags(flags: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32(flags);
    buf.freeze()
}

/// Split a stream transaction payload into its flag header and body.
pub fn decode_stream_flags(mut payload: Bytes) -> Result<(i32, Bytes), Error> {
    if payload.len() < 4 {
        return Err(Error::MalformedPayload(
            "stream transaction missing flag header".into(),
        ));
    }
    let flags = payload.get_i32();
    Ok((flags, payload))
}

/// Reject a status produced by a malformed setup payload.
#[must_use]
pub fn version_mismatch_status() -> Status {
    Status::unavailable("Wire format version mismatch")
}
