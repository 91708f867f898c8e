// SPDX-License-Identifier: AGPL-3.0-or-later

//! Crate-wide error taxonomy (spec §7).
//!
//! Internal plumbing mostly threads `anyhow::Result` the way the rest of
//! the stack does (`.context(...)` at each hand-off), but every condition a
//! retry loop needs to match on is a concrete [`C12Error`] variant so that
//! `anyhow::Error::downcast_ref::<C12Error>()` gives a stable discriminant.

use thiserror::Error;

/// A valid `STATUS != 0` response code from the device (spec §3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    pub const OK: ResponseCode = ResponseCode(0);
    pub const BSY: ResponseCode = ResponseCode(1);
    pub const DNR: ResponseCode = ResponseCode(2);
    pub const ERR: ResponseCode = ResponseCode(5);
    pub const SNS: ResponseCode = ResponseCode(6);
    pub const ISC: ResponseCode = ResponseCode(7);
    pub const ONP: ResponseCode = ResponseCode(8);
    pub const IAR: ResponseCode = ResponseCode(9);
    /// Internal retry signal recognised only inside the application-layer
    /// dispatcher (spec §4.3 step 1.1); never observed by callers.
    pub const RETRY: ResponseCode = ResponseCode(0xFF);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    pub fn is_retryable_at_app_layer(self) -> bool {
        matches!(self, Self::BSY | Self::DNR)
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::OK => "OK",
            Self::BSY => "BSY",
            Self::DNR => "DNR",
            Self::ERR => "ERR",
            Self::SNS => "SNS",
            Self::ISC => "ISC",
            Self::ONP => "ONP",
            Self::IAR => "IAR",
            _ => "UNKNOWN",
        };
        write!(f, "{name}(0x{:02x})", self.0)
    }
}

/// Error-kind taxonomy (spec §7). Transient conditions are retried inside
/// their own layer (link/app); only final exhaustion ever surfaces one of
/// these to a caller.
#[derive(Debug, Error)]
pub enum C12Error {
    /// Programmer-facing precondition violated (bad argument, channel not
    /// assigned, invalid baud setter input, ...).
    #[error("software error: {0}")]
    Software(String),

    /// Authentication failure, `DataNotValidated`, or `ERR` seen during
    /// `Authenticate`.
    #[error("security error: {0}")]
    Security(String),

    /// Protocol violation by the device itself (invalid baud index,
    /// unsupported auth algorithm, bad negotiated size, ...).
    #[error("meter protocol violation: {0}")]
    Meter(String),

    /// A valid `STATUS != 0` from the device.
    #[error("device returned {code}")]
    C12NokResponse {
        code: ResponseCode,
        extra: Vec<u8>,
    },

    #[error("channel read timed out")]
    ChannelReadTimeout,

    #[error("channel disconnected unexpectedly")]
    ChannelDisconnectedUnexpectedly,

    #[error("operation cancelled")]
    OperationCancelled,

    #[error("CRC-16 check failed")]
    CrcCheckFailed,

    #[error("received packet toggle-bit failure")]
    ReceivedPacketToggleBitFailure,

    #[error("inbound packet data length invalid")]
    InboundPacketDataLengthBad,

    #[error("modem error: expected {expected}, got {got}")]
    ExpectedXGotX { expected: String, got: String },

    #[error("modem error: {0}")]
    ModemError(String),

    #[error("could not connect by modem")]
    CouldNotConnectByModem,

    #[error("no phone number specified")]
    NoPhoneNumberSpecified,

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("proxy socket error: {0}")]
    ProxySocketError(String),

    #[error("bad IP address: {0}")]
    BadIpAddress(String),

    #[error("socket closed by peer")]
    SocketClosedByPeer,

    #[error("packet too big for this transport")]
    PacketTooBig,
}

impl C12Error {
    /// §7: only these two kinds, plus [`C12Error::ChannelDisconnectedUnexpectedly`],
    /// are never retried by any layer.
    pub fn is_never_retried(&self) -> bool {
        matches!(
            self,
            C12Error::OperationCancelled | C12Error::ChannelDisconnectedUnexpectedly
        )
    }
}
