//! Crate-wide error type. Mirrors the split between transient and fatal
//! conditions used by the teacher's `net::result`/`flux::shared` error
//! enums: every variant here is a distinct, user-visible outcome per
//! spec §7, not a generic wrapper.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ComboError {
    /// CRC or declared length mismatch while decoding a transport frame.
    InvalidFrame,
    /// MAC mismatch on a received frame, or KEY_RESPONSE verification
    /// failure during pairing. Fatal outside of pairing; during pairing the
    /// caller loops back to the PIN callback instead of propagating this.
    AuthenticationFailure,
    /// A received command code did not match what the caller expected.
    IncorrectPacket { expected: u8, actual: u8 },
    /// The pump sent a CTRL_SERVICE_ERROR packet.
    ServiceError { code: u8 },
    /// The underlying RFCOMM stream failed.
    Io(io::ErrorKind),
    /// The pump state store failed to read or write invariant pump data.
    PumpStateStoreAccess,
    /// A received payload did not parse to the expected shape.
    InvalidPayload,
    /// History delta retrieval exceeded `max_requests` without terminating.
    InfiniteHistoryData,
    /// The calling task was cancelled. Teardown still runs to completion.
    Cancelled,
    /// The packet receiver task ended (stream closed, or a prior fatal
    /// error); any waiter unblocks with this.
    PacketReceiverClosed,
}

impl fmt::Display for ComboError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComboError::InvalidFrame => write!(f, "invalid frame (length or CRC mismatch)"),
            ComboError::AuthenticationFailure => write!(f, "authentication failure (MAC mismatch)"),
            ComboError::IncorrectPacket { expected, actual } => {
                write!(f, "expected command {:#04x}, got {:#04x}", expected, actual)
            }
            ComboError::ServiceError { code } => write!(f, "pump reported service error {:#04x}", code),
            ComboError::Io(kind) => write!(f, "transport I/O error: {:?}", kind),
            ComboError::PumpStateStoreAccess => write!(f, "pump state store access failed"),
            ComboError::InvalidPayload => write!(f, "payload failed to parse"),
            ComboError::InfiniteHistoryData => write!(f, "history retrieval exceeded max_requests"),
            ComboError::Cancelled => write!(f, "operation cancelled"),
            ComboError::PacketReceiverClosed => write!(f, "packet receiver task terminated"),
        }
    }
}

impl std::error::Error for ComboError {}

impl From<io::Error> for ComboError {
    fn from(err: io::Error) -> Self {
        ComboError::Io(err.kind())
    }
}

pub type Result<T> = std::result::Result<T, ComboError>;

/// Whether an error, once observed on a session, must invalidate the paired
/// state per spec §3 ("Invariants") and §7.
impl ComboError {
    pub fn invalidates_pairing(&self) -> bool {
        matches!(
            self,
            ComboError::AuthenticationFailure
                | ComboError::ServiceError { .. }
                | ComboError::Io(_)
                | ComboError::PumpStateStoreAccess
                | ComboError::PacketReceiverClosed
        )
    }
}
