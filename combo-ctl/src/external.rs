//! Narrow interfaces to collaborators this crate never implements itself
//! (spec §6): the RFCOMM byte stream, the pump state store, and the PIN
//! prompt. Kept as `async_trait` traits rather than stored callback
//! pointers, per spec §9 ("back-references... are narrow function
//! parameters rather than stored pointers").

use crate::error::Result;
use crate::nonce::Nonce;
use crate::transport::state::InvariantPumpData;
use async_trait::async_trait;

/// A byte-oriented RFCOMM stream to a single paired pump. Implementations
/// are expected to be a thin wrapper over the host Bluetooth stack's
/// blocking read/write, bridged onto an async task (host-OS Bluetooth is
/// out of scope per spec §1).
#[async_trait]
pub trait RfcommStream: Send {
    /// Writes all of `bytes` to the stream.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads the next available chunk of bytes. Returns an empty vector
    /// only if the remote end closed the stream.
    async fn receive(&mut self) -> Result<Vec<u8>>;
}

/// Persistent, crash-safe storage for invariant pump data and the current
/// TX nonce (spec §6). Access failures must be treated as fatal by the
/// caller: invalidate the pump at both this store and the Bluetooth layer.
#[async_trait]
pub trait PumpStateStore: Send + Sync {
    async fn has_pump_state(&self, addr: &str) -> Result<bool>;

    async fn create_pump_state(&self, addr: &str, data: &InvariantPumpData) -> Result<()>;

    async fn get_invariant_data(&self, addr: &str) -> Result<InvariantPumpData>;

    async fn get_current_tx_nonce(&self, addr: &str) -> Result<Nonce>;

    /// Must be crash-safe: a process crash mid-write must not leave a
    /// nonce the pump has already rejected-as-replayed as the stored value
    /// (spec §6). Implementations should detect partial writes and surface
    /// them as `ComboError::PumpStateStoreAccess`.
    async fn set_current_tx_nonce(&self, addr: &str, nonce: Nonce) -> Result<()>;

    async fn delete_pump_state(&self, addr: &str) -> Result<()>;
}

/// Prompts the user for the ten-digit Combo pairing PIN. `previous_attempt_failed`
/// is `true` on every call after the first in a pairing attempt. Implementations
/// may return `Err(ComboError::Cancelled)` to abort pairing.
#[async_trait]
pub trait PinCallback: Send + Sync {
    async fn request_pin(&self, previous_attempt_failed: bool) -> Result<[u8; 10]>;
}

/// Invoked by `TransportSession::stop` under a non-cancellable context once
/// the final DISCONNECT packet has been sent, so the Bluetooth layer can
/// tear down the RFCOMM connection (spec §4.3).
#[async_trait]
pub trait DeviceDisconnect: Send + Sync {
    async fn disconnect(&self);
}
