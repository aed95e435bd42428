//! Invariant pairing data and the mutable transport state built around it
//! (spec §3).

use crate::cipher::Key;
use crate::nonce::Nonce;
use std::collections::HashMap;

/// Pairing address byte used before directional keys exist (spec §6):
/// source nibble 1, destination nibble 0.
pub const PAIRING_ADDRESS: u8 = 0x10;

/// Per-paired-pump data, written once during pairing and read-only
/// afterwards (spec §3). Re-pairing requires discarding this first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantPumpData {
    pub client_to_pump_key: Key,
    pub pump_to_client_key: Key,
    pub key_response_address: u8,
    pub pump_id: String,
}

impl InvariantPumpData {
    /// Derives the key-response address by swapping the nibbles of the
    /// address byte carried in the KEY_RESPONSE frame (spec §3).
    pub fn address_from_key_response(key_response_address: u8) -> u8 {
        (key_response_address >> 4) | (key_response_address << 4)
    }

    /// Parses the pump ID out of its null-terminated, up-to-13-byte wire
    /// representation (spec §3, §4.5 step 7).
    pub fn parse_pump_id(raw: &[u8]) -> String {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end.min(13)]).into_owned()
    }
}

/// Mutable per-session state layered over the cached invariant data:
/// current TX nonce, and (spec §3, "for duplicate detection if
/// implemented") the last RX nonce observed per command class, used to
/// reject replayed/out-of-order frames.
#[derive(Debug, Clone)]
pub struct TransportState {
    pub invariant: Option<InvariantPumpData>,
    pub tx_nonce: Nonce,
    last_rx_nonce: HashMap<u8, Nonce>,
}

impl TransportState {
    pub fn new() -> TransportState {
        TransportState {
            invariant: None,
            tx_nonce: Nonce::NULL,
            last_rx_nonce: HashMap::new(),
        }
    }

    /// Records the nonce of an incoming, successfully-authenticated frame
    /// for the given command class. Returns `false` if `nonce` is not
    /// strictly greater than the last one seen for this class (spec §3: a
    /// sign of replay/corruption, which is fatal to the session per §7).
    pub fn observe_rx_nonce(&mut self, command: u8, nonce: Nonce) -> bool {
        match self.last_rx_nonce.get(&command) {
            Some(last) if nonce <= *last => false,
            _ => {
                self.last_rx_nonce.insert(command, nonce);
                true
            }
        }
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_nibble_swap() {
        assert_eq!(InvariantPumpData::address_from_key_response(0x12), 0x21);
        assert_eq!(InvariantPumpData::address_from_key_response(0x10), 0x01);
    }

    #[test]
    fn pump_id_stops_at_nul_and_caps_at_13() {
        let mut raw = [0u8; 20];
        raw[..6].copy_from_slice(b"ABC123");
        assert_eq!(InvariantPumpData::parse_pump_id(&raw), "ABC123");

        let full = [b'X'; 20];
        assert_eq!(InvariantPumpData::parse_pump_id(&full).len(), 13);
    }

    #[test]
    fn rx_nonce_rejects_non_increasing() {
        let mut state = TransportState::new();
        let n1 = Nonce::from_bytes([1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let n2 = n1.increment();

        assert!(state.observe_rx_nonce(0x05, n1));
        assert!(state.observe_rx_nonce(0x05, n2));
        assert!(!state.observe_rx_nonce(0x05, n1));
        assert!(!state.observe_rx_nonce(0x05, n2));
    }

    #[test]
    fn rx_nonce_tracked_independently_per_command() {
        let mut state = TransportState::new();
        let n1 = Nonce::from_bytes([1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        assert!(state.observe_rx_nonce(0x05, n1));
        assert!(state.observe_rx_nonce(0x06, n1));
    }
}
