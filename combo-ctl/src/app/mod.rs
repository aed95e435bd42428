//! Application-layer packet definitions carried inside transport DATA
//! frames (spec §4.4). Builders/parsers for RT and CMD packets live in
//! the `rt`/`cmd`/`ctrl` submodules; `display` holds the RT display frame
//! reassembly engine.

pub mod cmd;
pub mod ctrl;
pub mod display;
pub mod rt;

use crate::error::{ComboError, Result};
use crate::framer::crc16_ccitt;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub mod service {
    pub const CTRL: u8 = 0x00;
    pub const RT_MODE: u8 = 0x01;
    pub const COMMAND_MODE: u8 = 0x02;
}

pub const APP_VERSION: u8 = 0x01;
const APP_HEADER_LEN: usize = 4;
const APP_CRC_LEN: usize = 2;

/// One application-layer packet: 4-byte header (service, version, 16-bit
/// little-endian command) plus payload plus a CRC-16 over header+payload
/// (spec §4.4). This whole encoding becomes the payload of a transport
/// DATA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPacket {
    pub service: u8,
    pub command: u16,
    pub payload: Vec<u8>,
}

impl AppPacket {
    pub fn new(service: u8, command: u16, payload: Vec<u8>) -> AppPacket {
        AppPacket { service, command, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(APP_HEADER_LEN + self.payload.len() + APP_CRC_LEN);
        out.write_u8(self.service).unwrap();
        out.write_u8(APP_VERSION).unwrap();
        out.write_u16::<LittleEndian>(self.command).unwrap();
        out.extend_from_slice(&self.payload);

        let crc = crc16_ccitt(&out);
        out.write_u16::<LittleEndian>(crc).unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<AppPacket> {
        if bytes.len() < APP_HEADER_LEN + APP_CRC_LEN {
            return Err(ComboError::InvalidPayload);
        }

        let crc_start = bytes.len() - APP_CRC_LEN;
        let expected_crc = u16::from_le_bytes([bytes[crc_start], bytes[crc_start + 1]]);
        let actual_crc = crc16_ccitt(&bytes[..crc_start]);
        if actual_crc != expected_crc {
            return Err(ComboError::InvalidPayload);
        }

        let mut cursor = &bytes[..crc_start];
        let service = cursor.read_u8()?;
        let _version = cursor.read_u8()?;
        let command = cursor.read_u16::<LittleEndian>()?;
        let payload = cursor.to_vec();

        Ok(AppPacket { service, command, payload })
    }
}

/// Command code assigned to response packets: the request code with the
/// top bit of the 16-bit code set. Like the transport command numbering in
/// `transport::command`, these values are this crate's own internally
/// consistent scheme (see DESIGN.md) rather than a recovered wire trace.
pub const fn response_code(request: u16) -> u16 {
    request | 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_packet_round_trip() {
        let packet = AppPacket::new(service::COMMAND_MODE, 0x1234, vec![1, 2, 3, 4]);
        let bytes = packet.encode();
        let decoded = AppPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn corrupted_app_packet_rejected() {
        let packet = AppPacket::new(service::CTRL, 0x01, vec![9, 9]);
        let mut bytes = packet.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(AppPacket::decode(&bytes).is_err());
    }

    #[test]
    fn response_code_sets_top_bit() {
        assert_eq!(response_code(0x0010), 0x8010);
    }
}
