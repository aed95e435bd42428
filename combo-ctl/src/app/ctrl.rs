//! CTRL service packets: connection/service lifecycle management (spec
//! §4.4).

use super::{response_code, service, AppPacket};
use crate::error::{ComboError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub mod command {
    pub const CONNECT: u16 = 0x0001;
    pub const DISCONNECT: u16 = 0x0002;
    pub const GET_SERVICE_VERSION: u16 = 0x0003;
    pub const BIND: u16 = 0x0004;
    pub const ACTIVATE_SERVICE: u16 = 0x0005;
    pub const DEACTIVATE_SERVICE: u16 = 0x0006;
    pub const SERVICE_ERROR: u16 = 0x00FF;
}

pub fn connect() -> AppPacket {
    AppPacket::new(service::CTRL, command::CONNECT, Vec::new())
}

pub fn disconnect() -> AppPacket {
    AppPacket::new(service::CTRL, command::DISCONNECT, Vec::new())
}

pub fn bind() -> AppPacket {
    AppPacket::new(service::CTRL, command::BIND, Vec::new())
}

pub fn get_service_version(target_service: u8) -> AppPacket {
    AppPacket::new(service::CTRL, command::GET_SERVICE_VERSION, vec![target_service])
}

pub fn activate_service(target_service: u8) -> AppPacket {
    AppPacket::new(service::CTRL, command::ACTIVATE_SERVICE, vec![target_service])
}

pub fn deactivate_service(target_service: u8) -> AppPacket {
    AppPacket::new(service::CTRL, command::DEACTIVATE_SERVICE, vec![target_service])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceVersion {
    pub major: u8,
    pub minor: u8,
}

pub fn parse_service_version(packet: &AppPacket) -> Result<ServiceVersion> {
    if packet.command != response_code(command::GET_SERVICE_VERSION) {
        return Err(ComboError::InvalidPayload);
    }
    let mut cursor = &packet.payload[..];
    Ok(ServiceVersion {
        major: cursor.read_u8()?,
        minor: cursor.read_u8()?,
    })
}

/// Parses an unsolicited CTRL_SERVICE_ERROR packet's error code (spec §7:
/// fatal to the session).
pub fn parse_service_error(packet: &AppPacket) -> Result<u8> {
    if packet.command != command::SERVICE_ERROR {
        return Err(ComboError::InvalidPayload);
    }
    packet.payload.first().copied().ok_or(ComboError::InvalidPayload)
}

pub fn is_service_error(packet: &AppPacket) -> bool {
    packet.service == service::CTRL && packet.command == command::SERVICE_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_service_payload_carries_target() {
        let packet = activate_service(service::RT_MODE);
        assert_eq!(packet.payload, vec![service::RT_MODE]);
    }

    #[test]
    fn service_version_round_trip() {
        let response = AppPacket::new(
            service::CTRL,
            response_code(command::GET_SERVICE_VERSION),
            vec![2, 1],
        );
        let version = parse_service_version(&response).unwrap();
        assert_eq!(version, ServiceVersion { major: 2, minor: 1 });
    }

    #[test]
    fn service_error_detected() {
        let packet = AppPacket::new(service::CTRL, command::SERVICE_ERROR, vec![0x07]);
        assert!(is_service_error(&packet));
        assert_eq!(parse_service_error(&packet).unwrap(), 0x07);
    }
}
