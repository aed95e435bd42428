//! Remote Terminal (RT) service packets: button presses, keep-alive, and
//! the incoming display stream (spec §4.4).

use super::{service, AppPacket};
use crate::error::{ComboError, Result};
use std::sync::atomic::{AtomicU16, Ordering};

pub mod command {
    pub const BUTTON_STATUS: u16 = 0x0101;
    pub const KEEP_ALIVE: u16 = 0x0102;
    /// Incoming, unsolicited: one quarter of a display frame.
    pub const DISPLAY: u16 = 0x0103;
    /// Incoming, unsolicited: acknowledges a button-status change.
    pub const BUTTON_CONFIRMATION: u16 = 0x0104;
}

/// Combo RT button bitmask (spec GLOSSARY: RT mode button presses).
pub mod button {
    pub const NO_BUTTON: u8 = 0x00;
    pub const UP: u8 = 0x01;
    pub const DOWN: u8 = 0x02;
    pub const MENU: u8 = 0x04;
    pub const CHECK: u8 = 0x08;
    pub const BACK: u8 = 0x10;
}

/// Combines a set of simultaneously-held buttons into the single bitmask
/// code RT_BUTTON_STATUS carries (spec §4.5, "Combine buttons into a
/// single code (bitwise OR of per-button codes)").
pub fn combine_buttons(buttons: &[u8]) -> u8 {
    buttons.iter().fold(button::NO_BUTTON, |acc, b| acc | b)
}

/// 16-bit RT sequence counter (spec §3, §4.4): reset to 0 whenever RT_MODE
/// is (re)activated, incremented for every outgoing RT packet, wraps at
/// 65535.
pub struct RtSequence(AtomicU16);

impl RtSequence {
    pub fn new() -> RtSequence {
        RtSequence(AtomicU16::new(0))
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Returns the sequence number to use for the packet about to be sent,
    /// then advances (wrapping) for the next one.
    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for RtSequence {
    fn default() -> Self {
        Self::new()
    }
}

pub fn button_status(seq: u16, code: u8, changed: bool) -> AppPacket {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&seq.to_le_bytes());
    payload.push(code);
    payload.push(changed as u8);
    AppPacket::new(service::RT_MODE, command::BUTTON_STATUS, payload)
}

pub fn keep_alive(seq: u16) -> AppPacket {
    AppPacket::new(service::RT_MODE, command::KEEP_ALIVE, seq.to_le_bytes().to_vec())
}

/// One quarter of a display frame as received over the wire (spec §4.4):
/// frame index, row index (0..=3), and 96 raw pixel-column bytes in the
/// Combo's native layout (remapped by `app::display`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRow {
    pub frame_index: u8,
    pub row_index: u8,
    pub data: [u8; 96],
}

pub fn parse_display(packet: &AppPacket) -> Result<DisplayRow> {
    if packet.command != command::DISPLAY {
        return Err(ComboError::InvalidPayload);
    }
    if packet.payload.len() != 98 {
        return Err(ComboError::InvalidPayload);
    }

    let frame_index = packet.payload[0];
    let row_index = packet.payload[1];
    if row_index > 3 {
        return Err(ComboError::InvalidPayload);
    }

    let mut data = [0u8; 96];
    data.copy_from_slice(&packet.payload[2..98]);

    Ok(DisplayRow { frame_index, row_index, data })
}

pub fn is_button_confirmation(packet: &AppPacket) -> bool {
    packet.service == service::RT_MODE && packet.command == command::BUTTON_CONFIRMATION
}

pub fn is_display(packet: &AppPacket) -> bool {
    packet.service == service::RT_MODE && packet.command == command::DISPLAY
}
