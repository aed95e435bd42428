//! CMD service packets: structured status/history/bolus request-response
//! pairs exchanged while in COMMAND_MODE (spec §4.4).

use super::{response_code, service, AppPacket};
use crate::error::{ComboError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

pub mod command {
    pub const READ_DATE_TIME: u16 = 0x0020;
    pub const READ_PUMP_STATUS: u16 = 0x0021;
    pub const READ_ERROR_WARNING_STATUS: u16 = 0x0022;
    pub const READ_HISTORY_BLOCK: u16 = 0x0023;
    pub const CONFIRM_HISTORY_BLOCK: u16 = 0x0024;
    pub const GET_BOLUS_STATUS: u16 = 0x0025;
    pub const DELIVER_BOLUS: u16 = 0x0026;
    pub const CANCEL_BOLUS: u16 = 0x0027;
    pub const PING: u16 = 0x0028;
}

pub fn ping() -> AppPacket {
    AppPacket::new(service::COMMAND_MODE, command::PING, Vec::new())
}

pub fn is_ping_response(packet: &AppPacket) -> bool {
    packet.service == service::COMMAND_MODE && packet.command == response_code(command::PING)
}

pub fn read_date_time() -> AppPacket {
    AppPacket::new(service::COMMAND_MODE, command::READ_DATE_TIME, Vec::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

pub fn parse_date_time(packet: &AppPacket) -> Result<PumpDateTime> {
    expect_response(packet, command::READ_DATE_TIME)?;
    let mut cursor = &packet.payload[..];
    Ok(PumpDateTime {
        year: cursor.read_u16::<LittleEndian>()?,
        month: cursor.read_u8()?,
        day: cursor.read_u8()?,
        hour: cursor.read_u8()?,
        minute: cursor.read_u8()?,
        second: cursor.read_u8()?,
    })
}

pub fn read_pump_status() -> AppPacket {
    AppPacket::new(service::COMMAND_MODE, command::READ_PUMP_STATUS, Vec::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStatus {
    pub bolus_active: bool,
    pub tbr_active: bool,
    pub suspended: bool,
}

pub fn parse_pump_status(packet: &AppPacket) -> Result<PumpStatus> {
    expect_response(packet, command::READ_PUMP_STATUS)?;
    let flags = *packet.payload.first().ok_or(ComboError::InvalidPayload)?;
    Ok(PumpStatus {
        bolus_active: flags & 0x01 != 0,
        tbr_active: flags & 0x02 != 0,
        suspended: flags & 0x04 != 0,
    })
}

pub fn read_error_warning_status() -> AppPacket {
    AppPacket::new(service::COMMAND_MODE, command::READ_ERROR_WARNING_STATUS, Vec::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorWarningStatus {
    pub errors: u32,
    pub warnings: u32,
}

pub fn parse_error_warning_status(packet: &AppPacket) -> Result<ErrorWarningStatus> {
    expect_response(packet, command::READ_ERROR_WARNING_STATUS)?;
    let mut cursor = &packet.payload[..];
    Ok(ErrorWarningStatus {
        errors: cursor.read_u32::<LittleEndian>()?,
        warnings: cursor.read_u32::<LittleEndian>()?,
    })
}

pub fn read_history_block(block_index: u16) -> AppPacket {
    AppPacket::new(
        service::COMMAND_MODE,
        command::READ_HISTORY_BLOCK,
        block_index.to_le_bytes().to_vec(),
    )
}

pub fn confirm_history_block(block_index: u16) -> AppPacket {
    AppPacket::new(
        service::COMMAND_MODE,
        command::CONFIRM_HISTORY_BLOCK,
        block_index.to_le_bytes().to_vec(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEvent {
    pub event_id: u16,
    pub data: Vec<u8>,
}

/// One CMD_READ_HISTORY_BLOCK response (spec §4.4): an events list plus the
/// two fields that drive the history-delta termination loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryBlock {
    pub events: Vec<HistoryEvent>,
    pub more_events_available: bool,
    pub num_remaining_events: u16,
}

const HISTORY_EVENT_HEADER_LEN: usize = 2 + 2; // event_id, data length
const HISTORY_BLOCK_HEADER_LEN: usize = 1 + 2; // more_events_available, num_remaining_events

pub fn parse_history_block(packet: &AppPacket) -> Result<HistoryBlock> {
    expect_response(packet, command::READ_HISTORY_BLOCK)?;

    let mut cursor = &packet.payload[..];
    if cursor.len() < HISTORY_BLOCK_HEADER_LEN {
        return Err(ComboError::InvalidPayload);
    }

    let more_events_available = cursor.read_u8()? != 0;
    let num_remaining_events = cursor.read_u16::<LittleEndian>()?;

    let mut events = Vec::new();
    while !cursor.is_empty() {
        if cursor.len() < HISTORY_EVENT_HEADER_LEN {
            return Err(ComboError::InvalidPayload);
        }
        let event_id = cursor.read_u16::<LittleEndian>()?;
        let data_len = cursor.read_u16::<LittleEndian>()? as usize;
        if cursor.len() < data_len {
            return Err(ComboError::InvalidPayload);
        }
        let mut data = vec![0u8; data_len];
        cursor.read_exact(&mut data)?;
        events.push(HistoryEvent { event_id, data });
    }

    Ok(HistoryBlock { events, more_events_available, num_remaining_events })
}

/// Termination rule for the history-delta loop (spec §4.4): stop once the
/// pump says there is nothing more, or once the delta-wide remaining count
/// no longer exceeds what the caller had already collected *before* this
/// block arrived. `events_collected_before_block` is a running total kept
/// across the whole delta by the caller (`PumpIo::read_history_delta`), not
/// this single block's own event count -- comparing against just this
/// block's size falsely terminates whenever a block's size happens to
/// equal the remaining count it reports, even with further blocks still to
/// come (see `tests::history_termination_scenario`).
pub fn is_history_complete(block: &HistoryBlock, events_collected_before_block: usize) -> bool {
    !block.more_events_available
        || (block.num_remaining_events as usize) < events_collected_before_block
}

pub fn get_bolus_status(bolus_id: u8) -> AppPacket {
    AppPacket::new(service::COMMAND_MODE, command::GET_BOLUS_STATUS, vec![bolus_id])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BolusStatus {
    pub bolus_id: u8,
    /// Requested amount, hundredths of a unit.
    pub requested: u16,
    /// Amount remaining to deliver, hundredths of a unit.
    pub remaining: u16,
}

pub fn parse_bolus_status(packet: &AppPacket) -> Result<BolusStatus> {
    expect_response(packet, command::GET_BOLUS_STATUS)?;
    let mut cursor = &packet.payload[..];
    Ok(BolusStatus {
        bolus_id: cursor.read_u8()?,
        requested: cursor.read_u16::<LittleEndian>()?,
        remaining: cursor.read_u16::<LittleEndian>()?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BolusKind {
    Standard,
    Extended,
    Multiwave,
}

impl BolusKind {
    fn wire(self) -> u8 {
        match self {
            BolusKind::Standard => 0,
            BolusKind::Extended => 1,
            BolusKind::Multiwave => 2,
        }
    }
}

/// Builds a CMD_DELIVER_BOLUS request. `amount` and `immediate_amount` are
/// hundredths of a unit; `duration_minutes` applies to extended/multiwave
/// boluses only.
pub fn deliver_bolus(
    kind: BolusKind,
    amount: u16,
    immediate_amount: u16,
    duration_minutes: u16,
) -> AppPacket {
    let mut payload = Vec::with_capacity(7);
    payload.push(kind.wire());
    payload.write_u16::<LittleEndian>(amount).unwrap();
    payload.write_u16::<LittleEndian>(immediate_amount).unwrap();
    payload.write_u16::<LittleEndian>(duration_minutes).unwrap();
    AppPacket::new(service::COMMAND_MODE, command::DELIVER_BOLUS, payload)
}

pub fn parse_deliver_bolus_response(packet: &AppPacket) -> Result<u8> {
    expect_response(packet, command::DELIVER_BOLUS)?;
    packet.payload.first().copied().ok_or(ComboError::InvalidPayload)
}

pub fn cancel_bolus(bolus_id: u8) -> AppPacket {
    AppPacket::new(service::COMMAND_MODE, command::CANCEL_BOLUS, vec![bolus_id])
}

fn expect_response(packet: &AppPacket, request_command: u16) -> Result<()> {
    if packet.command != response_code(request_command) {
        return Err(ComboError::InvalidPayload);
    }
    Ok(())
}
