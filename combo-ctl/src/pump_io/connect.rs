//! Connect state machine helpers (spec §4.5). The bulk of the state
//! machine — precondition checks, assembler/barrier reset, starting the
//! receiver, and the subsequent mode switch — lives on `PumpIo` itself in
//! `mod.rs`; this module holds the one step specific to opening the
//! transport-level connection.

use crate::error::Result;
use crate::transport::{self, OutgoingPacketInfo, TransportSession};

/// Step 4 of the connect state machine: `REQUEST_REGULAR_CONNECTION` ->
/// accepted. Caller must hold `session.send_lock()`.
pub async fn open_regular_connection(session: &TransportSession) -> Result<()> {
    let info = OutgoingPacketInfo {
        command: transport::command::REQUEST_REGULAR_CONNECTION,
        reliable: true,
        payload: Vec::new(),
        use_pairing_address: false,
        authenticated: true,
    };
    session
        .send_and_receive(info, Some(transport::command::REGULAR_CONNECTION_REQUEST_ACCEPTED))
        .await?;
    Ok(())
}
