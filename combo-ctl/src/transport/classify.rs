//! Packet classification hook for the transport receiver task (spec §4.3).
//! `PumpIo` supplies one implementation during pairing (forward
//! everything - the pairing handshake is a strict request/response
//! sequence with nothing to drop inline) and one while connected (drops
//! RT_DISPLAY/RT_BUTTON_CONFIRMATION/RT_KEEP_ALIVE-adjacent traffic after
//! handling it inline, forwards everything else to the awaiting caller).

use crate::error::Result;
use crate::framer::Frame;
use async_trait::async_trait;

pub enum ClassifyOutcome {
    /// Hand the frame to the next `TransportSession::receive` caller.
    Forward,
    /// Fully handled inline by the classifier; no caller should see it.
    Drop,
}

#[async_trait]
pub trait PacketClassifier: Send + Sync {
    /// Returning `Err` terminates the receiver task and fails the session
    /// (used for CTRL_SERVICE_ERROR, spec §7).
    async fn classify(&self, frame: &Frame) -> Result<ClassifyOutcome>;
}

/// Forwards every frame - used during pairing, where every inbound packet
/// is a direct response to the step currently awaited (spec §4.5).
pub struct ForwardAll;

#[async_trait]
impl PacketClassifier for ForwardAll {
    async fn classify(&self, _frame: &Frame) -> Result<ClassifyOutcome> {
        Ok(ClassifyOutcome::Forward)
    }
}
