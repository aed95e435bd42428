//! In-memory duplex `RfcommStream` pair for scenario tests (spec §8),
//! mirroring the teacher's `MockChannel`-backed channel tests in
//! `net::buffer`'s test module but across the async trait boundary.

use async_trait::async_trait;
use combo_ctl::error::Result as ComboResult;
use combo_ctl::external::RfcommStream;
use tokio::sync::mpsc;

/// The client-facing half, handed to `PumpIo`/`TransportSession` as its
/// `RfcommStream`. Every `send()` call carries exactly one whole frame, so
/// the pump-facing half never needs to reassemble a byte stream.
pub struct ClientStream {
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl RfcommStream for ClientStream {
    async fn send(&mut self, bytes: &[u8]) -> ComboResult<()> {
        let _ = self.outgoing.send(bytes.to_vec()).await;
        Ok(())
    }

    async fn receive(&mut self) -> ComboResult<Vec<u8>> {
        match self.incoming.recv().await {
            Some(bytes) => Ok(bytes),
            None => Ok(Vec::new()),
        }
    }
}

/// The pump-facing half, driven by a test's scripted responder task.
pub struct PumpSide {
    pub from_client: mpsc::Receiver<Vec<u8>>,
    pub to_client: mpsc::Sender<Vec<u8>>,
}

impl PumpSide {
    /// Reads exactly one frame's raw bytes as sent by the client.
    pub async fn recv_frame_bytes(&mut self) -> Vec<u8> {
        self.from_client.recv().await.expect("client stream closed unexpectedly")
    }

    pub async fn send_frame_bytes(&mut self, bytes: Vec<u8>) {
        let _ = self.to_client.send(bytes).await;
    }
}

pub fn duplex() -> (ClientStream, PumpSide) {
    let (c2p_tx, c2p_rx) = mpsc::channel(16);
    let (p2c_tx, p2c_rx) = mpsc::channel(16);
    (
        ClientStream { outgoing: c2p_tx, incoming: p2c_rx },
        PumpSide { from_client: c2p_rx, to_client: p2c_tx },
    )
}
