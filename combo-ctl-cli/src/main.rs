//! Documents the call sequence a real host integration follows: construct
//! the injected collaborators (§6 of the library's design), build a
//! `PumpIo`, and drive pairing/connect. The transport here is an in-memory
//! stub that never actually talks to a pump — wiring a real RFCOMM socket
//! and Bluetooth stack is out of scope for this crate (see `combo-ctl`'s
//! `external` module).

use async_trait::async_trait;
use combo_ctl::error::Result;
use combo_ctl::external::{DeviceDisconnect, PinCallback, PumpStateStore, RfcommStream};
use combo_ctl::nonce::Nonce;
use combo_ctl::transport::state::InvariantPumpData;
use combo_ctl::{Mode, PumpIo, PumpIoConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Never produces data and never closes; stands in for a host RFCOMM
/// socket that is connected but silent. A real implementation wraps the
/// host Bluetooth API's blocking read/write on a dedicated thread.
struct NullStream;

#[async_trait]
impl RfcommStream for NullStream {
    async fn send(&mut self, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Minimal in-process pump state store, standing in for a real persistent,
/// crash-safe implementation (spec §6).
#[derive(Default)]
struct InMemoryStore {
    entries: Mutex<HashMap<String, (InvariantPumpData, Nonce)>>,
}

#[async_trait]
impl PumpStateStore for InMemoryStore {
    async fn has_pump_state(&self, addr: &str) -> Result<bool> {
        Ok(self.entries.lock().await.contains_key(addr))
    }

    async fn create_pump_state(&self, addr: &str, data: &InvariantPumpData) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(addr.to_string(), (data.clone(), Nonce::NULL));
        Ok(())
    }

    async fn get_invariant_data(&self, addr: &str) -> Result<InvariantPumpData> {
        self.entries
            .lock()
            .await
            .get(addr)
            .map(|(data, _)| data.clone())
            .ok_or(combo_ctl::ComboError::PumpStateStoreAccess)
    }

    async fn get_current_tx_nonce(&self, addr: &str) -> Result<Nonce> {
        self.entries
            .lock()
            .await
            .get(addr)
            .map(|(_, nonce)| *nonce)
            .ok_or(combo_ctl::ComboError::PumpStateStoreAccess)
    }

    async fn set_current_tx_nonce(&self, addr: &str, nonce: Nonce) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(addr).ok_or(combo_ctl::ComboError::PumpStateStoreAccess)?;
        entry.1 = nonce;
        Ok(())
    }

    async fn delete_pump_state(&self, addr: &str) -> Result<()> {
        self.entries.lock().await.remove(addr);
        Ok(())
    }
}

/// Always answers with the same ten-digit PIN; a real implementation
/// prompts the user and surfaces `previous_attempt_failed`.
struct FixedPin(&'static str);

#[async_trait]
impl PinCallback for FixedPin {
    async fn request_pin(&self, previous_attempt_failed: bool) -> Result<[u8; 10]> {
        if previous_attempt_failed {
            eprintln!("previous PIN attempt failed, retrying with the configured PIN");
        }
        let mut pin = [0u8; 10];
        pin.copy_from_slice(self.0.as_bytes());
        Ok(pin)
    }
}

struct NoopDisconnect;

#[async_trait]
impl DeviceDisconnect for NoopDisconnect {
    async fn disconnect(&self) {}
}

#[tokio::main]
async fn main() {
    let logger = combo_ctl::logging::init_default();

    let pump_io = PumpIo::new(PumpIoConfig {
        stream: Box::new(NullStream),
        store: Arc::new(InMemoryStore::default()),
        pump_addr: "00:11:22:33:44:55".to_string(),
        pin_callback: Arc::new(FixedPin("1234567890")),
        disconnect_callback: Arc::new(NoopDisconnect),
        events: None,
        logger: logger.clone(),
    });

    slog::info!(logger, "starting pairing sequence");
    match tokio::time::timeout(Duration::from_secs(2), pump_io.pair()).await {
        Ok(Ok(())) => {
            slog::info!(logger, "paired");
            match pump_io.connect(Mode::Command, true).await {
                Ok(()) => slog::info!(logger, "connected"),
                Err(e) => slog::warn!(logger, "connect failed"; "error" => %e),
            }
        }
        Ok(Err(e)) => slog::warn!(logger, "pairing failed"; "error" => %e),
        Err(_) => slog::warn!(logger, "pairing timed out talking to the null transport (expected without a real pump)"),
    }
}
