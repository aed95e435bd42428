//! In-memory `PumpStateStore` for scenario tests.

use async_trait::async_trait;
use combo_ctl::error::{ComboError, Result};
use combo_ctl::external::PumpStateStore;
use combo_ctl::nonce::Nonce;
use combo_ctl::transport::state::InvariantPumpData;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (InvariantPumpData, Nonce)>>,
}

impl MemoryStore {
    pub async fn seed(&self, addr: &str, data: InvariantPumpData, nonce: Nonce) {
        self.entries.lock().await.insert(addr.to_string(), (data, nonce));
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl PumpStateStore for MemoryStore {
    async fn has_pump_state(&self, addr: &str) -> Result<bool> {
        Ok(self.entries.lock().await.contains_key(addr))
    }

    async fn create_pump_state(&self, addr: &str, data: &InvariantPumpData) -> Result<()> {
        self.entries.lock().await.insert(addr.to_string(), (data.clone(), Nonce::NULL));
        Ok(())
    }

    async fn get_invariant_data(&self, addr: &str) -> Result<InvariantPumpData> {
        self.entries
            .lock()
            .await
            .get(addr)
            .map(|(data, _)| data.clone())
            .ok_or(ComboError::PumpStateStoreAccess)
    }

    async fn get_current_tx_nonce(&self, addr: &str) -> Result<Nonce> {
        self.entries
            .lock()
            .await
            .get(addr)
            .map(|(_, nonce)| *nonce)
            .ok_or(ComboError::PumpStateStoreAccess)
    }

    async fn set_current_tx_nonce(&self, addr: &str, nonce: Nonce) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(addr).ok_or(ComboError::PumpStateStoreAccess)?;
        entry.1 = nonce;
        Ok(())
    }

    async fn delete_pump_state(&self, addr: &str) -> Result<()> {
        self.entries.lock().await.remove(addr);
        Ok(())
    }
}
