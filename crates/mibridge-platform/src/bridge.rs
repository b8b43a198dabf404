//! Home-automation bridge boundary

use async_trait::async_trait;
use mibridge_core::AccessoryRecord;
use thiserror::Error;

use crate::bindings::Characteristic;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to persist accessories: {0}")]
    Persistence(String),
}

/// Accessory host: persists records and exposes their characteristics
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Register a newly discovered accessory
    async fn register_accessory(&self, record: &AccessoryRecord) -> Result<(), BridgeError>;

    /// Persist refreshed metadata of an already registered accessory
    async fn update_accessory(&self, record: &AccessoryRecord) -> Result<(), BridgeError>;

    /// Remove accessories in one batch
    async fn unregister_accessories(&self, records: &[AccessoryRecord]) -> Result<(), BridgeError>;

    /// Attach characteristic get/set handlers for an accessory
    async fn bind_characteristics(
        &self,
        record: &AccessoryRecord,
        characteristics: &[Characteristic],
    ) -> Result<(), BridgeError>;
}
