//! JSON accessory store
//!
//! Persists accessory records between runs and acts as the bridge the
//! platform registers accessories with. The whole store is a single JSON
//! manifest rewritten on every change.

use async_trait::async_trait;
use mibridge_core::{AccessoryRecord, DeviceId, PersistedAccessory};
use mibridge_platform::{Bridge, BridgeError, Characteristic};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        BridgeError::Persistence(e.to_string())
    }
}

/// On-disk layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreManifest {
    #[serde(default)]
    pub accessories: BTreeMap<DeviceId, PersistedAccessory>,
}

impl StoreManifest {
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_or_create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

pub struct AccessoryStore {
    path: PathBuf,
    manifest: Mutex<StoreManifest>,
    characteristics: RwLock<HashMap<DeviceId, Vec<Characteristic>>>,
}

impl AccessoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let manifest = StoreManifest::load_or_create(&path)?;
        info!(
            path = %path.display(),
            accessories = manifest.accessories.len(),
            "Opened accessory store"
        );
        Ok(Self {
            path,
            manifest: Mutex::new(manifest),
            characteristics: RwLock::new(HashMap::new()),
        })
    }

    /// Records to hydrate the registry from
    pub async fn persisted(&self) -> Vec<PersistedAccessory> {
        self.manifest.lock().await.accessories.values().cloned().collect()
    }

    /// Characteristics bound for an accessory
    pub async fn characteristics(&self, id: &DeviceId) -> Vec<Characteristic> {
        self.characteristics
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns false when the stored entry was already up to date
    async fn write(&self, record: &AccessoryRecord) -> Result<bool, StoreError> {
        let mut manifest = self.manifest.lock().await;
        let entry = record.to_persisted();
        if manifest.accessories.get(&record.id) == Some(&entry) {
            return Ok(false);
        }
        manifest.accessories.insert(record.id.clone(), entry);
        manifest.save(&self.path).await?;
        Ok(true)
    }
}

#[async_trait]
impl Bridge for AccessoryStore {
    async fn register_accessory(&self, record: &AccessoryRecord) -> Result<(), BridgeError> {
        info!(device = %record.id, name = %record.display_name(), "Registering accessory");
        self.write(record).await?;
        Ok(())
    }

    async fn update_accessory(&self, record: &AccessoryRecord) -> Result<(), BridgeError> {
        if self.write(record).await? {
            debug!(device = %record.id, "Persisted accessory");
        }
        Ok(())
    }

    async fn unregister_accessories(&self, records: &[AccessoryRecord]) -> Result<(), BridgeError> {
        let mut characteristics = self.characteristics.write().await;
        let mut manifest = self.manifest.lock().await;
        for record in records {
            info!(device = %record.id, "Unregistering accessory");
            manifest.accessories.remove(&record.id);
            characteristics.remove(&record.id);
        }
        Ok(manifest.save(&self.path).await?)
    }

    async fn bind_characteristics(
        &self,
        record: &AccessoryRecord,
        characteristics: &[Characteristic],
    ) -> Result<(), BridgeError> {
        debug!(device = %record.id, count = characteristics.len(), "Binding characteristics");
        self.characteristics
            .write()
            .await
            .insert(record.id.clone(), characteristics.to_vec());
        Ok(())
    }
}
