//! Application state management

use mibridge_core::{AccessoryInformation, AccessoryRecord, DeviceId};
use mibridge_platform::{Characteristic, LinkState, Platform};
use serde::Serialize;
use std::sync::Arc;

use crate::store::AccessoryStore;

/// Shared application state
pub struct AppState {
    pub platform: Arc<Platform>,
    pub store: Arc<AccessoryStore>,
}

/// Accessory as shown by the API
#[derive(Debug, Serialize)]
pub struct AccessoryView {
    #[serde(flatten)]
    pub record: AccessoryRecord,
    pub information: AccessoryInformation,
    pub link: LinkState,
    pub characteristics: Vec<Characteristic>,
}

impl AppState {
    pub fn new(platform: Arc<Platform>, store: Arc<AccessoryStore>) -> Arc<Self> {
        Arc::new(Self { platform, store })
    }

    async fn view(&self, record: AccessoryRecord) -> AccessoryView {
        AccessoryView {
            information: record.information(),
            link: self.platform.reconciler().link_state(&record.id).await,
            characteristics: self.store.characteristics(&record.id).await,
            record,
        }
    }

    /// All accessories, ordered by id
    pub async fn accessories(&self) -> Vec<AccessoryView> {
        let mut views = Vec::new();
        for record in self.platform.registry().all().await {
            views.push(self.view(record).await);
        }
        views
    }

    pub async fn accessory(&self, id: &DeviceId) -> Option<AccessoryView> {
        let record = self.platform.registry().get(id).await?;
        Some(self.view(record).await)
    }
}
