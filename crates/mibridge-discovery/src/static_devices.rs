//! Statically configured devices
//!
//! Devices on networks where multicast does not reach can be listed by
//! address; each is announced once at startup.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::info;

use crate::event::{DiscoveryEvent, RawAnnouncement};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticDevice {
    pub id: String,
    pub address: IpAddr,
    pub port: u16,
    pub model: Option<String>,
    pub token: Option<String>,
}

impl StaticDevice {
    pub fn announcement(&self) -> RawAnnouncement {
        let mut raw = RawAnnouncement::new(self.address, self.port);
        raw.id = Some(self.id.clone());
        raw.model = self.model.clone();
        raw.token = self.token.clone();
        raw
    }

    /// Announce every device once
    pub async fn announce_all(devices: &[StaticDevice], events: &mpsc::Sender<DiscoveryEvent>) {
        for device in devices {
            info!(device = %device.id, address = %device.address, "Announcing configured device");
            if events
                .send(DiscoveryEvent::Announced(device.announcement()))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}
