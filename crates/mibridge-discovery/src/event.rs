//! Discovery events

use mibridge_core::DeviceId;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::resolver::parse_hostname;

/// Unprocessed announcement, as delivered by a discovery source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAnnouncement {
    /// Advertised instance/host name (`chuangmi-plug-v2_miio12345678`)
    pub hostname: Option<String>,
    pub address: IpAddr,
    pub port: u16,
    /// Explicit device id, when the source knows it
    pub id: Option<String>,
    pub model: Option<String>,
    /// Token carried by the announcement (hex)
    pub token: Option<String>,
}

impl RawAnnouncement {
    /// Announcement for a bare address and port
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            hostname: None,
            address,
            port,
            id: None,
            model: None,
            token: None,
        }
    }

    /// Device id carried by the announcement, explicit or from the host name
    pub fn device_id(&self) -> Option<DeviceId> {
        self.id
            .as_deref()
            .and_then(DeviceId::new)
            .or_else(|| {
                self.hostname
                    .as_deref()
                    .and_then(parse_hostname)
                    .map(|info| info.id)
            })
    }
}

/// Discovery event stream item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Device seen for the first time by this source
    Announced(RawAnnouncement),
    /// Device seen again, possibly with new details
    Updated(RawAnnouncement),
    /// Device no longer announced
    Vanished(DeviceId),
}

impl DiscoveryEvent {
    /// Device this event is about, if it can be identified
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            DiscoveryEvent::Announced(raw) | DiscoveryEvent::Updated(raw) => raw.device_id(),
            DiscoveryEvent::Vanished(id) => Some(id.clone()),
        }
    }
}
