//! Accessory records and their persisted form

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

use crate::device::{Capability, DeviceDescriptor, DeviceId, StateMap};

/// Version string of the running system. Persisted records tagged with any
/// other version are purged at startup.
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Manufacturer reported for every accessory
pub const MANUFACTURER: &str = "Xiaomi";

/// Accessory known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessoryRecord {
    /// Primary key, matches the device-reported id
    pub id: DeviceId,
    /// Bridge-facing accessory UUID (derived from `id`)
    pub uuid: Uuid,
    /// Which logical shape produced this record
    pub schema_version: String,
    pub capabilities: BTreeSet<Capability>,
    pub address: IpAddr,
    pub port: u16,
    pub model: String,
    pub last_known_state: StateMap,
    pub reachable: bool,
    /// Last announcement or successful poll
    pub last_seen: Option<DateTime<Utc>>,
}

/// Identity strings shown by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryInformation {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
}

impl AccessoryRecord {
    /// Create an empty record for a device not yet described
    pub fn new(id: DeviceId, schema_version: &str) -> Self {
        Self {
            uuid: id.accessory_uuid(),
            id,
            schema_version: schema_version.to_string(),
            capabilities: BTreeSet::new(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            model: String::new(),
            last_known_state: StateMap::new(),
            reachable: false,
            last_seen: None,
        }
    }

    /// Refresh network identity and model from a resolved descriptor
    pub fn apply_descriptor(&mut self, descriptor: &DeviceDescriptor) {
        self.address = descriptor.address;
        self.port = descriptor.port;
        if !descriptor.model.is_empty() {
            self.model = descriptor.model.clone();
        }
    }

    /// Whether this record was produced by the running version
    pub fn is_current(&self, version: &str) -> bool {
        self.schema_version == version
    }

    /// Mark the device as seen now
    pub fn touch(&mut self) {
        self.reachable = true;
        self.last_seen = Some(Utc::now());
    }

    pub fn display_name(&self) -> String {
        if self.capabilities.contains(&Capability::SwitchPlug) {
            format!("Miio Plug {}", self.id)
        } else {
            format!("Miio Device {}", self.id)
        }
    }

    pub fn information(&self) -> AccessoryInformation {
        let model = if self.model.is_empty() {
            "Unknown Device"
        } else {
            self.model.as_str()
        };
        AccessoryInformation {
            name: self.display_name(),
            manufacturer: MANUFACTURER.to_string(),
            model: format!("v{}: {}", self.schema_version, model),
            serial_number: self.id.to_string(),
        }
    }

    pub fn to_persisted(&self) -> PersistedAccessory {
        PersistedAccessory {
            id: self.id.clone(),
            schema_version: self.schema_version.clone(),
            capabilities: self.capabilities.iter().copied().collect(),
            address: self.address,
            port: self.port,
            model: self.model.clone(),
        }
    }

    /// Restore a record from the bridge's store. Reachability is unknown
    /// until the device announces itself or answers a poll.
    pub fn from_persisted(persisted: PersistedAccessory) -> Self {
        let mut record = Self::new(persisted.id, &persisted.schema_version);
        record.capabilities = persisted.capabilities.into_iter().collect();
        record.address = persisted.address;
        record.port = persisted.port;
        record.model = persisted.model;
        record
    }
}

/// Record layout written through the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAccessory {
    pub id: DeviceId,
    pub schema_version: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Token;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new("abc123").unwrap(),
            address: "192.168.1.40".parse().unwrap(),
            port: 54321,
            model: "chuangmi.plug.v2".to_string(),
            token: Token::parse("00112233445566778899aabbccddeeff").unwrap(),
            capability_hints: ["power-switch".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_new_record_is_unreachable() {
        let record = AccessoryRecord::new(DeviceId::new("abc123").unwrap(), SCHEMA_VERSION);
        assert!(!record.reachable);
        assert!(record.is_current(SCHEMA_VERSION));
        assert_eq!(record.uuid, record.id.accessory_uuid());
    }

    #[test]
    fn test_apply_descriptor_keeps_model_when_unconfirmed() {
        let mut record = AccessoryRecord::new(DeviceId::new("abc123").unwrap(), "1.0.0");
        record.apply_descriptor(&descriptor());
        assert_eq!(record.model, "chuangmi.plug.v2");

        let mut unconfirmed = descriptor();
        unconfirmed.model.clear();
        unconfirmed.port = 1234;
        record.apply_descriptor(&unconfirmed);
        assert_eq!(record.model, "chuangmi.plug.v2");
        assert_eq!(record.port, 1234);
    }

    #[test]
    fn test_information() {
        let mut record = AccessoryRecord::new(DeviceId::new("abc123").unwrap(), "1.0.0");
        assert_eq!(record.information().model, "v1.0.0: Unknown Device");

        record.capabilities.insert(Capability::SwitchPlug);
        record.model = "chuangmi.plug.v2".to_string();
        let info = record.information();
        assert_eq!(info.name, "Miio Plug abc123");
        assert_eq!(info.manufacturer, "Xiaomi");
        assert_eq!(info.model, "v1.0.0: chuangmi.plug.v2");
        assert_eq!(info.serial_number, "abc123");
    }

    #[test]
    fn test_persisted_layout() {
        let mut record = AccessoryRecord::new(DeviceId::new("abc123").unwrap(), "1.0.0");
        record.apply_descriptor(&descriptor());
        record.capabilities.insert(Capability::SwitchPlug);
        record.touch();

        let json = serde_json::to_value(record.to_persisted()).unwrap();
        assert_eq!(json["schemaVersion"], "1.0.0");
        assert_eq!(json["capabilities"][0], "SwitchPlug");
        assert_eq!(json["address"], "192.168.1.40");

        let restored = AccessoryRecord::from_persisted(serde_json::from_value(json).unwrap());
        assert_eq!(restored.capabilities, record.capabilities);
        assert!(!restored.reachable);
    }
}
