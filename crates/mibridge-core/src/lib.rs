//! mibridge Core - Core types and the accessory registry
//!
//! This crate provides the foundational types for the mibridge system:
//! - Device descriptors produced from discovery announcements
//! - Accessory records persisted through the bridge
//! - The device RPC boundary (`DeviceConnector` / `DeviceHandle`)
//! - The accessory registry that owns records and their device handles

pub mod accessory;
pub mod device;
pub mod handle;
pub mod registry;

pub use accessory::{AccessoryInformation, AccessoryRecord, PersistedAccessory, SCHEMA_VERSION};
pub use device::{
    hints_for_model, Capability, DeviceDescriptor, DeviceId, StateMap, StateValue, Token,
    TokenError,
};
pub use handle::{DeviceConnector, DeviceHandle, Probed, RpcError};
pub use registry::{DeviceGuard, Registry, Slot};
