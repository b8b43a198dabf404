//! mibridge RPC - Device RPC relay client
//!
//! Devices are reached through a relay that owns the wire protocol. This
//! crate implements the `DeviceConnector` / `DeviceHandle` boundary on top of
//! the relay's JSON call endpoint.

pub mod gateway;
pub mod protocol;

pub use gateway::{GatewayConnector, GatewayHandle, DEFAULT_TIMEOUT_MS, MIIO_PORT};
