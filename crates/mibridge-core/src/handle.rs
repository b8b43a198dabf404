//! Device RPC boundary
//!
//! The wire protocol (command encoding, token authentication, encryption) is
//! implemented elsewhere; the rest of the system only sees these traits.

use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::device::{DeviceDescriptor, StateMap};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Device not reachable: {0}")]
    Unreachable(String),
    #[error("Device rejected call (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Device handle already released")]
    Released,
}

/// Live connection to one device
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    /// Network endpoint this handle talks to
    fn endpoint(&self) -> SocketAddr;

    /// Read the given state keys
    async fn query_state(&self, keys: &[&str]) -> Result<StateMap, RpcError>;

    /// Issue a command; any non-error reply is success
    async fn send_command(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError>;

    /// Release the connection; later calls fail with `RpcError::Released`
    async fn release(&self);
}

/// Result of a successful probe
pub struct Probed {
    pub handle: Box<dyn DeviceHandle>,
    /// Model reported by the device, if it told us
    pub model: Option<String>,
}

impl std::fmt::Debug for Probed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probed")
            .field("endpoint", &self.handle.endpoint())
            .field("model", &self.model)
            .finish()
    }
}

/// Opens device handles
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Round-trip to the device to confirm it answers and learn its model
    async fn probe(&self, descriptor: &DeviceDescriptor) -> Result<Probed, RpcError>;
}
