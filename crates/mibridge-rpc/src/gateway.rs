//! HTTP relay connector and device handles

use async_trait::async_trait;
use mibridge_core::{DeviceConnector, DeviceDescriptor, DeviceHandle, Probed, RpcError, StateMap, Token};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::protocol::{zip_properties, CallRequest, CallResponse, InfoResult, METHOD_GET_PROP, METHOD_INFO};

/// Default device port
pub const MIIO_PORT: u16 = 54321;

/// Default timeout for relay calls
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Opens device handles through the relay
pub struct GatewayConnector {
    client: reqwest::Client,
    call_url: String,
    timeout: Duration,
}

impl GatewayConnector {
    /// Create a connector for the relay at `gateway` (e.g. `http://127.0.0.1:54300`)
    pub fn new(gateway: &str, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Unreachable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            call_url: format!("{}/call", gateway.trim_end_matches('/')),
            timeout,
        })
    }
}

#[async_trait]
impl DeviceConnector for GatewayConnector {
    async fn probe(&self, descriptor: &DeviceDescriptor) -> Result<Probed, RpcError> {
        let handle = GatewayHandle {
            client: self.client.clone(),
            call_url: self.call_url.clone(),
            endpoint: SocketAddr::new(descriptor.address, descriptor.port),
            token: descriptor.token.clone(),
            timeout: self.timeout,
            next_id: AtomicU32::new(1),
            released: AtomicBool::new(false),
        };

        let info = handle.call(METHOD_INFO, &[]).await?;
        let info: InfoResult = serde_json::from_value(info)
            .map_err(|e| RpcError::InvalidResponse(format!("miIO.info: {}", e)))?;

        debug!(
            device = %descriptor.id,
            endpoint = %handle.endpoint,
            model = ?info.model,
            firmware = ?info.fw_ver,
            "Device answered probe"
        );

        Ok(Probed {
            handle: Box::new(handle),
            model: info.model,
        })
    }
}

/// Handle for one device endpoint
pub struct GatewayHandle {
    client: reqwest::Client,
    call_url: String,
    endpoint: SocketAddr,
    token: Token,
    timeout: Duration,
    next_id: AtomicU32,
    released: AtomicBool,
}

impl GatewayHandle {
    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one call through the relay and wait for its result
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        if self.released.load(Ordering::Acquire) {
            return Err(RpcError::Released);
        }

        let id = self.next_id();
        let request = CallRequest {
            address: self.endpoint.ip(),
            port: self.endpoint.port(),
            token: self.token.as_str(),
            id,
            method,
            params,
        };

        trace!(endpoint = %self.endpoint, method = method, id = id, "Sending device call");

        let send = async {
            let response = self
                .client
                .post(&self.call_url)
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        RpcError::Timeout(self.timeout)
                    } else {
                        RpcError::Unreachable(e.to_string())
                    }
                })?;

            if !response.status().is_success() {
                return Err(RpcError::Unreachable(format!(
                    "Relay answered HTTP {}",
                    response.status()
                )));
            }

            response
                .json::<CallResponse>()
                .await
                .map_err(|e| RpcError::InvalidResponse(e.to_string()))
        };

        let response = timeout(self.timeout, send)
            .await
            .map_err(|_| RpcError::Timeout(self.timeout))??;

        response.into_result(id)
    }
}

#[async_trait]
impl DeviceHandle for GatewayHandle {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn query_state(&self, keys: &[&str]) -> Result<StateMap, RpcError> {
        let params: Vec<Value> = keys.iter().map(|k| Value::from(*k)).collect();
        let result = self.call(METHOD_GET_PROP, &params).await?;
        zip_properties(keys, result)
    }

    async fn send_command(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.call(method, &args).await.map(|_| ())
    }

    async fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!(endpoint = %self.endpoint, "Device handle released");
        }
    }
}
