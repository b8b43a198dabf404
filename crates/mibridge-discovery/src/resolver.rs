//! Device descriptor resolution
//!
//! Turns a raw announcement into a [`DeviceDescriptor`]:
//! 1. Identify the device (explicit id or advertised host name)
//! 2. Find a usable token (announcement first, then the credential table)
//! 3. Probe the device to confirm it answers and learn its model

use mibridge_core::{
    hints_for_model, DeviceConnector, DeviceDescriptor, DeviceHandle, DeviceId, RpcError, Token,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::event::RawAnnouncement;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Announcement from {0} carries no device id")]
    MissingIdentity(IpAddr),
    #[error("No usable token for device {0}")]
    MissingCredential(DeviceId),
    #[error("Probe of device {id} failed: {source}")]
    ProbeFailure {
        id: DeviceId,
        #[source]
        source: RpcError,
    },
}

impl ResolveError {
    /// Permanent failures will not go away by themselves; probe failures
    /// are retried by the next announcement
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ResolveError::ProbeFailure { .. })
    }
}

/// Model and id encoded in an advertised host name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnameInfo {
    pub model: String,
    pub id: DeviceId,
}

/// Parse `<model-with-dashes>_miio<id>` (or `_mibt<id>`), with or without a
/// trailing `.local.`
pub fn parse_hostname(hostname: &str) -> Option<HostnameInfo> {
    let name = hostname.trim_end_matches('.');
    let name = name.strip_suffix(".local").unwrap_or(name);

    let (split, marker_len) = ["_miio", "_mibt"]
        .iter()
        .filter_map(|marker| name.rfind(marker).map(|pos| (pos, marker.len())))
        .max_by_key(|(pos, _)| *pos)?;

    let model = &name[..split];
    let id = &name[split + marker_len..];
    if model.is_empty() {
        return None;
    }

    Some(HostnameInfo {
        model: model.replace('-', "."),
        id: DeviceId::new(id)?,
    })
}

/// Tokens known ahead of time, keyed by device id
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    tokens: HashMap<DeviceId, Token>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: DeviceId, token: Token) {
        self.tokens.insert(id, token);
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Token> {
        self.tokens.get(id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// A descriptor together with the handle opened by the probe
pub struct Resolved {
    pub descriptor: DeviceDescriptor,
    pub handle: Box<dyn DeviceHandle>,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("descriptor", &self.descriptor)
            .field("endpoint", &self.handle.endpoint())
            .finish()
    }
}

/// Device descriptor resolver
pub struct Resolver {
    connector: Arc<dyn DeviceConnector>,
    credentials: Credentials,
    probe_timeout: Duration,
}

impl Resolver {
    pub fn new(connector: Arc<dyn DeviceConnector>, credentials: Credentials, probe_timeout: Duration) -> Self {
        Self {
            connector,
            credentials,
            probe_timeout,
        }
    }

    /// Normalize an announcement without touching the network
    pub fn describe(&self, raw: &RawAnnouncement) -> Result<DeviceDescriptor, ResolveError> {
        let from_hostname = raw.hostname.as_deref().and_then(parse_hostname);

        let id = raw
            .device_id()
            .ok_or(ResolveError::MissingIdentity(raw.address))?;

        let token = raw
            .token
            .as_deref()
            .and_then(|t| Token::parse(t).ok())
            .or_else(|| self.credentials.get(&id).cloned())
            .ok_or_else(|| ResolveError::MissingCredential(id.clone()))?;

        let model = raw
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| from_hostname.map(|info| info.model))
            .unwrap_or_default();

        Ok(DeviceDescriptor {
            capability_hints: hints_for_model(&model),
            id,
            address: raw.address,
            port: raw.port,
            model,
            token,
        })
    }

    /// Full resolution: describe, then probe the device
    pub async fn resolve(&self, raw: &RawAnnouncement) -> Result<Resolved, ResolveError> {
        let descriptor = self.describe(raw)?;
        self.probe(descriptor).await
    }

    /// Probe an already described device, confirming its model
    pub async fn probe(&self, mut descriptor: DeviceDescriptor) -> Result<Resolved, ResolveError> {
        info!(
            device = %descriptor.id,
            address = %descriptor.address,
            port = descriptor.port,
            "Investigating device"
        );

        let probed = match timeout(self.probe_timeout, self.connector.probe(&descriptor)).await {
            Ok(Ok(probed)) => probed,
            Ok(Err(source)) => {
                return Err(ResolveError::ProbeFailure {
                    id: descriptor.id,
                    source,
                })
            }
            Err(_) => {
                return Err(ResolveError::ProbeFailure {
                    id: descriptor.id,
                    source: RpcError::Timeout(self.probe_timeout),
                })
            }
        };

        if let Some(model) = probed.model.as_deref() {
            descriptor.confirm_model(model);
        }
        debug!(device = %descriptor.id, model = %descriptor.model, "Device resolved");

        Ok(Resolved {
            descriptor,
            handle: probed.handle,
        })
    }
}
