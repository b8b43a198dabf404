//! Capability bindings
//!
//! Each capability contributes a [`CapabilityBinding`] that maps
//! accessory-facing characteristics onto device state keys and commands.
//! Adding a capability means adding a binding to the [`BindingTable`]; the
//! reconciler and scheduler only consult the table.
//!
//! Reads return the cached state immediately and kick off an on-demand poll.
//! Writes go to the device and only update the cache once it confirmed.

use mibridge_core::{AccessoryRecord, Capability, DeviceId, Registry, RpcError, StateValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::scheduler::PollScheduler;

/// Accessory-facing characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Characteristic {
    On,
    OutletInUse,
}

impl Characteristic {
    pub fn name(&self) -> &'static str {
        match self {
            Characteristic::On => "On",
            Characteristic::OutletInUse => "OutletInUse",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [Characteristic::On, Characteristic::OutletInUse]
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("Unknown accessory {0}")]
    UnknownAccessory(DeviceId),
    #[error("Accessory {id} has no characteristic {characteristic}")]
    UnsupportedCharacteristic {
        id: DeviceId,
        characteristic: Characteristic,
    },
    #[error("Invalid value for {characteristic}: {value}")]
    InvalidValue {
        characteristic: Characteristic,
        value: String,
    },
    #[error("Characteristic {0} is read-only")]
    ReadOnly(Characteristic),
    #[error("Communications error: {0}")]
    CommandFailure(#[from] RpcError),
}

/// Device command produced by a characteristic write
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub method: String,
    pub args: Vec<Value>,
    /// State key updated once the device confirms
    pub key: &'static str,
    pub value: StateValue,
}

/// Binding between one capability and its characteristics
pub trait CapabilityBinding: Send + Sync {
    fn capability(&self) -> Capability;

    fn characteristics(&self) -> &'static [Characteristic];

    /// State keys polled for this capability
    fn state_keys(&self) -> &'static [&'static str];

    /// Current value from cached state
    fn read(&self, characteristic: Characteristic, record: &AccessoryRecord) -> Option<StateValue>;

    /// Command that sets `characteristic` to `value`
    fn command(&self, characteristic: Characteristic, value: &StateValue) -> Result<Command, BindingError>;
}

/// Power outlet: `On` follows the `power` property
pub struct SwitchPlugBinding;

const POWER: &str = "power";

impl CapabilityBinding for SwitchPlugBinding {
    fn capability(&self) -> Capability {
        Capability::SwitchPlug
    }

    fn characteristics(&self) -> &'static [Characteristic] {
        &[Characteristic::On, Characteristic::OutletInUse]
    }

    fn state_keys(&self) -> &'static [&'static str] {
        &[POWER]
    }

    fn read(&self, characteristic: Characteristic, record: &AccessoryRecord) -> Option<StateValue> {
        match characteristic {
            Characteristic::On => record
                .last_known_state
                .get(POWER)
                .and_then(StateValue::as_bool)
                .map(StateValue::Bool),
            // The plug cannot tell whether something is plugged in
            Characteristic::OutletInUse => Some(StateValue::Bool(true)),
        }
    }

    fn command(&self, characteristic: Characteristic, value: &StateValue) -> Result<Command, BindingError> {
        match characteristic {
            Characteristic::On => {
                let on = value.as_bool().ok_or_else(|| BindingError::InvalidValue {
                    characteristic,
                    value: format!("{:?}", value),
                })?;
                Ok(Command {
                    method: "set_power".to_string(),
                    args: vec![Value::from(if on { "on" } else { "off" })],
                    key: POWER,
                    value: StateValue::Bool(on),
                })
            }
            Characteristic::OutletInUse => Err(BindingError::ReadOnly(characteristic)),
        }
    }
}

/// All known capability bindings
pub struct BindingTable {
    bindings: Vec<Arc<dyn CapabilityBinding>>,
}

impl Default for BindingTable {
    fn default() -> Self {
        Self::empty().with(Arc::new(SwitchPlugBinding))
    }
}

impl BindingTable {
    pub fn empty() -> Self {
        Self { bindings: Vec::new() }
    }

    pub fn with(mut self, binding: Arc<dyn CapabilityBinding>) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn for_capability(&self, capability: Capability) -> Option<&Arc<dyn CapabilityBinding>> {
        self.bindings.iter().find(|b| b.capability() == capability)
    }

    fn for_record<'a>(
        &'a self,
        record: &'a AccessoryRecord,
    ) -> impl Iterator<Item = &'a Arc<dyn CapabilityBinding>> + 'a {
        record
            .capabilities
            .iter()
            .filter_map(move |c| self.for_capability(*c))
    }

    /// Binding that serves `characteristic` for this record
    pub fn resolve(
        &self,
        record: &AccessoryRecord,
        characteristic: Characteristic,
    ) -> Option<&Arc<dyn CapabilityBinding>> {
        record
            .capabilities
            .iter()
            .filter_map(|c| self.for_capability(*c))
            .find(|b| b.characteristics().contains(&characteristic))
    }

    /// Characteristics exposed for this record
    pub fn characteristics(&self, record: &AccessoryRecord) -> Vec<Characteristic> {
        let mut out = Vec::new();
        for binding in self.for_record(record) {
            for c in binding.characteristics() {
                if !out.contains(c) {
                    out.push(*c);
                }
            }
        }
        out
    }

    /// State keys to poll for this record; empty when nothing is queryable
    pub fn state_keys(&self, record: &AccessoryRecord) -> Vec<&'static str> {
        let mut keys = Vec::new();
        for binding in self.for_record(record) {
            for key in binding.state_keys() {
                if !keys.contains(key) {
                    keys.push(*key);
                }
            }
        }
        keys
    }
}

/// Characteristic get/set handlers backed by the registry
pub struct Bindings {
    registry: Arc<Registry>,
    table: Arc<BindingTable>,
    scheduler: Arc<PollScheduler>,
}

impl Bindings {
    pub fn new(registry: Arc<Registry>, table: Arc<BindingTable>, scheduler: Arc<PollScheduler>) -> Self {
        Self {
            registry,
            table,
            scheduler,
        }
    }

    pub fn table(&self) -> &Arc<BindingTable> {
        &self.table
    }

    async fn lookup(
        &self,
        id: &DeviceId,
        characteristic: Characteristic,
    ) -> Result<(AccessoryRecord, Arc<dyn CapabilityBinding>), BindingError> {
        let record = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| BindingError::UnknownAccessory(id.clone()))?;
        let binding = self
            .table
            .resolve(&record, characteristic)
            .cloned()
            .ok_or_else(|| BindingError::UnsupportedCharacteristic {
                id: id.clone(),
                characteristic,
            })?;
        Ok((record, binding))
    }

    /// Last cached value; never waits on the network.
    ///
    /// Schedules an on-demand poll of the device in the background.
    pub async fn read(
        &self,
        id: &DeviceId,
        characteristic: Characteristic,
    ) -> Result<Option<StateValue>, BindingError> {
        let (record, binding) = self.lookup(id, characteristic).await?;
        let value = binding.read(characteristic, &record);
        debug!(device = %id, characteristic = %characteristic, value = ?value, "Characteristic read");

        let scheduler = self.scheduler.clone();
        let id = id.clone();
        tokio::spawn(async move {
            scheduler.refresh(&id).await;
        });

        Ok(value)
    }

    /// Send the value to the device; the cache only changes on success
    pub async fn write(
        &self,
        id: &DeviceId,
        characteristic: Characteristic,
        value: StateValue,
    ) -> Result<(), BindingError> {
        let (_, binding) = self.lookup(id, characteristic).await?;
        let command = binding.command(characteristic, &value)?;

        let _guard = self.registry.lock(id).await;
        let handle = self.registry.handle(id).await.ok_or_else(|| {
            BindingError::CommandFailure(RpcError::Unreachable(format!("no connection to {}", id)))
        })?;

        info!(device = %id, characteristic = %characteristic, value = ?command.value, "Setting characteristic");

        let limit = self.scheduler.config().query_timeout;
        let result = match timeout(limit, handle.send_command(&command.method, command.args)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(limit)),
        };

        match result {
            Ok(()) => {
                let key = command.key;
                let value = command.value;
                self.registry
                    .update(id, |slot| {
                        slot.record.last_known_state.insert(key.to_string(), value);
                        slot.record.touch();
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(device = %id, characteristic = %characteristic, error = %e, "Command failed");
                Err(BindingError::CommandFailure(e))
            }
        }
    }
}
