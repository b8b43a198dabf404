//! Discovery reconciliation
//!
//! Maps discovery events onto accessory records. Per device id:
//!
//! ```text
//! Unknown --announce--> Probing --supported--> Active <--announce/poll-- Stale
//!                          |                     |                        ^
//!                          +--unsupported--> discarded      vanished------+
//! ```
//!
//! Events are admitted in arrival order and each gets a ticket. Resolution
//! (which probes the device) runs concurrently, but the result is committed
//! under the device lock and only if no later event for the same id has been
//! admitted since. A slow probe can therefore never overwrite the outcome of
//! a newer announcement. Once the registry is shut down nothing more is
//! committed.

use mibridge_core::{AccessoryRecord, DeviceGuard, DeviceId, Registry};
use mibridge_discovery::{DiscoveryEvent, RawAnnouncement, ResolveError, Resolved, Resolver};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::bindings::BindingTable;
use crate::bridge::Bridge;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("Device {id} ({model}) is not a supported device type")]
    UnsupportedDeviceType { id: DeviceId, model: String },
    #[error("Registry is shut down, dropping {0}")]
    ShutDown(DeviceId),
}

/// What an event did to the registry
#[derive(Debug)]
pub enum Outcome {
    /// New record, registered with the bridge
    Created(DeviceId),
    /// Handle replaced and metadata refreshed
    Updated(DeviceId),
    /// Record of a device that turned out unsupported was removed
    Removed(DeviceId),
    /// Reachability cleared, record kept
    MarkedStale(DeviceId),
    /// A later event for the same id was admitted first
    Superseded(DeviceId),
    /// No record for the id
    Unknown(DeviceId),
    /// Stopped before touching the registry
    Ignored(ReconcileError),
}

impl Outcome {
    /// Device the event was resolved to, if it got that far
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Outcome::Created(id)
            | Outcome::Updated(id)
            | Outcome::Removed(id)
            | Outcome::MarkedStale(id)
            | Outcome::Superseded(id)
            | Outcome::Unknown(id)
            | Outcome::Ignored(ReconcileError::UnsupportedDeviceType { id, .. })
            | Outcome::Ignored(ReconcileError::ShutDown(id)) => Some(id),
            Outcome::Ignored(ReconcileError::Resolve(_)) => None,
        }
    }
}

/// Per-device reconciliation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Unknown,
    Probing,
    Active,
    Stale,
}

/// Position of an event in the per-id arrival order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

/// Admission bookkeeping for one id
#[derive(Debug, Clone, Copy)]
struct Pending {
    latest: Ticket,
    in_flight: usize,
}

pub struct Reconciler {
    registry: Arc<Registry>,
    resolver: Arc<Resolver>,
    bridge: Arc<dyn Bridge>,
    table: Arc<BindingTable>,
    next_ticket: AtomicU64,
    pending: Mutex<HashMap<DeviceId, Pending>>,
    probing: Mutex<HashMap<DeviceId, usize>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        resolver: Arc<Resolver>,
        bridge: Arc<dyn Bridge>,
        table: Arc<BindingTable>,
    ) -> Self {
        Self {
            registry,
            resolver,
            bridge,
            table,
            next_ticket: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            probing: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of a device id
    pub async fn link_state(&self, id: &DeviceId) -> LinkState {
        if let Some(record) = self.registry.get(id).await {
            return if record.reachable {
                LinkState::Active
            } else {
                LinkState::Stale
            };
        }
        if self.probing.lock().await.contains_key(id) {
            LinkState::Probing
        } else {
            LinkState::Unknown
        }
    }

    /// Take a ticket for an event; must be called in arrival order
    pub async fn admit(&self, event: &DiscoveryEvent) -> Ticket {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        if let Some(id) = event.device_id() {
            let mut pending = self.pending.lock().await;
            let entry = pending.entry(id).or_insert(Pending {
                latest: ticket,
                in_flight: 0,
            });
            entry.latest = ticket;
            entry.in_flight += 1;
        }
        ticket
    }

    async fn is_latest(&self, id: &DeviceId, ticket: Ticket) -> bool {
        self.pending
            .lock()
            .await
            .get(id)
            .map_or(true, |pending| pending.latest == ticket)
    }

    /// Bookkeeping after an admitted event finished. An id with no record
    /// and no events in flight is forgotten entirely.
    async fn settle(&self, id: &DeviceId) {
        {
            let mut pending = self.pending.lock().await;
            if let Some(entry) = pending.get_mut(id) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                if entry.in_flight == 0 && !self.registry.contains(id).await {
                    pending.remove(id);
                }
            }
        }
        self.registry.forget_lock(id).await;
    }


    /// Admit and process one event
    pub async fn handle(&self, event: DiscoveryEvent) -> Outcome {
        let ticket = self.admit(&event).await;
        self.process(event, ticket).await
    }

    /// Process an admitted event
    pub async fn process(&self, event: DiscoveryEvent, ticket: Ticket) -> Outcome {
        let admitted = event.device_id();
        let outcome = match event {
            DiscoveryEvent::Announced(raw) | DiscoveryEvent::Updated(raw) => {
                self.announce(raw, ticket).await
            }
            DiscoveryEvent::Vanished(id) => self.vanish(id, ticket).await,
        };

        if let Some(id) = &admitted {
            self.settle(id).await;
        }
        // Resolved to an id the announcement did not carry
        if let Some(id) = outcome.device_id() {
            if admitted.as_ref() != Some(id) {
                self.registry.forget_lock(id).await;
            }
        }
        outcome
    }

    /// Consume events until the channel closes; each event is processed
    /// in its own task
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        info!("Reconciler started");
        while let Some(event) = events.recv().await {
            let ticket = self.admit(&event).await;
            let reconciler = self.clone();
            tokio::spawn(async move {
                reconciler.process(event, ticket).await;
            });
        }
        info!("Discovery stream closed, reconciler stopped");
    }

    async fn announce(&self, raw: RawAnnouncement, ticket: Ticket) -> Outcome {
        let id = raw.device_id();
        if let Some(id) = &id {
            *self.probing.lock().await.entry(id.clone()).or_default() += 1;
        }

        let resolved = self.resolver.resolve(&raw).await;

        if let Some(id) = &id {
            let mut probing = self.probing.lock().await;
            if let Some(n) = probing.get_mut(id) {
                *n -= 1;
                if *n == 0 {
                    probing.remove(id);
                }
            }
        }

        match resolved {
            Ok(resolved) => self.commit(resolved, ticket).await,
            Err(e) => {
                if e.is_permanent() {
                    warn!(address = %raw.address, error = %e, "Skipping announcement");
                } else {
                    info!(address = %raw.address, error = %e, "Could not reach device, waiting for next announcement");
                }
                Outcome::Ignored(e.into())
            }
        }
    }

    async fn commit(&self, resolved: Resolved, ticket: Ticket) -> Outcome {
        let id = resolved.descriptor.id.clone();
        let guard = self.registry.lock(&id).await;

        if !self.is_latest(&id, ticket).await {
            debug!(device = %id, endpoint = %resolved.handle.endpoint(), "Superseded by a later event");
            resolved.handle.release().await;
            return Outcome::Superseded(id);
        }
        if self.registry.is_closed() {
            resolved.handle.release().await;
            return Outcome::Ignored(ReconcileError::ShutDown(id));
        }

        let capabilities = resolved.descriptor.capabilities();
        match self.registry.get(&id).await {
            None if capabilities.is_empty() => {
                info!(
                    device = %id,
                    model = %resolved.descriptor.model,
                    "Ignoring unsupported device"
                );
                resolved.handle.release().await;
                Outcome::Ignored(ReconcileError::UnsupportedDeviceType {
                    id,
                    model: resolved.descriptor.model,
                })
            }
            Some(existing) if capabilities.is_empty() && existing.capabilities.is_empty() => {
                resolved.handle.release().await;
                self.remove_unsupported(&id, guard).await
            }
            None => self.create(resolved, guard).await,
            Some(_) => self.refresh(resolved, guard).await,
        }
    }

    async fn create(&self, resolved: Resolved, guard: DeviceGuard) -> Outcome {
        let Resolved { descriptor, handle } = resolved;
        let id = descriptor.id.clone();
        let capabilities = descriptor.capabilities();

        let record = self
            .registry
            .upsert(&id, |slot| {
                slot.record.apply_descriptor(&descriptor);
                slot.record.capabilities = capabilities;
                slot.record.touch();
                slot.record.clone()
            })
            .await;
        match self.registry.install_handle(&id, handle).await {
            Ok(Some(previous)) => previous.release().await,
            Ok(None) => {}
            Err(handle) => {
                handle.release().await;
                return Outcome::Ignored(ReconcileError::ShutDown(id));
            }
        }
        drop(guard);

        info!(
            device = %id,
            model = %record.model,
            address = %record.address,
            "Discovered new device"
        );
        if let Err(e) = self.bridge.register_accessory(&record).await {
            error!(device = %id, error = %e, "Failed to register accessory");
        }
        let characteristics = self.table.characteristics(&record);
        if let Err(e) = self.bridge.bind_characteristics(&record, &characteristics).await {
            error!(device = %id, error = %e, "Failed to bind characteristics");
        }
        Outcome::Created(id)
    }

    async fn refresh(&self, resolved: Resolved, guard: DeviceGuard) -> Outcome {
        let Resolved { descriptor, handle } = resolved;
        let id = descriptor.id.clone();
        let capabilities = descriptor.capabilities();

        let updated = self
            .registry
            .update(&id, |slot| {
                let previous = slot.take_handle();
                let before = slot.record.to_persisted();
                slot.record.apply_descriptor(&descriptor);
                if !capabilities.is_empty() {
                    slot.record.capabilities = capabilities;
                }
                slot.record.touch();
                (slot.record.clone(), previous, before)
            })
            .await;

        let Some((record, previous, before)) = updated else {
            // Purged since the lookup in commit
            handle.release().await;
            return Outcome::Unknown(id);
        };

        // Old connection goes before the new one is installed
        if let Some(previous) = previous {
            debug!(device = %id, endpoint = %previous.endpoint(), "Releasing previous connection");
            previous.release().await;
        }
        if let Err(handle) = self.registry.install_handle(&id, handle).await {
            handle.release().await;
            return if self.registry.is_closed() {
                Outcome::Ignored(ReconcileError::ShutDown(id))
            } else {
                Outcome::Unknown(id)
            };
        }
        drop(guard);

        debug!(device = %id, address = %record.address, "Refreshed known device");
        if record.to_persisted() != before {
            if let Err(e) = self.bridge.update_accessory(&record).await {
                error!(device = %id, error = %e, "Failed to update accessory");
            }
        }
        Outcome::Updated(id)
    }

    async fn remove_unsupported(&self, id: &DeviceId, guard: DeviceGuard) -> Outcome {
        let removed: Option<AccessoryRecord> = self.registry.remove_held(id, &guard).await;
        drop(guard);
        if let Some(record) = removed {
            info!(device = %id, "Removing accessory for unsupported device");
            if let Err(e) = self.bridge.unregister_accessories(&[record]).await {
                error!(device = %id, error = %e, "Failed to unregister accessory");
            }
        }
        Outcome::Removed(id.clone())
    }

    async fn vanish(&self, id: DeviceId, ticket: Ticket) -> Outcome {
        let _guard = self.registry.lock(&id).await;
        if !self.is_latest(&id, ticket).await {
            return Outcome::Superseded(id);
        }
        let marked = self
            .registry
            .update(&id, |slot| slot.record.reachable = false)
            .await;
        match marked {
            Some(()) => {
                info!(device = %id, "Device vanished, marking unreachable");
                Outcome::MarkedStale(id)
            }
            None => Outcome::Unknown(id),
        }
    }
}
