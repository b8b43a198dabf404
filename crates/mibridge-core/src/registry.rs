//! Accessory registry
//!
//! The registry is the only shared mutable state in the system. It maps
//! device ids to accessory records and owns each record's device handle.
//!
//! Two kinds of exclusion are provided:
//! - Record mutations (`upsert`, `update`, `remove`) are atomic with respect
//!   to each other; closures run under the map lock and must not block.
//! - Network work against a device (queries, commands, handle swaps) is
//!   serialized per id with [`Registry::lock`]. At most one such operation is
//!   in flight per device, while different devices proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::accessory::{AccessoryRecord, PersistedAccessory};
use crate::device::DeviceId;
use crate::handle::DeviceHandle;

/// Held while performing network work against one device
pub type DeviceGuard = OwnedMutexGuard<()>;

/// Registry entry: the record plus the device handle it exclusively owns
pub struct Slot {
    pub record: AccessoryRecord,
    handle: Option<Arc<dyn DeviceHandle>>,
    created: bool,
}

impl Slot {
    fn new(record: AccessoryRecord) -> Self {
        Self {
            record,
            handle: None,
            created: false,
        }
    }

    /// True while the closure that created this slot is running
    pub fn is_new(&self) -> bool {
        self.created
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Install a new handle, returning the previous one for the caller to release
    pub fn replace_handle(&mut self, handle: Box<dyn DeviceHandle>) -> Option<Arc<dyn DeviceHandle>> {
        self.handle.replace(Arc::from(handle))
    }

    pub fn take_handle(&mut self) -> Option<Arc<dyn DeviceHandle>> {
        self.handle.take()
    }
}

/// In-memory map from device id to accessory record
pub struct Registry {
    version: String,
    slots: RwLock<HashMap<DeviceId, Slot>>,
    gates: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl Registry {
    /// Create an empty registry for the given running version
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            slots: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a registry from persisted records and run the startup sweep.
    ///
    /// Returns the registry and the records purged because their schema
    /// version differs from `version`.
    pub async fn hydrate(
        version: &str,
        persisted: impl IntoIterator<Item = PersistedAccessory>,
    ) -> (Self, Vec<AccessoryRecord>) {
        let mut slots = HashMap::new();
        for entry in persisted {
            let record = AccessoryRecord::from_persisted(entry);
            if slots.contains_key(&record.id) {
                warn!(device = %record.id, "Duplicate persisted accessory, keeping the last one");
            }
            slots.insert(record.id.clone(), Slot::new(record));
        }

        let registry = Self {
            version: version.to_string(),
            slots: RwLock::new(slots),
            gates: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        let purged = registry.purge_outdated().await;
        info!(
            restored = registry.len().await,
            purged = purged.len(),
            "Registry hydrated"
        );
        (registry, purged)
    }

    /// Running version new records are tagged with
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Snapshot of one record
    pub async fn get(&self, id: &DeviceId) -> Option<AccessoryRecord> {
        self.slots.read().await.get(id).map(|s| s.record.clone())
    }

    /// Snapshot of all records, ordered by id
    pub async fn all(&self) -> Vec<AccessoryRecord> {
        let slots = self.slots.read().await;
        let mut records: Vec<_> = slots.values().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn contains(&self, id: &DeviceId) -> bool {
        self.slots.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Create the record if absent, then apply `mutate` atomically
    pub async fn upsert<F, R>(&self, id: &DeviceId, mutate: F) -> R
    where
        F: FnOnce(&mut Slot) -> R,
    {
        let mut slots = self.slots.write().await;
        let slot = slots.entry(id.clone()).or_insert_with(|| {
            debug!(device = %id, "Creating accessory record");
            let mut slot = Slot::new(AccessoryRecord::new(id.clone(), &self.version));
            slot.created = true;
            slot
        });
        let result = mutate(slot);
        slot.created = false;
        result
    }

    /// Apply `mutate` to an existing record; absent records are left absent
    pub async fn update<F, R>(&self, id: &DeviceId, mutate: F) -> Option<R>
    where
        F: FnOnce(&mut Slot) -> R,
    {
        self.slots.write().await.get_mut(id).map(mutate)
    }

    /// Install a handle on an existing record, returning the one it displaces.
    ///
    /// After [`shutdown`](Self::shutdown), or when the record is gone, the
    /// handle is given back for the caller to release.
    pub async fn install_handle(
        &self,
        id: &DeviceId,
        handle: Box<dyn DeviceHandle>,
    ) -> Result<Option<Arc<dyn DeviceHandle>>, Box<dyn DeviceHandle>> {
        let mut slots = self.slots.write().await;
        if self.is_closed() {
            return Err(handle);
        }
        match slots.get_mut(id) {
            Some(slot) => Ok(slot.replace_handle(handle)),
            None => Err(handle),
        }
    }

    /// True once [`shutdown`](Self::shutdown) has started
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current device handle for `id`. Callers should hold the device's
    /// [`lock`](Self::lock) for as long as they use it.
    pub async fn handle(&self, id: &DeviceId) -> Option<Arc<dyn DeviceHandle>> {
        self.slots.read().await.get(id).and_then(|s| s.handle.clone())
    }

    async fn gate(&self, id: &DeviceId) -> Arc<Mutex<()>> {
        self.gates
            .lock()
            .await
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive network access to one device
    pub async fn lock(&self, id: &DeviceId) -> DeviceGuard {
        self.gate(id).await.lock_owned().await
    }

    /// Exclusive network access to one device, or `None` if it is busy
    pub async fn try_lock(&self, id: &DeviceId) -> Option<DeviceGuard> {
        self.gate(id).await.try_lock_owned().ok()
    }

    /// Remove a record, releasing its device handle first
    pub async fn remove(&self, id: &DeviceId) -> Option<AccessoryRecord> {
        let guard = self.lock(id).await;
        let removed = self.remove_held(id, &guard).await;
        drop(guard);
        self.forget_lock(id).await;
        removed
    }

    /// Drop the device lock of an id with no record, unless someone holds
    /// or waits on it
    pub async fn forget_lock(&self, id: &DeviceId) {
        let mut gates = self.gates.lock().await;
        if self.slots.read().await.contains_key(id) {
            return;
        }
        if gates.get(id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(id);
        }
    }

    /// Remove a record while the caller already holds the device's lock
    pub async fn remove_held(&self, id: &DeviceId, _guard: &DeviceGuard) -> Option<AccessoryRecord> {
        let slot = self.slots.write().await.remove(id)?;
        if let Some(handle) = slot.handle {
            handle.release().await;
        }
        info!(device = %id, "Accessory record removed");
        Some(slot.record)
    }

    /// Remove every record whose schema version differs from the running
    /// version, in one batch
    pub async fn purge_outdated(&self) -> Vec<AccessoryRecord> {
        let outdated: Vec<Slot> = {
            let mut slots = self.slots.write().await;
            let ids: Vec<DeviceId> = slots
                .values()
                .filter(|s| !s.record.is_current(&self.version))
                .map(|s| s.record.id.clone())
                .collect();
            ids.iter().filter_map(|id| slots.remove(id)).collect()
        };

        let mut purged = Vec::with_capacity(outdated.len());
        for slot in outdated {
            info!(
                device = %slot.record.id,
                schema_version = %slot.record.schema_version,
                "Purging outdated accessory"
            );
            if let Some(handle) = slot.handle {
                handle.release().await;
            }
            purged.push(slot.record);
        }
        purged
    }

    /// Release every device handle and refuse new ones. Records are kept.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut slots = self.slots.write().await;
            self.closed.store(true, Ordering::SeqCst);
            slots.values_mut().filter_map(Slot::take_handle).collect()
        };
        info!(count = handles.len(), "Releasing device handles");
        for handle in handles {
            handle.release().await;
        }
    }
}
