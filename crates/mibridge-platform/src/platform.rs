//! Platform lifecycle: startup sweep, task wiring and shutdown

use mibridge_core::{PersistedAccessory, Registry};
use mibridge_discovery::{DiscoveryEvent, Resolver};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bindings::{BindingTable, Bindings};
use crate::bridge::Bridge;
use crate::reconciler::Reconciler;
use crate::scheduler::{PollConfig, PollScheduler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Run the poll scheduler at all
    pub poll_changes: bool,
    pub poll: PollConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            poll_changes: true,
            poll: PollConfig::default(),
        }
    }
}

pub struct Platform {
    registry: Arc<Registry>,
    table: Arc<BindingTable>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<PollScheduler>,
    bindings: Arc<Bindings>,
    bridge: Arc<dyn Bridge>,
    config: PlatformConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Platform {
    /// Hydrate the registry from persisted records and run the startup sweep.
    ///
    /// Outdated records are unregistered in one batch; surviving records get
    /// their characteristics bound again. Discovery is not consumed until
    /// [`spawn`](Self::spawn).
    pub async fn start(
        version: &str,
        persisted: Vec<PersistedAccessory>,
        resolver: Arc<Resolver>,
        bridge: Arc<dyn Bridge>,
        config: PlatformConfig,
    ) -> Self {
        let (registry, purged) = Registry::hydrate(version, persisted).await;
        let registry = Arc::new(registry);

        if !purged.is_empty() {
            info!(count = purged.len(), "Unregistering outdated accessories");
            if let Err(e) = bridge.unregister_accessories(&purged).await {
                error!(error = %e, "Failed to unregister outdated accessories");
            }
        }

        let table = Arc::new(BindingTable::default());
        for record in registry.all().await {
            let characteristics = table.characteristics(&record);
            if let Err(e) = bridge.bind_characteristics(&record, &characteristics).await {
                error!(device = %record.id, error = %e, "Failed to bind characteristics");
            }
        }

        let scheduler = Arc::new(PollScheduler::new(
            registry.clone(),
            table.clone(),
            config.poll.clone(),
        ));
        let bindings = Arc::new(Bindings::new(registry.clone(), table.clone(), scheduler.clone()));
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            resolver,
            bridge.clone(),
            table.clone(),
        ));

        Self {
            registry,
            table,
            reconciler,
            scheduler,
            bindings,
            bridge,
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<BindingTable> {
        &self.table
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &Arc<PollScheduler> {
        &self.scheduler
    }

    pub fn bindings(&self) -> &Arc<Bindings> {
        &self.bindings
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.bridge
    }

    /// Start consuming discovery events, and polling unless disabled
    pub async fn spawn(&self, events: mpsc::Receiver<DiscoveryEvent>) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.reconciler.clone().run(events)));

        if self.config.poll_changes {
            tasks.push(tokio::spawn(self.scheduler.clone().run()));
        } else {
            info!("Polling disabled");
        }
    }

    /// Stop background tasks and release every device handle
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.registry.shutdown().await;
        info!("Platform stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{address, announcement, device_id, resolver, FakeNetwork, RecordingBridge};
    use mibridge_core::Capability;
    use std::time::Duration;

    fn persisted(id: &str, version: &str) -> PersistedAccessory {
        PersistedAccessory {
            id: device_id(id),
            schema_version: version.to_string(),
            capabilities: vec![Capability::SwitchPlug],
            address: address(40),
            port: 54321,
            model: "chuangmi.plug.v2".to_string(),
        }
    }

    async fn wait_for(registry: &Registry, count: usize) {
        for _ in 0..100 {
            if registry.len().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {} records", count);
    }

    #[tokio::test]
    async fn test_startup_sweep() {
        let net = FakeNetwork::new();
        let bridge = RecordingBridge::new();
        let platform = Platform::start(
            "2.0.0",
            vec![
                persisted("old1", "1.0.0"),
                persisted("old2", "1.0.0"),
                persisted("kept", "2.0.0"),
            ],
            resolver(&net),
            bridge.clone(),
            PlatformConfig::default(),
        )
        .await;

        assert_eq!(platform.registry().len().await, 1);
        let mut unregistered = bridge.unregistered();
        assert_eq!(unregistered.len(), 1);
        unregistered[0].sort();
        assert_eq!(unregistered[0], vec![device_id("old1"), device_id("old2")]);

        let bound = bridge.bound();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].0, device_id("kept"));
        assert!(!platform.registry().get(&device_id("kept")).await.unwrap().reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_without_polling() {
        let net = FakeNetwork::new();
        let bridge = RecordingBridge::new();
        let platform = Platform::start(
            "1.0.0",
            Vec::new(),
            resolver(&net),
            bridge.clone(),
            PlatformConfig {
                poll_changes: false,
                ..PlatformConfig::default()
            },
        )
        .await;

        let (tx, rx) = mpsc::channel(8);
        platform.spawn(rx).await;
        tx.send(DiscoveryEvent::Announced(announcement("abc123", "chuangmi.plug.v2", 40)))
            .await
            .unwrap();
        wait_for(platform.registry(), 1).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(net.query_count(&device_id("abc123")), 0);

        platform.shutdown().await;
        assert_eq!(net.released().len(), 1);
        assert!(platform.registry().contains(&device_id("abc123")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_probe_leaks_nothing() {
        let net = FakeNetwork::new();
        let bridge = RecordingBridge::new();
        let platform = Platform::start(
            "1.0.0",
            Vec::new(),
            resolver(&net),
            bridge.clone(),
            PlatformConfig::default(),
        )
        .await;
        net.delay_probes(address(40), Duration::from_millis(500));

        let (tx, rx) = mpsc::channel(8);
        platform.spawn(rx).await;
        tx.send(DiscoveryEvent::Announced(announcement("abc123", "chuangmi.plug.v2", 40)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        platform.shutdown().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let id = device_id("abc123");
        assert_eq!(net.probe_count(&id), 1);
        assert_eq!(net.released(), vec![std::net::SocketAddr::new(address(40), 54321)]);
        assert!(platform.registry().handle(&id).await.is_none());
        assert!(!platform.registry().contains(&id).await);
        assert!(bridge.registered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_with_polling() {
        let net = FakeNetwork::new();
        let bridge = RecordingBridge::new();
        let platform = Platform::start(
            "1.0.0",
            Vec::new(),
            resolver(&net),
            bridge.clone(),
            PlatformConfig::default(),
        )
        .await;

        let (tx, rx) = mpsc::channel(8);
        platform.spawn(rx).await;
        tx.send(DiscoveryEvent::Announced(announcement("abc123", "chuangmi.plug.v2", 40)))
            .await
            .unwrap();
        wait_for(platform.registry(), 1).await;

        // Two full cycles at the default period
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(net.query_count(&device_id("abc123")) >= 2);

        platform.shutdown().await;
    }
}
