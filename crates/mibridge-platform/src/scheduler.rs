//! Poll scheduler
//!
//! Each sweep snapshots the registry and queries every accessory with
//! queryable state once, at evenly spaced slots `start + i * spacing`, where
//! `spacing = max(period / count, floor)`. Sweeps never finish before
//! `start + period`, so cycles repeat with a period of at least `period`.
//!
//! Every query runs under the device's lock, so a sweep query and an
//! on-demand refresh never reach the same device concurrently. A slow or
//! failing device only stalls its own slot.

use mibridge_core::{DeviceGuard, DeviceId, Registry, RpcError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::bindings::BindingTable;

/// Default sweep period
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(15);

/// Minimum spacing between two queries of a sweep
pub const DEFAULT_SPACING_FLOOR: Duration = Duration::from_millis(50);

/// Default limit for a single network call
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub period: Duration,
    pub spacing_floor: Duration,
    /// Applies to state queries and to commands
    pub query_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            spacing_floor: DEFAULT_SPACING_FLOOR,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl PollConfig {
    /// Gap between consecutive queries when sweeping `count` devices
    pub fn spacing(&self, count: usize) -> Duration {
        match u32::try_from(count) {
            Ok(0) => self.period,
            Ok(n) => (self.period / n).max(self.spacing_floor),
            Err(_) => self.spacing_floor,
        }
    }
}

#[derive(Error, Debug)]
pub enum PollFailure {
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug)]
pub enum PollOutcome {
    /// State merged and device marked reachable
    Refreshed,
    /// Device marked unreachable; the next cycle retries
    Failed(PollFailure),
    /// No open connection or nothing to query
    Skipped,
    /// Another operation holds the device
    Busy,
    /// Record removed while the query was in flight
    Gone,
}

/// Counts for one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub queried: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &PollOutcome) {
        match outcome {
            PollOutcome::Refreshed => self.refreshed += 1,
            PollOutcome::Failed(_) => self.failed += 1,
            PollOutcome::Skipped | PollOutcome::Busy | PollOutcome::Gone => self.skipped += 1,
        }
    }
}

pub struct PollScheduler {
    registry: Arc<Registry>,
    table: Arc<BindingTable>,
    config: PollConfig,
}

impl PollScheduler {
    pub fn new(registry: Arc<Registry>, table: Arc<BindingTable>, config: PollConfig) -> Self {
        Self {
            registry,
            table,
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    async fn state_keys(&self, id: &DeviceId) -> Option<Vec<&'static str>> {
        let record = self.registry.get(id).await?;
        let keys = self.table.state_keys(&record);
        (!keys.is_empty()).then_some(keys)
    }

    /// Query one device; the caller holds its lock
    async fn poll_held(&self, id: &DeviceId, keys: &[&str], _guard: &DeviceGuard) -> PollOutcome {
        let Some(handle) = self.registry.handle(id).await else {
            trace!(device = %id, "No connection, skipping poll");
            return PollOutcome::Skipped;
        };

        let limit = self.config.query_timeout;
        let result = match timeout(limit, handle.query_state(keys)).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(e)) => Err(PollFailure::Rpc(e)),
            Err(_) => Err(PollFailure::Timeout(limit)),
        };

        match result {
            Ok(state) => {
                trace!(device = %id, state = ?state, "Polled state");
                let applied = self
                    .registry
                    .update(id, |slot| {
                        slot.record.last_known_state.extend(state);
                        slot.record.touch();
                    })
                    .await;
                match applied {
                    Some(()) => PollOutcome::Refreshed,
                    None => PollOutcome::Gone,
                }
            }
            Err(failure) => {
                debug!(device = %id, error = %failure, "Poll failed, marking unreachable");
                self.registry
                    .update(id, |slot| slot.record.reachable = false)
                    .await;
                PollOutcome::Failed(failure)
            }
        }
    }

    /// Poll one device, waiting for any operation in flight on it
    pub async fn poll(&self, id: &DeviceId) -> PollOutcome {
        let Some(keys) = self.state_keys(id).await else {
            return PollOutcome::Skipped;
        };
        let guard = self.registry.lock(id).await;
        self.poll_held(id, &keys, &guard).await
    }

    /// On-demand poll outside the sweep; skipped if the device is busy
    pub async fn refresh(&self, id: &DeviceId) -> PollOutcome {
        let Some(keys) = self.state_keys(id).await else {
            return PollOutcome::Skipped;
        };
        let Some(guard) = self.registry.try_lock(id).await else {
            trace!(device = %id, "Device busy, skipping on-demand poll");
            return PollOutcome::Busy;
        };
        self.poll_held(id, &keys, &guard).await
    }

    /// One full pass over the registry
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let start = Instant::now();
        let targets: Vec<(DeviceId, Vec<&'static str>)> = self
            .registry
            .all()
            .await
            .into_iter()
            .filter_map(|record| {
                let keys = self.table.state_keys(&record);
                (!keys.is_empty()).then_some((record.id, keys))
            })
            .collect();

        let spacing = self.config.spacing(targets.len());
        debug!(devices = targets.len(), spacing = ?spacing, "Starting poll sweep");

        let mut report = SweepReport {
            queried: targets.len(),
            ..SweepReport::default()
        };
        let mut queries = JoinSet::new();

        for (slot, (id, keys)) in targets.into_iter().enumerate() {
            let at = start + spacing.saturating_mul(slot as u32);
            let scheduler = self.clone();
            queries.spawn(async move {
                sleep_until(at).await;
                let guard = scheduler.registry.lock(&id).await;
                scheduler.poll_held(&id, &keys, &guard).await
            });
        }

        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    warn!(error = %e, "Poll task failed");
                    report.failed += 1;
                }
            }
        }

        sleep_until(start + self.config.period).await;
        debug!(
            refreshed = report.refreshed,
            failed = report.failed,
            skipped = report.skipped,
            elapsed = ?start.elapsed(),
            "Poll sweep finished"
        );
        report
    }

    /// Sweep forever
    pub async fn run(self: Arc<Self>) {
        info!(period = ?self.config.period, "Poll scheduler started");
        loop {
            self.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device_id, FakeNetwork};
    use mibridge_core::{Capability, StateValue};

    fn config(period: Duration) -> PollConfig {
        PollConfig {
            period,
            spacing_floor: Duration::from_millis(50),
            query_timeout: Duration::from_secs(5),
        }
    }

    async fn add_plug(registry: &Registry, net: &FakeNetwork, name: &str, port: u16) -> DeviceId {
        let id = device_id(name);
        let handle = net.handle_for(&id, port);
        registry
            .upsert(&id, |slot| {
                slot.record.capabilities.insert(Capability::SwitchPlug);
                slot.record.touch();
                slot.replace_handle(handle);
            })
            .await;
        id
    }

    fn scheduler(registry: &Arc<Registry>, config: PollConfig) -> Arc<PollScheduler> {
        Arc::new(PollScheduler::new(
            registry.clone(),
            Arc::new(BindingTable::default()),
            config,
        ))
    }

    #[test]
    fn test_spacing() {
        let config = config(Duration::from_secs(15));
        assert_eq!(config.spacing(3), Duration::from_secs(5));
        assert_eq!(config.spacing(1), Duration::from_secs(15));
        assert_eq!(config.spacing(0), Duration::from_secs(15));
        // Degenerate division hits the floor
        assert_eq!(config.spacing(1000), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_spacing_and_timeout() {
        let net = FakeNetwork::new();
        let registry = Arc::new(Registry::new("1.0.0"));
        let a = add_plug(&registry, &net, "a", 1).await;
        let b = add_plug(&registry, &net, "b", 2).await;
        let c = add_plug(&registry, &net, "c", 3).await;
        net.hang_queries(&b);

        let scheduler = scheduler(&registry, config(Duration::from_secs(15)));
        let start = Instant::now();
        let report = scheduler.sweep().await;

        assert_eq!(report.queried, 3);
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.failed, 1);
        assert!(start.elapsed() >= Duration::from_secs(15));

        for (id, expected) in [(&a, 0u64), (&b, 5), (&c, 10)] {
            let offset = net.query_times(id)[0] - start;
            let expected = Duration::from_secs(expected);
            assert!(
                offset >= expected && offset < expected + Duration::from_millis(10),
                "{} queried at {:?}",
                id,
                offset
            );
        }

        assert!(registry.get(&a).await.unwrap().reachable);
        assert!(!registry.get(&b).await.unwrap().reachable);
        assert!(registry.get(&c).await.unwrap().reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_issues_one_query_per_device() {
        let net = FakeNetwork::new();
        let registry = Arc::new(Registry::new("1.0.0"));
        let mut ids = Vec::new();
        for i in 0..5u16 {
            ids.push(add_plug(&registry, &net, &format!("plug{}", i), i).await);
        }
        // Not queryable: no capability
        registry.upsert(&device_id("bare"), |_| ()).await;

        let scheduler = scheduler(&registry, config(Duration::from_secs(10)));
        let start = Instant::now();
        let report = scheduler.sweep().await;

        assert_eq!(report.queried, 5);
        assert!(start.elapsed() >= Duration::from_secs(10));
        for id in &ids {
            assert_eq!(net.query_count(id), 1);
        }
        assert_eq!(net.query_count(&device_id("bare")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_refresh_never_overlap() {
        let net = FakeNetwork::new();
        let registry = Arc::new(Registry::new("1.0.0"));
        let a = add_plug(&registry, &net, "a", 1).await;
        net.slow_queries(&a, Duration::from_secs(2));

        let scheduler = scheduler(&registry, config(Duration::from_secs(3)));
        let sweep = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.sweep().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Sweep query is in flight: on-demand refresh backs off, a full poll waits
        assert!(matches!(scheduler.refresh(&a).await, PollOutcome::Busy));
        assert!(matches!(scheduler.poll(&a).await, PollOutcome::Refreshed));

        sweep.await.unwrap();
        assert_eq!(net.query_count(&a), 2);
        assert_eq!(net.max_in_flight(&a), 1);
    }

    #[tokio::test]
    async fn test_poll_merges_state() {
        let net = FakeNetwork::new();
        let registry = Arc::new(Registry::new("1.0.0"));
        let a = add_plug(&registry, &net, "a", 1).await;
        registry
            .update(&a, |slot| slot.record.reachable = false)
            .await;
        net.set_power(&a, true);

        let scheduler = scheduler(&registry, PollConfig::default());
        assert!(matches!(scheduler.poll(&a).await, PollOutcome::Refreshed));

        let record = registry.get(&a).await.unwrap();
        assert!(record.reachable);
        assert_eq!(record.last_known_state.get("power"), Some(&StateValue::Bool(true)));
    }

    #[tokio::test]
    async fn test_poll_failure_marks_unreachable() {
        let net = FakeNetwork::new();
        let registry = Arc::new(Registry::new("1.0.0"));
        let a = add_plug(&registry, &net, "a", 1).await;
        net.fail_queries(&a);

        let scheduler = scheduler(&registry, PollConfig::default());
        assert!(matches!(
            scheduler.poll(&a).await,
            PollOutcome::Failed(PollFailure::Rpc(_))
        ));
        assert!(!registry.get(&a).await.unwrap().reachable);
        // No retry within the same call
        assert_eq!(net.query_count(&a), 1);
    }

    #[tokio::test]
    async fn test_poll_without_handle_is_skipped() {
        let registry = Arc::new(Registry::new("1.0.0"));
        let id = device_id("restored");
        registry
            .upsert(&id, |slot| {
                slot.record.capabilities.insert(Capability::SwitchPlug);
            })
            .await;

        let scheduler = scheduler(&registry, PollConfig::default());
        assert!(matches!(scheduler.poll(&id).await, PollOutcome::Skipped));
        assert!(matches!(
            scheduler.poll(&device_id("ghost")).await,
            PollOutcome::Skipped
        ));
        assert!(registry.get(&device_id("ghost")).await.is_none());
    }
}
