//! mDNS browsing for devices advertising `_miio._udp`
//!
//! Devices announce themselves with an instance name of the form
//! `<model-with-dashes>_miio<id>`. The browser turns resolved and removed
//! services into discovery events, and keeps a cache of when each device was
//! last announced: devices not re-announced within the cache lifetime are
//! reported as vanished. The browse query is restarted every half lifetime
//! to solicit fresh announcements.

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use mibridge_core::DeviceId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::event::{DiscoveryEvent, RawAnnouncement};
use crate::resolver::parse_hostname;

/// mDNS service type advertised by devices
pub const SERVICE_TYPE: &str = "_miio._udp.local.";

/// Minimum cache lifetime, so a tiny search interval cannot spin the browser
const MIN_LIFETIME: Duration = Duration::from_secs(2);

/// Last-announced times per device
#[derive(Debug)]
pub struct DiscoveryCache {
    lifetime: Duration,
    seen: HashMap<DeviceId, Instant>,
}

impl DiscoveryCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            seen: HashMap::new(),
        }
    }

    /// Record an announcement; returns true when the device was not cached
    pub fn observe(&mut self, id: DeviceId, now: Instant) -> bool {
        self.seen.insert(id, now).is_none()
    }

    /// Drop a device; returns true when it was cached
    pub fn forget(&mut self, id: &DeviceId) -> bool {
        self.seen.remove(id).is_some()
    }

    /// Remove and return devices not announced within the lifetime
    pub fn expire(&mut self, now: Instant) -> Vec<DeviceId> {
        let lifetime = self.lifetime;
        let expired: Vec<DeviceId> = self
            .seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > lifetime)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.seen.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Instance part of a full service name
fn instance_name(fullname: &str) -> &str {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
}

/// Build an announcement from a resolved service
fn announcement_from(info: &ServiceInfo) -> Option<RawAnnouncement> {
    // Prefer IPv4; devices answer RPC on their v4 address
    let address = info
        .get_addresses()
        .iter()
        .copied()
        .min_by_key(|addr| addr.is_ipv6())?;

    let instance = instance_name(info.get_fullname());
    let hostname = if parse_hostname(instance).is_some() {
        instance
    } else {
        info.get_hostname()
    };

    let mut raw = RawAnnouncement::new(address, info.get_port());
    raw.hostname = Some(hostname.to_string());
    raw.model = info.get_property_val_str("model").map(str::to_string);
    raw.token = info.get_property_val_str("token").map(str::to_string);
    Some(raw)
}

enum Step {
    Event(Option<ServiceEvent>),
    Refresh,
}

/// mDNS discovery source
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    lifetime: Duration,
}

impl MdnsBrowser {
    /// Create a browser whose cache lifetime is the search interval
    pub fn new(search_interval: Duration) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| anyhow::anyhow!("Failed to create mDNS daemon: {}", e))?;
        Ok(Self {
            daemon,
            lifetime: search_interval.max(MIN_LIFETIME),
        })
    }

    /// Browse until the event receiver goes away
    pub async fn run(self, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        let mut receiver = self.browse()?;
        let mut cache = DiscoveryCache::new(self.lifetime);

        let mut refresh = interval(self.lifetime / 2);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;

        info!(service = SERVICE_TYPE, lifetime = ?self.lifetime, "mDNS browser started");

        loop {
            let step = tokio::select! {
                event = receiver.recv_async() => Step::Event(event.ok()),
                _ = refresh.tick() => Step::Refresh,
            };

            let outgoing = match step {
                Step::Event(Some(event)) => self.handle_event(event, &mut cache),
                Step::Event(None) => {
                    warn!("mDNS browse channel closed, restarting browse");
                    receiver = self.browse()?;
                    Vec::new()
                }
                Step::Refresh => {
                    let expired = cache.expire(Instant::now());
                    if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
                        debug!(error = %e, "Failed to stop mDNS browse");
                    }
                    receiver = self.browse()?;
                    trace!(cached = cache.len(), expired = expired.len(), "mDNS browse refreshed");
                    expired.into_iter().map(DiscoveryEvent::Vanished).collect()
                }
            };

            for event in outgoing {
                if events.send(event).await.is_err() {
                    debug!("Discovery event receiver dropped, stopping mDNS browser");
                    if let Err(e) = self.daemon.shutdown() {
                        debug!(error = %e, "Failed to shut down mDNS daemon");
                    }
                    return Ok(());
                }
            }
        }
    }

    fn browse(&self) -> Result<mdns_sd::Receiver<ServiceEvent>> {
        self.daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| anyhow::anyhow!("Failed to browse {}: {}", SERVICE_TYPE, e))
    }

    fn handle_event(&self, event: ServiceEvent, cache: &mut DiscoveryCache) -> Vec<DiscoveryEvent> {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(raw) = announcement_from(&info) else {
                    debug!(service = %info.get_fullname(), "Resolved service has no address");
                    return Vec::new();
                };
                let Some(id) = raw.device_id() else {
                    debug!(service = %info.get_fullname(), "Ignoring service without device id");
                    return Vec::new();
                };

                debug!(device = %id, address = %raw.address, "Device announced over mDNS");
                if cache.observe(id, Instant::now()) {
                    vec![DiscoveryEvent::Announced(raw)]
                } else {
                    vec![DiscoveryEvent::Updated(raw)]
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                match parse_hostname(instance_name(&fullname)) {
                    Some(info) if cache.forget(&info.id) => {
                        debug!(device = %info.id, "Device withdrew mDNS announcement");
                        vec![DiscoveryEvent::Vanished(info.id)]
                    }
                    _ => Vec::new(),
                }
            }
            other => {
                trace!(event = ?other, "mDNS event");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("chuangmi-plug-v2_miio123._miio._udp.local."),
            "chuangmi-plug-v2_miio123"
        );
        assert_eq!(instance_name("something-else"), "something-else");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_observe_and_expire() {
        let mut cache = DiscoveryCache::new(Duration::from_secs(30));
        let start = Instant::now();

        assert!(cache.observe(id("a"), start));
        assert!(!cache.observe(id("a"), start));
        assert!(cache.observe(id("b"), start));

        let later = start + Duration::from_secs(20);
        assert!(!cache.observe(id("b"), later));
        assert!(cache.expire(later).is_empty());

        let expired = cache.expire(start + Duration::from_secs(31));
        assert_eq!(expired, vec![id("a")]);
        assert_eq!(cache.len(), 1);

        assert!(cache.forget(&id("b")));
        assert!(!cache.forget(&id("b")));
        assert!(cache.is_empty());
    }
}
