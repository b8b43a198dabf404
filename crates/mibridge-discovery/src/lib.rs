//! mibridge Discovery - Device announcements and descriptor resolution
//!
//! This crate provides:
//! - The discovery event stream consumed by the reconciler
//! - The descriptor resolver (identity, credentials, probe round-trip)
//! - An mDNS browser for devices advertising `_miio._udp`
//! - Statically configured devices for networks without multicast

pub mod event;
pub mod mdns;
pub mod resolver;
pub mod static_devices;

pub use event::{DiscoveryEvent, RawAnnouncement};
pub use mdns::{DiscoveryCache, MdnsBrowser, SERVICE_TYPE};
pub use resolver::{parse_hostname, Credentials, HostnameInfo, ResolveError, Resolved, Resolver};
pub use static_devices::StaticDevice;
