//! Scripted device network and recording bridge for tests

use async_trait::async_trait;
use mibridge_core::{
    AccessoryRecord, DeviceConnector, DeviceDescriptor, DeviceHandle, DeviceId, Probed, RpcError,
    StateMap, StateValue,
};
use mibridge_discovery::{Credentials, RawAnnouncement, Resolver};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::bindings::Characteristic;
use crate::bridge::{Bridge, BridgeError};

pub const TOKEN: &str = "00112233445566778899aabbccddeeff";

pub fn device_id(s: &str) -> DeviceId {
    DeviceId::new(s).unwrap()
}

pub fn address(last: u8) -> IpAddr {
    IpAddr::from([192, 168, 1, last])
}

/// Announcement carrying an explicit id, model and token
pub fn announcement(id: &str, model: &str, last: u8) -> RawAnnouncement {
    let mut raw = RawAnnouncement::new(address(last), 54321);
    raw.id = Some(id.to_string());
    raw.model = Some(model.to_string());
    raw.token = Some(TOKEN.to_string());
    raw
}

pub fn resolver(net: &FakeNetwork) -> Arc<Resolver> {
    Arc::new(Resolver::new(
        Arc::new(net.clone()),
        Credentials::new(),
        Duration::from_secs(1),
    ))
}

#[derive(Clone, Copy)]
enum Mode {
    Ok,
    Fail,
    Hang,
    Slow(Duration),
}

#[derive(Default)]
struct NetState {
    models: HashMap<DeviceId, String>,
    failing_probes: HashSet<DeviceId>,
    probe_delays: HashMap<IpAddr, Duration>,
    probes: HashMap<DeviceId, usize>,
    queries: HashMap<DeviceId, Mode>,
    commands: HashMap<DeviceId, Mode>,
    power: HashMap<DeviceId, bool>,
    query_times: HashMap<DeviceId, Vec<Instant>>,
    in_flight: HashMap<DeviceId, usize>,
    max_in_flight: HashMap<DeviceId, usize>,
    sent: Vec<(DeviceId, String, Vec<Value>)>,
    released: Vec<SocketAddr>,
}

/// In-memory stand-in for the device RPC layer
#[derive(Clone, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetState>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut NetState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Model the device reports when probed
    pub fn set_model(&self, id: &DeviceId, model: &str) {
        self.with(|s| s.models.insert(id.clone(), model.to_string()));
    }

    pub fn fail_probes(&self, id: &DeviceId) {
        self.with(|s| s.failing_probes.insert(id.clone()));
    }

    /// Delay probes reaching this address
    pub fn delay_probes(&self, address: IpAddr, delay: Duration) {
        self.with(|s| s.probe_delays.insert(address, delay));
    }

    pub fn probe_count(&self, id: &DeviceId) -> usize {
        self.with(|s| s.probes.get(id).copied().unwrap_or(0))
    }

    pub fn fail_queries(&self, id: &DeviceId) {
        self.with(|s| s.queries.insert(id.clone(), Mode::Fail));
    }

    pub fn hang_queries(&self, id: &DeviceId) {
        self.with(|s| s.queries.insert(id.clone(), Mode::Hang));
    }

    pub fn slow_queries(&self, id: &DeviceId, delay: Duration) {
        self.with(|s| s.queries.insert(id.clone(), Mode::Slow(delay)));
    }

    pub fn fail_commands(&self, id: &DeviceId) {
        self.with(|s| s.commands.insert(id.clone(), Mode::Fail));
    }

    pub fn hang_commands(&self, id: &DeviceId) {
        self.with(|s| s.commands.insert(id.clone(), Mode::Hang));
    }

    pub fn set_power(&self, id: &DeviceId, on: bool) {
        self.with(|s| s.power.insert(id.clone(), on));
    }

    pub fn query_times(&self, id: &DeviceId) -> Vec<Instant> {
        self.with(|s| s.query_times.get(id).cloned().unwrap_or_default())
    }

    pub fn query_count(&self, id: &DeviceId) -> usize {
        self.query_times(id).len()
    }

    pub fn max_in_flight(&self, id: &DeviceId) -> usize {
        self.with(|s| s.max_in_flight.get(id).copied().unwrap_or(0))
    }

    pub fn commands(&self) -> Vec<(DeviceId, String, Vec<Value>)> {
        self.with(|s| s.sent.clone())
    }

    pub fn released(&self) -> Vec<SocketAddr> {
        self.with(|s| s.released.clone())
    }

    /// Handle for a device at 192.168.1.x with the given port
    pub fn handle_for(&self, id: &DeviceId, port: u16) -> Box<dyn DeviceHandle> {
        Box::new(FakeHandle {
            id: id.clone(),
            endpoint: SocketAddr::new(address(1), port),
            net: self.clone(),
        })
    }

    async fn run(&self, mode: Mode) -> Result<(), RpcError> {
        match mode {
            Mode::Ok => Ok(()),
            Mode::Fail => Err(RpcError::Unreachable("scripted failure".into())),
            Mode::Hang => std::future::pending().await,
            Mode::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DeviceConnector for FakeNetwork {
    async fn probe(&self, descriptor: &DeviceDescriptor) -> Result<Probed, RpcError> {
        let (delay, fails, model) = self.with(|s| {
            *s.probes.entry(descriptor.id.clone()).or_default() += 1;
            (
                s.probe_delays.get(&descriptor.address).copied(),
                s.failing_probes.contains(&descriptor.id),
                s.models.get(&descriptor.id).cloned(),
            )
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(RpcError::Unreachable("probe refused".into()));
        }
        Ok(Probed {
            handle: Box::new(FakeHandle {
                id: descriptor.id.clone(),
                endpoint: SocketAddr::new(descriptor.address, descriptor.port),
                net: self.clone(),
            }),
            model,
        })
    }
}

/// Decrements the in-flight count when a query ends or is cancelled
struct InFlight {
    net: FakeNetwork,
    id: DeviceId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.net.with(|s| {
            if let Some(n) = s.in_flight.get_mut(&self.id) {
                *n -= 1;
            }
        });
    }
}

struct FakeHandle {
    id: DeviceId,
    endpoint: SocketAddr,
    net: FakeNetwork,
}

#[async_trait]
impl DeviceHandle for FakeHandle {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn query_state(&self, keys: &[&str]) -> Result<StateMap, RpcError> {
        let (mode, power) = self.net.with(|s| {
            s.query_times
                .entry(self.id.clone())
                .or_default()
                .push(Instant::now());
            let n = s.in_flight.entry(self.id.clone()).or_default();
            *n += 1;
            let n = *n;
            let max = s.max_in_flight.entry(self.id.clone()).or_default();
            *max = (*max).max(n);
            (
                s.queries.get(&self.id).copied().unwrap_or(Mode::Ok),
                s.power.get(&self.id).copied().unwrap_or(false),
            )
        });
        let _in_flight = InFlight {
            net: self.net.clone(),
            id: self.id.clone(),
        };

        self.net.run(mode).await?;
        let mut state = StateMap::new();
        if keys.contains(&"power") {
            state.insert("power".into(), StateValue::Bool(power));
        }
        Ok(state)
    }

    async fn send_command(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        let mode = self.net.with(|s| {
            s.sent.push((self.id.clone(), method.to_string(), args));
            s.commands.get(&self.id).copied().unwrap_or(Mode::Ok)
        });
        self.net.run(mode).await
    }

    async fn release(&self) {
        self.net.with(|s| s.released.push(self.endpoint));
    }
}

#[derive(Default)]
struct Calls {
    registered: Vec<DeviceId>,
    updated: Vec<DeviceId>,
    unregistered: Vec<Vec<DeviceId>>,
    bound: Vec<(DeviceId, Vec<Characteristic>)>,
}

/// Bridge that records every call; optionally fails them all
#[derive(Default)]
pub struct RecordingBridge {
    calls: Mutex<Calls>,
    failing: bool,
}

impl RecordingBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub fn registered(&self) -> Vec<DeviceId> {
        self.calls.lock().unwrap().registered.clone()
    }

    pub fn updated(&self) -> Vec<DeviceId> {
        self.calls.lock().unwrap().updated.clone()
    }

    pub fn unregistered(&self) -> Vec<Vec<DeviceId>> {
        self.calls.lock().unwrap().unregistered.clone()
    }

    pub fn bound(&self) -> Vec<(DeviceId, Vec<Characteristic>)> {
        self.calls.lock().unwrap().bound.clone()
    }

    fn result(&self) -> Result<(), BridgeError> {
        if self.failing {
            Err(BridgeError::Persistence("disk full".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Bridge for RecordingBridge {
    async fn register_accessory(&self, record: &AccessoryRecord) -> Result<(), BridgeError> {
        self.calls.lock().unwrap().registered.push(record.id.clone());
        self.result()
    }

    async fn update_accessory(&self, record: &AccessoryRecord) -> Result<(), BridgeError> {
        self.calls.lock().unwrap().updated.push(record.id.clone());
        self.result()
    }

    async fn unregister_accessories(&self, records: &[AccessoryRecord]) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap()
            .unregistered
            .push(records.iter().map(|r| r.id.clone()).collect());
        self.result()
    }

    async fn bind_characteristics(
        &self,
        record: &AccessoryRecord,
        characteristics: &[Characteristic],
    ) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap()
            .bound
            .push((record.id.clone(), characteristics.to_vec()));
        self.result()
    }
}
