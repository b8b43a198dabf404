//! Device identity, credentials and descriptor types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// Namespace for deriving accessory UUIDs from device ids
const ACCESSORY_NAMESPACE: Uuid = Uuid::from_u128(0x6d69_696f_2d62_7269_6467_652d_6163_6373);

/// Stable device identifier, assigned by the device itself
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a DeviceId, rejecting empty or blank ids
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accessory UUID for this device. Deterministic, so a purged and
    /// re-discovered device keeps the same bridge identity.
    pub fn accessory_uuid(&self) -> Uuid {
        Uuid::new_v5(&ACCESSORY_NAMESPACE, self.0.as_bytes())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token must be 32 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("Token contains non-hex character {0:?}")]
    InvalidCharacter(char),
}

/// Opaque device credential (128-bit, hex encoded)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(String);

impl Token {
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.len() != 32 {
            return Err(TokenError::InvalidLength(raw.len()));
        }
        if let Some(c) = raw.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(TokenError::InvalidCharacter(c));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Token {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(****)")
    }
}

/// Recognized functional facet of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// On/off switchable outlet
    SwitchPlug,
}

impl Capability {
    pub const ALL: &'static [Capability] = &[Capability::SwitchPlug];

    /// Discovery hint that selects this capability
    pub fn hint(&self) -> &'static str {
        match self {
            Capability::SwitchPlug => "power-switch",
        }
    }

    pub fn from_hint(hint: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.hint() == hint)
    }

    /// Map a set of hints onto recognized capabilities; unknown hints are dropped
    pub fn from_hints<'a>(hints: impl IntoIterator<Item = &'a str>) -> BTreeSet<Capability> {
        hints.into_iter().filter_map(Self::from_hint).collect()
    }
}

/// Model families and the hints they imply
const MODEL_HINTS: &[(&str, &[&str])] = &[
    ("chuangmi.plug.", &["power-switch"]),
    ("qmi.powerstrip.", &["power-switch"]),
    ("zimi.powerstrip.", &["power-switch"]),
];

/// Capability hints implied by a model string (e.g. `chuangmi.plug.v2`)
pub fn hints_for_model(model: &str) -> BTreeSet<String> {
    let model = model.to_ascii_lowercase();
    MODEL_HINTS
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .flat_map(|(_, hints)| hints.iter().map(|h| h.to_string()))
        .collect()
}

/// Normalized device description, produced fresh for every announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub address: IpAddr,
    pub port: u16,
    /// Model string; empty until confirmed
    pub model: String,
    pub token: Token,
    pub capability_hints: BTreeSet<String>,
}

impl DeviceDescriptor {
    /// Capabilities recognized from the hints
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        Capability::from_hints(self.capability_hints.iter().map(String::as_str))
    }

    /// Apply a model confirmed by a probe, adding the hints it implies
    pub fn confirm_model(&mut self, model: &str) {
        if model.is_empty() {
            return;
        }
        self.model = model.to_string();
        self.capability_hints.extend(hints_for_model(model));
    }
}

/// A single observable state value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl StateValue {
    /// Interpret as a switch value. Devices report power as `"on"`/`"off"`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            StateValue::Int(0) => Some(false),
            StateValue::Int(1) => Some(true),
            StateValue::Text(s) => match s.to_ascii_lowercase().as_str() {
                "on" | "true" => Some(true),
                "off" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

/// Cached device state keyed by property name (e.g. `power`)
pub type StateMap = BTreeMap<String, StateValue>;
