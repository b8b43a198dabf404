//! mibridge Platform - Keeps the accessory registry in step with the network
//!
//! - [`Reconciler`]: maps discovery events onto accessory records
//! - [`PollScheduler`]: evenly spaced state refresh sweeps
//! - [`Bindings`]: accessory-facing characteristic reads and writes
//! - [`Platform`]: startup sweep, task wiring and shutdown

pub mod bindings;
pub mod bridge;
pub mod platform;
pub mod reconciler;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use bindings::{BindingError, BindingTable, Bindings, CapabilityBinding, Characteristic, Command, SwitchPlugBinding};
pub use bridge::{Bridge, BridgeError};
pub use platform::{Platform, PlatformConfig};
pub use reconciler::{LinkState, Outcome, ReconcileError, Reconciler};
pub use scheduler::{PollConfig, PollFailure, PollOutcome, PollScheduler, SweepReport};
