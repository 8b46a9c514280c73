//! The geoclued broker core: source arbitration, client lifecycle,
//! authorization and the published bus surface.
//!
//! Data flows providers → [`manager::LocationManager`] → per-client filters →
//! bus subscribers; control flows bus methods → [`engine::Engine`] →
//! provider start/stop. See the crate-level binary for assembly.

pub mod agents;
pub mod bus;
pub mod client;
pub mod clients;
pub mod engine;
pub mod error;
pub mod manager;
pub mod peers;

pub use agents::{AgentRegistration, AgentRegistry};
pub use bus::{serve, ClientIface, LocationIface, ManagerIface, MANAGER_PATH, WELL_KNOWN_NAME};
pub use client::{ClientId, ClientRecord, ClientState};
pub use clients::ClientManager;
pub use engine::{spawn_pumps, Effect, Engine, EngineState};
pub use error::BusError;
pub use manager::LocationManager;
pub use peers::{PeerIdentity, PeerTracker, Sandbox};

#[cfg(test)]
pub(crate) mod testutil;
