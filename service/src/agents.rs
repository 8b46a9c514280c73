//! Registry of per-user consent agents and prompt dispatch.

use std::collections::HashMap;
use std::time::Duration;

use geoclued_types::AccuracyLevel;
use log::{debug, warn};
use zbus::{proxy, Connection};

use crate::error::BusError;

/// An agent prompt that does not answer within this window counts as denial.
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[proxy(
    interface = "org.freedesktop.GeoClue2.Agent",
    default_path = "/org/freedesktop/GeoClue2/Agent",
    assume_defaults = false
)]
trait Agent {
    /// Ask the user whether `desktop_id` may locate at `req_accuracy_level`.
    fn authorize_app(
        &self,
        desktop_id: &str,
        req_accuracy_level: u32,
    ) -> zbus::Result<(bool, u32)>;

    /// Finest level this agent will ever grant.
    #[zbus(property)]
    fn max_accuracy_level(&self) -> zbus::Result<u32>;
}

/// One registered agent for one user.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    /// Desktop id the agent registered under.
    pub desktop_id: String,
    /// Unique bus name of the agent process.
    pub peer: String,
    /// Finest level the agent permits.
    pub max_accuracy: AccuracyLevel,
}

/// Per-uid agent registrations.
///
/// Decisions are never cached here; every `Start` that needs consent
/// re-prompts the agent.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    by_uid: HashMap<u32, AgentRegistration>,
}

impl AgentRegistry {
    /// Register an agent for a uid. A later registration for the same uid
    /// evicts the earlier one.
    pub fn register(&mut self, uid: u32, registration: AgentRegistration) {
        if let Some(previous) = self.by_uid.insert(uid, registration) {
            warn!(
                "agent '{}' for uid {uid} evicted by a newer registration",
                previous.desktop_id
            );
        } else {
            debug!("agent registered for uid {uid}");
        }
    }

    /// The agent serving a uid, if one registered.
    #[must_use]
    pub fn get(&self, uid: u32) -> Option<&AgentRegistration> {
        self.by_uid.get(&uid)
    }

    /// Drop every registration owned by a vanished peer.
    pub fn remove_peer(&mut self, peer: &str) {
        self.by_uid.retain(|uid, registration| {
            if registration.peer == peer {
                debug!("agent for uid {uid} vanished");
                false
            } else {
                true
            }
        });
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    /// Whether no agent is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

/// Dispatch one authorization prompt to a registered agent.
///
/// # Errors
///
/// Maps agent refusal, prompt timeout and transport failures to
/// [`BusError::AccessDenied`]; the caller only learns whether access was
/// granted and at which ceiling.
pub async fn prompt_agent(
    connection: &Connection,
    registration: &AgentRegistration,
    desktop_id: &str,
    requested: AccuracyLevel,
) -> Result<AccuracyLevel, BusError> {
    let proxy = AgentProxy::builder(connection)
        .destination(registration.peer.clone())
        .map_err(|err| crate::error::internal(err.to_string()))?
        .build()
        .await
        .map_err(|err| crate::error::internal(err.to_string()))?;

    let answer = tokio::time::timeout(
        PROMPT_TIMEOUT,
        proxy.authorize_app(desktop_id, requested as u32),
    )
    .await;
    let (authorized, granted) = match answer {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            debug!("agent prompt for '{desktop_id}' failed: {err}");
            return Err(BusError::AccessDenied(format!(
                "agent rejected '{desktop_id}'"
            )));
        }
        Err(_) => {
            debug!("agent prompt for '{desktop_id}' timed out");
            return Err(BusError::AccessDenied(format!(
                "agent did not answer for '{desktop_id}'"
            )));
        }
    };
    if !authorized {
        return Err(BusError::AccessDenied(format!(
            "user denied location access to '{desktop_id}'"
        )));
    }
    let granted = AccuracyLevel::try_from(granted).map_err(|_| {
        BusError::AccessDenied(format!("agent granted a bogus level for '{desktop_id}'"))
    })?;
    Ok(clamp_grant(requested, granted, registration.max_accuracy))
}

/// The level a client actually starts at: never finer than what it asked
/// for, what the user granted, or what the agent is willing to hand out.
#[must_use]
pub fn clamp_grant(
    requested: AccuracyLevel,
    granted: AccuracyLevel,
    agent_ceiling: AccuracyLevel,
) -> AccuracyLevel {
    requested.min(granted).min(agent_ceiling)
}

/// Read the ceiling an agent advertises, defaulting to `Exact` when the
/// property is unreadable.
pub async fn read_agent_ceiling(connection: &Connection, peer: &str) -> AccuracyLevel {
    let build = async {
        AgentProxy::builder(connection)
            .destination(peer.to_owned())?
            .build()
            .await
    };
    let Ok(proxy) = build.await else {
        return AccuracyLevel::Exact;
    };
    let level = match tokio::time::timeout(Duration::from_secs(5), proxy.max_accuracy_level()).await
    {
        Ok(Ok(level)) => level,
        Ok(Err(err)) => {
            debug!("agent {peer} ceiling unreadable: {err}");
            return AccuracyLevel::Exact;
        }
        Err(_) => {
            debug!("agent {peer} ceiling read timed out");
            return AccuracyLevel::Exact;
        }
    };
    AccuracyLevel::try_from(level).unwrap_or(AccuracyLevel::Exact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(peer: &str) -> AgentRegistration {
        AgentRegistration {
            desktop_id: "org.example.Agent".into(),
            peer: peer.into(),
            max_accuracy: AccuracyLevel::Exact,
        }
    }

    #[test]
    fn later_registration_evicts_the_earlier_one() {
        let mut registry = AgentRegistry::default();
        registry.register(1000, registration(":1.10"));
        registry.register(1000, registration(":1.11"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(1000).unwrap().peer, ":1.11");
    }

    #[test]
    fn grants_clamp_to_the_tightest_ceiling() {
        use AccuracyLevel::{City, Exact, Street};
        assert_eq!(clamp_grant(Exact, City, Exact), City);
        assert_eq!(clamp_grant(City, Exact, Exact), City);
        assert_eq!(clamp_grant(Exact, Exact, Street), Street);
        assert_eq!(clamp_grant(Exact, Exact, Exact), Exact);
    }

    #[test]
    fn vanished_peer_loses_its_registrations() {
        let mut registry = AgentRegistry::default();
        registry.register(1000, registration(":1.10"));
        registry.register(1001, registration(":1.20"));
        registry.remove_peer(":1.10");
        assert!(registry.get(1000).is_none());
        assert!(registry.get(1001).is_some());
    }
}
