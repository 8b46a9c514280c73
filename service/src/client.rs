//! Per-subscriber client records: the start/stop state machine and the
//! broadcast filter.

use geoclued_types::{AccuracyLevel, LocationFix};

use crate::error::BusError;

/// Opaque identifier of a client; serialized to an object path only at the
/// bus boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, never started.
    Created,
    /// Receiving broadcasts, capped at the effective level.
    Started {
        /// Requested level after any agent clamp.
        effective: AccuracyLevel,
    },
    /// Stopped; may be started again.
    Stopped,
}

/// One client as the engine tracks it.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Identifier of this client.
    pub id: ClientId,
    /// Unique bus name of the owning peer.
    pub owner: String,
    /// Remove the client entirely when the owner vanishes.
    pub auto_delete: bool,
    /// Desktop id the application claims; a sandbox identity overrides it.
    pub desktop_id: Option<String>,
    /// Level the application asked for.
    pub requested: AccuracyLevel,
    /// Minimum movement in meters between broadcasts; zero disables.
    pub distance_threshold: u32,
    /// Minimum seconds between broadcasts; zero disables.
    pub time_threshold: u32,
    /// Lifecycle state.
    pub state: ClientState,
    /// Last fix broadcast to this client.
    pub last_emitted: Option<LocationFix>,
    /// Serial of the published location object for the last fix.
    pub location_serial: Option<u64>,
    /// Bumped on deletion and peer vanish; outstanding suspended operations
    /// compare it on resume and abandon themselves when stale.
    pub generation: u64,
}

impl ClientRecord {
    pub(crate) fn new(id: ClientId, owner: String, auto_delete: bool) -> Self {
        Self {
            id,
            owner,
            auto_delete,
            desktop_id: None,
            requested: AccuracyLevel::City,
            distance_threshold: 0,
            time_threshold: 0,
            state: ClientState::Created,
            last_emitted: None,
            location_serial: None,
            generation: 0,
        }
    }

    /// Whether the client is currently started.
    #[must_use]
    pub fn started(&self) -> bool {
        matches!(self.state, ClientState::Started { .. })
    }

    /// Effective accuracy ceiling while started.
    #[must_use]
    pub fn effective_level(&self) -> Option<AccuracyLevel> {
        match self.state {
            ClientState::Started { effective } => Some(effective),
            _ => None,
        }
    }

    /// Validate a start attempt before the suspended authorization steps.
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyStarted`] when already started.
    pub fn begin_start(&self) -> Result<(), BusError> {
        match self.state {
            ClientState::Started { .. } => Err(BusError::AlreadyStarted(format!(
                "client {} is already started",
                self.id.0
            ))),
            ClientState::Created | ClientState::Stopped => Ok(()),
        }
    }

    /// Enter the started state at the granted level.
    pub fn complete_start(&mut self, effective: AccuracyLevel) {
        self.state = ClientState::Started { effective };
    }

    /// Leave the started state.
    ///
    /// # Errors
    ///
    /// [`BusError::NotStarted`] when not started.
    pub fn stop(&mut self) -> Result<(), BusError> {
        if !self.started() {
            return Err(BusError::NotStarted(format!(
                "client {} is not started",
                self.id.0
            )));
        }
        self.state = ClientState::Stopped;
        Ok(())
    }

    /// Whether a candidate fix should be broadcast to this client.
    ///
    /// Applies, in order: the started check, the accuracy cap, timestamp
    /// monotonicity, duplicate suppression and the distance/time thresholds.
    #[must_use]
    pub fn accepts(&self, fix: &LocationFix) -> bool {
        let Some(effective) = self.effective_level() else {
            return false;
        };
        if fix.level() > effective {
            return false;
        }
        let Some(last) = &self.last_emitted else {
            return true;
        };
        if fix.timestamp() < last.timestamp() {
            return false;
        }
        if last.equivalent_to(fix) {
            return false;
        }
        let time_ok = self.time_threshold == 0
            || fix.timestamp().seconds_since(last.timestamp()) >= u64::from(self.time_threshold);
        let distance_ok = self.distance_threshold == 0
            || last.distance_to(fix) >= f64::from(self.distance_threshold);
        time_ok && distance_ok
    }

    /// Record a broadcast and the serial of its published location object.
    pub fn note_broadcast(&mut self, fix: LocationFix, serial: u64) {
        self.last_emitted = Some(fix);
        self.location_serial = Some(serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoclued_types::Timestamp;
    use std::time::Instant;

    fn record() -> ClientRecord {
        ClientRecord::new(ClientId(1), ":1.7".into(), false)
    }

    fn fix_at(lat: f64, lon: f64, accuracy: f64, seconds: u64) -> LocationFix {
        LocationFix::new(lat, lon, accuracy)
            .unwrap()
            .with_timestamp(Timestamp { seconds, micros: 0 }, Instant::now())
    }

    #[test]
    fn lifecycle_transitions() {
        let mut client = record();
        assert!(client.begin_start().is_ok());
        client.complete_start(AccuracyLevel::Exact);
        assert!(matches!(
            client.begin_start(),
            Err(BusError::AlreadyStarted(_))
        ));
        assert!(client.stop().is_ok());
        assert!(matches!(client.stop(), Err(BusError::NotStarted(_))));
        assert!(client.begin_start().is_ok());
    }

    #[test]
    fn unstarted_clients_accept_nothing() {
        let client = record();
        assert!(!client.accepts(&fix_at(48.0, 2.0, 8.0, 100)));
    }

    #[test]
    fn accuracy_cap_blocks_finer_fixes() {
        let mut client = record();
        client.complete_start(AccuracyLevel::City);
        // Street-level fix is finer than the City cap.
        assert!(!client.accepts(&fix_at(48.0, 2.0, 80.0, 100)));
        // A city-sized radius passes.
        assert!(client.accepts(&fix_at(48.0, 2.0, 5_000.0, 100)));
    }

    #[test]
    fn first_broadcast_always_passes_thresholds() {
        let mut client = record();
        client.distance_threshold = 500;
        client.time_threshold = 60;
        client.complete_start(AccuracyLevel::Exact);
        assert!(client.accepts(&fix_at(48.0, 2.0, 8.0, 100)));
    }

    #[test]
    fn distance_threshold_filters_small_moves() {
        let mut client = record();
        client.distance_threshold = 50;
        client.complete_start(AccuracyLevel::Exact);
        client.note_broadcast(fix_at(48.8583, 2.2945, 8.0, 100), 1);
        // Roughly 11 m, below the 50 m threshold.
        assert!(!client.accepts(&fix_at(48.8584, 2.2945, 8.0, 101)));
        // Without a threshold the same move passes.
        client.distance_threshold = 0;
        assert!(client.accepts(&fix_at(48.8584, 2.2945, 8.0, 101)));
    }

    #[test]
    fn time_threshold_filters_rapid_updates() {
        let mut client = record();
        client.time_threshold = 10;
        client.complete_start(AccuracyLevel::Exact);
        client.note_broadcast(fix_at(48.0, 2.0, 8.0, 100), 1);
        assert!(!client.accepts(&fix_at(48.1, 2.1, 8.0, 105)));
        assert!(client.accepts(&fix_at(48.1, 2.1, 8.0, 110)));
    }

    #[test]
    fn older_fixes_are_never_rebroadcast() {
        let mut client = record();
        client.complete_start(AccuracyLevel::Exact);
        client.note_broadcast(fix_at(48.0, 2.0, 8.0, 100), 1);
        assert!(!client.accepts(&fix_at(47.0, 1.0, 8.0, 99)));
    }

    #[test]
    fn duplicate_fixes_are_suppressed() {
        let mut client = record();
        client.complete_start(AccuracyLevel::Exact);
        client.note_broadcast(fix_at(48.0, 2.0, 8.0, 100), 1);
        assert!(!client.accepts(&fix_at(48.0, 2.0, 8.4, 150)));
    }
}
