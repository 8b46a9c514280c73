//! The broker engine: one place where all state changes happen.
//!
//! All mutable state lives in [`EngineState`] behind a non-async mutex that
//! is never held across an await point. State transitions return [`Effect`]
//! lists describing the provider and bus work they imply; the async
//! [`Engine`] wrapper executes those effects outside the lock. Suspended
//! operations (peer resolution, agent prompts, provider starts) re-validate
//! against a per-client generation counter when they resume.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_channel::Receiver;
use futures::StreamExt;
use geoclued_config::{AppPermission, ConfigStore};
use geoclued_sources::{Source, SourceEvent, SourceKind, StartResult, Submitter};
use geoclued_types::{AccuracyLevel, LocationFix};
use log::{debug, error, warn};
use zbus::Connection;

use crate::agents::{AgentRegistration, AgentRegistry};
use crate::bus::{client_path, location_path, root_path, ClientIface, LocationIface};
use crate::client::{ClientId, ClientRecord};
use crate::clients::ClientManager;
use crate::error::BusError;
use crate::manager::LocationManager;
use crate::peers::{PeerIdentity, PeerTracker};

/// A provider that has not come up after this long counts as failed.
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Demand is recomputed on this cadence so failure backoffs expire.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Deferred work computed under the state lock.
#[derive(Debug)]
pub enum Effect {
    /// Bring a provider up.
    StartSource(Arc<dyn Source>),
    /// Take a provider down.
    StopSource(Arc<dyn Source>),
    /// Publish a fix to a client.
    Broadcast {
        /// Receiving client.
        client: ClientId,
        /// Serial of the location object superseded by this broadcast.
        old_serial: Option<u64>,
        /// Serial of the location object to publish.
        new_serial: u64,
        /// The fix itself.
        fix: LocationFix,
    },
    /// A client's `Active` property flipped.
    ActiveChanged {
        /// The client in question.
        client: ClientId,
        /// New value.
        active: bool,
    },
    /// The manager's `InUse` property flipped.
    InUseChanged(bool),
    /// Drop a deleted client's objects from the bus.
    RemoveClientObjects {
        /// The deleted client.
        client: ClientId,
        /// Its published location object, if any.
        location_serial: Option<u64>,
    },
    /// Report a broadcast-grade fix to the submission endpoint.
    SubmitFix(LocationFix),
}

/// Everything the `Start` pipeline needs before its suspension points.
#[derive(Debug, Clone)]
pub struct StartPlan {
    /// Client being started.
    pub id: ClientId,
    /// Generation to re-validate on resume.
    pub generation: u64,
    /// Owning peer to resolve.
    pub owner: String,
    /// Application-claimed desktop id, if set.
    pub desktop_id_hint: Option<String>,
    /// Level the application asked for.
    pub requested: AccuracyLevel,
}

/// Outcome of the synchronous part of authorization.
#[derive(Debug)]
pub enum AuthVerdict {
    /// Proceed at the given level without consulting anyone.
    Granted {
        /// Resolved application identity.
        desktop_id: String,
        /// Level to start at.
        effective: AccuracyLevel,
    },
    /// The per-user agent must be prompted.
    NeedAgent {
        /// Resolved application identity.
        desktop_id: String,
        /// Agent to prompt.
        registration: AgentRegistration,
    },
}

/// All broker state; touched only through the engine's mutex.
#[derive(Debug)]
pub struct EngineState {
    config: Arc<ConfigStore>,
    /// Source ownership and fix arbitration.
    pub manager: LocationManager,
    /// Client records.
    pub clients: ClientManager,
    /// Agent registrations.
    pub agents: AgentRegistry,
    location_serial: u64,
    in_use: bool,
}

impl EngineState {
    /// Assemble the state around a configured manager.
    #[must_use]
    pub fn new(config: Arc<ConfigStore>, manager: LocationManager) -> Self {
        Self {
            config,
            manager,
            clients: ClientManager::default(),
            agents: AgentRegistry::default(),
            location_serial: 0,
            in_use: false,
        }
    }

    /// The immutable configuration snapshot.
    #[must_use]
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Whether any client is started.
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Create-or-return the reusable client for a peer.
    pub fn get_or_create_client(&mut self, owner: &str) -> ClientId {
        self.clients.get_or_create(owner)
    }

    /// Always create a fresh client that dies with its peer.
    pub fn create_client(&mut self, owner: &str) -> ClientId {
        self.clients.create(owner, true)
    }

    /// Validate a start attempt and snapshot what the suspended part needs.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` for unknown clients and foreign callers,
    /// `AlreadyStarted` for repeated starts.
    pub fn begin_start(&mut self, id: ClientId, caller: &str) -> Result<StartPlan, BusError> {
        let client = self
            .clients
            .get(id)
            .ok_or_else(|| BusError::NotAuthorized(format!("unknown client {}", id.0)))?;
        if client.owner != caller {
            return Err(BusError::NotAuthorized(format!(
                "client {} is owned by another peer",
                id.0
            )));
        }
        client.begin_start()?;
        Ok(StartPlan {
            id,
            generation: client.generation,
            owner: client.owner.clone(),
            desktop_id_hint: client.desktop_id.clone(),
            requested: client.requested,
        })
    }

    /// Decide authorization from configuration, or hand back the agent to
    /// prompt. The sandbox identity overrides whatever the application
    /// claimed.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when no identity can be derived, `AccessDenied`
    /// for denied apps and for ask-agent apps without a registered agent.
    pub fn authorize(
        &self,
        identity: &PeerIdentity,
        desktop_id_hint: Option<&str>,
        requested: AccuracyLevel,
    ) -> Result<AuthVerdict, BusError> {
        let desktop_id = identity
            .sandbox
            .app_id()
            .or(desktop_id_hint)
            .ok_or_else(|| BusError::InvalidArgument("DesktopId is not set".into()))?
            .to_owned();

        match self.config.permission(&desktop_id, identity.uid) {
            AppPermission::Denied => Err(BusError::AccessDenied(format!(
                "'{desktop_id}' is not allowed to locate"
            ))),
            AppPermission::Allowed => Ok(AuthVerdict::Granted {
                desktop_id,
                effective: requested,
            }),
            AppPermission::AskAgent => {
                if self.config.is_system_component(&desktop_id) {
                    return Ok(AuthVerdict::Granted {
                        desktop_id,
                        effective: requested,
                    });
                }
                match self.agents.get(identity.uid) {
                    Some(registration) => Ok(AuthVerdict::NeedAgent {
                        desktop_id,
                        registration: registration.clone(),
                    }),
                    None => Err(BusError::AccessDenied(format!(
                        "no agent registered for uid {}, cannot authorize '{desktop_id}'",
                        identity.uid
                    ))),
                }
            }
        }
    }

    /// Finish a start after the suspended authorization steps.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` when the client disappeared or was recycled while
    /// suspended, `AlreadyStarted` on a lost race, `NotAvailable` when no
    /// provider is usable.
    pub fn complete_start(
        &mut self,
        id: ClientId,
        generation: u64,
        effective: AccuracyLevel,
    ) -> Result<Vec<Effect>, BusError> {
        let client = self
            .clients
            .get(id)
            .ok_or_else(|| BusError::NotAuthorized(format!("client {} is gone", id.0)))?;
        if client.generation != generation {
            return Err(BusError::NotAuthorized(format!(
                "client {} was recycled while authorizing",
                id.0
            )));
        }
        client.begin_start()?;
        if !self.manager.can_serve(effective) {
            return Err(BusError::NotAvailable(
                "no location source is currently usable".into(),
            ));
        }

        let mut effects = Vec::new();
        if let Some(client) = self.clients.get_mut(id) {
            client.complete_start(effective);
        }
        effects.push(Effect::ActiveChanged {
            client: id,
            active: true,
        });
        self.push_demand_effects(&mut effects);
        self.push_in_use_effect(&mut effects);

        // The current best fix may already be cached; deliver it right away
        // when it passes this client's cap and thresholds.
        let window = LocationManager::staleness_window(self.clients.max_started_time_threshold());
        if let Some(best) = self.manager.select_best(window) {
            self.push_broadcast(id, &best, &mut effects);
        }
        Ok(effects)
    }

    /// Stop a started client.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` for unknown clients and foreign callers, `NotStarted`
    /// when not started.
    pub fn stop_client(&mut self, id: ClientId, caller: &str) -> Result<Vec<Effect>, BusError> {
        let client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| BusError::NotAuthorized(format!("unknown client {}", id.0)))?;
        if client.owner != caller {
            return Err(BusError::NotAuthorized(format!(
                "client {} is owned by another peer",
                id.0
            )));
        }
        client.stop()?;
        client.generation += 1;

        let mut effects = vec![Effect::ActiveChanged {
            client: id,
            active: false,
        }];
        self.push_demand_effects(&mut effects);
        self.push_in_use_effect(&mut effects);
        Ok(effects)
    }

    /// Delete a client on behalf of a caller.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` for unknown clients and foreign callers.
    pub fn delete_client(&mut self, id: ClientId, caller: &str) -> Result<Vec<Effect>, BusError> {
        {
            let client = self
                .clients
                .get(id)
                .ok_or_else(|| BusError::NotAuthorized(format!("unknown client {}", id.0)))?;
            if client.owner != caller {
                return Err(BusError::NotAuthorized(format!(
                    "client {} is owned by another peer",
                    id.0
                )));
            }
        }
        Ok(self.remove_client(id))
    }

    fn remove_client(&mut self, id: ClientId) -> Vec<Effect> {
        let Some(record) = self.clients.remove(id) else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        effects.push(Effect::RemoveClientObjects {
            client: id,
            location_serial: record.location_serial,
        });
        self.push_demand_effects(&mut effects);
        self.push_in_use_effect(&mut effects);
        debug!("client {} deleted", id.0);
        effects
    }

    /// Tear down everything owned by a vanished peer.
    ///
    /// Started clients are stopped, auto-delete clients removed, pending
    /// suspended operations invalidated, agent registrations dropped.
    pub fn peer_vanished(&mut self, peer: &str) -> Vec<Effect> {
        self.agents.remove_peer(peer);

        let mut effects = Vec::new();
        for id in self.clients.owned_by(peer) {
            let Some(client) = self.clients.get_mut(id) else {
                continue;
            };
            client.generation += 1;
            if client.started() {
                let _ = client.stop();
                effects.push(Effect::ActiveChanged {
                    client: id,
                    active: false,
                });
            }
            if client.auto_delete {
                effects.extend(self.remove_client(id));
            }
        }
        self.push_demand_effects(&mut effects);
        self.push_in_use_effect(&mut effects);
        effects
    }

    /// Fold a provider emission into state and compute resulting broadcasts.
    ///
    /// One best fix is elected per event; it is then offered to every
    /// started client, and only the per-client accuracy cap and thresholds
    /// decide who receives it. Clients capped below the winner's level get
    /// nothing this round rather than a coarser substitute.
    pub fn handle_source_event(&mut self, event: &SourceEvent) -> Vec<Effect> {
        self.manager.note_event(event);
        let SourceEvent::Fix { fix, .. } = event else {
            return Vec::new();
        };

        let window = LocationManager::staleness_window(self.clients.max_started_time_threshold());
        let Some(best) = self.manager.select_best(window) else {
            return Vec::new();
        };
        let started: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|client| client.started())
            .map(|client| client.id)
            .collect();

        let mut effects = Vec::new();
        for id in started {
            self.push_broadcast(id, &best, &mut effects);
        }
        if fix.level() == AccuracyLevel::Exact
            && effects
                .iter()
                .any(|effect| matches!(effect, Effect::Broadcast { .. }))
        {
            effects.push(Effect::SubmitFix(fix.clone()));
        }
        effects
    }

    /// Record a provider start outcome; failures elect substitutes.
    pub fn record_start_result(&mut self, kind: SourceKind, result: StartResult) -> Vec<Effect> {
        self.manager.record_start_result(kind, result);
        let mut effects = Vec::new();
        if result == StartResult::Failed {
            self.push_demand_effects(&mut effects);
        }
        effects
    }

    /// Periodic demand recompute; lets failure backoffs expire.
    pub fn tick(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.push_demand_effects(&mut effects);
        effects
    }

    /// Set a client's claimed desktop id.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for empty ids or ids with path separators.
    pub fn set_desktop_id(&mut self, id: ClientId, desktop_id: &str) -> Result<(), BusError> {
        if desktop_id.is_empty() || desktop_id.contains('/') {
            return Err(BusError::InvalidArgument(format!(
                "malformed desktop id '{desktop_id}'"
            )));
        }
        if let Some(client) = self.clients.get_mut(id) {
            client.desktop_id = Some(desktop_id.to_owned());
        }
        Ok(())
    }

    /// Set a client's requested accuracy level from its wire value.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for values outside the level contract.
    pub fn set_requested_level(&mut self, id: ClientId, level: u32) -> Result<(), BusError> {
        let level = AccuracyLevel::try_from(level)
            .map_err(|err| BusError::InvalidArgument(err.to_string()))?;
        if let Some(client) = self.clients.get_mut(id) {
            client.requested = level;
        }
        Ok(())
    }

    /// Set a client's distance threshold in meters.
    pub fn set_distance_threshold(&mut self, id: ClientId, meters: u32) {
        if let Some(client) = self.clients.get_mut(id) {
            client.distance_threshold = meters;
        }
    }

    /// Set a client's time threshold in seconds.
    pub fn set_time_threshold(&mut self, id: ClientId, seconds: u32) {
        if let Some(client) = self.clients.get_mut(id) {
            client.time_threshold = seconds;
        }
    }

    /// Snapshot a client record for property reads.
    #[must_use]
    pub fn client(&self, id: ClientId) -> Option<ClientRecord> {
        self.clients.get(id).cloned()
    }

    /// Finest level any usable provider advertises.
    #[must_use]
    pub fn available_accuracy(&self) -> AccuracyLevel {
        self.manager.available_accuracy()
    }

    fn push_broadcast(&mut self, id: ClientId, candidate: &LocationFix, effects: &mut Vec<Effect>) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        if !client.accepts(candidate) {
            return;
        }
        self.location_serial += 1;
        let serial = self.location_serial;
        let old_serial = client.location_serial;
        client.note_broadcast(candidate.clone(), serial);
        effects.push(Effect::Broadcast {
            client: id,
            old_serial,
            new_serial: serial,
            fix: candidate.clone(),
        });
    }

    fn push_demand_effects(&mut self, effects: &mut Vec<Effect>) {
        let levels = self.clients.started_levels();
        let delta = self.manager.recompute_demand(&levels);
        effects.extend(delta.to_start.into_iter().map(Effect::StartSource));
        effects.extend(delta.to_stop.into_iter().map(Effect::StopSource));
    }

    fn push_in_use_effect(&mut self, effects: &mut Vec<Effect>) {
        let in_use = self.clients.any_started();
        if in_use != self.in_use {
            self.in_use = in_use;
            effects.push(Effect::InUseChanged(in_use));
        }
    }
}

/// Async shell around the state: owns the mutex, executes effects.
#[derive(Debug)]
pub struct Engine {
    state: Mutex<EngineState>,
    connection: OnceLock<Connection>,
    tracker: OnceLock<Arc<PeerTracker>>,
    submitter: Option<Arc<Submitter>>,
}

impl Engine {
    /// Wrap a state.
    #[must_use]
    pub fn new(state: EngineState, submitter: Option<Submitter>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            connection: OnceLock::new(),
            tracker: OnceLock::new(),
            submitter: submitter.map(Arc::new),
        })
    }

    /// Attach the served connection and the peer tracker once both exist.
    pub fn attach(&self, connection: Connection, tracker: Arc<PeerTracker>) {
        let _ = self.connection.set(connection);
        let _ = self.tracker.set(tracker);
    }

    /// Lock the state. Never held across an await point.
    ///
    /// # Panics
    ///
    /// Panics when a previous holder panicked; the daemon is expected to die
    /// with it rather than run with torn state.
    pub fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state poisoned")
    }

    /// The peer tracker, once attached.
    ///
    /// # Errors
    ///
    /// `Internal` before attachment; method calls cannot arrive earlier in
    /// practice.
    pub fn tracker(&self) -> Result<Arc<PeerTracker>, BusError> {
        self.tracker
            .get()
            .cloned()
            .ok_or_else(|| crate::error::internal("peer tracker not attached".into()))
    }

    /// Execute effects computed under the lock.
    pub async fn apply(self: Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartSource(source) => Self::spawn_start(&self, source),
                Effect::StopSource(source) => {
                    tokio::spawn(async move {
                        source.stop().await;
                    });
                }
                Effect::Broadcast {
                    client,
                    old_serial,
                    new_serial,
                    fix,
                } => {
                    if let Err(err) = self.publish(client, old_serial, new_serial, fix).await {
                        warn!("failed to publish location update: {err}");
                    }
                }
                Effect::ActiveChanged { client, active } => {
                    if let Err(err) = self.notify_active(client, active).await {
                        debug!("failed to notify Active change: {err}");
                    }
                }
                Effect::InUseChanged(in_use) => {
                    if let Err(err) = self.notify_in_use(in_use).await {
                        debug!("failed to notify InUse change: {err}");
                    }
                }
                Effect::RemoveClientObjects {
                    client,
                    location_serial,
                } => {
                    if let Err(err) = self.remove_objects(client, location_serial).await {
                        debug!("failed to drop client objects: {err}");
                    }
                }
                Effect::SubmitFix(fix) => {
                    if let Some(submitter) = &self.submitter {
                        let submitter = Arc::clone(submitter);
                        tokio::spawn(async move {
                            submitter.report(&fix).await;
                        });
                    }
                }
            }
        }
    }

    fn spawn_start(engine: &Arc<Self>, source: Arc<dyn Source>) {
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            let kind = source.kind();
            let result = match tokio::time::timeout(START_TIMEOUT, source.start()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("{kind} source start timed out");
                    // The provider may come up later; force it down so its
                    // state matches the accounting.
                    let _ = source.stop().await;
                    StartResult::Failed
                }
            };
            let effects = engine.state().record_start_result(kind, result);
            engine.apply(effects).await;
        });
    }

    async fn publish(
        &self,
        client: ClientId,
        old_serial: Option<u64>,
        new_serial: u64,
        fix: LocationFix,
    ) -> zbus::Result<()> {
        let Some(connection) = self.connection.get() else {
            return Ok(());
        };
        let server = connection.object_server();

        let new_path = location_path(new_serial);
        server.at(new_path.as_str(), LocationIface::new(fix)).await?;

        let path = client_path(client);
        let iface = server.interface::<_, ClientIface>(path.as_str()).await?;
        let old_path = old_serial.map_or_else(root_path, location_path);
        ClientIface::location_updated(
            iface.signal_emitter(),
            old_path.clone().into(),
            new_path.clone().into(),
        )
        .await?;
        iface
            .get()
            .await
            .location_changed(iface.signal_emitter())
            .await?;

        if let Some(old) = old_serial {
            server
                .remove::<LocationIface, _>(location_path(old).as_str())
                .await?;
        }
        Ok(())
    }

    async fn notify_active(&self, client: ClientId, _active: bool) -> zbus::Result<()> {
        let Some(connection) = self.connection.get() else {
            return Ok(());
        };
        let iface = connection
            .object_server()
            .interface::<_, ClientIface>(client_path(client).as_str())
            .await?;
        iface
            .get()
            .await
            .active_changed(iface.signal_emitter())
            .await
    }

    async fn notify_in_use(&self, _in_use: bool) -> zbus::Result<()> {
        let Some(connection) = self.connection.get() else {
            return Ok(());
        };
        let iface = connection
            .object_server()
            .interface::<_, crate::bus::ManagerIface>(crate::bus::MANAGER_PATH)
            .await?;
        let guard = iface.get().await;
        guard.in_use_changed(iface.signal_emitter()).await?;
        guard
            .available_accuracy_level_changed(iface.signal_emitter())
            .await
    }

    async fn remove_objects(
        &self,
        client: ClientId,
        location_serial: Option<u64>,
    ) -> zbus::Result<()> {
        let Some(connection) = self.connection.get() else {
            return Ok(());
        };
        let server = connection.object_server();
        server
            .remove::<ClientIface, _>(client_path(client).as_str())
            .await?;
        if let Some(serial) = location_serial {
            server
                .remove::<LocationIface, _>(location_path(serial).as_str())
                .await?;
        }
        Ok(())
    }
}

/// Drive the engine from its input streams: provider events, peer vanish
/// notifications and the periodic demand tick.
pub fn spawn_pumps(engine: Arc<Engine>, events: Receiver<SourceEvent>) {
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let effects = engine.state().handle_source_event(&event);
                engine.clone().apply(effects).await;
            }
        });
    }
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let tracker = loop {
                match engine.tracker() {
                    Ok(tracker) => break tracker,
                    Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                }
            };
            let vanished = match tracker.vanished().await {
                Ok(stream) => stream,
                Err(err) => {
                    error!("cannot watch bus names, peer cleanup disabled: {err}");
                    return;
                }
            };
            let mut vanished = Box::pin(vanished);
            while let Some(peer) = vanished.next().await {
                let effects = engine.state().peer_vanished(&peer);
                engine.clone().apply(effects).await;
            }
        });
    }
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            let effects = engine.state().tick();
            engine.clone().apply(effects).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Sandbox;
    use crate::testutil::{fix_at, MockSource};

    fn state_with(fragments: &[&str], sources: &[(SourceKind, AccuracyLevel)]) -> EngineState {
        let config = Arc::new(ConfigStore::from_fragments(fragments.iter().copied()));
        let mut manager = LocationManager::default();
        for &(kind, max) in sources {
            manager.register(MockSource::new(kind, max));
        }
        EngineState::new(config, manager)
    }

    fn identity(uid: u32) -> PeerIdentity {
        PeerIdentity {
            bus_name: ":1.7".into(),
            uid,
            pid: 4242,
            sandbox: Sandbox::None,
        }
    }

    /// Drive a client through the full start pipeline without a bus.
    fn start_client(
        state: &mut EngineState,
        owner: &str,
        desktop_id: &str,
        requested: u32,
    ) -> (ClientId, Vec<Effect>) {
        let id = state.get_or_create_client(owner);
        state.set_desktop_id(id, desktop_id).unwrap();
        state.set_requested_level(id, requested).unwrap();
        let plan = state.begin_start(id, owner).unwrap();
        let verdict = state
            .authorize(&identity(1000), plan.desktop_id_hint.as_deref(), plan.requested)
            .unwrap();
        let AuthVerdict::Granted { effective, .. } = verdict else {
            panic!("expected configuration to grant access");
        };
        let effects = state
            .complete_start(id, plan.generation, effective)
            .unwrap();
        (id, effects)
    }

    fn broadcasts(effects: &[Effect]) -> Vec<(ClientId, LocationFix)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Broadcast { client, fix, .. } => Some((*client, fix.clone())),
                _ => None,
            })
            .collect()
    }

    fn starts(effects: &[Effect]) -> Vec<SourceKind> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::StartSource(source) => Some(source.kind()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn allowed_client_receives_an_injected_fix() {
        let mut state = state_with(
            &["[test.app]\nallowed=true\n"],
            &[(SourceKind::Gnss, AccuracyLevel::Exact)],
        );
        let (id, effects) = start_client(&mut state, ":1.7", "test.app", 8);
        assert_eq!(starts(&effects), vec![SourceKind::Gnss]);
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::InUseChanged(true))));

        let fix = fix_at(48.8583, 2.2945, 8.0, 100);
        let effects = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Gnss,
            fix: fix.clone(),
        });
        let delivered = broadcasts(&effects);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, id);
        assert_eq!(delivered[0].1.latitude(), fix.latitude());
        assert_eq!(delivered[0].1.longitude(), fix.longitude());
        assert_eq!(delivered[0].1.accuracy(), fix.accuracy());
    }

    #[test]
    fn distance_threshold_gates_the_second_fix() {
        let mut state = state_with(
            &["[test.app]\nallowed=true\n"],
            &[(SourceKind::Gnss, AccuracyLevel::Exact)],
        );
        let (id, _) = start_client(&mut state, ":1.7", "test.app", 8);
        state.set_distance_threshold(id, 50);

        state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Gnss,
            fix: fix_at(48.8583, 2.2945, 8.0, 100),
        });
        // Roughly 11 m north, below the 50 m threshold.
        let effects = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Gnss,
            fix: fix_at(48.8584, 2.2945, 8.0, 101),
        });
        assert!(broadcasts(&effects).is_empty());

        state.set_distance_threshold(id, 0);
        let effects = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Gnss,
            fix: fix_at(48.8585, 2.2945, 8.0, 102),
        });
        assert_eq!(broadcasts(&effects).len(), 1);
    }

    #[test]
    fn ask_agent_without_an_agent_is_denied() {
        let state = state_with(&[], &[(SourceKind::Gnss, AccuracyLevel::Exact)]);
        let verdict = state.authorize(&identity(1000), Some("test.app"), AccuracyLevel::Exact);
        assert!(matches!(verdict, Err(BusError::AccessDenied(_))));
    }

    #[test]
    fn agent_clamp_blocks_fixes_finer_than_the_grant() {
        let mut state = state_with(
            &[],
            &[
                (SourceKind::Wifi, AccuracyLevel::Street),
                (SourceKind::Ip, AccuracyLevel::City),
            ],
        );
        state.agents.register(
            1000,
            AgentRegistration {
                desktop_id: "org.example.Agent".into(),
                peer: ":1.2".into(),
                max_accuracy: AccuracyLevel::City,
            },
        );

        let id = state.get_or_create_client(":1.7");
        state.set_desktop_id(id, "test.app").unwrap();
        state.set_requested_level(id, 8).unwrap();
        let plan = state.begin_start(id, ":1.7").unwrap();
        let verdict = state
            .authorize(&identity(1000), plan.desktop_id_hint.as_deref(), plan.requested)
            .unwrap();
        let AuthVerdict::NeedAgent { registration, .. } = verdict else {
            panic!("expected the agent to be consulted");
        };
        // The agent allows, but its registration caps the level at City.
        let effective = crate::agents::clamp_grant(
            plan.requested,
            AccuracyLevel::City,
            registration.max_accuracy,
        );
        assert_eq!(effective, AccuracyLevel::City);
        state.complete_start(id, plan.generation, effective).unwrap();

        // Street-accuracy fixes are finer than the clamp and never shown.
        let effects = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Wifi,
            fix: fix_at(48.8583, 2.2945, 80.0, 100),
        });
        assert!(broadcasts(&effects).is_empty());

        let effects = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Ip,
            fix: fix_at(48.8, 2.3, 15_000.0, 101),
        });
        assert_eq!(broadcasts(&effects).len(), 1);
    }

    #[test]
    fn smaller_radius_wins_across_concurrent_sources() {
        let mut state = state_with(
            &["[test.app]\nallowed=true\n"],
            &[
                (SourceKind::Wifi, AccuracyLevel::Street),
                (SourceKind::Ip, AccuracyLevel::City),
            ],
        );
        let (_, _) = start_client(&mut state, ":1.7", "test.app", 8);
        // Demand the city source as well so both caches fill.
        state
            .manager
            .recompute_demand(&[AccuracyLevel::Exact, AccuracyLevel::City]);

        let first = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Wifi,
            fix: fix_at(48.8583, 2.2945, 80.0, 100),
        });
        let delivered = broadcasts(&first);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.accuracy(), 80.0);

        // A newer but much coarser fix does not displace the selection.
        let second = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Ip,
            fix: fix_at(48.9, 2.3, 15_000.0, 101),
        });
        assert!(broadcasts(&second).is_empty());
    }

    #[test]
    fn capped_client_gets_no_substitute_fix() {
        let mut state = state_with(
            &["[test.app]\nallowed=true\n", "[fine.app]\nallowed=true\n"],
            &[
                (SourceKind::Wifi, AccuracyLevel::Street),
                (SourceKind::Ip, AccuracyLevel::City),
            ],
        );
        let (city_id, _) = start_client(&mut state, ":1.7", "test.app", 4);
        let (fine_id, _) = start_client(&mut state, ":1.9", "fine.app", 8);

        // While the coarse fix is the best one, everyone gets it.
        let effects = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Ip,
            fix: fix_at(48.8, 2.3, 15_000.0, 100),
        });
        assert_eq!(broadcasts(&effects).len(), 2);

        // A street-level fix becomes the single best; the city-capped
        // client is filtered out and gets no coarser stand-in.
        let effects = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Wifi,
            fix: fix_at(48.8583, 2.2945, 80.0, 101),
        });
        let delivered = broadcasts(&effects);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, fine_id);
        assert_eq!(delivered[0].1.accuracy(), 80.0);

        // Even a fresh coarse fix does not reach the capped client while
        // the finer one stays the global winner.
        let effects = state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Ip,
            fix: fix_at(49.0, 2.4, 15_000.0, 102),
        });
        assert!(broadcasts(&effects).is_empty());
        assert!(state.client(city_id).unwrap().last_emitted.is_some());
    }

    #[test]
    fn surviving_client_keeps_its_record_but_rejects_new_owners() {
        let mut state = state_with(
            &["[test.app]\nallowed=true\n"],
            &[(SourceKind::Gnss, AccuracyLevel::Exact)],
        );
        let (id, _) = start_client(&mut state, ":1.7", "test.app", 8);

        let effects = state.peer_vanished(":1.7");
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::ActiveChanged { active: false, .. })));
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::StopSource(_))));
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::InUseChanged(false))));

        // The record survives, but a new peer cannot start it.
        assert!(state.client(id).is_some());
        assert!(matches!(
            state.begin_start(id, ":1.9"),
            Err(BusError::NotAuthorized(_))
        ));
    }

    #[test]
    fn auto_delete_clients_vanish_with_their_peer() {
        let mut state = state_with(
            &["[test.app]\nallowed=true\n"],
            &[(SourceKind::Gnss, AccuracyLevel::Exact)],
        );
        let id = state.create_client(":1.7");
        state.set_desktop_id(id, "test.app").unwrap();
        state.set_requested_level(id, 8).unwrap();
        let plan = state.begin_start(id, ":1.7").unwrap();
        state
            .complete_start(id, plan.generation, AccuracyLevel::Exact)
            .unwrap();

        let effects = state.peer_vanished(":1.7");
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::RemoveClientObjects { .. })));
        assert!(state.client(id).is_none());
    }

    #[test]
    fn generation_guard_cancels_stale_starts() {
        let mut state = state_with(
            &["[test.app]\nallowed=true\n"],
            &[(SourceKind::Gnss, AccuracyLevel::Exact)],
        );
        let id = state.get_or_create_client(":1.7");
        state.set_desktop_id(id, "test.app").unwrap();
        let plan = state.begin_start(id, ":1.7").unwrap();

        // The peer vanishes while authorization is suspended.
        state.peer_vanished(":1.7");
        assert!(matches!(
            state.complete_start(id, plan.generation, AccuracyLevel::Exact),
            Err(BusError::NotAuthorized(_))
        ));
    }

    #[test]
    fn start_without_any_source_is_not_available() {
        let mut state = state_with(&["[test.app]\nallowed=true\n"], &[]);
        let id = state.get_or_create_client(":1.7");
        state.set_desktop_id(id, "test.app").unwrap();
        let plan = state.begin_start(id, ":1.7").unwrap();
        assert!(matches!(
            state.complete_start(id, plan.generation, AccuracyLevel::Exact),
            Err(BusError::NotAvailable(_))
        ));
    }

    #[test]
    fn cached_fix_is_delivered_on_start() {
        let mut state = state_with(
            &["[test.app]\nallowed=true\n", "[late.app]\nallowed=true\n"],
            &[(SourceKind::Gnss, AccuracyLevel::Exact)],
        );
        let (_, _) = start_client(&mut state, ":1.7", "test.app", 8);
        state.handle_source_event(&SourceEvent::Fix {
            kind: SourceKind::Gnss,
            fix: fix_at(48.8583, 2.2945, 8.0, 100),
        });

        // A second client starting later gets the cached fix immediately.
        let (late_id, effects) = start_client(&mut state, ":1.9", "late.app", 8);
        let delivered = broadcasts(&effects);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, late_id);
    }

    #[test]
    fn sandbox_identity_overrides_the_claimed_desktop_id() {
        let state = state_with(
            &["[org.example.Sandboxed]\nallowed=true\n[test.app]\nallowed=false\n"],
            &[(SourceKind::Gnss, AccuracyLevel::Exact)],
        );
        let sandboxed = PeerIdentity {
            bus_name: ":1.7".into(),
            uid: 1000,
            pid: 4242,
            sandbox: Sandbox::Flatpak {
                app_id: "org.example.Sandboxed".into(),
            },
        };
        // The app claims a denied id, but the sandbox identity wins.
        let verdict = state
            .authorize(&sandboxed, Some("test.app"), AccuracyLevel::Exact)
            .unwrap();
        assert!(matches!(verdict, AuthVerdict::Granted { .. }));
    }

    #[test]
    fn missing_desktop_id_is_an_invalid_argument() {
        let state = state_with(&[], &[(SourceKind::Gnss, AccuracyLevel::Exact)]);
        assert!(matches!(
            state.authorize(&identity(1000), None, AccuracyLevel::Exact),
            Err(BusError::InvalidArgument(_))
        ));
    }
}
