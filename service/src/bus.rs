//! The published bus surface: Manager, Client and Location objects.
//!
//! Interface objects hold no state of their own beyond their identifiers;
//! every read and write goes through the engine so there is exactly one copy
//! of the truth. Typed identifiers become object paths only here.

use std::sync::Arc;

use geoclued_types::{AccuracyLevel, LocationFix};
use log::{debug, warn};
use zbus::message::Header;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};
use zbus::{connection, interface, Connection, ObjectServer};

use crate::agents::{prompt_agent, read_agent_ceiling, AgentRegistration};
use crate::client::ClientId;
use crate::engine::{AuthVerdict, Engine};
use crate::error::BusError;

/// Well-known name the broker claims on the system bus.
pub const WELL_KNOWN_NAME: &str = "org.freedesktop.GeoClue2";
/// Path of the manager object.
pub const MANAGER_PATH: &str = "/org/freedesktop/GeoClue2/Manager";

const CLIENT_PATH_PREFIX: &str = "/org/freedesktop/GeoClue2/Client/";
const LOCATION_PATH_PREFIX: &str = "/org/freedesktop/GeoClue2/Location/";

/// Serialize a client identifier to its object path.
#[must_use]
pub fn client_path(id: ClientId) -> OwnedObjectPath {
    ObjectPath::try_from(format!("{CLIENT_PATH_PREFIX}{}", id.0))
        .expect("client paths are always well formed")
        .into()
}

/// Serialize a location serial to its object path.
#[must_use]
pub fn location_path(serial: u64) -> OwnedObjectPath {
    ObjectPath::try_from(format!("{LOCATION_PATH_PREFIX}{serial}"))
        .expect("location paths are always well formed")
        .into()
}

/// The root path, published as a client's location before the first fix.
#[must_use]
pub fn root_path() -> OwnedObjectPath {
    ObjectPath::try_from("/")
        .expect("the root path is well formed")
        .into()
}

fn parse_client_path(path: &ObjectPath<'_>) -> Result<ClientId, BusError> {
    path.as_str()
        .strip_prefix(CLIENT_PATH_PREFIX)
        .and_then(|tail| tail.parse().ok())
        .map(ClientId)
        .ok_or_else(|| BusError::InvalidArgument(format!("'{path}' is not a client path")))
}

fn sender_of(header: &Header<'_>) -> Result<String, BusError> {
    header
        .sender()
        .map(ToString::to_string)
        .ok_or_else(|| crate::error::internal("method call without a sender".into()))
}

/// The singleton manager object.
pub struct ManagerIface {
    engine: Arc<Engine>,
}

impl ManagerIface {
    /// Bind the manager object to the engine.
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    async fn export_client(
        &self,
        server: &ObjectServer,
        id: ClientId,
    ) -> Result<OwnedObjectPath, BusError> {
        let path = client_path(id);
        server
            .at(path.as_str(), ClientIface::new(Arc::clone(&self.engine), id))
            .await?;
        Ok(path)
    }
}

#[interface(name = "org.freedesktop.GeoClue2.Manager")]
impl ManagerIface {
    /// Create-or-return the caller's reusable client.
    async fn get_client(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(object_server)] server: &ObjectServer,
    ) -> Result<OwnedObjectPath, BusError> {
        let caller = sender_of(&header)?;
        let id = self.engine.state().get_or_create_client(&caller);
        self.export_client(server, id).await
    }

    /// Always create a fresh client that dies with the caller.
    async fn create_client(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(object_server)] server: &ObjectServer,
    ) -> Result<OwnedObjectPath, BusError> {
        let caller = sender_of(&header)?;
        let id = self.engine.state().create_client(&caller);
        self.export_client(server, id).await
    }

    /// Delete a client owned by the caller.
    async fn delete_client(
        &self,
        client: ObjectPath<'_>,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), BusError> {
        let caller = sender_of(&header)?;
        let id = parse_client_path(&client)?;
        let effects = self.engine.state().delete_client(id, &caller)?;
        self.engine.clone().apply(effects).await;
        Ok(())
    }

    /// Register the caller as the consent agent for its user.
    async fn add_agent(
        &self,
        id: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(), BusError> {
        let caller = sender_of(&header)?;
        let identity = self
            .engine
            .tracker()?
            .resolve(&caller)
            .await
            .map_err(|err| BusError::AccessDenied(format!("cannot identify agent: {err}")))?;

        let allowed = {
            let state = self.engine.state();
            identity.uid == 0 || state.config().is_agent_allowed(&id)
        };
        if !allowed {
            warn!("rejecting agent '{id}' for uid {}", identity.uid);
            return Err(BusError::AccessDenied(format!(
                "agent '{id}' is not in the agent whitelist"
            )));
        }

        let ceiling = read_agent_ceiling(connection, &caller).await;
        self.engine.state().agents.register(
            identity.uid,
            AgentRegistration {
                desktop_id: id,
                peer: caller,
                max_accuracy: ceiling,
            },
        );
        Ok(())
    }

    /// Whether any client is currently receiving updates.
    #[zbus(property)]
    async fn in_use(&self) -> bool {
        self.engine.state().in_use()
    }

    /// Finest accuracy level any usable source advertises.
    #[zbus(property)]
    async fn available_accuracy_level(&self) -> u32 {
        self.engine.state().available_accuracy() as u32
    }
}

/// One per-subscriber client object.
pub struct ClientIface {
    engine: Arc<Engine>,
    id: ClientId,
}

impl ClientIface {
    /// Bind a client object to its record.
    #[must_use]
    pub fn new(engine: Arc<Engine>, id: ClientId) -> Self {
        Self { engine, id }
    }
}

#[interface(name = "org.freedesktop.GeoClue2.Client")]
impl ClientIface {
    /// Start receiving location updates, subject to authorization.
    async fn start(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(), BusError> {
        let caller = sender_of(&header)?;
        let plan = self.engine.state().begin_start(self.id, &caller)?;

        // Suspension point: everything re-validates via the generation.
        let identity = self
            .engine
            .tracker()?
            .resolve(&plan.owner)
            .await
            .map_err(|err| {
                BusError::AccessDenied(format!("cannot identify peer {}: {err}", plan.owner))
            })?;

        let verdict =
            self.engine
                .state()
                .authorize(&identity, plan.desktop_id_hint.as_deref(), plan.requested)?;
        let effective = match verdict {
            AuthVerdict::Granted { effective, .. } => effective,
            AuthVerdict::NeedAgent {
                desktop_id,
                registration,
            } => prompt_agent(connection, &registration, &desktop_id, plan.requested).await?,
        };

        let effects = self
            .engine
            .state()
            .complete_start(self.id, plan.generation, effective)?;
        debug!("client {} started at {effective}", self.id.0);
        self.engine.clone().apply(effects).await;
        Ok(())
    }

    /// Stop receiving location updates.
    async fn stop(&self, #[zbus(header)] header: Header<'_>) -> Result<(), BusError> {
        let caller = sender_of(&header)?;
        let effects = self.engine.state().stop_client(self.id, &caller)?;
        self.engine.clone().apply(effects).await;
        Ok(())
    }

    /// Desktop id the application claims.
    #[zbus(property)]
    async fn desktop_id(&self) -> String {
        self.engine
            .state()
            .client(self.id)
            .and_then(|client| client.desktop_id)
            .unwrap_or_default()
    }

    #[zbus(property)]
    async fn set_desktop_id(&mut self, value: String) -> zbus::fdo::Result<()> {
        self.engine
            .state()
            .set_desktop_id(self.id, &value)
            .map_err(|err| zbus::fdo::Error::InvalidArgs(err.to_string()))
    }

    /// Requested accuracy level, as a wire value.
    #[zbus(property)]
    async fn requested_accuracy_level(&self) -> u32 {
        self.engine
            .state()
            .client(self.id)
            .map_or(AccuracyLevel::City, |client| client.requested) as u32
    }

    #[zbus(property)]
    async fn set_requested_accuracy_level(&mut self, value: u32) -> zbus::fdo::Result<()> {
        self.engine
            .state()
            .set_requested_level(self.id, value)
            .map_err(|err| zbus::fdo::Error::InvalidArgs(err.to_string()))
    }

    /// Minimum movement in meters between updates; zero disables.
    #[zbus(property)]
    async fn distance_threshold(&self) -> u32 {
        self.engine
            .state()
            .client(self.id)
            .map_or(0, |client| client.distance_threshold)
    }

    #[zbus(property)]
    async fn set_distance_threshold(&mut self, value: u32) {
        self.engine.state().set_distance_threshold(self.id, value);
    }

    /// Minimum seconds between updates; zero disables.
    #[zbus(property)]
    async fn time_threshold(&self) -> u32 {
        self.engine
            .state()
            .client(self.id)
            .map_or(0, |client| client.time_threshold)
    }

    #[zbus(property)]
    async fn set_time_threshold(&mut self, value: u32) {
        self.engine.state().set_time_threshold(self.id, value);
    }

    /// Path of the latest published fix, `/` before the first one.
    #[zbus(property)]
    async fn location(&self) -> OwnedObjectPath {
        self.engine
            .state()
            .client(self.id)
            .and_then(|client| client.location_serial)
            .map_or_else(root_path, location_path)
    }

    /// Whether the client is started.
    #[zbus(property)]
    async fn active(&self) -> bool {
        self.engine
            .state()
            .client(self.id)
            .is_some_and(|client| client.started())
    }

    /// Emitted on every broadcast with the superseded and the new location
    /// object paths.
    #[zbus(signal)]
    pub async fn location_updated(
        emitter: &SignalEmitter<'_>,
        old: ObjectPath<'_>,
        new: ObjectPath<'_>,
    ) -> zbus::Result<()>;
}

/// One published fix, immutable for its lifetime on the bus.
pub struct LocationIface {
    fix: LocationFix,
}

impl LocationIface {
    /// Wrap a fix for publication.
    #[must_use]
    pub fn new(fix: LocationFix) -> Self {
        Self { fix }
    }
}

#[interface(name = "org.freedesktop.GeoClue2.Location")]
impl LocationIface {
    /// Latitude in degrees.
    #[zbus(property)]
    async fn latitude(&self) -> f64 {
        self.fix.latitude()
    }

    /// Longitude in degrees.
    #[zbus(property)]
    async fn longitude(&self) -> f64 {
        self.fix.longitude()
    }

    /// Radius of the 68% confidence circle in meters.
    #[zbus(property)]
    async fn accuracy(&self) -> f64 {
        self.fix.accuracy()
    }

    /// Altitude in meters; the largest negative double when unknown.
    #[zbus(property)]
    async fn altitude(&self) -> f64 {
        self.fix.altitude().unwrap_or(-f64::MAX)
    }

    /// Speed in meters per second; negative when unknown.
    #[zbus(property)]
    async fn speed(&self) -> f64 {
        self.fix.speed().unwrap_or(-1.0)
    }

    /// Heading in degrees; negative when unknown.
    #[zbus(property)]
    async fn heading(&self) -> f64 {
        self.fix.heading().unwrap_or(-1.0)
    }

    /// Human-readable description of the fix origin.
    #[zbus(property)]
    async fn description(&self) -> String {
        self.fix.description().to_owned()
    }

    /// Wallclock pair (seconds, microseconds) of the measurement.
    #[zbus(property)]
    async fn timestamp(&self) -> (u64, u64) {
        let ts = self.fix.timestamp();
        (ts.seconds, ts.micros)
    }
}

/// Claim the well-known name on the system bus and publish the manager.
///
/// # Errors
///
/// Fails when the bus is unreachable or the name is taken.
pub async fn serve(engine: Arc<Engine>) -> zbus::Result<Connection> {
    let connection = connection::Builder::system()?
        .serve_at(MANAGER_PATH, ManagerIface::new(engine))?
        .name(WELL_KNOWN_NAME)?
        .build()
        .await?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_paths_round_trip() {
        let path = client_path(ClientId(17));
        assert_eq!(path.as_str(), "/org/freedesktop/GeoClue2/Client/17");
        let borrowed: ObjectPath<'_> = path.clone().into();
        assert_eq!(parse_client_path(&borrowed).unwrap(), ClientId(17));
    }

    #[test]
    fn foreign_paths_are_rejected() {
        let path = ObjectPath::try_from("/org/freedesktop/GeoClue2/Location/1").unwrap();
        assert!(parse_client_path(&path).is_err());
        let path = ObjectPath::try_from("/org/freedesktop/GeoClue2/Client/x").unwrap();
        assert!(parse_client_path(&path).is_err());
    }

    #[test]
    fn location_paths_carry_the_serial() {
        assert_eq!(
            location_path(3).as_str(),
            "/org/freedesktop/GeoClue2/Location/3"
        );
        assert_eq!(root_path().as_str(), "/");
    }
}
