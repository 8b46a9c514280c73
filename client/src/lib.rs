//! Convenience wrapper around the GeoClue2 bus contract.
//!
//! Hides the object-path plumbing behind a builder plus an async stream of
//! decoded positions:
//!
//! ```rust,no_run
//! use futures::{StreamExt, pin_mut};
//! use geoclued_client::LocationSession;
//! use geoclued_types::AccuracyLevel;
//!
//! async fn run() -> Result<(), geoclued_client::ClientError> {
//!     let session = LocationSession::builder("org.example.Map")
//!         .accuracy(AccuracyLevel::Exact)
//!         .distance_threshold(10)
//!         .connect()
//!         .await?;
//!     session.start().await?;
//!     let updates = session.updates().await?;
//!     pin_mut!(updates);
//!     while let Some(position) = updates.next().await {
//!         println!("{:.5}, {:.5}", position.latitude(), position.longitude());
//!     }
//!     Ok(())
//! }
//! ```

use std::time::Instant;

use futures::{Stream, StreamExt};
use geoclued_types::{AccuracyLevel, InvalidFix, LocationFix, Timestamp};
use log::debug;
use thiserror::Error;
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

pub mod proxies;

use proxies::{ClientProxy, LocationProxy, ManagerProxy};

/// Failures surfaced by the convenience wrapper.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport or service failure.
    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),
    /// The environment mandates portal routing, which this library does not
    /// speak; use the desktop portal API instead.
    #[error("direct bus access is disabled in this environment, use the location portal")]
    PortalRequired,
    /// The service published a fix this library considers malformed.
    #[error("service published a malformed fix: {0}")]
    Malformed(#[from] InvalidFix),
}

/// Whether this process must route through the desktop portal instead of
/// talking to the service directly.
#[must_use]
pub fn portal_required() -> bool {
    if std::env::var("GTK_USE_PORTAL").is_ok_and(|value| value == "1") {
        return true;
    }
    std::path::Path::new("/.flatpak-info").exists()
}

/// Configuration for a [`LocationSession`].
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    desktop_id: String,
    accuracy: AccuracyLevel,
    distance_threshold: u32,
    time_threshold: u32,
    dedicated: bool,
}

impl SessionBuilder {
    /// Desired accuracy level; `City` when not set.
    #[must_use]
    pub fn accuracy(mut self, level: AccuracyLevel) -> Self {
        self.accuracy = level;
        self
    }

    /// Minimum movement in meters between updates.
    #[must_use]
    pub fn distance_threshold(mut self, meters: u32) -> Self {
        self.distance_threshold = meters;
        self
    }

    /// Minimum seconds between updates.
    #[must_use]
    pub fn time_threshold(mut self, seconds: u32) -> Self {
        self.time_threshold = seconds;
        self
    }

    /// Use a dedicated client object that the service discards when this
    /// process disconnects, instead of the per-peer reusable one.
    #[must_use]
    pub fn dedicated(mut self) -> Self {
        self.dedicated = true;
        self
    }

    /// Connect to the system bus and configure a client object.
    ///
    /// # Errors
    ///
    /// [`ClientError::PortalRequired`] in portal-mandated environments,
    /// transport failures otherwise.
    pub async fn connect(self) -> Result<LocationSession, ClientError> {
        if portal_required() {
            return Err(ClientError::PortalRequired);
        }
        let connection = Connection::system().await?;
        let manager = ManagerProxy::new(&connection).await?;
        let path = if self.dedicated {
            manager.create_client().await?
        } else {
            manager.get_client().await?
        };
        debug!("using client object {path}");
        let client = ClientProxy::builder(&connection)
            .path(path.clone())?
            .build()
            .await?;
        client.set_desktop_id(&self.desktop_id).await?;
        client
            .set_requested_accuracy_level(self.accuracy as u32)
            .await?;
        if self.distance_threshold > 0 {
            client.set_distance_threshold(self.distance_threshold).await?;
        }
        if self.time_threshold > 0 {
            client.set_time_threshold(self.time_threshold).await?;
        }
        Ok(LocationSession {
            connection,
            client,
            path,
            dedicated: self.dedicated,
        })
    }
}

/// An established client session with the location service.
///
/// Dropping the session stops deliveries on a best-effort basis; dedicated
/// sessions also ask the service to delete their client object.
#[derive(Debug)]
pub struct LocationSession {
    connection: Connection,
    client: ClientProxy<'static>,
    path: OwnedObjectPath,
    dedicated: bool,
}

impl LocationSession {
    /// Start configuring a session for an application identity.
    #[must_use]
    pub fn builder(desktop_id: &str) -> SessionBuilder {
        SessionBuilder {
            desktop_id: desktop_id.to_owned(),
            accuracy: AccuracyLevel::City,
            distance_threshold: 0,
            time_threshold: 0,
            dedicated: false,
        }
    }

    /// Path of the underlying client object.
    #[must_use]
    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    /// Ask the service to start delivering updates.
    ///
    /// # Errors
    ///
    /// Authorization failures and transport errors, verbatim from the
    /// service.
    pub async fn start(&self) -> Result<(), ClientError> {
        Ok(self.client.start().await?)
    }

    /// Stop deliveries; the session can be started again.
    ///
    /// # Errors
    ///
    /// Transport errors and lifecycle violations from the service.
    pub async fn stop(&self) -> Result<(), ClientError> {
        Ok(self.client.stop().await?)
    }

    /// The most recently published position, if any.
    ///
    /// # Errors
    ///
    /// Transport errors while reading the location object.
    pub async fn current(&self) -> Result<Option<LocationFix>, ClientError> {
        let path = self.client.location().await?;
        if path.as_str() == "/" {
            return Ok(None);
        }
        Ok(Some(self.read_location(&path).await?))
    }

    /// Stream of decoded positions, one per service broadcast.
    ///
    /// Unreadable updates (the location object may already be gone when a
    /// slow consumer catches up) are skipped with a debug log.
    ///
    /// # Errors
    ///
    /// Transport errors while subscribing to the update signal.
    pub async fn updates(&self) -> Result<impl Stream<Item = LocationFix> + '_, ClientError> {
        let stream = self.client.receive_location_updated().await?;
        let connection = self.connection.clone();
        Ok(stream.filter_map(move |signal| {
            let connection = connection.clone();
            async move {
                let args = signal.args().ok()?;
                match read_location_at(&connection, args.new()).await {
                    Ok(fix) => Some(fix),
                    Err(err) => {
                        debug!("skipping unreadable location update: {err}");
                        None
                    }
                }
            }
        }))
    }

    async fn read_location(&self, path: &OwnedObjectPath) -> Result<LocationFix, ClientError> {
        read_location_at(&self.connection, path).await
    }
}

impl Drop for LocationSession {
    /// Best-effort teardown: stop deliveries and, for dedicated sessions,
    /// delete the client object. Runs detached since drop cannot await;
    /// without a runtime the service's peer-vanish cleanup is the backstop.
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime at drop, leaving {} to the service", self.path);
            return;
        };
        let client = self.client.clone();
        let connection = self.connection.clone();
        let path = self.path.clone();
        let dedicated = self.dedicated;
        handle.spawn(async move {
            if client.active().await.unwrap_or(false) {
                if let Err(err) = client.stop().await {
                    debug!("failed to stop {path} on drop: {err}");
                }
            }
            if dedicated {
                let deleted = async {
                    ManagerProxy::new(&connection)
                        .await?
                        .delete_client(&path)
                        .await
                };
                if let Err(err) = deleted.await {
                    debug!("failed to delete {path} on drop: {err}");
                }
            }
        });
    }
}

/// Fetch and decode one location object.
async fn read_location_at(
    connection: &Connection,
    path: &OwnedObjectPath,
) -> Result<LocationFix, ClientError> {
    let location = LocationProxy::builder(connection)
        .path(path.clone())?
        .build()
        .await?;
    let latitude = location.latitude().await?;
    let longitude = location.longitude().await?;
    let accuracy = location.accuracy().await?;
    let altitude = location.altitude().await?;
    let speed = location.speed().await?;
    let heading = location.heading().await?;
    let description = location.description().await?;
    let (seconds, micros) = location.timestamp().await?;

    let mut fix = LocationFix::new(latitude, longitude, accuracy)?
        .with_description(&description)
        .with_timestamp(Timestamp { seconds, micros }, Instant::now());
    if altitude > -f64::MAX {
        fix = fix.with_altitude(altitude);
    }
    if speed >= 0.0 {
        fix = fix.with_speed(speed)?;
    }
    if heading >= 0.0 {
        fix = fix.with_heading(heading)?;
    }
    Ok(fix)
}
