//! Proxies for the published GeoClue2 interfaces.

use zbus::proxy;
use zbus::zvariant::OwnedObjectPath;

/// The service manager object.
#[proxy(
    interface = "org.freedesktop.GeoClue2.Manager",
    default_service = "org.freedesktop.GeoClue2",
    default_path = "/org/freedesktop/GeoClue2/Manager"
)]
pub trait Manager {
    /// Create-or-return the caller's reusable client.
    fn get_client(&self) -> zbus::Result<OwnedObjectPath>;

    /// Always create a fresh client that dies with the caller.
    fn create_client(&self) -> zbus::Result<OwnedObjectPath>;

    /// Delete a client owned by the caller.
    fn delete_client(&self, client: &OwnedObjectPath) -> zbus::Result<()>;

    /// Register the caller as the consent agent for its user.
    fn add_agent(&self, id: &str) -> zbus::Result<()>;

    /// Whether any client is currently receiving updates.
    #[zbus(property)]
    fn in_use(&self) -> zbus::Result<bool>;

    /// Finest accuracy level any usable source advertises.
    #[zbus(property)]
    fn available_accuracy_level(&self) -> zbus::Result<u32>;
}

/// One per-subscriber client object.
#[proxy(
    interface = "org.freedesktop.GeoClue2.Client",
    default_service = "org.freedesktop.GeoClue2",
    assume_defaults = false
)]
pub trait Client {
    /// Start receiving location updates, subject to authorization.
    fn start(&self) -> zbus::Result<()>;

    /// Stop receiving location updates.
    fn stop(&self) -> zbus::Result<()>;

    /// Desktop id the application claims.
    #[zbus(property)]
    fn desktop_id(&self) -> zbus::Result<String>;

    /// Set the claimed desktop id; required before `Start`.
    #[zbus(property)]
    fn set_desktop_id(&self, value: &str) -> zbus::Result<()>;

    /// Requested accuracy level, as a wire value.
    #[zbus(property)]
    fn requested_accuracy_level(&self) -> zbus::Result<u32>;

    /// Request an accuracy level.
    #[zbus(property)]
    fn set_requested_accuracy_level(&self, value: u32) -> zbus::Result<()>;

    /// Minimum movement in meters between updates; zero disables.
    #[zbus(property)]
    fn distance_threshold(&self) -> zbus::Result<u32>;

    /// Set the distance threshold.
    #[zbus(property)]
    fn set_distance_threshold(&self, value: u32) -> zbus::Result<()>;

    /// Minimum seconds between updates; zero disables.
    #[zbus(property)]
    fn time_threshold(&self) -> zbus::Result<u32>;

    /// Set the time threshold.
    #[zbus(property)]
    fn set_time_threshold(&self, value: u32) -> zbus::Result<()>;

    /// Path of the latest published fix, `/` before the first one.
    #[zbus(property)]
    fn location(&self) -> zbus::Result<OwnedObjectPath>;

    /// Whether the client is started.
    #[zbus(property)]
    fn active(&self) -> zbus::Result<bool>;

    /// Emitted on every broadcast with the superseded and new paths.
    #[zbus(signal)]
    fn location_updated(&self, old: OwnedObjectPath, new: OwnedObjectPath) -> zbus::Result<()>;
}

/// One published fix.
#[proxy(
    interface = "org.freedesktop.GeoClue2.Location",
    default_service = "org.freedesktop.GeoClue2",
    assume_defaults = false
)]
pub trait Location {
    /// Latitude in degrees.
    #[zbus(property)]
    fn latitude(&self) -> zbus::Result<f64>;

    /// Longitude in degrees.
    #[zbus(property)]
    fn longitude(&self) -> zbus::Result<f64>;

    /// Radius of the 68% confidence circle in meters.
    #[zbus(property)]
    fn accuracy(&self) -> zbus::Result<f64>;

    /// Altitude in meters; the largest negative double when unknown.
    #[zbus(property)]
    fn altitude(&self) -> zbus::Result<f64>;

    /// Speed in meters per second; negative when unknown.
    #[zbus(property)]
    fn speed(&self) -> zbus::Result<f64>;

    /// Heading in degrees; negative when unknown.
    #[zbus(property)]
    fn heading(&self) -> zbus::Result<f64>;

    /// Human-readable description of the fix origin.
    #[zbus(property)]
    fn description(&self) -> zbus::Result<String>;

    /// Wallclock pair (seconds, microseconds) of the measurement.
    #[zbus(property)]
    fn timestamp(&self) -> zbus::Result<(u64, u64)>;
}
