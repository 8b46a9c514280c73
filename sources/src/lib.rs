//! Location providers feeding the geoclued arbitration engine.
//!
//! Every provider implements the [`Source`] contract: an idempotent
//! start/stop pair, a cached current fix, an advertised maximum accuracy and
//! asynchronous fix emission through a shared event channel. The engine is
//! agnostic to provider internals; it only sees [`SourceKind`] tags and
//! [`SourceEvent`]s.

use std::fmt;

use async_channel::Sender;
use async_trait::async_trait;
use geoclued_types::{AccuracyLevel, InvalidFix, LocationFix};
use log::warn;
use thiserror::Error;

pub mod compass;
pub mod modem;
pub mod nmea;
pub mod scan;
pub mod static_file;
pub mod web;
pub mod web_source;

pub use compass::CompassSource;
pub use modem::ModemGpsSource;
pub use nmea::NmeaSource;
pub use scan::{CellTower, NoScan, RadioKind, ScanAdapter, WifiAccessPoint};
pub use static_file::StaticSource;
pub use web::WebQuerier;
pub use web_source::{QueryPlan, Submitter, WebSource};

/// Identity tag for a provider mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// GNSS receiver on a cellular modem.
    Gnss,
    /// NMEA 0183 sentences from a local socket.
    Nmea,
    /// Wi-Fi access-point evidence submitted to a web service.
    Wifi,
    /// 3G cell-tower evidence submitted to a web service.
    ThreeG,
    /// CDMA cell-tower evidence submitted to a web service.
    Cdma,
    /// Persisted static hint.
    Static,
    /// IP-address geolocation.
    Ip,
    /// Heading-only compass augmentation.
    Compass,
}

impl SourceKind {
    /// Tie-break rank used by fix selection; lower ranks win.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Gnss => 0,
            Self::Nmea => 1,
            Self::Wifi => 2,
            Self::ThreeG => 3,
            Self::Cdma => 4,
            Self::Static => 5,
            Self::Ip => 6,
            Self::Compass => 7,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gnss => "modem-gps",
            Self::Nmea => "network-nmea",
            Self::Wifi => "wifi",
            Self::ThreeG => "3g",
            Self::Cdma => "cdma",
            Self::Static => "static",
            Self::Ip => "ip",
            Self::Compass => "compass",
        };
        f.write_str(name)
    }
}

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// The provider is now running.
    Ok,
    /// The provider was already running.
    AlreadyActive,
    /// The provider could not come up; eligible for backoff retry.
    Failed,
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// The provider is now stopped.
    Ok,
    /// The provider was not running.
    AlreadyStopped,
}

/// Asynchronous emission from a provider to the engine.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A new or refreshed location fix.
    Fix {
        /// Emitting provider.
        kind: SourceKind,
        /// The measurement.
        fix: LocationFix,
    },
    /// A compass heading reading in degrees.
    Heading {
        /// Degrees clockwise from true north, within [0, 360).
        degrees: f64,
    },
}

/// Failures surfaced by provider internals.
///
/// Transient errors are logged and absorbed by the provider tasks; this type
/// mostly travels inside the crate and into logs.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP transport failure.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// A response body that could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Socket or file I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// D-Bus failure while talking to a device service.
    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),
    /// A fix rejected by the value-type validation.
    #[error(transparent)]
    Fix(#[from] InvalidFix),
    /// Permanent configuration problem; the provider stays disabled.
    #[error("provider disabled: {0}")]
    Disabled(&'static str),
}

/// Contract between the engine and every provider.
///
/// Implementations must be idempotent under repeated start or stop calls and
/// must own their external handles exclusively, releasing them on stop.
#[async_trait]
pub trait Source: Send + Sync + fmt::Debug {
    /// Mechanism tag.
    fn kind(&self) -> SourceKind;

    /// Best accuracy this provider can ever achieve.
    fn max_accuracy(&self) -> AccuracyLevel;

    /// Whether the provider is currently running.
    fn active(&self) -> bool;

    /// Most recent fix, if any was produced since start.
    fn current_fix(&self) -> Option<LocationFix>;

    /// Bring the provider up.
    async fn start(&self) -> StartResult;

    /// Take the provider down, releasing its external handles.
    async fn stop(&self) -> StopResult;
}

/// Push an event to the engine, logging when the channel is gone.
pub(crate) fn emit(events: &Sender<SourceEvent>, event: SourceEvent) {
    if let Err(err) = events.try_send(event) {
        warn!("dropping source event: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_matches_selection_contract() {
        let order = [
            SourceKind::Gnss,
            SourceKind::Nmea,
            SourceKind::Wifi,
            SourceKind::ThreeG,
            SourceKind::Cdma,
            SourceKind::Static,
            SourceKind::Ip,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
    }
}
