//! Core value types shared by the geoclued broker, its providers and clients.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;
use zbus::zvariant::Type;

/// Mean Earth radius in meters (WGS-84), used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Maximum length of a fix description in bytes.
const MAX_DESCRIPTION_LEN: usize = 256;

/// Coarse accuracy category ordered from no knowledge to an exact position.
///
/// The numeric values are an external contract shared with every consumer of
/// the bus interface; the gaps between them are intentional.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize_repr,
    Deserialize_repr,
    Type,
)]
#[repr(u32)]
pub enum AccuracyLevel {
    /// No position knowledge at all.
    None = 0,
    /// Country-level position.
    Country = 1,
    /// City-level position.
    City = 4,
    /// Neighborhood-level position.
    Neighborhood = 5,
    /// Street-level position.
    Street = 6,
    /// Exact position, typically GNSS-derived.
    Exact = 8,
}

impl AccuracyLevel {
    /// Map an accuracy radius in meters to the finest level it can claim.
    #[must_use]
    pub fn for_radius(meters: f64) -> Self {
        if meters <= 10.0 {
            Self::Exact
        } else if meters <= 100.0 {
            Self::Street
        } else if meters <= 1_000.0 {
            Self::Neighborhood
        } else if meters <= 15_000.0 {
            Self::City
        } else {
            Self::Country
        }
    }
}

impl fmt::Display for AccuracyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Country => "country",
            Self::City => "city",
            Self::Neighborhood => "neighborhood",
            Self::Street => "street",
            Self::Exact => "exact",
        };
        f.write_str(name)
    }
}

impl TryFrom<u32> for AccuracyLevel {
    type Error = InvalidFix;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Country),
            4 => Ok(Self::City),
            5 => Ok(Self::Neighborhood),
            6 => Ok(Self::Street),
            8 => Ok(Self::Exact),
            other => Err(InvalidFix::AccuracyLevel(other)),
        }
    }
}

/// Wallclock instant a fix was measured, as it crosses the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Type)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: u64,
    /// Microseconds within the current second.
    pub micros: u64,
}

impl Timestamp {
    /// Capture the current wallclock time.
    #[must_use]
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            seconds: since_epoch.as_secs(),
            micros: u64::from(since_epoch.subsec_micros()),
        }
    }

    /// Seconds elapsed between `earlier` and `self`, zero if `self` is older.
    #[must_use]
    pub fn seconds_since(&self, earlier: Self) -> u64 {
        self.seconds.saturating_sub(earlier.seconds)
    }
}

/// Reasons a fix or one of its fields can be rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidFix {
    /// Latitude outside [-90, 90].
    #[error("latitude {0} is outside [-90, 90]")]
    Latitude(f64),
    /// Longitude outside (-180, 180].
    #[error("longitude {0} is outside (-180, 180]")]
    Longitude(f64),
    /// Accuracy radius not strictly positive.
    #[error("accuracy radius {0} must be positive")]
    Accuracy(f64),
    /// Negative speed.
    #[error("speed {0} must be non-negative")]
    Speed(f64),
    /// Heading outside [0, 360).
    #[error("heading {0} is outside [0, 360)")]
    Heading(f64),
    /// Numeric accuracy level not part of the contract.
    #[error("{0} is not a known accuracy level")]
    AccuracyLevel(u32),
}

/// A single immutable location measurement.
///
/// Carries both the wallclock pair published to subscribers and a monotonic
/// reading used for staleness arithmetic inside the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    latitude: f64,
    longitude: f64,
    altitude: Option<f64>,
    accuracy: f64,
    speed: Option<f64>,
    heading: Option<f64>,
    description: String,
    timestamp: Timestamp,
    received: Instant,
}

impl LocationFix {
    /// Create a fix from the mandatory fields, validating their ranges.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidFix`] when a coordinate or the accuracy radius is out
    /// of range.
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Result<Self, InvalidFix> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(InvalidFix::Latitude(latitude));
        }
        if !longitude.is_finite() || longitude <= -180.0 || longitude > 180.0 {
            return Err(InvalidFix::Longitude(longitude));
        }
        if !accuracy.is_finite() || accuracy <= 0.0 {
            return Err(InvalidFix::Accuracy(accuracy));
        }
        Ok(Self {
            latitude,
            longitude,
            altitude: None,
            accuracy,
            speed: None,
            heading: None,
            description: String::new(),
            timestamp: Timestamp::now(),
            received: Instant::now(),
        })
    }

    /// Attach an altitude in meters.
    #[must_use]
    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    /// Attach a speed in meters per second.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidFix::Speed`] for negative values.
    pub fn with_speed(mut self, speed: f64) -> Result<Self, InvalidFix> {
        if !speed.is_finite() || speed < 0.0 {
            return Err(InvalidFix::Speed(speed));
        }
        self.speed = Some(speed);
        Ok(self)
    }

    /// Attach a heading in degrees relative to true north.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidFix::Heading`] for values outside [0, 360).
    pub fn with_heading(mut self, heading: f64) -> Result<Self, InvalidFix> {
        if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
            return Err(InvalidFix::Heading(heading));
        }
        self.heading = Some(heading);
        Ok(self)
    }

    /// Attach a human-readable description, truncated to the wire bound.
    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        if description.len() <= MAX_DESCRIPTION_LEN {
            self.description = description.to_owned();
        } else {
            let mut end = MAX_DESCRIPTION_LEN;
            while !description.is_char_boundary(end) {
                end -= 1;
            }
            self.description = description[..end].to_owned();
        }
        self
    }

    /// Override the measurement timestamps.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp, received: Instant) -> Self {
        self.timestamp = timestamp;
        self.received = received;
        self
    }

    /// Latitude in degrees.
    #[must_use]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in degrees.
    #[must_use]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Altitude in meters, when known.
    #[must_use]
    pub fn altitude(&self) -> Option<f64> {
        self.altitude
    }

    /// Radius of the 68% confidence circle in meters.
    #[must_use]
    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    /// Speed in meters per second, when known.
    #[must_use]
    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    /// Heading in degrees, when known.
    #[must_use]
    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    /// Replace the heading, used by the compass augmentation.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidFix::Heading`] for values outside [0, 360).
    pub fn set_heading(&mut self, heading: f64) -> Result<(), InvalidFix> {
        if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
            return Err(InvalidFix::Heading(heading));
        }
        self.heading = Some(heading);
        Ok(())
    }

    /// Human-readable description of the fix origin.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Wallclock timestamp pair.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Monotonic age of this fix.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.received.elapsed()
    }

    /// Finest accuracy level this fix can claim given its radius.
    #[must_use]
    pub fn level(&self) -> AccuracyLevel {
        AccuracyLevel::for_radius(self.accuracy)
    }

    /// Great-circle distance to another fix in meters.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        haversine(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }

    /// Whether two fixes are close enough that re-broadcasting is pointless:
    /// coordinates within a micro-degree and accuracy within a meter.
    #[must_use]
    pub fn equivalent_to(&self, other: &Self) -> bool {
        (self.latitude - other.latitude).abs() <= 1e-6
            && (self.longitude - other.longitude).abs() <= 1e-6
            && (self.accuracy - other.accuracy).abs() <= 1.0
    }
}

/// Great-circle distance in meters between two coordinates.
#[must_use]
pub fn haversine(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
    let d_lat = (lat_b - lat_a).to_radians();
    let d_lon = (lon_b - lon_a).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat_a.to_radians().cos() * lat_b.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_levels_are_ordered_with_contract_values() {
        assert!(AccuracyLevel::None < AccuracyLevel::Country);
        assert!(AccuracyLevel::Country < AccuracyLevel::City);
        assert!(AccuracyLevel::City < AccuracyLevel::Neighborhood);
        assert!(AccuracyLevel::Neighborhood < AccuracyLevel::Street);
        assert!(AccuracyLevel::Street < AccuracyLevel::Exact);
        assert_eq!(AccuracyLevel::City as u32, 4);
        assert_eq!(AccuracyLevel::Exact as u32, 8);
    }

    #[test]
    fn radius_maps_to_level_at_boundaries() {
        assert_eq!(AccuracyLevel::for_radius(10.0), AccuracyLevel::Exact);
        assert_eq!(AccuracyLevel::for_radius(10.1), AccuracyLevel::Street);
        assert_eq!(AccuracyLevel::for_radius(100.0), AccuracyLevel::Street);
        assert_eq!(
            AccuracyLevel::for_radius(1_000.0),
            AccuracyLevel::Neighborhood
        );
        assert_eq!(AccuracyLevel::for_radius(15_000.0), AccuracyLevel::City);
        assert_eq!(AccuracyLevel::for_radius(15_001.0), AccuracyLevel::Country);
    }

    #[test]
    fn numeric_level_round_trip_rejects_gaps() {
        assert_eq!(AccuracyLevel::try_from(8), Ok(AccuracyLevel::Exact));
        assert_eq!(AccuracyLevel::try_from(0), Ok(AccuracyLevel::None));
        assert!(AccuracyLevel::try_from(2).is_err());
        assert!(AccuracyLevel::try_from(3).is_err());
        assert!(AccuracyLevel::try_from(7).is_err());
        assert!(AccuracyLevel::try_from(9).is_err());
    }

    #[test]
    fn fix_rejects_out_of_range_fields() {
        assert!(matches!(
            LocationFix::new(90.5, 0.0, 10.0),
            Err(InvalidFix::Latitude(_))
        ));
        assert!(matches!(
            LocationFix::new(0.0, -180.0, 10.0),
            Err(InvalidFix::Longitude(_))
        ));
        assert!(LocationFix::new(0.0, 180.0, 10.0).is_ok());
        assert!(matches!(
            LocationFix::new(0.0, 0.0, 0.0),
            Err(InvalidFix::Accuracy(_))
        ));
        let fix = LocationFix::new(0.0, 0.0, 5.0).unwrap();
        assert!(matches!(
            fix.clone().with_speed(-1.0),
            Err(InvalidFix::Speed(_))
        ));
        assert!(matches!(
            fix.with_heading(360.0),
            Err(InvalidFix::Heading(_))
        ));
    }

    #[test]
    fn description_is_bounded() {
        let long = "x".repeat(1_000);
        let fix = LocationFix::new(0.0, 0.0, 5.0)
            .unwrap()
            .with_description(&long);
        assert_eq!(fix.description().len(), 256);
    }

    #[test]
    fn description_truncation_respects_char_boundaries() {
        let long = "é".repeat(200);
        let fix = LocationFix::new(0.0, 0.0, 5.0)
            .unwrap()
            .with_description(&long);
        assert!(fix.description().len() <= 256);
        assert!(fix.description().chars().all(|c| c == 'é'));
    }

    #[test]
    fn haversine_matches_known_short_distance() {
        // Roughly 11 m apart near the Eiffel Tower.
        let d = haversine(48.8583, 2.2945, 48.8584, 2.2945);
        assert!((d - 11.1).abs() < 0.5, "distance was {d}");
    }

    #[test]
    fn equivalence_uses_micro_degree_and_meter_slack() {
        let a = LocationFix::new(48.8583, 2.2945, 8.0).unwrap();
        let b = LocationFix::new(48.858_300_5, 2.294_500_5, 8.5).unwrap();
        assert!(a.equivalent_to(&b));
        let c = LocationFix::new(48.8584, 2.2945, 8.0).unwrap();
        assert!(!a.equivalent_to(&c));
        let d = LocationFix::new(48.8583, 2.2945, 10.0).unwrap();
        assert!(!a.equivalent_to(&d));
    }

    #[test]
    fn fix_level_follows_radius() {
        let fix = LocationFix::new(48.0, 2.0, 80.0).unwrap();
        assert_eq!(fix.level(), AccuracyLevel::Street);
    }
}
