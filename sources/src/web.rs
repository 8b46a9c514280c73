//! Shared web-query helper for the Wi-Fi, cell and IP providers.
//!
//! One HTTP client with the provider query timeout baked in, plus the wire
//! shapes for ichnaea geolocate/geosubmit bodies and the parsers for the two
//! alternative IP lookup methods.

use std::time::Duration;

use geoclued_types::LocationFix;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::scan::{CellTower, WifiAccessPoint};
use crate::SourceError;

/// Provider web queries give up after this long.
const QUERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Default locate endpoint for the gmaps method.
pub const GMAPS_URL: &str = "https://www.google.com/maps";
/// Default locate endpoint for the reallyfreegeoip method.
pub const REALLYFREEGEOIP_URL: &str = "https://reallyfreegeoip.org/json/";
/// Accuracy radius assumed for reallyfreegeoip answers.
pub const REALLYFREEGEOIP_ACCURACY: f64 = 20_000.0;
/// Coarsest credible gmaps accuracy, also its sanity bound.
const GMAPS_SCALE: f64 = 1e7;

/// Ichnaea geolocate request body.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeolocateQuery {
    /// Observed Wi-Fi access points.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wifi_access_points: Vec<WifiAccessPoint>,
    /// Observed cell towers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cell_towers: Vec<CellTower>,
    /// Whether the service may fall back to the caller's IP address.
    pub consider_ip: bool,
}

#[derive(Debug, Deserialize)]
struct GeolocateResponse {
    location: LatLng,
    accuracy: f64,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

/// One crowd-sourced report in a geosubmit body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReport {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The position block of the report.
    pub position: SubmitPosition,
    /// Observed Wi-Fi access points.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wifi_access_points: Vec<WifiAccessPoint>,
    /// Observed cell towers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cell_towers: Vec<CellTower>,
}

/// Position block of a geosubmit report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPosition {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
    /// Altitude in meters, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    items: &'a [SubmitReport],
}

/// Plain (latitude, longitude, accuracy) triple out of a lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPosition {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
}

/// HTTP client shared by every web-query provider.
#[derive(Debug, Clone)]
pub struct WebQuerier {
    client: reqwest::Client,
}

impl WebQuerier {
    /// Build a client with the provider query timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] when the TLS backend cannot initialize.
    pub fn new() -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .user_agent(concat!("geoclued/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// POST an ichnaea geolocate query and decode the answer.
    ///
    /// # Errors
    ///
    /// Transport failures and undecodable bodies.
    pub async fn geolocate(
        &self,
        url: &str,
        query: &GeolocateQuery,
    ) -> Result<RawPosition, SourceError> {
        let response: GeolocateResponse = self
            .client
            .post(url)
            .json(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(RawPosition {
            latitude: response.location.lat,
            longitude: response.location.lng,
            accuracy: response.accuracy,
        })
    }

    /// GET a URL and return the response body as text.
    ///
    /// # Errors
    ///
    /// Transport failures and non-success status codes.
    pub async fn get_text(&self, url: &str) -> Result<String, SourceError> {
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }

    /// POST crowd-sourced reports to a geosubmit endpoint.
    ///
    /// # Errors
    ///
    /// Transport failures and non-success status codes.
    pub async fn submit(
        &self,
        url: &str,
        nick: &str,
        reports: &[SubmitReport],
    ) -> Result<(), SourceError> {
        let mut request = self.client.post(url).json(&SubmitBody { items: reports });
        if !nick.is_empty() {
            request = request.header("X-Nickname", nick);
        }
        request.send().await?.error_for_status()?;
        debug!("submitted {} report(s) to {url}", reports.len());
        Ok(())
    }
}

/// Decode a reallyfreegeoip JSON document.
///
/// # Errors
///
/// Returns [`SourceError::Malformed`] for undecodable bodies or out-of-range
/// coordinates.
pub fn parse_reallyfreegeoip(
    body: &str,
    accuracy_override: Option<f64>,
) -> Result<RawPosition, SourceError> {
    #[derive(Deserialize)]
    struct Response {
        latitude: f64,
        longitude: f64,
    }

    let response: Response = serde_json::from_str(body)
        .map_err(|err| SourceError::Malformed(format!("reallyfreegeoip: {err}")))?;
    Ok(RawPosition {
        latitude: response.latitude,
        longitude: response.longitude,
        accuracy: accuracy_override.unwrap_or(REALLYFREEGEOIP_ACCURACY),
    })
}

/// Scrape the coordinates embedded in the Google Maps landing page.
///
/// The page carries a `center=<lat>%2C<lon>&amp;zoom=<z>&amp;` fragment; the
/// zoom level maps to an accuracy radius of `1e7 / 2^(zoom-1)` meters,
/// rounded to one significant figure.
///
/// # Errors
///
/// Returns [`SourceError::Malformed`] when no such fragment is present or
/// the derived accuracy is not credible.
pub fn parse_gmaps(body: &str, accuracy_override: Option<f64>) -> Result<RawPosition, SourceError> {
    let start = body
        .find("center=")
        .ok_or_else(|| SourceError::Malformed("gmaps: no center= fragment".into()))?;
    let rest = &body[start + "center=".len()..];
    let (lat_text, rest) = rest
        .split_once("%2C")
        .ok_or_else(|| SourceError::Malformed("gmaps: no coordinate separator".into()))?;
    let (lon_text, rest) = rest
        .split_once("&amp;")
        .ok_or_else(|| SourceError::Malformed("gmaps: unterminated coordinates".into()))?;
    let zoom_text = rest
        .strip_prefix("zoom=")
        .and_then(|tail| tail.split_once("&amp;").map(|(zoom, _)| zoom))
        .ok_or_else(|| SourceError::Malformed("gmaps: no zoom fragment".into()))?;

    let latitude: f64 = lat_text
        .parse()
        .map_err(|_| SourceError::Malformed(format!("gmaps: bad latitude '{lat_text}'")))?;
    let longitude: f64 = lon_text
        .parse()
        .map_err(|_| SourceError::Malformed(format!("gmaps: bad longitude '{lon_text}'")))?;
    let zoom: u32 = zoom_text
        .parse()
        .map_err(|_| SourceError::Malformed(format!("gmaps: bad zoom '{zoom_text}'")))?;

    let accuracy = accuracy_override.unwrap_or_else(|| {
        let raw = if zoom >= 1 {
            GMAPS_SCALE / f64::from(1u32 << (zoom - 1).min(30))
        } else {
            GMAPS_SCALE
        };
        round_to_1fig(raw)
    });
    if !(1.0..=GMAPS_SCALE).contains(&accuracy) {
        return Err(SourceError::Malformed(format!(
            "gmaps: implausible accuracy {accuracy}"
        )));
    }
    debug!("gmaps scrape: lat={latitude:.6} lon={longitude:.6} zoom={zoom}");
    Ok(RawPosition {
        latitude,
        longitude,
        accuracy,
    })
}

/// Turn a raw position into a fix with a description attached.
///
/// # Errors
///
/// Propagates range validation from the fix constructor.
pub fn position_to_fix(position: RawPosition, description: &str) -> Result<LocationFix, SourceError> {
    Ok(
        LocationFix::new(position.latitude, position.longitude, position.accuracy)?
            .with_description(description),
    )
}

fn round_to_1fig(x: f64) -> f64 {
    let base = 10f64.powi(x.log10().floor() as i32);
    (x / base).round() * base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geolocate_query_serializes_in_ichnaea_shape() {
        let query = GeolocateQuery {
            wifi_access_points: vec![WifiAccessPoint {
                mac_address: "ab:cd:ef:01:23:45".into(),
                signal_strength: Some(-60),
            }],
            cell_towers: Vec::new(),
            consider_ip: true,
        };
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(
            json["wifiAccessPoints"][0]["macAddress"],
            "ab:cd:ef:01:23:45"
        );
        assert_eq!(json["wifiAccessPoints"][0]["signalStrength"], -60);
        assert_eq!(json["considerIp"], true);
        assert!(json.get("cellTowers").is_none());
    }

    #[test]
    fn reallyfreegeoip_document_parses() {
        let body = r#"{"ip":"203.0.113.9","latitude":60.1699,"longitude":24.9384}"#;
        let position = parse_reallyfreegeoip(body, None).unwrap();
        assert_eq!(position.latitude, 60.1699);
        assert_eq!(position.longitude, 24.9384);
        assert_eq!(position.accuracy, REALLYFREEGEOIP_ACCURACY);
        let position = parse_reallyfreegeoip(body, Some(5_000.0)).unwrap();
        assert_eq!(position.accuracy, 5_000.0);
    }

    #[test]
    fn reallyfreegeoip_rejects_garbage() {
        assert!(parse_reallyfreegeoip("not json", None).is_err());
    }

    #[test]
    fn gmaps_page_fragment_parses() {
        let body = "...snip...center=60.16%2C24.93&amp;zoom=11&amp;size=256...";
        let position = parse_gmaps(body, None).unwrap();
        assert_eq!(position.latitude, 60.16);
        assert_eq!(position.longitude, 24.93);
        // 1e7 / 2^10 = 9765.6..., rounded to one significant figure.
        assert_eq!(position.accuracy, 10_000.0);
    }

    #[test]
    fn gmaps_zoom_one_is_the_full_scale() {
        let body = "center=1.0%2C2.0&amp;zoom=1&amp;";
        let position = parse_gmaps(body, None).unwrap();
        assert_eq!(position.accuracy, 1e7);
    }

    #[test]
    fn gmaps_without_fragment_is_malformed() {
        assert!(parse_gmaps("<html>nothing here</html>", None).is_err());
        assert!(parse_gmaps("center=1.0%2C2.0&amp;size=3", None).is_err());
    }

    #[test]
    fn submit_body_wraps_items() {
        let report = SubmitReport {
            timestamp: 1_700_000_000_000,
            position: SubmitPosition {
                latitude: 60.0,
                longitude: 24.0,
                accuracy: 10.0,
                altitude: None,
            },
            wifi_access_points: Vec::new(),
            cell_towers: Vec::new(),
        };
        let json = serde_json::to_value(SubmitBody { items: &[report] }).unwrap();
        assert_eq!(json["items"][0]["position"]["latitude"], 60.0);
        assert!(json["items"][0]["position"].get("altitude").is_none());
    }

    #[test]
    fn one_significant_figure_rounding() {
        assert_eq!(round_to_1fig(9_765.625), 10_000.0);
        assert_eq!(round_to_1fig(1_234.0), 1_000.0);
        assert_eq!(round_to_1fig(85.0), 90.0);
    }
}
