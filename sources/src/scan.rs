//! Scan-evidence seam for the web-query providers.
//!
//! Gathering Wi-Fi beacons or cell-tower neighbourhoods is a device dialogue
//! the broker does not own; adapters plug it in. The default [`NoScan`]
//! adapter supplies no evidence, which degrades the web query to an
//! IP-assisted lookup on the same endpoint.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// One observed Wi-Fi access point.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiAccessPoint {
    /// BSSID of the access point.
    pub mac_address: String,
    /// Reported signal strength in dBm, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i8>,
}

/// Radio technology of a cell tower observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioKind {
    /// GSM/UMTS family.
    Gsm,
    /// CDMA family.
    Cdma,
}

impl RadioKind {
    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            Self::Gsm => "gsm",
            Self::Cdma => "cdma",
        }
    }
}

/// One observed cell tower.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellTower {
    /// Radio technology as spelled on the wire.
    pub radio_type: String,
    /// Mobile country code.
    pub mobile_country_code: u16,
    /// Mobile network code.
    pub mobile_network_code: u16,
    /// Location area code.
    pub location_area_code: u32,
    /// Cell identifier.
    pub cell_id: u64,
    /// Primary scrambling code, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psc: Option<u16>,
}

/// Supplies scan evidence to the web-query providers.
#[async_trait]
pub trait ScanAdapter: Send + Sync + fmt::Debug {
    /// Currently visible Wi-Fi access points.
    async fn wifi_access_points(&self) -> Vec<WifiAccessPoint>;

    /// Currently attached or neighbouring cell towers.
    async fn cell_towers(&self, radio: RadioKind) -> Vec<CellTower>;
}

/// Adapter with no device access; always returns empty evidence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScan;

#[async_trait]
impl ScanAdapter for NoScan {
    async fn wifi_access_points(&self) -> Vec<WifiAccessPoint> {
        Vec::new()
    }

    async fn cell_towers(&self, _radio: RadioKind) -> Vec<CellTower> {
        Vec::new()
    }
}
