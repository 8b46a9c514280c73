//! Layered keyfile configuration for the geoclued broker.
//!
//! One base file plus any `*.conf` drop-ins, loaded in lexicographic order.
//! Later files override only the keys they actually carry; absent keys keep
//! the value from earlier files. The resulting [`ConfigStore`] is immutable
//! for the lifetime of the process.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ini::Ini;
use log::{debug, warn};

/// Default locate endpoint when no `wifi/url` is configured.
pub const DEFAULT_LOCATE_URL: &str = "https://api.beacondb.net/v1/geolocate";
/// Default submission endpoint when no `wifi/submission-url` is configured.
pub const DEFAULT_SUBMIT_URL: &str = "https://api.beacondb.net/v2/geosubmit";
/// Default nickname attached to submitted reports.
pub const DEFAULT_SUBMIT_NICK: &str = "geoclue";

/// Section names that configure the service itself; every other section is a
/// per-application policy entry keyed by desktop id.
const RESERVED_SECTIONS: &[&str] = &[
    "agent",
    "wifi",
    "3g",
    "cdma",
    "modem-gps",
    "network-nmea",
    "compass",
    "static-source",
    "ip",
];

/// Authorization policy for one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPermission {
    /// Access granted without consulting the agent.
    Allowed,
    /// Access refused outright.
    Denied,
    /// The per-user agent decides interactively.
    AskAgent,
}

/// Backend used by the IP provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpMethod {
    /// POST an ichnaea geolocate query.
    Ichnaea,
    /// Scrape coordinates out of the Google Maps landing page.
    Gmaps,
    /// GET a reallyfreegeoip JSON document.
    ReallyFreeGeoip,
}

impl FromStr for IpMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ichnaea" => Ok(Self::Ichnaea),
            "gmaps" => Ok(Self::Gmaps),
            "reallyfreegeoip" => Ok(Self::ReallyFreeGeoip),
            _ => Err(()),
        }
    }
}

impl fmt::Display for IpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ichnaea => "ichnaea",
            Self::Gmaps => "gmaps",
            Self::ReallyFreeGeoip => "reallyfreegeoip",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
struct AppConfig {
    allowed: bool,
    system: bool,
    users: Vec<u32>,
}

/// Immutable snapshot of the merged configuration.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    agents: Vec<String>,

    wifi_enabled: bool,
    wifi_url: Option<String>,
    wifi_submit: bool,
    wifi_submit_url: Option<String>,
    wifi_submit_nick: String,

    threeg_enabled: bool,
    cdma_enabled: bool,
    modem_gps_enabled: bool,
    compass_enabled: bool,
    static_enabled: bool,

    nmea_enabled: bool,
    nmea_socket: Option<String>,

    ip_enabled: bool,
    ip_method: Option<IpMethod>,
    ip_url: Option<String>,
    ip_accuracy: Option<f64>,

    apps: HashMap<String, AppConfig>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            wifi_enabled: true,
            wifi_url: Some(DEFAULT_LOCATE_URL.to_owned()),
            wifi_submit: false,
            wifi_submit_url: Some(DEFAULT_SUBMIT_URL.to_owned()),
            wifi_submit_nick: DEFAULT_SUBMIT_NICK.to_owned(),
            threeg_enabled: true,
            cdma_enabled: true,
            modem_gps_enabled: true,
            compass_enabled: true,
            static_enabled: true,
            nmea_enabled: true,
            nmea_socket: None,
            ip_enabled: true,
            ip_method: None,
            ip_url: None,
            ip_accuracy: None,
            apps: HashMap::new(),
        }
    }
}

impl ConfigStore {
    /// Load the base file and every `*.conf` under the drop-in directory.
    ///
    /// Unreadable files are skipped with a warning; the result always has a
    /// usable value for every key.
    #[must_use]
    pub fn load(base: &Path, dropin_dir: &Path) -> Self {
        let mut store = Self::default();

        store.merge_file(base);

        match std::fs::read_dir(dropin_dir) {
            Ok(entries) => {
                let mut paths: Vec<_> = entries
                    .filter_map(Result::ok)
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
                    .collect();
                paths.sort();
                for path in &paths {
                    store.merge_file(path);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to open {}: {err}", dropin_dir.display()),
        }

        store.finalize();
        store
    }

    /// Build a store from in-memory keyfile fragments, in layering order.
    ///
    /// Used by tests and by tools that synthesize a configuration.
    #[must_use]
    pub fn from_fragments<'a, I: IntoIterator<Item = &'a str>>(fragments: I) -> Self {
        let mut store = Self::default();
        for (n, fragment) in fragments.into_iter().enumerate() {
            match Ini::load_from_str(fragment) {
                Ok(ini) => store.merge(&ini, &format!("fragment #{n}")),
                Err(err) => warn!("failed to parse fragment #{n}: {err}"),
            }
        }
        store.finalize();
        store
    }

    fn merge_file(&mut self, path: &Path) {
        debug!("loading config: {}", path.display());
        match Ini::load_from_file(path) {
            Ok(ini) => self.merge(&ini, &path.display().to_string()),
            Err(err) => warn!("failed to load {}: {err}", path.display()),
        }
    }

    fn merge(&mut self, ini: &Ini, origin: &str) {
        self.merge_agent(ini, origin);
        self.merge_wifi(ini, origin);
        self.merge_enable(ini, origin, "3g", |s, v| s.threeg_enabled = v);
        self.merge_enable(ini, origin, "cdma", |s, v| s.cdma_enabled = v);
        self.merge_enable(ini, origin, "modem-gps", |s, v| s.modem_gps_enabled = v);
        self.merge_enable(ini, origin, "compass", |s, v| s.compass_enabled = v);
        self.merge_enable(ini, origin, "static-source", |s, v| s.static_enabled = v);
        self.merge_nmea(ini, origin);
        self.merge_ip(ini, origin);
        self.merge_apps(ini, origin);
    }

    fn merge_agent(&mut self, ini: &Ini, _origin: &str) {
        if let Some(list) = get_str(ini, "agent", "whitelist") {
            self.agents = split_list(list).map(str::to_owned).collect();
        }
    }

    fn merge_enable<F: FnOnce(&mut Self, bool)>(
        &mut self,
        ini: &Ini,
        origin: &str,
        section: &str,
        apply: F,
    ) {
        if let Some(value) = get_bool(ini, origin, section, "enable") {
            apply(self, value);
        }
    }

    fn merge_wifi(&mut self, ini: &Ini, origin: &str) {
        if let Some(value) = get_bool(ini, origin, "wifi", "enable") {
            self.wifi_enabled = value;
        }
        if let Some(url) = get_str(ini, "wifi", "url") {
            self.wifi_url = non_empty(url);
        }
        if let Some(value) = get_bool(ini, origin, "wifi", "submit-data") {
            self.wifi_submit = value;
        }
        if let Some(url) = get_str(ini, "wifi", "submission-url") {
            self.wifi_submit_url = non_empty(url);
        }
        if let Some(nick) = get_str(ini, "wifi", "submission-nick") {
            // Must be empty or 2 to 32 characters long.
            if nick.len() != 1 && nick.len() <= 32 {
                self.wifi_submit_nick = nick.to_owned();
            } else {
                warn!("\"wifi/submission-nick\" must be empty or between 2 and 32 characters");
            }
        }
    }

    fn merge_nmea(&mut self, ini: &Ini, origin: &str) {
        if let Some(value) = get_bool(ini, origin, "network-nmea", "enable") {
            self.nmea_enabled = value;
        }
        if let Some(socket) = get_str(ini, "network-nmea", "nmea-socket") {
            self.nmea_socket = non_empty(socket);
        }
    }

    fn merge_ip(&mut self, ini: &Ini, origin: &str) {
        if let Some(value) = get_bool(ini, origin, "ip", "enable") {
            self.ip_enabled = value;
        }
        if let Some(method) = get_str(ini, "ip", "method") {
            match method.parse() {
                Ok(parsed) => self.ip_method = Some(parsed),
                // Leave the raw failure for finalize() so the warning
                // reflects the fully merged state.
                Err(()) => self.ip_method = None,
            }
        }
        if let Some(url) = get_str(ini, "ip", "url") {
            self.ip_url = non_empty(url);
        }
        if let Some(raw) = get_str(ini, "ip", "accuracy") {
            match raw.parse::<f64>() {
                Ok(value) if value > 0.0 => self.ip_accuracy = Some(value),
                _ => warn!("failed to get config \"ip/accuracy\" from {origin}"),
            }
        }
    }

    fn merge_apps(&mut self, ini: &Ini, origin: &str) {
        for (section, props) in ini.iter() {
            let Some(id) = section else { continue };
            if RESERVED_SECTIONS.contains(&id) {
                continue;
            }

            let allowed = props.get("allowed").map(|raw| parse_bool(raw, origin, id));
            let system = props.get("system").map(|raw| parse_bool(raw, origin, id));
            let users = props.get("users").map(|raw| {
                split_list(raw)
                    .filter_map(|item| match item.parse::<u32>() {
                        Ok(uid) => Some(uid),
                        Err(_) => {
                            warn!("ignoring bad uid '{item}' for app '{id}' in {origin}");
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            });

            // A brand-new app section must at least state a verdict; an
            // overriding section may carry any subset of keys.
            let is_new = !self.apps.contains_key(id);
            if is_new && !matches!(allowed, Some(Some(_))) {
                warn!("failed to load configuration for app '{id}' in {origin}");
                continue;
            }
            let entry = self.apps.entry(id.to_owned()).or_default();

            if let Some(Some(value)) = allowed {
                entry.allowed = value;
            }
            if let Some(Some(value)) = system {
                entry.system = value;
            }
            if let Some(value) = users {
                entry.users = value;
            }
        }
    }

    /// Cross-key validation after all files are merged.
    fn finalize(&mut self) {
        if self.wifi_url.is_none() && (self.wifi_enabled || self.threeg_enabled) {
            warn!("\"wifi/url\" is not set, disabling WiFi and 3G sources");
            self.wifi_enabled = false;
            self.threeg_enabled = false;
        }
        if self.wifi_submit_url.is_none() && self.wifi_submit {
            warn!("\"wifi/submission-url\" is not set, disabling WiFi/3G submissions");
            self.wifi_submit = false;
        }
        if self.ip_enabled && self.ip_method.is_none() {
            warn!("missing or unknown IP source method, disabling source");
            self.ip_enabled = false;
        }
        self.log_summary();
    }

    fn log_summary(&self) {
        debug!("merged configuration:");
        if self.agents.is_empty() {
            debug!("allowed agents: none");
        } else {
            debug!("allowed agents: {}", self.agents.join(", "));
        }
        debug!(
            "wifi source: {} (url: {})",
            on_off(self.wifi_enabled),
            self.wifi_url.as_deref().map_or_else(
                || "none".to_owned(),
                |url| redact_api_key(url),
            ),
        );
        debug!(
            "wifi submission: {} (nick: {:?})",
            on_off(self.wifi_submit),
            self.wifi_submit_nick
        );
        debug!("3g source: {}", on_off(self.threeg_enabled));
        debug!("cdma source: {}", on_off(self.cdma_enabled));
        debug!("modem gps source: {}", on_off(self.modem_gps_enabled));
        debug!(
            "network nmea source: {} (socket: {})",
            on_off(self.nmea_enabled),
            self.nmea_socket.as_deref().unwrap_or("none")
        );
        debug!("compass: {}", on_off(self.compass_enabled));
        debug!("static source: {}", on_off(self.static_enabled));
        match self.ip_method {
            Some(method) => debug!("ip source: {} (method: {method})", on_off(self.ip_enabled)),
            None => debug!("ip source: {}", on_off(self.ip_enabled)),
        }
        for (id, app) in &self.apps {
            debug!(
                "app '{id}': allowed={} system={} users={:?}",
                app.allowed, app.system, app.users
            );
        }
    }

    /// Whether an agent with this desktop id may register.
    #[must_use]
    pub fn is_agent_allowed(&self, desktop_id: &str) -> bool {
        self.agents.iter().any(|agent| agent == desktop_id)
    }

    /// Desktop ids of agents permitted to register.
    #[must_use]
    pub fn allowed_agents(&self) -> &[String] {
        &self.agents
    }

    /// Authorization verdict for an application run by `uid`.
    #[must_use]
    pub fn permission(&self, desktop_id: &str, uid: u32) -> AppPermission {
        let Some(app) = self.apps.get(desktop_id) else {
            debug!("'{desktop_id}' not in configuration");
            return AppPermission::AskAgent;
        };
        if !app.allowed {
            debug!("'{desktop_id}' disallowed by configuration");
            return AppPermission::Denied;
        }
        if app.users.is_empty() || app.users.contains(&uid) {
            AppPermission::Allowed
        } else {
            AppPermission::Denied
        }
    }

    /// Whether this application is a system component that bypasses the agent.
    #[must_use]
    pub fn is_system_component(&self, desktop_id: &str) -> bool {
        self.apps.get(desktop_id).is_some_and(|app| app.system)
    }

    /// Wi-Fi provider toggle, after cross-key validation.
    #[must_use]
    pub fn wifi_enabled(&self) -> bool {
        self.wifi_enabled
    }

    /// Locate endpoint used by the Wi-Fi, 3G, CDMA and ichnaea IP providers.
    #[must_use]
    pub fn wifi_url(&self) -> Option<&str> {
        self.wifi_url.as_deref()
    }

    /// Whether successful fixes are reported back to the submission endpoint.
    #[must_use]
    pub fn wifi_submit(&self) -> bool {
        self.wifi_submit
    }

    /// Submission endpoint for crowd-sourced reports.
    #[must_use]
    pub fn wifi_submit_url(&self) -> Option<&str> {
        self.wifi_submit_url.as_deref()
    }

    /// Nickname attached to submitted reports.
    #[must_use]
    pub fn wifi_submit_nick(&self) -> &str {
        &self.wifi_submit_nick
    }

    /// 3G provider toggle.
    #[must_use]
    pub fn threeg_enabled(&self) -> bool {
        self.threeg_enabled
    }

    /// CDMA provider toggle.
    #[must_use]
    pub fn cdma_enabled(&self) -> bool {
        self.cdma_enabled
    }

    /// Modem GNSS provider toggle.
    #[must_use]
    pub fn modem_gps_enabled(&self) -> bool {
        self.modem_gps_enabled
    }

    /// Compass augmentation toggle.
    #[must_use]
    pub fn compass_enabled(&self) -> bool {
        self.compass_enabled
    }

    /// Static file provider toggle.
    #[must_use]
    pub fn static_enabled(&self) -> bool {
        self.static_enabled
    }

    /// NMEA provider toggle.
    #[must_use]
    pub fn nmea_enabled(&self) -> bool {
        self.nmea_enabled
    }

    /// Socket path or `host:port` the NMEA provider reads from.
    #[must_use]
    pub fn nmea_socket(&self) -> Option<&str> {
        self.nmea_socket.as_deref()
    }

    /// IP provider toggle, after method validation.
    #[must_use]
    pub fn ip_enabled(&self) -> bool {
        self.ip_enabled
    }

    /// Selected IP geolocation method.
    #[must_use]
    pub fn ip_method(&self) -> Option<IpMethod> {
        self.ip_method
    }

    /// Override for the IP method's default endpoint.
    #[must_use]
    pub fn ip_url(&self) -> Option<&str> {
        self.ip_url.as_deref()
    }

    /// Override for the accuracy radius reported by the IP provider.
    #[must_use]
    pub fn ip_accuracy(&self) -> Option<f64> {
        self.ip_accuracy
    }
}

/// Replace everything after a `key=` query parameter for logging.
#[must_use]
pub fn redact_api_key(url: &str) -> String {
    if let Some(pos) = url.rfind("key=") {
        let preceded_ok = pos > 0 && matches!(&url[pos - 1..pos], "?" | "&");
        if preceded_ok && pos + 4 < url.len() {
            return format!("{}<redacted>", &url[..pos + 4]);
        }
    }
    url.to_owned()
}

fn get_str<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section)).and_then(|props| props.get(key))
}

fn get_bool(ini: &Ini, origin: &str, section: &str, key: &str) -> Option<bool> {
    let raw = get_str(ini, section, key)?;
    match parse_bool_raw(raw) {
        Some(value) => Some(value),
        None => {
            warn!("failed to get config \"{section}/{key}\" from {origin}");
            None
        }
    }
}

fn parse_bool(raw: &str, origin: &str, section: &str) -> Option<bool> {
    let value = parse_bool_raw(raw);
    if value.is_none() {
        warn!("bad boolean in section '{section}' of {origin}: {raw}");
    }
    value
}

fn parse_bool_raw(raw: &str) -> Option<bool> {
    match raw {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|item| !item.is_empty())
}

fn on_off(value: bool) -> &'static str {
    if value { "enabled" } else { "disabled" }
}
