//! Providers that resolve a position by querying a web service.
//!
//! One [`WebSource`] type covers Wi-Fi, 3G, CDMA and the three IP lookup
//! methods; a [`QueryPlan`] tag selects how the query is built and parsed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::Sender;
use async_trait::async_trait;
use geoclued_config::{ConfigStore, IpMethod};
use geoclued_types::{AccuracyLevel, LocationFix, Timestamp};
use log::debug;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::scan::{RadioKind, ScanAdapter};
use crate::web::{
    GeolocateQuery, SubmitPosition, SubmitReport, WebQuerier, parse_gmaps, parse_reallyfreegeoip,
    position_to_fix, GMAPS_URL, REALLYFREEGEOIP_URL,
};
use crate::{emit, Source, SourceError, SourceEvent, SourceKind, StartResult, StopResult};

/// Scan-evidence queries refresh this often while running.
const SCAN_REFRESH: Duration = Duration::from_secs(60);
/// IP lookups refresh this often while running.
const IP_REFRESH: Duration = Duration::from_secs(300);

/// How a [`WebSource`] builds and parses its query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPlan {
    /// Wi-Fi access-point evidence to an ichnaea geolocate endpoint.
    WifiScan,
    /// Cell-tower evidence to an ichnaea geolocate endpoint.
    CellTowers(RadioKind),
    /// IP-only ichnaea geolocate query.
    IpIchnaea,
    /// Scrape of the Google Maps landing page.
    IpGmaps,
    /// reallyfreegeoip JSON lookup.
    IpReallyFreeGeoip,
}

#[derive(Debug, Default)]
struct RunState {
    active: bool,
    current: Option<LocationFix>,
}

#[derive(Debug)]
struct Shared {
    kind: SourceKind,
    plan: QueryPlan,
    url: String,
    accuracy_override: Option<f64>,
    scan: Arc<dyn ScanAdapter>,
    querier: WebQuerier,
    events: Sender<SourceEvent>,
    state: Mutex<RunState>,
}

impl Shared {
    async fn query(&self) -> Result<LocationFix, SourceError> {
        match self.plan {
            QueryPlan::WifiScan => {
                let aps = self.scan.wifi_access_points().await;
                let query = GeolocateQuery {
                    wifi_access_points: aps,
                    consider_ip: true,
                    ..GeolocateQuery::default()
                };
                let mut position = self.querier.geolocate(&self.url, &query).await?;
                if let Some(accuracy) = self.accuracy_override {
                    position.accuracy = accuracy;
                }
                position_to_fix(position, "Wi-Fi")
            }
            QueryPlan::CellTowers(radio) => {
                let towers = self.scan.cell_towers(radio).await;
                let query = GeolocateQuery {
                    cell_towers: towers,
                    consider_ip: true,
                    ..GeolocateQuery::default()
                };
                let position = self.querier.geolocate(&self.url, &query).await?;
                let description = match radio {
                    RadioKind::Gsm => "3G",
                    RadioKind::Cdma => "CDMA",
                };
                position_to_fix(position, description)
            }
            QueryPlan::IpIchnaea => {
                let query = GeolocateQuery {
                    consider_ip: true,
                    ..GeolocateQuery::default()
                };
                let mut position = self.querier.geolocate(&self.url, &query).await?;
                if let Some(accuracy) = self.accuracy_override {
                    position.accuracy = accuracy;
                }
                position_to_fix(position, "GeoIP (ichnaea)")
            }
            QueryPlan::IpGmaps => {
                let body = self.querier.get_text(&self.url).await?;
                position_to_fix(
                    parse_gmaps(&body, self.accuracy_override)?,
                    "GeoIP (gmaps)",
                )
            }
            QueryPlan::IpReallyFreeGeoip => {
                let body = self.querier.get_text(&self.url).await?;
                position_to_fix(
                    parse_reallyfreegeoip(&body, self.accuracy_override)?,
                    "GeoIP (reallyfreegeoip)",
                )
            }
        }
    }

    async fn run(self: Arc<Self>, interval: Duration) {
        loop {
            if !self.state.lock().expect("web source state poisoned").active {
                break;
            }
            match self.query().await {
                Ok(fix) => {
                    let mut state = self.state.lock().expect("web source state poisoned");
                    if !state.active {
                        break;
                    }
                    state.current = Some(fix.clone());
                    drop(state);
                    emit(
                        &self.events,
                        SourceEvent::Fix {
                            kind: self.kind,
                            fix,
                        },
                    );
                }
                // Transient by policy; the provider stays up and retries.
                Err(err) => debug!("{} query failed: {err}", self.kind),
            }
            sleep(interval).await;
        }
    }
}

/// Web-query provider; covers Wi-Fi, 3G, CDMA and IP geolocation.
#[derive(Debug)]
pub struct WebSource {
    max_accuracy: AccuracyLevel,
    interval: Duration,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSource {
    /// Wi-Fi provider against the configured locate endpoint.
    ///
    /// # Errors
    ///
    /// [`SourceError::Disabled`] when no locate URL survived configuration
    /// validation; HTTP client construction failures.
    pub fn wifi(
        config: &ConfigStore,
        scan: Arc<dyn ScanAdapter>,
        querier: WebQuerier,
        events: Sender<SourceEvent>,
    ) -> Result<Self, SourceError> {
        let url = config
            .wifi_url()
            .ok_or(SourceError::Disabled("no wifi locate url"))?;
        Ok(Self::new(
            SourceKind::Wifi,
            QueryPlan::WifiScan,
            url.to_owned(),
            None,
            AccuracyLevel::Street,
            SCAN_REFRESH,
            scan,
            querier,
            events,
        ))
    }

    /// 3G cell-tower provider against the configured locate endpoint.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`WebSource::wifi`].
    pub fn threeg(
        config: &ConfigStore,
        scan: Arc<dyn ScanAdapter>,
        querier: WebQuerier,
        events: Sender<SourceEvent>,
    ) -> Result<Self, SourceError> {
        let url = config
            .wifi_url()
            .ok_or(SourceError::Disabled("no locate url"))?;
        Ok(Self::new(
            SourceKind::ThreeG,
            QueryPlan::CellTowers(RadioKind::Gsm),
            url.to_owned(),
            None,
            AccuracyLevel::City,
            SCAN_REFRESH,
            scan,
            querier,
            events,
        ))
    }

    /// CDMA cell-tower provider against the configured locate endpoint.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`WebSource::wifi`].
    pub fn cdma(
        config: &ConfigStore,
        scan: Arc<dyn ScanAdapter>,
        querier: WebQuerier,
        events: Sender<SourceEvent>,
    ) -> Result<Self, SourceError> {
        let url = config
            .wifi_url()
            .ok_or(SourceError::Disabled("no locate url"))?;
        Ok(Self::new(
            SourceKind::Cdma,
            QueryPlan::CellTowers(RadioKind::Cdma),
            url.to_owned(),
            None,
            AccuracyLevel::City,
            SCAN_REFRESH,
            scan,
            querier,
            events,
        ))
    }

    /// IP provider for the configured method.
    ///
    /// The locate URL falls back from `ip/url` to `wifi/url` to the built-in
    /// default for the ichnaea method, and to the method's canonical endpoint
    /// for the other two.
    ///
    /// # Errors
    ///
    /// [`SourceError::Disabled`] when no method survived configuration
    /// validation; HTTP client construction failures.
    pub fn ip(
        config: &ConfigStore,
        querier: WebQuerier,
        events: Sender<SourceEvent>,
    ) -> Result<Self, SourceError> {
        let method = config
            .ip_method()
            .ok_or(SourceError::Disabled("no ip method"))?;
        let (plan, url) = match method {
            IpMethod::Ichnaea => (
                QueryPlan::IpIchnaea,
                config
                    .ip_url()
                    .or_else(|| config.wifi_url())
                    .unwrap_or(geoclued_config::DEFAULT_LOCATE_URL)
                    .to_owned(),
            ),
            IpMethod::Gmaps => (
                QueryPlan::IpGmaps,
                config.ip_url().unwrap_or(GMAPS_URL).to_owned(),
            ),
            IpMethod::ReallyFreeGeoip => (
                QueryPlan::IpReallyFreeGeoip,
                config.ip_url().unwrap_or(REALLYFREEGEOIP_URL).to_owned(),
            ),
        };
        let accuracy_override = config.ip_accuracy();
        let max_accuracy = accuracy_override
            .map_or(AccuracyLevel::City, AccuracyLevel::for_radius);
        Ok(Self::new(
            SourceKind::Ip,
            plan,
            url,
            accuracy_override,
            max_accuracy,
            IP_REFRESH,
            Arc::new(crate::scan::NoScan),
            querier,
            events,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        kind: SourceKind,
        plan: QueryPlan,
        url: String,
        accuracy_override: Option<f64>,
        max_accuracy: AccuracyLevel,
        interval: Duration,
        scan: Arc<dyn ScanAdapter>,
        querier: WebQuerier,
        events: Sender<SourceEvent>,
    ) -> Self {
        Self {
            max_accuracy,
            interval,
            shared: Arc::new(Shared {
                kind,
                plan,
                url,
                accuracy_override,
                scan,
                querier,
                events,
                state: Mutex::new(RunState::default()),
            }),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Source for WebSource {
    fn kind(&self) -> SourceKind {
        self.shared.kind
    }

    fn max_accuracy(&self) -> AccuracyLevel {
        self.max_accuracy
    }

    fn active(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("web source state poisoned")
            .active
    }

    fn current_fix(&self) -> Option<LocationFix> {
        self.shared
            .state
            .lock()
            .expect("web source state poisoned")
            .current
            .clone()
    }

    async fn start(&self) -> StartResult {
        {
            let mut state = self.shared.state.lock().expect("web source state poisoned");
            if state.active {
                return StartResult::AlreadyActive;
            }
            state.active = true;
        }
        let handle = tokio::spawn(Arc::clone(&self.shared).run(self.interval));
        *self.task.lock().expect("web source task poisoned") = Some(handle);
        debug!("{} source started ({})", self.shared.kind, self.shared.url);
        StartResult::Ok
    }

    async fn stop(&self) -> StopResult {
        {
            let mut state = self.shared.state.lock().expect("web source state poisoned");
            if !state.active {
                return StopResult::AlreadyStopped;
            }
            state.active = false;
        }
        if let Some(handle) = self.task.lock().expect("web source task poisoned").take() {
            handle.abort();
        }
        debug!("{} source stopped", self.shared.kind);
        StopResult::Ok
    }
}

/// Reports broadcast positions back to a geosubmit endpoint together with
/// the scan evidence visible at that moment.
#[derive(Debug)]
pub struct Submitter {
    url: String,
    nick: String,
    scan: Arc<dyn ScanAdapter>,
    querier: WebQuerier,
}

impl Submitter {
    /// Build a submitter when configuration enables crowd-sourced reports.
    #[must_use]
    pub fn from_config(
        config: &ConfigStore,
        scan: Arc<dyn ScanAdapter>,
        querier: WebQuerier,
    ) -> Option<Self> {
        if !config.wifi_submit() {
            return None;
        }
        let url = config.wifi_submit_url()?.to_owned();
        Some(Self {
            url,
            nick: config.wifi_submit_nick().to_owned(),
            scan,
            querier,
        })
    }

    /// Send one report; failures are logged and absorbed.
    pub async fn report(&self, fix: &LocationFix) {
        let timestamp = Timestamp::now();
        let report = SubmitReport {
            timestamp: timestamp.seconds * 1_000 + timestamp.micros / 1_000,
            position: SubmitPosition {
                latitude: fix.latitude(),
                longitude: fix.longitude(),
                accuracy: fix.accuracy(),
                altitude: fix.altitude(),
            },
            wifi_access_points: self.scan.wifi_access_points().await,
            cell_towers: self.scan.cell_towers(RadioKind::Gsm).await,
        };
        if let Err(err) = self.querier.submit(&self.url, &self.nick, &[report]).await {
            debug!("geosubmit report failed: {err}");
        }
    }
}
