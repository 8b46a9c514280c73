//! GNSS provider consuming a cellular modem's raw GPS readings over the
//! system bus.
//!
//! Talks to ModemManager: enumerate modems through its object manager, set
//! up raw-GPS gathering on the first modem exposing the location interface
//! and poll it while running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::Sender;
use async_trait::async_trait;
use geoclued_types::{AccuracyLevel, LocationFix};
use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use zbus::zvariant::OwnedValue;
use zbus::{proxy, Connection};

use crate::{emit, Source, SourceError, SourceEvent, SourceKind, StartResult, StopResult};

const MODEM_MANAGER_NAME: &str = "org.freedesktop.ModemManager1";
const MODEM_MANAGER_PATH: &str = "/org/freedesktop/ModemManager1";
const LOCATION_INTERFACE: &str = "org.freedesktop.ModemManager1.Modem.Location";

/// Bitmask selecting raw GPS readings in the modem location setup.
const LOCATION_SOURCE_GPS_RAW: u32 = 1 << 2;

/// How often the modem is polled for a new reading.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Radius credited to a locked GNSS reading without a reported error bound.
const LOCKED_RADIUS: f64 = 10.0;

#[proxy(
    interface = "org.freedesktop.ModemManager1.Modem.Location",
    default_service = "org.freedesktop.ModemManager1",
    assume_defaults = false
)]
trait ModemLocation {
    fn setup(&self, sources: u32, signal_location: bool) -> zbus::Result<()>;

    fn get_location(&self) -> zbus::Result<HashMap<u32, OwnedValue>>;
}

#[derive(Debug, Default)]
struct RunState {
    active: bool,
    current: Option<LocationFix>,
}

#[derive(Debug)]
struct ModemShared {
    connection: Connection,
    events: Sender<SourceEvent>,
    state: Mutex<RunState>,
}

impl ModemShared {
    async fn locate_modem(&self) -> Result<ModemLocationProxy<'static>, SourceError> {
        let object_manager = zbus::fdo::ObjectManagerProxy::builder(&self.connection)
            .destination(MODEM_MANAGER_NAME)?
            .path(MODEM_MANAGER_PATH)?
            .build()
            .await?;
        let objects = object_manager
            .get_managed_objects()
            .await
            .map_err(zbus::Error::from)?;
        let path = objects
            .into_iter()
            .find(|(_, interfaces)| interfaces.contains_key(LOCATION_INTERFACE))
            .map(|(path, _)| path)
            .ok_or(SourceError::Malformed("no modem with a location interface".into()))?;
        Ok(ModemLocationProxy::builder(&self.connection)
            .path(path)?
            .build()
            .await?)
    }

    async fn poll(self: Arc<Self>, proxy: ModemLocationProxy<'static>) {
        loop {
            if !self.state.lock().expect("modem state poisoned").active {
                break;
            }
            match proxy.get_location().await {
                Ok(readings) => {
                    if let Some(fix) = raw_gps_fix(&readings) {
                        self.state.lock().expect("modem state poisoned").current =
                            Some(fix.clone());
                        emit(
                            &self.events,
                            SourceEvent::Fix {
                                kind: SourceKind::Gnss,
                                fix,
                            },
                        );
                    }
                }
                // Transient by policy; the modem may be reacquiring.
                Err(err) => debug!("modem location poll failed: {err}"),
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// Decode the raw-GPS entry of a modem location reading, if locked.
fn raw_gps_fix(readings: &HashMap<u32, OwnedValue>) -> Option<LocationFix> {
    let raw = readings.get(&LOCATION_SOURCE_GPS_RAW)?;
    let dict: HashMap<String, OwnedValue> = raw.try_clone().ok()?.try_into().ok()?;
    let latitude = dict_f64(&dict, "latitude")?;
    let longitude = dict_f64(&dict, "longitude")?;
    let mut fix = LocationFix::new(latitude, longitude, LOCKED_RADIUS)
        .ok()?
        .with_description("Modem GNSS");
    if let Some(altitude) = dict_f64(&dict, "altitude") {
        fix = fix.with_altitude(altitude);
    }
    Some(fix)
}

/// Read a dictionary member that may be a double or (on older daemons) a
/// decimal string.
fn dict_f64(dict: &HashMap<String, OwnedValue>, key: &str) -> Option<f64> {
    let value = dict.get(key)?;
    if let Ok(number) = value.downcast_ref::<f64>() {
        return Some(number);
    }
    value
        .downcast_ref::<&str>()
        .ok()
        .and_then(|text| text.parse().ok())
}

/// GNSS provider backed by a ModemManager modem.
#[derive(Debug)]
pub struct ModemGpsSource {
    shared: Arc<ModemShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ModemGpsSource {
    /// Build the provider on an established bus connection.
    #[must_use]
    pub fn new(connection: Connection, events: Sender<SourceEvent>) -> Self {
        Self {
            shared: Arc::new(ModemShared {
                connection,
                events,
                state: Mutex::new(RunState::default()),
            }),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Source for ModemGpsSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Gnss
    }

    fn max_accuracy(&self) -> AccuracyLevel {
        AccuracyLevel::Exact
    }

    fn active(&self) -> bool {
        self.shared.state.lock().expect("modem state poisoned").active
    }

    fn current_fix(&self) -> Option<LocationFix> {
        self.shared
            .state
            .lock()
            .expect("modem state poisoned")
            .current
            .clone()
    }

    async fn start(&self) -> StartResult {
        {
            let state = self.shared.state.lock().expect("modem state poisoned");
            if state.active {
                return StartResult::AlreadyActive;
            }
        }
        let proxy = match self.shared.locate_modem().await {
            Ok(proxy) => proxy,
            Err(err) => {
                debug!("no usable modem: {err}");
                return StartResult::Failed;
            }
        };
        if let Err(err) = proxy.setup(LOCATION_SOURCE_GPS_RAW, false).await {
            warn!("modem location setup failed: {err}");
            return StartResult::Failed;
        }
        self.shared.state.lock().expect("modem state poisoned").active = true;
        let handle = tokio::spawn(Arc::clone(&self.shared).poll(proxy));
        *self.task.lock().expect("modem task poisoned") = Some(handle);
        debug!("modem gps source started");
        StartResult::Ok
    }

    async fn stop(&self) -> StopResult {
        {
            let mut state = self.shared.state.lock().expect("modem state poisoned");
            if !state.active {
                return StopResult::AlreadyStopped;
            }
            state.active = false;
        }
        if let Some(handle) = self.task.lock().expect("modem task poisoned").take() {
            handle.abort();
        }
        debug!("modem gps source stopped");
        StopResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::zvariant::Value;

    #[test]
    fn raw_gps_dictionary_decodes() {
        let mut inner: HashMap<String, Value<'_>> = HashMap::new();
        inner.insert("latitude".into(), Value::from(48.8583_f64));
        inner.insert("longitude".into(), Value::from(2.2945_f64));
        inner.insert("altitude".into(), Value::from(35.0_f64));
        let mut readings: HashMap<u32, OwnedValue> = HashMap::new();
        readings.insert(
            LOCATION_SOURCE_GPS_RAW,
            Value::from(inner).try_into().unwrap(),
        );

        let fix = raw_gps_fix(&readings).unwrap();
        assert_eq!(fix.latitude(), 48.8583);
        assert_eq!(fix.altitude(), Some(35.0));
        assert_eq!(fix.level(), AccuracyLevel::Exact);
    }

    #[test]
    fn stringly_typed_coordinates_decode() {
        let mut inner: HashMap<String, Value<'_>> = HashMap::new();
        inner.insert("latitude".into(), Value::from("60.1699"));
        inner.insert("longitude".into(), Value::from("24.9384"));
        let mut readings: HashMap<u32, OwnedValue> = HashMap::new();
        readings.insert(
            LOCATION_SOURCE_GPS_RAW,
            Value::from(inner).try_into().unwrap(),
        );

        let fix = raw_gps_fix(&readings).unwrap();
        assert!((fix.latitude() - 60.1699).abs() < 1e-9);
    }

    #[test]
    fn missing_raw_entry_yields_nothing() {
        let readings: HashMap<u32, OwnedValue> = HashMap::new();
        assert!(raw_gps_fix(&readings).is_none());
    }
}
