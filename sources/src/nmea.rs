//! NMEA 0183 provider reading GGA/GNS sentences from a local socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::Sender;
use async_trait::async_trait;
use geoclued_config::ConfigStore;
use geoclued_types::{AccuracyLevel, LocationFix};
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::{emit, Source, SourceError, SourceEvent, SourceKind, StartResult, StopResult};

/// Delay between reconnection attempts to the sentence socket.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Meters of radius per unit of horizontal dilution.
const UERE: f64 = 5.0;
/// Accuracy assumed when a sentence carries no dilution field.
const DEFAULT_ACCURACY: f64 = 10.0;

/// Position fields common to GGA and GNS sentences.
#[derive(Debug, Clone, PartialEq)]
pub struct GgaData {
    /// Latitude in degrees, negative south.
    pub latitude: f64,
    /// Longitude in degrees, negative west.
    pub longitude: f64,
    /// Antenna altitude in meters, when present.
    pub altitude: Option<f64>,
    /// Horizontal dilution of precision, when present.
    pub hdop: Option<f64>,
    /// Whether the talker claims a usable fix.
    pub has_fix: bool,
}

impl GgaData {
    /// Accuracy radius derived from the dilution.
    #[must_use]
    pub fn accuracy(&self) -> f64 {
        self.hdop.map_or(DEFAULT_ACCURACY, |hdop| hdop * UERE)
    }
}

/// A parsed sentence the provider cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    /// Fix data from a `GGA` sentence.
    Gga(GgaData),
    /// Fix data from a `GNS` sentence.
    Gns(GgaData),
}

/// Whether a sentence is of the given three-letter type, ignoring the talker.
#[must_use]
pub fn sentence_type_is(line: &str, kind: &str) -> bool {
    line.len() > 6 && line.starts_with('$') && &line[3..6] == kind
}

/// Verify the `*hh` checksum trailer; sentences without one are rejected.
#[must_use]
pub fn checksum_valid(line: &str) -> bool {
    let Some(body) = line.strip_prefix('$') else {
        return false;
    };
    let Some((payload, checksum)) = body.rsplit_once('*') else {
        return false;
    };
    let Ok(expected) = u8::from_str_radix(checksum.trim_end(), 16) else {
        return false;
    };
    let actual = payload.bytes().fold(0u8, |acc, byte| acc ^ byte);
    actual == expected
}

/// Parse one line into a [`Sentence`], if it is a valid GGA or GNS.
#[must_use]
pub fn parse_sentence(line: &str) -> Option<Sentence> {
    let line = line.trim();
    if !checksum_valid(line) {
        return None;
    }
    let payload = &line[1..line.rfind('*')?];
    let fields: Vec<&str> = payload.split(',').collect();

    if sentence_type_is(line, "GGA") {
        // $xxGGA,time,lat,NS,lon,EW,quality,numSV,HDOP,alt,M,...
        if fields.len() < 10 {
            return None;
        }
        let quality: u32 = fields[6].parse().ok()?;
        Some(Sentence::Gga(GgaData {
            latitude: parse_coordinate(fields[2], fields[3], 2)?,
            longitude: parse_coordinate(fields[4], fields[5], 3)?,
            altitude: fields[9].parse().ok(),
            hdop: fields[8].parse().ok(),
            has_fix: quality != 0,
        }))
    } else if sentence_type_is(line, "GNS") {
        // $xxGNS,time,lat,NS,lon,EW,posMode,numSV,HDOP,alt,sep,...
        if fields.len() < 10 {
            return None;
        }
        let has_fix = fields[6]
            .chars()
            .any(|mode| matches!(mode, 'A' | 'D' | 'F' | 'R' | 'P'));
        Some(Sentence::Gns(GgaData {
            latitude: parse_coordinate(fields[2], fields[3], 2)?,
            longitude: parse_coordinate(fields[4], fields[5], 3)?,
            altitude: fields[9].parse().ok(),
            hdop: fields[8].parse().ok(),
            has_fix,
        }))
    } else {
        None
    }
}

/// Convert `ddmm.mmmm` (or `dddmm.mmmm`) plus a hemisphere into degrees.
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if value.len() <= degree_digits {
        return None;
    }
    let degrees: f64 = value[..degree_digits].parse().ok()?;
    let minutes: f64 = value[degree_digits..].parse().ok()?;
    let magnitude = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(magnitude),
        "S" | "W" => Some(-magnitude),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct RunState {
    active: bool,
    current: Option<LocationFix>,
}

#[derive(Debug)]
struct NmeaShared {
    socket: String,
    events: Sender<SourceEvent>,
    state: Mutex<RunState>,
}

impl NmeaShared {
    async fn run(self: Arc<Self>) {
        loop {
            if !self.state.lock().expect("nmea state poisoned").active {
                break;
            }
            let outcome = if self.socket.starts_with('/') {
                match UnixStream::connect(&self.socket).await {
                    Ok(stream) => self.read_stream(stream).await,
                    Err(err) => Err(SourceError::Io(err)),
                }
            } else {
                match TcpStream::connect(&self.socket).await {
                    Ok(stream) => self.read_stream(stream).await,
                    Err(err) => Err(SourceError::Io(err)),
                }
            };
            match outcome {
                Ok(()) => break,
                // Transient by policy; keep the provider up and retry.
                Err(err) => debug!("nmea socket {}: {err}", self.socket),
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    /// Read sentences until the stream ends or the provider is stopped.
    /// `Ok` means an orderly stop, `Err` a connection worth retrying.
    async fn read_stream<S: AsyncRead + Unpin>(&self, stream: S) -> Result<(), SourceError> {
        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            if !self.state.lock().expect("nmea state poisoned").active {
                return Ok(());
            }
            let data = match parse_sentence(&line) {
                Some(Sentence::Gga(data) | Sentence::Gns(data)) => data,
                None => continue,
            };
            if !data.has_fix {
                debug!("nmea sentence without a fix, skipping");
                continue;
            }
            match self.fix_from(&data) {
                Ok(fix) => {
                    self.state.lock().expect("nmea state poisoned").current = Some(fix.clone());
                    emit(
                        &self.events,
                        SourceEvent::Fix {
                            kind: SourceKind::Nmea,
                            fix,
                        },
                    );
                }
                Err(err) => warn!("rejecting nmea fix: {err}"),
            }
        }
        Err(SourceError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "sentence stream ended",
        )))
    }

    fn fix_from(&self, data: &GgaData) -> Result<LocationFix, SourceError> {
        let mut fix = LocationFix::new(data.latitude, data.longitude, data.accuracy())?
            .with_description("NMEA");
        if let Some(altitude) = data.altitude {
            fix = fix.with_altitude(altitude);
        }
        Ok(fix)
    }
}

/// Provider reading NMEA sentences from a unix or TCP socket.
#[derive(Debug)]
pub struct NmeaSource {
    shared: Arc<NmeaShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NmeaSource {
    /// Build the provider from the `network-nmea` configuration.
    ///
    /// # Errors
    ///
    /// [`SourceError::Disabled`] when no socket is configured.
    pub fn new(config: &ConfigStore, events: Sender<SourceEvent>) -> Result<Self, SourceError> {
        let socket = config
            .nmea_socket()
            .ok_or(SourceError::Disabled("no nmea socket configured"))?;
        Ok(Self {
            shared: Arc::new(NmeaShared {
                socket: socket.to_owned(),
                events,
                state: Mutex::new(RunState::default()),
            }),
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Source for NmeaSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Nmea
    }

    fn max_accuracy(&self) -> AccuracyLevel {
        AccuracyLevel::Exact
    }

    fn active(&self) -> bool {
        self.shared.state.lock().expect("nmea state poisoned").active
    }

    fn current_fix(&self) -> Option<LocationFix> {
        self.shared
            .state
            .lock()
            .expect("nmea state poisoned")
            .current
            .clone()
    }

    async fn start(&self) -> StartResult {
        {
            let mut state = self.shared.state.lock().expect("nmea state poisoned");
            if state.active {
                return StartResult::AlreadyActive;
            }
            state.active = true;
        }
        let handle = tokio::spawn(Arc::clone(&self.shared).run());
        *self.task.lock().expect("nmea task poisoned") = Some(handle);
        debug!("nmea source started ({})", self.shared.socket);
        StartResult::Ok
    }

    async fn stop(&self) -> StopResult {
        {
            let mut state = self.shared.state.lock().expect("nmea state poisoned");
            if !state.active {
                return StopResult::AlreadyStopped;
            }
            state.active = false;
        }
        if let Some(handle) = self.task.lock().expect("nmea task poisoned").take() {
            handle.abort();
        }
        debug!("nmea source stopped");
        StopResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_checksum(payload: &str) -> String {
        let checksum = payload.bytes().fold(0u8, |acc, byte| acc ^ byte);
        format!("${payload}*{checksum:02X}")
    }

    #[test]
    fn canonical_gga_sentence_parses() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        assert!(checksum_valid(line));
        let Some(Sentence::Gga(data)) = parse_sentence(line) else {
            panic!("expected a GGA sentence");
        };
        assert!(data.has_fix);
        assert!((data.latitude - 48.1173).abs() < 1e-4);
        assert!((data.longitude - 11.516_667).abs() < 1e-4);
        assert_eq!(data.altitude, Some(545.4));
        assert_eq!(data.hdop, Some(0.9));
        assert!((data.accuracy() - 4.5).abs() < f64::EPSILON);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48";
        assert_eq!(parse_sentence(line), None);
    }

    #[test]
    fn zero_quality_reports_no_fix() {
        let line = with_checksum("GPGGA,123519,4807.038,N,01131.000,E,0,00,,,M,,M,,");
        let Some(Sentence::Gga(data)) = parse_sentence(&line) else {
            panic!("expected a GGA sentence");
        };
        assert!(!data.has_fix);
    }

    #[test]
    fn gns_sentence_parses_with_mode_letters() {
        let line = with_checksum("GNGNS,014035.00,4332.69262,S,17235.48549,E,RR,13,0.9,25.63,11.24,,");
        let Some(Sentence::Gns(data)) = parse_sentence(&line) else {
            panic!("expected a GNS sentence");
        };
        assert!(data.has_fix);
        assert!(data.latitude < 0.0);
        assert!((data.latitude + 43.544_877).abs() < 1e-4);
        assert!((data.longitude - 172.591_425).abs() < 1e-4);
    }

    #[test]
    fn gns_no_fix_mode_is_detected() {
        let line = with_checksum("GNGNS,014035.00,4332.69262,S,17235.48549,E,NN,00,,,,,");
        let Some(Sentence::Gns(data)) = parse_sentence(&line) else {
            panic!("expected a GNS sentence");
        };
        assert!(!data.has_fix);
    }

    #[test]
    fn southern_and_western_hemispheres_are_negative() {
        assert_eq!(parse_coordinate("4807.038", "S", 2), Some(-(48.0 + 7.038 / 60.0)));
        assert_eq!(parse_coordinate("01131.000", "W", 3), Some(-(11.0 + 31.0 / 60.0)));
        assert_eq!(parse_coordinate("4807.038", "X", 2), None);
    }

    #[test]
    fn unrelated_sentences_are_ignored() {
        let line = with_checksum("GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W");
        assert_eq!(parse_sentence(&line), None);
    }
}
