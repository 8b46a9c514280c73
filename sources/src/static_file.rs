//! Provider publishing a fixed position persisted in a hint file.
//!
//! The file carries one value per line in the order latitude, longitude,
//! altitude, accuracy radius; blank lines and `#` comments are skipped. It is
//! re-read on every start, so editing it and restarting demand picks up the
//! new position.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_channel::Sender;
use async_trait::async_trait;
use geoclued_config::ConfigStore;
use geoclued_types::{AccuracyLevel, LocationFix};
use log::{debug, warn};

use crate::{emit, Source, SourceError, SourceEvent, SourceKind, StartResult, StopResult};

/// Default hint file location.
pub const DEFAULT_HINT_PATH: &str = "/etc/geolocation";

/// Parse the hint file body into a fix.
///
/// # Errors
///
/// [`SourceError::Malformed`] when fewer than four values are present or a
/// value does not parse; range validation from the fix constructor.
pub fn parse_hint(body: &str) -> Result<LocationFix, SourceError> {
    let mut values = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));
    let mut next = |name: &str| -> Result<f64, SourceError> {
        values
            .next()
            .ok_or_else(|| SourceError::Malformed(format!("missing {name}")))?
            .parse()
            .map_err(|_| SourceError::Malformed(format!("bad {name}")))
    };
    let latitude = next("latitude")?;
    let longitude = next("longitude")?;
    let altitude = next("altitude")?;
    let accuracy = next("accuracy")?;
    Ok(LocationFix::new(latitude, longitude, accuracy)?
        .with_altitude(altitude)
        .with_description("Static hint"))
}

#[derive(Debug, Default)]
struct RunState {
    active: bool,
    current: Option<LocationFix>,
}

/// Provider reading a persisted position hint.
#[derive(Debug)]
pub struct StaticSource {
    path: PathBuf,
    events: Sender<SourceEvent>,
    state: Mutex<RunState>,
}

impl StaticSource {
    /// Build the provider against the default hint path.
    #[must_use]
    pub fn new(_config: &ConfigStore, events: Sender<SourceEvent>) -> Self {
        Self::with_path(DEFAULT_HINT_PATH, events)
    }

    /// Build the provider against an explicit hint path.
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(path: P, events: Sender<SourceEvent>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            events,
            state: Mutex::new(RunState::default()),
        }
    }
}

#[async_trait]
impl Source for StaticSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn max_accuracy(&self) -> AccuracyLevel {
        AccuracyLevel::Exact
    }

    fn active(&self) -> bool {
        self.state.lock().expect("static state poisoned").active
    }

    fn current_fix(&self) -> Option<LocationFix> {
        self.state
            .lock()
            .expect("static state poisoned")
            .current
            .clone()
    }

    async fn start(&self) -> StartResult {
        {
            let state = self.state.lock().expect("static state poisoned");
            if state.active {
                return StartResult::AlreadyActive;
            }
        }
        let fix = match tokio::fs::read_to_string(&self.path).await {
            Ok(body) => match parse_hint(&body) {
                Ok(fix) => fix,
                Err(err) => {
                    warn!("unusable hint file {}: {err}", self.path.display());
                    return StartResult::Failed;
                }
            },
            Err(err) => {
                debug!("no hint file at {}: {err}", self.path.display());
                return StartResult::Failed;
            }
        };
        {
            let mut state = self.state.lock().expect("static state poisoned");
            state.active = true;
            state.current = Some(fix.clone());
        }
        emit(
            &self.events,
            SourceEvent::Fix {
                kind: SourceKind::Static,
                fix,
            },
        );
        debug!("static source started ({})", self.path.display());
        StartResult::Ok
    }

    async fn stop(&self) -> StopResult {
        let mut state = self.state.lock().expect("static state poisoned");
        if !state.active {
            return StopResult::AlreadyStopped;
        }
        state.active = false;
        StopResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_file_body_parses() {
        let body = "# site survey 2024\n48.8583\n2.2945\n35.0\n12.5\n";
        let fix = parse_hint(body).unwrap();
        assert_eq!(fix.latitude(), 48.8583);
        assert_eq!(fix.longitude(), 2.2945);
        assert_eq!(fix.altitude(), Some(35.0));
        assert_eq!(fix.accuracy(), 12.5);
    }

    #[test]
    fn short_or_garbled_hints_are_rejected() {
        assert!(parse_hint("48.8583\n2.2945\n").is_err());
        assert!(parse_hint("north\neast\n0\n1\n").is_err());
        assert!(parse_hint("95.0\n2.2945\n0\n10\n").is_err());
    }

    #[tokio::test]
    async fn start_reads_and_emits_the_hint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geolocation");
        std::fs::write(&path, "10.0\n20.0\n0\n250\n").unwrap();

        let (tx, rx) = async_channel::unbounded();
        let source = StaticSource::with_path(&path, tx);
        assert_eq!(source.start().await, StartResult::Ok);
        assert_eq!(source.start().await, StartResult::AlreadyActive);

        let Ok(SourceEvent::Fix { kind, fix }) = rx.try_recv() else {
            panic!("expected an emitted fix");
        };
        assert_eq!(kind, SourceKind::Static);
        assert_eq!(fix.latitude(), 10.0);
        assert_eq!(fix.level(), AccuracyLevel::Neighborhood);

        assert_eq!(source.stop().await, StopResult::Ok);
        assert_eq!(source.stop().await, StopResult::AlreadyStopped);
    }

    #[tokio::test]
    async fn missing_hint_file_fails_start() {
        let (tx, _rx) = async_channel::unbounded();
        let source = StaticSource::with_path("/nonexistent/geolocation", tx);
        assert_eq!(source.start().await, StartResult::Failed);
        assert!(!source.active());
    }
}
