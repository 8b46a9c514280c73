//! Test doubles shared by the engine and manager tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use geoclued_sources::{Source, SourceKind, StartResult, StopResult};
use geoclued_types::{AccuracyLevel, LocationFix, Timestamp};

/// Provider stub that starts instantly and remembers its running flag.
#[derive(Debug)]
pub(crate) struct MockSource {
    kind: SourceKind,
    max: AccuracyLevel,
    active: AtomicBool,
}

impl MockSource {
    pub(crate) fn new(kind: SourceKind, max: AccuracyLevel) -> Arc<Self> {
        Arc::new(Self {
            kind,
            max,
            active: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Source for MockSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn max_accuracy(&self) -> AccuracyLevel {
        self.max
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn current_fix(&self) -> Option<LocationFix> {
        None
    }

    async fn start(&self) -> StartResult {
        self.active.store(true, Ordering::SeqCst);
        StartResult::Ok
    }

    async fn stop(&self) -> StopResult {
        self.active.store(false, Ordering::SeqCst);
        StopResult::Ok
    }
}

/// A fresh fix at the given coordinates and wallclock second.
pub(crate) fn fix_at(lat: f64, lon: f64, accuracy: f64, seconds: u64) -> LocationFix {
    LocationFix::new(lat, lon, accuracy)
        .unwrap()
        .with_timestamp(Timestamp { seconds, micros: 0 }, Instant::now())
}
