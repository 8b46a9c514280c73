//! Heading augmentation from the iio-sensor-proxy compass.
//!
//! Never a primary position source: it claims the compass while running and
//! feeds heading readings into whatever fix the engine publishes next.

use std::sync::{Arc, Mutex};

use async_channel::Sender;
use async_trait::async_trait;
use futures::StreamExt;
use geoclued_types::{AccuracyLevel, LocationFix};
use log::{debug, warn};
use tokio::task::JoinHandle;
use zbus::{proxy, Connection};

use crate::{emit, Source, SourceEvent, SourceKind, StartResult, StopResult};

#[proxy(
    interface = "net.hadess.SensorProxy",
    default_service = "net.hadess.SensorProxy",
    default_path = "/net/hadess/SensorProxy"
)]
trait SensorProxy {
    fn claim_compass(&self) -> zbus::Result<()>;

    fn release_compass(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn has_compass(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn compass_heading(&self) -> zbus::Result<f64>;
}

#[derive(Debug, Default)]
struct RunState {
    active: bool,
}

#[derive(Debug)]
struct CompassShared {
    connection: Connection,
    events: Sender<SourceEvent>,
    state: Mutex<RunState>,
}

impl CompassShared {
    async fn watch(self: Arc<Self>, proxy: SensorProxyProxy<'static>) {
        let mut changes = proxy.receive_compass_heading_changed().await;
        while let Some(change) = changes.next().await {
            if !self.state.lock().expect("compass state poisoned").active {
                break;
            }
            match change.get().await {
                Ok(degrees) if (0.0..360.0).contains(&degrees) => {
                    emit(&self.events, SourceEvent::Heading { degrees });
                }
                Ok(degrees) => debug!("discarding compass reading {degrees}"),
                Err(err) => debug!("compass heading read failed: {err}"),
            }
        }
    }
}

/// Heading-only provider backed by `net.hadess.SensorProxy`.
#[derive(Debug)]
pub struct CompassSource {
    shared: Arc<CompassShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CompassSource {
    /// Build the provider on an established bus connection.
    #[must_use]
    pub fn new(connection: Connection, events: Sender<SourceEvent>) -> Self {
        Self {
            shared: Arc::new(CompassShared {
                connection,
                events,
                state: Mutex::new(RunState::default()),
            }),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Source for CompassSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Compass
    }

    fn max_accuracy(&self) -> AccuracyLevel {
        AccuracyLevel::None
    }

    fn active(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("compass state poisoned")
            .active
    }

    fn current_fix(&self) -> Option<LocationFix> {
        None
    }

    async fn start(&self) -> StartResult {
        {
            let state = self.shared.state.lock().expect("compass state poisoned");
            if state.active {
                return StartResult::AlreadyActive;
            }
        }
        let proxy = match SensorProxyProxy::new(&self.shared.connection).await {
            Ok(proxy) => proxy,
            Err(err) => {
                debug!("sensor proxy unavailable: {err}");
                return StartResult::Failed;
            }
        };
        match proxy.has_compass().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("no compass on this machine");
                return StartResult::Failed;
            }
            Err(err) => {
                debug!("sensor proxy unavailable: {err}");
                return StartResult::Failed;
            }
        }
        if let Err(err) = proxy.claim_compass().await {
            warn!("failed to claim compass: {err}");
            return StartResult::Failed;
        }
        self.shared
            .state
            .lock()
            .expect("compass state poisoned")
            .active = true;
        let handle = tokio::spawn(Arc::clone(&self.shared).watch(proxy));
        *self.task.lock().expect("compass task poisoned") = Some(handle);
        debug!("compass source started");
        StartResult::Ok
    }

    async fn stop(&self) -> StopResult {
        {
            let mut state = self.shared.state.lock().expect("compass state poisoned");
            if !state.active {
                return StopResult::AlreadyStopped;
            }
            state.active = false;
        }
        if let Some(handle) = self.task.lock().expect("compass task poisoned").take() {
            handle.abort();
        }
        if let Ok(proxy) = SensorProxyProxy::new(&self.shared.connection).await {
            if let Err(err) = proxy.release_compass().await {
                debug!("failed to release compass: {err}");
            }
        }
        debug!("compass source stopped");
        StopResult::Ok
    }
}
