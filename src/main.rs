//! The geoclued daemon: load configuration, assemble the providers and the
//! engine, claim the well-known name and serve until killed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use geoclued_config::ConfigStore;
use geoclued_service::{serve, spawn_pumps, Engine, EngineState, LocationManager, PeerTracker};
use geoclued_sources::{
    CompassSource, ModemGpsSource, NmeaSource, NoScan, ScanAdapter, SourceError, StaticSource,
    Submitter, WebQuerier, WebSource,
};
use log::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "geoclued", version, about)]
struct Args {
    /// Base configuration file.
    #[arg(long, default_value = "/etc/geoclue/geoclue.conf")]
    config: PathBuf,

    /// Drop-in directory applied over the base file.
    #[arg(long, default_value = "/etc/geoclue/conf.d")]
    config_dir: PathBuf,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn log_disabled(name: &str, err: &SourceError) {
    warn!("{name} source disabled: {err}");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = Arc::new(ConfigStore::load(&args.config, &args.config_dir));
    let (events_tx, events_rx) = async_channel::unbounded();
    let querier = WebQuerier::new().context("cannot build the web query client")?;
    let scan: Arc<dyn ScanAdapter> = Arc::new(NoScan);

    let mut manager = LocationManager::default();
    if config.nmea_enabled() {
        match NmeaSource::new(&config, events_tx.clone()) {
            Ok(source) => manager.register(Arc::new(source)),
            Err(err) => log_disabled("network-nmea", &err),
        }
    }
    if config.wifi_enabled() {
        match WebSource::wifi(&config, Arc::clone(&scan), querier.clone(), events_tx.clone()) {
            Ok(source) => manager.register(Arc::new(source)),
            Err(err) => log_disabled("wifi", &err),
        }
    }
    if config.threeg_enabled() {
        match WebSource::threeg(&config, Arc::clone(&scan), querier.clone(), events_tx.clone()) {
            Ok(source) => manager.register(Arc::new(source)),
            Err(err) => log_disabled("3g", &err),
        }
    }
    if config.cdma_enabled() {
        match WebSource::cdma(&config, Arc::clone(&scan), querier.clone(), events_tx.clone()) {
            Ok(source) => manager.register(Arc::new(source)),
            Err(err) => log_disabled("cdma", &err),
        }
    }
    if config.ip_enabled() {
        match WebSource::ip(&config, querier.clone(), events_tx.clone()) {
            Ok(source) => manager.register(Arc::new(source)),
            Err(err) => log_disabled("ip", &err),
        }
    }
    if config.static_enabled() {
        manager.register(Arc::new(StaticSource::new(&config, events_tx.clone())));
    }

    let submitter = Submitter::from_config(&config, Arc::clone(&scan), querier.clone());
    let engine = Engine::new(EngineState::new(Arc::clone(&config), manager), submitter);

    let connection = serve(Arc::clone(&engine))
        .await
        .context("cannot claim the service name on the system bus")?;

    // These two talk to their device daemons over the same connection, so
    // they can only be registered once it exists.
    {
        let mut state = engine.state();
        if config.modem_gps_enabled() {
            state
                .manager
                .register(Arc::new(ModemGpsSource::new(connection.clone(), events_tx.clone())));
        }
        if config.compass_enabled() {
            state
                .manager
                .register_compass(Arc::new(CompassSource::new(connection.clone(), events_tx)));
        }
    }

    let tracker = Arc::new(
        PeerTracker::new(&connection)
            .await
            .context("cannot watch bus peers")?,
    );
    engine.attach(connection, tracker);
    spawn_pumps(engine, events_rx);

    info!("serving org.freedesktop.GeoClue2 on the system bus");
    std::future::pending::<()>().await;
    Ok(())
}
