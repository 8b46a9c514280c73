//! Headless consent agent: registers with the broker and approves every
//! prompt up to a configurable ceiling. Useful on systems without a desktop
//! shell agent and as a reference for the agent wire contract.

use anyhow::Context;
use clap::Parser;
use geoclued_client::proxies::ManagerProxy;
use geoclued_types::AccuracyLevel;
use log::{info, warn};
use zbus::{connection, interface, Connection};

const AGENT_PATH: &str = "/org/freedesktop/GeoClue2/Agent";

#[derive(Debug, Parser)]
#[command(name = "geoclue-demo-agent", version, about)]
struct Args {
    /// Desktop id to register under; must be in the service's agent
    /// whitelist unless running as root.
    #[arg(long, default_value = "geoclue-demo-agent")]
    desktop_id: String,

    /// Finest accuracy level to ever grant (wire value).
    #[arg(long, default_value_t = 8)]
    max_level: u32,

    /// Deny every prompt instead of approving.
    #[arg(long)]
    deny: bool,
}

struct AgentIface {
    max_level: AccuracyLevel,
    deny: bool,
}

#[interface(name = "org.freedesktop.GeoClue2.Agent")]
impl AgentIface {
    /// Answer an authorization prompt from the service.
    async fn authorize_app(&self, desktop_id: String, req_accuracy_level: u32) -> (bool, u32) {
        if self.deny {
            info!("denying '{desktop_id}'");
            return (false, 0);
        }
        let requested =
            AccuracyLevel::try_from(req_accuracy_level).unwrap_or(AccuracyLevel::Exact);
        let granted = requested.min(self.max_level);
        info!("granting '{desktop_id}' access at level {granted}");
        (true, granted as u32)
    }

    /// Finest level this agent will ever grant.
    #[zbus(property)]
    async fn max_accuracy_level(&self) -> u32 {
        self.max_level as u32
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let max_level = AccuracyLevel::try_from(args.max_level)
        .map_err(|err| anyhow::anyhow!("--max-level: {err}"))?;

    let connection: Connection = connection::Builder::system()
        .context("system bus unavailable")?
        .serve_at(
            AGENT_PATH,
            AgentIface {
                max_level,
                deny: args.deny,
            },
        )?
        .build()
        .await
        .context("cannot serve the agent object")?;

    let manager = ManagerProxy::new(&connection)
        .await
        .context("location service unavailable")?;
    if let Err(err) = manager.add_agent(&args.desktop_id).await {
        warn!("agent registration rejected: {err}");
        return Err(err.into());
    }
    info!("registered as '{}'", args.desktop_id);

    std::future::pending::<()>().await;
    Ok(())
}
