//! Resolution of bus peers to process identities.
//!
//! A peer is whatever sits on the other end of a connection: an application
//! creating clients or an agent registering itself. The tracker resolves a
//! peer name to (uid, pid, sandbox identity) and surfaces name-vanished
//! notifications that drive client and agent teardown.

use std::path::{Path, PathBuf};

use futures::{Stream, StreamExt};
use ini::Ini;
use log::debug;
use zbus::names::BusName;
use zbus::{fdo, Connection};

/// Confinement of a peer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sandbox {
    /// Plain host process.
    None,
    /// Flatpak sandbox; the manifest names the application.
    Flatpak {
        /// Application id from the sandbox manifest.
        app_id: String,
    },
}

impl Sandbox {
    /// Application id imposed by the sandbox, if any.
    #[must_use]
    pub fn app_id(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Flatpak { app_id } => Some(app_id),
        }
    }
}

/// Identity of one bus peer, derived once and never mutated.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// Unique bus name of the peer.
    pub bus_name: String,
    /// Unix user id of the peer process.
    pub uid: u32,
    /// Process id of the peer process.
    pub pid: u32,
    /// Confinement, with the sandbox-imposed application id if present.
    pub sandbox: Sandbox,
}

/// Resolves peer names and watches for their disappearance.
#[derive(Debug)]
pub struct PeerTracker {
    proxy: fdo::DBusProxy<'static>,
    proc_root: PathBuf,
}

impl PeerTracker {
    /// Build a tracker on an established connection.
    ///
    /// # Errors
    ///
    /// Fails when the bus driver proxy cannot be created.
    pub async fn new(connection: &Connection) -> zbus::Result<Self> {
        Ok(Self {
            proxy: fdo::DBusProxy::new(connection).await?,
            proc_root: PathBuf::from("/proc"),
        })
    }

    /// Resolve a peer name to its process identity.
    ///
    /// # Errors
    ///
    /// Fails when the bus driver does not know the name, typically because
    /// the peer already disconnected.
    pub async fn resolve(&self, bus_name: &str) -> zbus::Result<PeerIdentity> {
        let name = BusName::try_from(bus_name.to_owned())?;
        let uid = self.proxy.get_connection_unix_user(name.clone()).await?;
        let pid = self.proxy.get_connection_unix_process_id(name).await?;
        let sandbox = detect_sandbox(&self.proc_root, pid);
        if let Some(app_id) = sandbox.app_id() {
            debug!("peer {bus_name} is sandboxed as '{app_id}'");
        }
        Ok(PeerIdentity {
            bus_name: bus_name.to_owned(),
            uid,
            pid,
            sandbox,
        })
    }

    /// Stream of peer names whose owner vanished from the bus.
    ///
    /// # Errors
    ///
    /// Fails when the signal subscription cannot be established.
    pub async fn vanished(&self) -> zbus::Result<impl Stream<Item = String>> {
        let stream = self.proxy.receive_name_owner_changed().await?;
        Ok(stream.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            if args.new_owner().is_none() {
                Some(args.name().to_string())
            } else {
                None
            }
        }))
    }
}

/// Inspect the process filesystem for a sandbox manifest.
fn detect_sandbox(proc_root: &Path, pid: u32) -> Sandbox {
    let manifest = proc_root
        .join(pid.to_string())
        .join("root/.flatpak-info");
    let Ok(ini) = Ini::load_from_file(&manifest) else {
        return Sandbox::None;
    };
    match ini
        .section(Some("Application"))
        .and_then(|section| section.get("name"))
    {
        Some(app_id) => Sandbox::Flatpak {
            app_id: app_id.to_owned(),
        },
        None => Sandbox::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatpak_manifest_yields_the_app_id() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("4242").join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join(".flatpak-info"),
            "[Application]\nname=org.example.Map\nruntime=runtime/org.freedesktop.Platform\n",
        )
        .unwrap();

        let sandbox = detect_sandbox(dir.path(), 4242);
        assert_eq!(sandbox.app_id(), Some("org.example.Map"));
    }

    #[test]
    fn absent_manifest_means_no_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_sandbox(dir.path(), 1), Sandbox::None);
    }
}
