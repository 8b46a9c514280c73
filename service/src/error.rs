//! Error taxonomy surfaced to bus callers.

use std::time::Duration;

use log::error;
use zbus::DBusError;

/// How long a scheduled shutdown waits for the error reply to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Errors crossing the bus boundary, under the service's error prefix.
///
/// `Internal` signals a broken invariant; construct it through [`internal`]
/// so the daemon shuts down orderly rather than carrying corrupted state.
#[derive(DBusError, Debug)]
#[zbus(prefix = "org.freedesktop.GeoClue2.Error")]
pub enum BusError {
    /// Catch-all for transport-level failures.
    #[zbus(error)]
    ZBus(zbus::Error),
    /// Policy or agent refusal, or a required agent is missing.
    AccessDenied(String),
    /// The operation requires a prior successful `Start`.
    NotAuthorized(String),
    /// The client is already started.
    AlreadyStarted(String),
    /// The client is not started.
    NotStarted(String),
    /// No source can satisfy the requested accuracy right now.
    NotAvailable(String),
    /// Malformed identifier, level or threshold.
    InvalidArgument(String),
    /// Broken invariant; triggers an orderly shutdown. Built via
    /// [`internal`], never directly.
    Internal(String),
}

/// Report a broken invariant: log it, schedule a process shutdown and hand
/// the error back so the caller still receives a reply before the daemon
/// dies. Outside a runtime the exit is immediate.
pub(crate) fn internal(message: String) -> BusError {
    error!("internal error: {message}; shutting down");
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async {
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                std::process::exit(1);
            });
        }
        Err(_) => std::process::exit(1),
    }
    BusError::Internal(message)
}
