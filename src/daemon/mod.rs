//! Long-running sandbox process.
//!
//! Starts the reconciler, announces `RUNNING`, then blocks until a stop
//! signal arrives and runs the shutdown backup.

pub mod reconciler;

use std::io;

use crossbeam_channel::{Receiver, bounded};

use crate::error::SandboxError;
use crate::orchestrator::{Sandbox, SandboxStatus};
use crate::protocol::ShutdownEvent;

pub use reconciler::{ReconcileStats, Reconciler, ReconcilerHandle, reconcile};

/// Run until `stop` fires (or its sender is dropped), then shut down as
/// `event` asks.
///
/// The reconciler is stopped before the backup starts so no folder is
/// deleted while it is being saved.
pub fn run_until(
    sandbox: &Sandbox,
    sandbox_json: Option<&str>,
    event: ShutdownEvent,
    stop: Receiver<()>,
) -> Result<SandboxStatus, SandboxError> {
    sandbox.startup(sandbox_json);

    let config = sandbox.config();
    let mut reconciler = ReconcilerHandle::spawn(
        sandbox.workspace().clone(),
        config.lock_timeout,
        config.watch_interval,
    )?;
    sandbox.set_running_status();
    log::info!("Sandbox {} running", config.identity.id);

    let _ = stop.recv();
    log::info!("Stop requested");
    reconciler.shutdown();

    Ok(sandbox.shutdown(event.force))
}

/// Run until SIGINT or SIGTERM.
pub fn run(
    sandbox: &Sandbox,
    sandbox_json: Option<&str>,
    event: ShutdownEvent,
) -> Result<SandboxStatus, SandboxError> {
    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .map_err(|e| io::Error::other(e.to_string()))?;

    run_until(sandbox, sandbox_json, event, rx)
}
