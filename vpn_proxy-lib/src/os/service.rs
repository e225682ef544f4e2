use crate::Change;
use crate::command::{CommandOps, Error, Verbosity};

/// Whether the OpenVPN service for `iface` is up, by exit code of the
/// service manager's status verb.
pub fn is_running(ops: &impl CommandOps, iface: &str) -> bool {
    ops.run(&["service", "openvpn", "status", iface], Verbosity::Silent).is_ok()
}

/// Bring the OpenVPN service for `iface` up. With `force` a running
/// service is restarted, otherwise left alone.
///
/// Start and restart go through the close-FDs executor: the daemon must
/// not inherit our HTTP listening socket, or it blocks rebinding the port
/// long after we exit.
pub fn start(ops: &impl CommandOps, iface: &str, force: bool) -> Result<Change, Error> {
    if is_running(ops, iface) {
        if force {
            tracing::info!(%iface, "restarting OpenVPN server");
            ops.run_close_fds(&["service", "openvpn", "restart", iface], Verbosity::Debug)?;
        } else {
            tracing::debug!(%iface, "OpenVPN server already running");
            return Ok(Change::Unchanged);
        }
    } else {
        tracing::info!(%iface, "OpenVPN server not running, starting");
        ops.run_close_fds(&["service", "openvpn", "start", iface], Verbosity::Debug)?;
    }
    Ok(Change::Changed)
}

/// Stop the OpenVPN service for `iface` if it runs.
pub fn stop(ops: &impl CommandOps, iface: &str) -> Result<Change, Error> {
    if !is_running(ops, iface) {
        tracing::debug!(%iface, "OpenVPN server already stopped");
        return Ok(Change::Unchanged);
    }
    tracing::info!(%iface, "OpenVPN server is running, stopping");
    ops.run(&["service", "openvpn", "stop", iface], Verbosity::Debug)?;
    Ok(Change::Changed)
}
