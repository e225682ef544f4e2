//! Composes the OS adapters into whole reconciliation passes. Ordering is
//! load-bearing: routing state must leave before its service stops, and a
//! service must run before routes point at its interface. A failing step
//! aborts the pass; the next pass starts from the beginning and converges
//! because every step is idempotent.

use thiserror::Error;

use crate::command::{CommandOps, Error as CommandError};
use crate::files;
use crate::model::{Forwarding, Tunnel};
use crate::os;
use crate::render;
use crate::settings::Settings;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    File(#[from] files::Error),
    #[error(transparent)]
    Routing(#[from] os::routing::Error),
}

pub struct Reconciler<'a, C: CommandOps> {
    ops: &'a C,
    settings: &'a Settings,
}

impl<'a, C: CommandOps> Reconciler<'a, C> {
    pub fn new(ops: &'a C, settings: &'a Settings) -> Self {
        Reconciler { ops, settings }
    }

    /// Drive the OS to the tunnel's desired state.
    pub fn reconcile_tunnel(&self, tunnel: &Tunnel) -> Result<(), Error> {
        if tunnel.active {
            self.start_tunnel(tunnel)
        } else {
            self.stop_tunnel(tunnel)
        }
    }

    pub fn reconcile_forwarding(&self, forwarding: &Forwarding, tunnel: &Tunnel) -> Result<(), Error> {
        if forwarding.active {
            self.enable_forwarding(forwarding, tunnel)
        } else {
            self.disable_forwarding(forwarding, tunnel)
        }
    }

    pub fn start_tunnel(&self, tunnel: &Tunnel) -> Result<(), Error> {
        let settings = self.settings;
        let name = tunnel.name(settings);
        let key = files::ensure_private_file(&tunnel.key_path(settings), &tunnel.key, "key file")?;
        let conf = files::ensure_file(
            &tunnel.conf_path(settings),
            &render::server_conf(tunnel, settings),
            "conf file",
        )?;
        // a running daemon only needs a kick when its config moved under it
        let force = key.changed() || conf.changed();
        os::service::start(self.ops, &name, force)?;
        files::add_rtable(&settings.rt_tables_path, tunnel.id, &tunnel.rtable(settings))?;
        os::routing::add_source_rule(self.ops, tunnel.server, &tunnel.rtable(settings))?;
        os::routing::add_default_route(self.ops, &name, &tunnel.rtable(settings))?;
        os::routing::ensure_loose_rp_filter(&tunnel.rp_filter_path(settings), &name)?;
        Ok(())
    }

    /// Strict reverse of [`Reconciler::start_tunnel`].
    pub fn stop_tunnel(&self, tunnel: &Tunnel) -> Result<(), Error> {
        let settings = self.settings;
        let name = tunnel.name(settings);
        os::routing::del_default_route(self.ops, &name, &tunnel.rtable(settings))?;
        os::routing::del_source_rule(self.ops, tunnel.server, &tunnel.rtable(settings))?;
        files::del_rtable(&settings.rt_tables_path, tunnel.id, &tunnel.rtable(settings))?;
        os::service::stop(self.ops, &name)?;
        files::remove_file(&tunnel.conf_path(settings), "conf file")?;
        files::remove_file(&tunnel.key_path(settings), "key file")?;
        Ok(())
    }

    pub fn enable_forwarding(&self, forwarding: &Forwarding, tunnel: &Tunnel) -> Result<(), Error> {
        os::iptables::add(self.ops, forwarding, &tunnel.name(self.settings))?;
        os::routing::add_fwmark_rule(self.ops, tunnel.id, &tunnel.rtable(self.settings))?;
        Ok(())
    }

    pub fn disable_forwarding(&self, forwarding: &Forwarding, tunnel: &Tunnel) -> Result<(), Error> {
        os::iptables::remove(self.ops, forwarding, &tunnel.name(self.settings))?;
        os::routing::del_fwmark_rule(self.ops, tunnel.id, &tunnel.rtable(self.settings))?;
        Ok(())
    }
}
