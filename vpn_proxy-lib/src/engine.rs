//! Desired-state lifecycle over the store plus the reconciliation passes
//! that project it onto the OS. One mutex serializes every mutating
//! operation end to end: iptables, `ip rule`, the rt_tables file and the
//! openvpn services are process-global, and none of the tools tolerate
//! interleaving. Mutations reconcile before the row is (re)saved; inserts
//! reconcile right after, once the id exists.

use thiserror::Error;

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ipnetwork::Ipv4Network;

use crate::alloc;
use crate::command::CommandOps;
use crate::keygen;
use crate::model::{self, Tunnel, ValidationError};
use crate::ping;
use crate::reconcile::{self, Reconciler};
use crate::settings::Settings;
use crate::store::{self, Store};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Alloc(#[from] alloc::Error),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Store(store::Error),
    #[error(transparent)]
    Reconcile(#[from] reconcile::Error),
    #[error(transparent)]
    Keygen(#[from] keygen::Error),
    #[error(transparent)]
    Ping(#[from] ping::Error),
}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        match e {
            store::Error::NotFound => Error::NotFound,
            other => Error::Store(other),
        }
    }
}

pub struct Engine<C: CommandOps> {
    settings: Settings,
    ops: C,
    store: Mutex<Store>,
}

impl<C: CommandOps> Engine<C> {
    pub fn new(settings: Settings, ops: C, store: Store) -> Self {
        Engine {
            settings,
            ops,
            store: Mutex::new(store),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn reconciler(&self) -> Reconciler<'_, C> {
        Reconciler::new(&self.ops, &self.settings)
    }

    /// Allocate an adjacent client/server pair from `cidrs`, generate a
    /// key and persist the new (inactive) tunnel. Activation is a
    /// separate, explicit step.
    pub fn create_tunnel(&self, cidrs: &[Ipv4Network], excluded: &[Ipv4Network]) -> Result<Tunnel, Error> {
        let mut store = self.lock();
        let pool: &[Ipv4Network] = if cidrs.is_empty() {
            &self.settings.allowed_vpn_addresses
        } else {
            cidrs
        };
        let reserved = &self.settings.excluded_vpn_addresses;

        let mut used = store.used_addresses()?;
        let client = alloc::choose_ip(pool, excluded, reserved, &used, None)?;
        used.insert(client);
        let server = alloc::choose_ip(pool, excluded, reserved, &used, Some(client))?;
        model::check_ip(client, &self.settings)?;
        model::check_ip(server, &self.settings)?;

        let key = keygen::generate(&self.ops)?;
        let tunnel = store.insert_tunnel(server, client, &key)?;
        tracing::info!(id = tunnel.id, %server, %client, "created tunnel");
        // every persisted mutation reconciles; a new tunnel is inactive,
        // so this pass is a teardown that must find nothing to do
        self.reconciler().reconcile_tunnel(&tunnel)?;
        Ok(tunnel)
    }

    pub fn list_tunnels(&self) -> Result<Vec<Tunnel>, Error> {
        Ok(self.lock().list_tunnels()?)
    }

    pub fn get_tunnel(&self, id: i64) -> Result<Tunnel, Error> {
        Ok(self.lock().get_tunnel(id)?)
    }

    pub fn enable_tunnel(&self, id: i64) -> Result<Tunnel, Error> {
        let mut store = self.lock();
        let mut tunnel = store.get_tunnel(id)?;
        tunnel.active = true;
        self.reconciler().reconcile_tunnel(&tunnel)?;
        Ok(store.set_tunnel_active(id, true)?)
    }

    pub fn disable_tunnel(&self, id: i64) -> Result<Tunnel, Error> {
        let mut store = self.lock();
        let mut tunnel = store.get_tunnel(id)?;
        tunnel.active = false;
        self.reconciler().reconcile_tunnel(&tunnel)?;
        Ok(store.set_tunnel_active(id, false)?)
    }

    /// Tear down and delete the tunnel and everything attached to it.
    /// Forwardings go first, in creation order, each one disabled before
    /// its row disappears; the tunnel itself follows the same rule.
    pub fn delete_tunnel(&self, id: i64) -> Result<(), Error> {
        let mut store = self.lock();
        let tunnel = store.get_tunnel(id)?;
        let rec = self.reconciler();
        for forwarding in store.forwardings_for(tunnel.id)? {
            rec.disable_forwarding(&forwarding, &tunnel)?;
            store.delete_forwarding(forwarding.id)?;
        }
        rec.stop_tunnel(&tunnel)?;
        store.delete_tunnel(tunnel.id)?;
        tracing::info!(id = tunnel.id, "deleted tunnel");
        Ok(())
    }

    /// Idempotent "reach `dst_addr:dst_port` via tunnel" request. An
    /// existing forwarding for the triple is re-enabled and its port
    /// returned; otherwise a local port is allocated near the
    /// deterministic hint and the new forwarding enabled.
    pub fn ensure_forwarding(&self, tunnel_id: i64, dst_addr: Ipv4Addr, dst_port: u16) -> Result<u16, Error> {
        model::check_dst_port(dst_port)?;
        let mut store = self.lock();
        let tunnel = store.get_tunnel(tunnel_id)?;
        let rec = self.reconciler();

        if let Some(found) = store.find_forwarding(tunnel.id, dst_addr, dst_port)? {
            let mut forwarding = found;
            forwarding.active = true;
            rec.reconcile_forwarding(&forwarding, &tunnel)?;
            let forwarding = store.set_forwarding_active(forwarding.id, true)?;
            return Ok(forwarding.loc_port);
        }

        let hint = dst_port as u32 + 5000 + tunnel.id as u32;
        let mut retried = false;
        loop {
            let used = store.used_ports()?;
            let loc_port = alloc::pick_port(hint, &used)?;
            match store.insert_forwarding(tunnel.id, dst_addr, dst_port, loc_port) {
                Ok(mut forwarding) => {
                    tracing::info!(
                        tunnel = tunnel.id,
                        destination = %forwarding.destination(),
                        loc_port,
                        "created forwarding"
                    );
                    forwarding.active = true;
                    rec.reconcile_forwarding(&forwarding, &tunnel)?;
                    let forwarding = store.set_forwarding_active(forwarding.id, true)?;
                    return Ok(forwarding.loc_port);
                }
                // lost a uniqueness race: pick again, once
                Err(store::Error::Constraint(_)) if !retried => {
                    retried = true;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Disable forwardings whose last touch is older than `ttl`. Rows are
    /// kept so a later request reuses the same local port.
    pub fn retain(&self, ttl: Duration, tunnels: Option<&[i64]>) -> Result<usize, Error> {
        let mut store = self.lock();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let rec = self.reconciler();
        let mut disabled = 0;
        for found in store.stale_forwardings(cutoff, tunnels)? {
            let tunnel = store.get_tunnel(found.tunnel_id)?;
            tracing::info!(
                forwarding = found.id,
                tunnel = tunnel.id,
                loc_port = found.loc_port,
                "disabling forwarding past retention"
            );
            let mut forwarding = found;
            forwarding.active = false;
            rec.reconcile_forwarding(&forwarding, &tunnel)?;
            store.set_forwarding_active(forwarding.id, false)?;
            disabled += 1;
        }
        Ok(disabled)
    }

    /// Re-converge every persisted entity, e.g. after a host reboot wiped
    /// the OS state. Failures are logged per tunnel and do not stop the
    /// sweep; the count of failed tunnels comes back to the caller.
    pub fn reset_all(&self) -> Result<usize, Error> {
        let store = self.lock();
        let rec = self.reconciler();
        let mut failures = 0;
        for tunnel in store.list_tunnels()? {
            tracing::info!(id = tunnel.id, "resetting tunnel");
            let result: Result<(), Error> = (|| {
                rec.reconcile_tunnel(&tunnel)?;
                for forwarding in store.forwardings_for(tunnel.id)? {
                    rec.reconcile_forwarding(&forwarding, &tunnel)?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                tracing::error!(id = tunnel.id, error = %e, "failed resetting tunnel");
                failures += 1;
            }
        }
        Ok(failures)
    }

    pub fn client_script(&self, id: i64) -> Result<String, Error> {
        let tunnel = self.lock().get_tunnel(id)?;
        Ok(crate::render::client_script(&tunnel, &self.settings))
    }

    /// ICMP probe through the tunnel interface. Runs without the engine
    /// lock held: a ping takes seconds and touches no managed state.
    pub fn ping(&self, id: i64, target: Option<&str>, packets: u32) -> Result<ping::Report, Error> {
        let tunnel = { self.lock().get_tunnel(id)? };
        let client = tunnel.client.to_string();
        let host = target.filter(|t| !t.is_empty()).unwrap_or(&client);
        Ok(ping::probe(&self.ops, &tunnel.name(&self.settings), host, packets)?)
    }
}
