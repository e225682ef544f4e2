//! Policy-routing adapters: the source rule and default route that steer a
//! tunnel's return traffic through its own table, the fwmark rule used by
//! forwardings, and the loose reverse-path filter the NATed replies need.

use thiserror::Error;

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::Change;
use crate::command::{CommandOps, Error as CommandError, Verbosity};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("IO error on `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn rule_list(ops: &impl CommandOps) -> Result<String, CommandError> {
    ops.run(&["ip", "rule", "list"], Verbosity::Silent)
}

pub fn check_source_rule(ops: &impl CommandOps, server: Ipv4Addr, rtable: &str) -> Result<bool, Error> {
    Ok(rule_list(ops)?.contains(&format!("from {server} lookup {rtable}")))
}

/// `ip rule add from <server> table <rtable>`: traffic sourced from the
/// tunnel's server address resolves routes in the tunnel's own table.
pub fn add_source_rule(ops: &impl CommandOps, server: Ipv4Addr, rtable: &str) -> Result<Change, Error> {
    if check_source_rule(ops, server, rtable)? {
        tracing::debug!(%rtable, "IP rule already configured");
        return Ok(Change::Unchanged);
    }
    tracing::info!(%rtable, %server, "adding IP rule");
    ops.run(
        &["ip", "rule", "add", "from", &server.to_string(), "table", rtable],
        Verbosity::Info,
    )?;
    Ok(Change::Changed)
}

pub fn del_source_rule(ops: &impl CommandOps, server: Ipv4Addr, rtable: &str) -> Result<Change, Error> {
    if !check_source_rule(ops, server, rtable)? {
        tracing::debug!(%rtable, "IP rule already removed");
        return Ok(Change::Unchanged);
    }
    tracing::info!(%rtable, %server, "removing IP rule");
    ops.run(
        &["ip", "rule", "del", "from", &server.to_string(), "table", rtable],
        Verbosity::Info,
    )?;
    Ok(Change::Changed)
}

/// A failing list command means the table does not exist yet, which reads
/// as "route absent".
pub fn check_default_route(ops: &impl CommandOps, iface: &str, rtable: &str) -> Result<bool, Error> {
    match ops.run(&["ip", "route", "list", "table", rtable], Verbosity::Silent) {
        Ok(out) => Ok(out.contains(&format!("default dev {iface}"))),
        Err(CommandError::Failed { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn add_default_route(ops: &impl CommandOps, iface: &str, rtable: &str) -> Result<Change, Error> {
    if check_default_route(ops, iface, rtable)? {
        tracing::debug!(%rtable, "IP route already configured");
        return Ok(Change::Unchanged);
    }
    tracing::info!(%rtable, %iface, "adding IP route");
    ops.run(
        &["ip", "route", "add", "default", "dev", iface, "table", rtable],
        Verbosity::Info,
    )?;
    Ok(Change::Changed)
}

pub fn del_default_route(ops: &impl CommandOps, iface: &str, rtable: &str) -> Result<Change, Error> {
    if !check_default_route(ops, iface, rtable)? {
        tracing::debug!(%rtable, "IP route already removed");
        return Ok(Change::Unchanged);
    }
    tracing::info!(%rtable, %iface, "removing IP route");
    ops.run(
        &["ip", "route", "del", "default", "dev", iface, "table", rtable],
        Verbosity::Info,
    )?;
    Ok(Change::Changed)
}

fn fwmark(mark: i64) -> String {
    // ip rule prints marks in hex; using the same form on add keeps the
    // check substring aligned with the list output
    format!("{mark:#x}")
}

pub fn check_fwmark_rule(ops: &impl CommandOps, mark: i64, rtable: &str) -> Result<bool, Error> {
    Ok(rule_list(ops)?.contains(&format!("from all fwmark {} lookup {rtable}", fwmark(mark))))
}

/// Point packets marked with a tunnel's id at that tunnel's routing table.
pub fn add_fwmark_rule(ops: &impl CommandOps, mark: i64, rtable: &str) -> Result<Change, Error> {
    if check_fwmark_rule(ops, mark, rtable)? {
        tracing::debug!(%mark, "IP rule for mark already exists");
        return Ok(Change::Unchanged);
    }
    tracing::info!(%mark, %rtable, "inserting IP rule for fwmark");
    ops.run(
        &["ip", "rule", "add", "fwmark", &fwmark(mark), "table", rtable],
        Verbosity::Info,
    )?;
    Ok(Change::Changed)
}

pub fn del_fwmark_rule(ops: &impl CommandOps, mark: i64, rtable: &str) -> Result<Change, Error> {
    if !check_fwmark_rule(ops, mark, rtable)? {
        tracing::debug!(%mark, "IP rule for mark already removed");
        return Ok(Change::Unchanged);
    }
    tracing::info!(%mark, %rtable, "removing IP rule for fwmark");
    ops.run(
        &["ip", "rule", "del", "fwmark", &fwmark(mark), "table", rtable],
        Verbosity::Info,
    )?;
    Ok(Change::Changed)
}

/// Loose reverse-path filtering (mode 2) on the tunnel interface, so the
/// asymmetric replies of NATed connections are not dropped.
pub fn ensure_loose_rp_filter(path: &Path, iface: &str) -> Result<Change, Error> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let current = fs::read_to_string(path).map_err(io_err)?;
    if current.trim() == "2" {
        tracing::debug!(%iface, "loose reverse path filter already enabled");
        return Ok(Change::Unchanged);
    }
    fs::write(path, "2").map_err(io_err)?;
    tracing::info!(%iface, "enabling loose reverse path filtering");
    Ok(Change::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::mocks::MockCommands;

    fn server() -> Ipv4Addr {
        Ipv4Addr::new(172, 17, 17, 2)
    }

    #[test]
    fn source_rule_round_trip() -> anyhow::Result<()> {
        let mock = MockCommands::new();
        assert!(!check_source_rule(&mock, server(), "rt_vpn-proxy-tun1")?);
        assert_eq!(add_source_rule(&mock, server(), "rt_vpn-proxy-tun1")?, Change::Changed);
        assert!(check_source_rule(&mock, server(), "rt_vpn-proxy-tun1")?);
        assert_eq!(add_source_rule(&mock, server(), "rt_vpn-proxy-tun1")?, Change::Unchanged);
        assert_eq!(del_source_rule(&mock, server(), "rt_vpn-proxy-tun1")?, Change::Changed);
        assert_eq!(del_source_rule(&mock, server(), "rt_vpn-proxy-tun1")?, Change::Unchanged);
        Ok(())
    }

    #[test]
    fn missing_table_reads_as_absent_route() -> anyhow::Result<()> {
        let mock = MockCommands::new();
        assert!(!check_default_route(&mock, "vpn-proxy-tun1", "rt_vpn-proxy-tun1")?);
        Ok(())
    }

    #[test]
    fn default_route_round_trip() -> anyhow::Result<()> {
        let mock = MockCommands::new();
        assert_eq!(
            add_default_route(&mock, "vpn-proxy-tun1", "rt_vpn-proxy-tun1")?,
            Change::Changed
        );
        assert!(check_default_route(&mock, "vpn-proxy-tun1", "rt_vpn-proxy-tun1")?);
        assert_eq!(
            add_default_route(&mock, "vpn-proxy-tun1", "rt_vpn-proxy-tun1")?,
            Change::Unchanged
        );
        assert_eq!(
            del_default_route(&mock, "vpn-proxy-tun1", "rt_vpn-proxy-tun1")?,
            Change::Changed
        );
        assert!(!check_default_route(&mock, "vpn-proxy-tun1", "rt_vpn-proxy-tun1")?);
        Ok(())
    }

    #[test]
    fn fwmark_rule_is_rendered_in_hex() -> anyhow::Result<()> {
        let mock = MockCommands::new();
        add_fwmark_rule(&mock, 10, "rt_vpn-proxy-tun10")?;
        assert!(check_fwmark_rule(&mock, 10, "rt_vpn-proxy-tun10")?);
        let rules = mock.ip_rules();
        assert!(rules.iter().any(|r| r.contains("fwmark 0xa")));
        assert_eq!(del_fwmark_rule(&mock, 10, "rt_vpn-proxy-tun10")?, Change::Changed);
        assert!(!check_fwmark_rule(&mock, 10, "rt_vpn-proxy-tun10")?);
        Ok(())
    }

    #[test]
    fn rp_filter_writes_mode_2_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rp_filter");
        fs::write(&path, "1\n")?;
        assert_eq!(ensure_loose_rp_filter(&path, "vpn-proxy-tun1")?, Change::Changed);
        assert_eq!(fs::read_to_string(&path)?, "2");
        assert_eq!(ensure_loose_rp_filter(&path, "vpn-proxy-tun1")?, Change::Unchanged);
        Ok(())
    }
}
