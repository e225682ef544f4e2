use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::settings::Settings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("only private IPv4 addresses are supported, got {0}")]
    NotPrivate(Ipv4Addr),
    #[error("address {0} is outside the allowed networks")]
    OutsideAllowed(Ipv4Addr),
    #[error("address {0} lies in an excluded network")]
    Excluded(Ipv4Addr),
    #[error("destination port must not be 0")]
    PortOutOfRange,
}

/// Desired state of one point-to-point OpenVPN link.
///
/// Everything beyond the stored fields is derived from the id and the
/// settings: interface name, UDP port, routing table and file locations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunnel {
    pub id: i64,
    pub server: Ipv4Addr,
    pub client: Ipv4Addr,
    pub key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn name(&self, settings: &Settings) -> String {
        format!("{}{}", settings.iface_prefix, self.id)
    }

    pub fn port(&self, settings: &Settings) -> u16 {
        settings.server_port_start + self.id as u16 - 1
    }

    pub fn rtable(&self, settings: &Settings) -> String {
        format!("rt_{}", self.name(settings))
    }

    pub fn key_path(&self, settings: &Settings) -> PathBuf {
        settings.openvpn_dir.join(format!("{}.key", self.name(settings)))
    }

    pub fn conf_path(&self, settings: &Settings) -> PathBuf {
        settings.openvpn_dir.join(format!("{}.conf", self.name(settings)))
    }

    pub fn rp_filter_path(&self, settings: &Settings) -> PathBuf {
        settings.rp_filter_dir.join(self.name(settings)).join("rp_filter")
    }

    pub fn to_dict(&self, settings: &Settings) -> TunnelDict {
        TunnelDict {
            id: self.id,
            name: self.name(settings),
            server: self.server,
            client: self.client,
            port: self.port(settings),
            key: self.key.clone(),
            active: self.active,
        }
    }
}

/// One TCP port-forwarding rule attached to a tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forwarding {
    pub id: i64,
    pub tunnel_id: i64,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub loc_port: u16,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Forwarding {
    pub fn destination(&self) -> String {
        format!("{}:{}", self.dst_addr, self.dst_port)
    }

    pub fn to_dict(&self, tunnel: &Tunnel, settings: &Settings) -> ForwardingDict {
        ForwardingDict {
            id: self.id,
            dst_addr: self.dst_addr,
            dst_port: self.dst_port,
            loc_port: self.loc_port,
            tunnel_id: tunnel.id,
            tunnel_name: tunnel.name(settings),
            r_table: tunnel.rtable(settings),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDict {
    pub id: i64,
    pub name: String,
    pub server: Ipv4Addr,
    pub client: Ipv4Addr,
    pub port: u16,
    pub key: String,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingDict {
    pub id: i64,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub loc_port: u16,
    pub tunnel_id: i64,
    pub tunnel_name: String,
    pub r_table: String,
}

/// Tunnel endpoints must be private, inside the allowed set and outside
/// every exclusion. Runs before anything is persisted.
pub fn check_ip(addr: Ipv4Addr, settings: &Settings) -> Result<(), ValidationError> {
    if !addr.is_private() {
        return Err(ValidationError::NotPrivate(addr));
    }
    if !settings.allowed_vpn_addresses.iter().any(|net| net.contains(addr)) {
        return Err(ValidationError::OutsideAllowed(addr));
    }
    if settings.excluded_vpn_addresses.iter().any(|net| net.contains(addr)) {
        return Err(ValidationError::Excluded(addr));
    }
    Ok(())
}

pub fn check_dst_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::PortOutOfRange);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;

    pub(crate) fn tunnel(id: i64) -> Tunnel {
        Tunnel {
            id,
            server: Ipv4Addr::new(172, 17, 17, 2),
            client: Ipv4Addr::new(172, 17, 17, 1),
            key: "test-key".to_string(),
            active: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn derived_attributes_follow_the_id() {
        let settings = Settings::default();
        let t = tunnel(1);
        assert_eq!(t.name(&settings), "vpn-proxy-tun1");
        assert_eq!(t.port(&settings), 1195);
        assert_eq!(t.rtable(&settings), "rt_vpn-proxy-tun1");
        assert_eq!(t.key_path(&settings), PathBuf::from("/etc/openvpn/vpn-proxy-tun1.key"));
        assert_eq!(t.conf_path(&settings), PathBuf::from("/etc/openvpn/vpn-proxy-tun1.conf"));
        assert_eq!(
            t.rp_filter_path(&settings),
            PathBuf::from("/proc/sys/net/ipv4/conf/vpn-proxy-tun1/rp_filter")
        );
    }

    #[rstest]
    #[case(3, 1197)]
    #[case(10, 1204)]
    fn port_is_start_plus_id_minus_one(#[case] id: i64, #[case] port: u16) {
        assert_eq!(tunnel(id).port(&Settings::default()), port);
    }

    #[test]
    fn public_addresses_are_rejected() {
        let settings = Settings::default();
        assert_eq!(
            check_ip(Ipv4Addr::new(8, 8, 8, 8), &settings),
            Err(ValidationError::NotPrivate(Ipv4Addr::new(8, 8, 8, 8)))
        );
    }

    #[test]
    fn excluded_networks_are_rejected() -> anyhow::Result<()> {
        let mut settings = Settings::default();
        settings.excluded_vpn_addresses = vec!["10.1.0.0/16".parse()?];
        assert_eq!(
            check_ip(Ipv4Addr::new(10, 1, 2, 3), &settings),
            Err(ValidationError::Excluded(Ipv4Addr::new(10, 1, 2, 3)))
        );
        assert!(check_ip(Ipv4Addr::new(10, 2, 2, 3), &settings).is_ok());
        Ok(())
    }

    #[test]
    fn allowed_set_is_enforced() -> anyhow::Result<()> {
        let mut settings = Settings::default();
        settings.allowed_vpn_addresses = vec!["172.17.17.0/24".parse()?];
        assert_eq!(
            check_ip(Ipv4Addr::new(192, 168, 1, 1), &settings),
            Err(ValidationError::OutsideAllowed(Ipv4Addr::new(192, 168, 1, 1)))
        );
        assert!(check_ip(Ipv4Addr::new(172, 17, 17, 5), &settings).is_ok());
        Ok(())
    }

    #[test]
    fn forwarding_destination_renders_addr_port() {
        let f = Forwarding {
            id: 1,
            tunnel_id: 1,
            dst_addr: Ipv4Addr::new(192, 168, 50, 10),
            dst_port: 22,
            loc_port: 5023,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(f.destination(), "192.168.50.10:22");
    }

    #[test]
    fn dicts_carry_the_wire_fields() {
        let settings = Settings::default();
        let t = tunnel(1);
        let dict = t.to_dict(&settings);
        let value = serde_json::to_value(&dict).expect("serialize tunnel dict");
        assert_eq!(value["name"], "vpn-proxy-tun1");
        assert_eq!(value["port"], 1195);
        assert_eq!(value["server"], "172.17.17.2");
    }
}
