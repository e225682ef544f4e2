use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PATH: &str = "/etc/vpn-proxy/config.toml";
pub const ENV_VAR: &str = "VPN_PROXY_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Address the HTTP API binds to.
    pub listen_addr: SocketAddr,
    pub database_path: PathBuf,
    /// Prefix of the per-tunnel interface names; the tunnel id is appended.
    pub iface_prefix: String,
    /// UDP port of the first tunnel; tunnel N listens on start + N - 1.
    pub server_port_start: u16,
    /// DNS-reachable endpoint embedded into generated client configs.
    pub remote_address: String,
    /// Networks tunnel endpoints may be allocated from.
    pub allowed_vpn_addresses: Vec<Ipv4Network>,
    /// Networks never handed out, on top of per-request exclusions.
    pub excluded_vpn_addresses: Vec<Ipv4Network>,
    /// Networks allowed to reach the HTTP API; everyone else gets a 404.
    pub source_cidrs: Vec<Ipv4Network>,
    /// Forwardings untouched for longer than this get disabled.
    #[serde(with = "humantime_serde")]
    pub retention_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    pub openvpn_dir: PathBuf,
    pub rt_tables_path: PathBuf,
    pub rp_filter_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: "127.0.0.1:8080".parse().expect("static socket address"),
            database_path: PathBuf::from("/var/lib/vpn-proxy/vpn-proxy.db"),
            iface_prefix: "vpn-proxy-tun".to_string(),
            server_port_start: 1195,
            remote_address: "vpn-proxy.example.com".to_string(),
            allowed_vpn_addresses: rfc1918(),
            excluded_vpn_addresses: Vec::new(),
            source_cidrs: source_defaults(),
            retention_ttl: Duration::from_secs(60 * 60 * 24),
            sweep_interval: Duration::from_secs(60 * 60),
            openvpn_dir: PathBuf::from("/etc/openvpn"),
            rt_tables_path: PathBuf::from("/etc/iproute2/rt_tables"),
            rp_filter_dir: PathBuf::from("/proc/sys/net/ipv4/conf"),
        }
    }
}

fn rfc1918() -> Vec<Ipv4Network> {
    ["192.168.0.0/16", "172.16.0.0/12", "10.0.0.0/8"]
        .iter()
        .map(|net| net.parse().expect("static network"))
        .collect()
}

fn source_defaults() -> Vec<Ipv4Network> {
    let mut nets = rfc1918();
    nets.push("127.0.0.0/8".parse().expect("static network"));
    nets
}

/// Read settings from `path`; a missing file means stock settings.
pub fn read(path: &Path) -> Result<Settings, Error> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(config_file = %path.display(), "no configuration file, using defaults");
            return Ok(Settings::default());
        }
        Err(e) => return Err(Error::Io(e)),
    };
    let settings = toml::from_str(&content)?;
    Ok(settings)
}
