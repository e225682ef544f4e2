use clap::Parser;

use std::net::SocketAddr;
use std::path::PathBuf;

use vpn_proxy_lib::settings;

/// VPN proxy control plane - provisions per-tenant OpenVPN tunnels and
/// TCP forwardings into the networks behind them
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// General configuration file
    #[arg(
        short,
        long,
        env = settings::ENV_VAR,
        default_value = settings::DEFAULT_PATH,
    )]
    pub config_path: PathBuf,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Database file, overriding the configuration file
    #[arg(short, long)]
    pub database: Option<PathBuf>,

    /// Skip re-converging persisted tunnels on startup
    #[arg(long)]
    pub no_reset: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_no_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["vpn_proxy"])?;
        assert_eq!(args.config_path, PathBuf::from(settings::DEFAULT_PATH));
        assert!(args.listen.is_none());
        assert!(!args.no_reset);
        Ok(())
    }

    #[test]
    fn overrides_are_parsed() -> anyhow::Result<()> {
        let args = Cli::try_parse_from([
            "vpn_proxy",
            "--config-path",
            "/tmp/vpn-proxy.toml",
            "--listen",
            "0.0.0.0:9000",
            "--database",
            "/tmp/vpn-proxy.db",
            "--no-reset",
        ])?;
        assert_eq!(args.listen, Some("0.0.0.0:9000".parse()?));
        assert_eq!(args.database, Some(PathBuf::from("/tmp/vpn-proxy.db")));
        assert!(args.no_reset);
        Ok(())
    }
}
