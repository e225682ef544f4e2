use clap::{Parser, Subcommand};

/// Control a vpn-proxy daemon over its HTTP API
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Base URL of the vpn-proxy daemon
    #[arg(
        short,
        long,
        env = "VPN_PROXY_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    pub server: String,

    /// Print raw JSON responses
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// List all tunnels
    List,
    /// Create a tunnel with endpoints drawn from the given networks
    Create {
        /// Network to allocate from, repeatable
        #[arg(long = "cidr", required = true)]
        cidrs: Vec<String>,
        /// Network to keep out of the allocation, repeatable
        #[arg(long = "exclude")]
        excluded: Vec<String>,
    },
    /// Show one tunnel
    Show { id: i64 },
    /// Enable a tunnel, converging the host to its configuration
    Enable { id: i64 },
    /// Disable and delete a tunnel and all its forwardings
    Delete { id: i64 },
    /// Fetch the client bootstrap script
    Script { id: i64 },
    /// Ensure a TCP forwarding exists and print its local port
    Forward {
        id: i64,
        dst_addr: String,
        dst_port: u16,
    },
    /// Probe a host through the tunnel interface
    Ping {
        id: i64,
        /// Defaults to the tunnel's client address
        target: Option<String>,
        /// Number of echo requests
        #[arg(long)]
        pkts: Option<u32>,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}
