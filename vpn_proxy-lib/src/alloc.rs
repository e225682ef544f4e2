use ipnetwork::Ipv4Network;
use rand::Rng;
use thiserror::Error;

use std::collections::HashSet;
use std::net::Ipv4Addr;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("no address available in the requested networks")]
    NoAddressAvailable,
    #[error("no local port available")]
    NoPortAvailable,
}

/// Pick a free host address out of `routable`.
///
/// The client pass (`client_addr` unset) starts at a random host so tunnels
/// spread over the pool; the server pass starts right behind the client so
/// the pair ends up adjacent. The cursor sweeps sequentially, wraps at the
/// broadcast address and jumps over excluded networks. An address is free
/// when no persisted tunnel endpoint uses it.
pub fn choose_ip(
    routable: &[Ipv4Network],
    excluded: &[Ipv4Network],
    reserved: &[Ipv4Network],
    used: &HashSet<Ipv4Addr>,
    client_addr: Option<Ipv4Addr>,
) -> Result<Ipv4Addr, Error> {
    let exclusions: Vec<Ipv4Network> = excluded.iter().chain(reserved.iter()).copied().collect();

    for cidr in routable {
        let network = u32::from(cidr.network());
        let broadcast = u32::from(cidr.broadcast());
        if broadcast <= network + 1 {
            // /31 and /32 have no usable point-to-point hosts here
            continue;
        }
        let host_count = broadcast - network - 1;

        let mut cursor = match client_addr {
            Some(client) => u32::from(client).wrapping_add(1),
            None => rand::rng().random_range(network + 1..broadcast),
        };

        for _ in 0..host_count {
            if cursor <= network || cursor >= broadcast {
                cursor = network + 1;
            }
            if let Some(hit) = exclusions.iter().find(|net| net.contains(Ipv4Addr::from(cursor))) {
                // resume right after the excluded block
                cursor = u32::from(hit.broadcast()).wrapping_add(1);
                continue;
            }
            let candidate = Ipv4Addr::from(cursor);
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
            cursor += 1;
        }
    }
    Err(Error::NoAddressAvailable)
}

const PORT_ATTEMPTS: u32 = 60_000;

/// Linearly probe from `start` for a port no forwarding holds yet.
pub fn pick_port(start: u32, used: &HashSet<u16>) -> Result<u16, Error> {
    let mut port = start;
    for _ in 0..PORT_ATTEMPTS {
        if port > u16::MAX as u32 {
            break;
        }
        if !used.contains(&(port as u16)) {
            return Ok(port as u16);
        }
        port += 1;
    }
    Err(Error::NoPortAvailable)
}
