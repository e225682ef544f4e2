//! Declarative adapters over the OS state this service manages: the
//! per-interface OpenVPN service, policy routing and the iptables rules of
//! a forwarding. Every adapter converges (add/remove are idempotent) and
//! reports whether it had to touch anything.

pub mod iptables;
pub mod routing;
pub mod service;

#[cfg(test)]
pub mod mocks;
