//! The iptables triplet behind one forwarding: MARK in mangle so the
//! fwmark rule can route the flow, DNAT to rewrite the destination, and
//! MASQUERADE on the tunnel interface for the return path. Each rule is
//! checked, added and removed on its own so a half-installed set converges
//! on the next pass.

use crate::Change;
use crate::command::{CommandOps, Error, Verbosity};
use crate::model::Forwarding;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    Mangle,
    Nat,
    Mask,
}

const RULES: [Rule; 3] = [Rule::Mangle, Rule::Nat, Rule::Mask];

impl Rule {
    fn name(self) -> &'static str {
        match self {
            Rule::Mangle => "mangle",
            Rule::Nat => "nat",
            Rule::Mask => "mask",
        }
    }

    fn argv(self, job: &str, fwd: &Forwarding, iface: &str) -> Vec<String> {
        let loc_port = fwd.loc_port.to_string();
        let mark = fwd.tunnel_id.to_string();
        let destination = fwd.destination();
        let dst_addr = fwd.dst_addr.to_string();
        let dst_port = fwd.dst_port.to_string();
        let args: Vec<&str> = match self {
            // mangle is traversed before nat in PREROUTING, so the mark is
            // set before the destination gets rewritten
            Rule::Mangle => vec![
                "iptables", "-t", "mangle", job, "PREROUTING",
                "-p", "tcp", "--dport", &loc_port,
                "-j", "MARK", "--set-mark", &mark,
            ],
            Rule::Nat => vec![
                "iptables", "-t", "nat", job, "PREROUTING",
                "-p", "tcp", "--dport", &loc_port,
                "-j", "DNAT", "--to-destination", &destination,
            ],
            Rule::Mask => vec![
                "iptables", "-t", "nat", job, "POSTROUTING",
                "-p", "tcp", "-o", iface, "-d", &dst_addr,
                "--dport", &dst_port,
                "-j", "MASQUERADE",
            ],
        };
        args.into_iter().map(str::to_string).collect()
    }
}

fn check(ops: &impl CommandOps, rule: Rule, fwd: &Forwarding, iface: &str) -> Result<bool, Error> {
    let argv = rule.argv("-C", fwd, iface);
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    match ops.run(&argv, Verbosity::Silent) {
        Ok(_) => Ok(true),
        Err(Error::Failed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn apply(ops: &impl CommandOps, rule: Rule, job: &str, fwd: &Forwarding, iface: &str) -> Result<(), Error> {
    let argv = rule.argv(job, fwd, iface);
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    ops.run(&argv, Verbosity::Debug)?;
    Ok(())
}

/// Install whichever of the three rules are missing.
pub fn add(ops: &impl CommandOps, fwd: &Forwarding, iface: &str) -> Result<Change, Error> {
    let mut change = Change::Unchanged;
    for rule in RULES {
        if check(ops, rule, fwd, iface)? {
            tracing::debug!(rule = rule.name(), loc_port = fwd.loc_port, "iptables rule already in place");
        } else {
            apply(ops, rule, "-A", fwd, iface)?;
            tracing::info!(rule = rule.name(), loc_port = fwd.loc_port, "appending iptables rule");
            change = Change::Changed;
        }
    }
    Ok(change)
}

/// Remove whichever of the three rules are present.
pub fn remove(ops: &impl CommandOps, fwd: &Forwarding, iface: &str) -> Result<Change, Error> {
    let mut change = Change::Unchanged;
    for rule in RULES {
        if check(ops, rule, fwd, iface)? {
            apply(ops, rule, "-D", fwd, iface)?;
            tracing::info!(rule = rule.name(), loc_port = fwd.loc_port, "removing iptables rule");
            change = Change::Changed;
        } else {
            tracing::debug!(rule = rule.name(), loc_port = fwd.loc_port, "iptables rule already deleted");
        }
    }
    Ok(change)
}
