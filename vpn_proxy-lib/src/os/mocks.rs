//! Stateful stand-in for [`CommandOps`] used across the test suites.
//!
//! Instead of recording call sequences it keeps the OS state the real
//! tools would mutate (running services, `ip rule` lines, per-table
//! routes, the iptables rule set) and answers checks from that state, so
//! tests assert on what the system looks like after a pass, and
//! idempotence is observable. A `fail_on` map injects failures per
//! command prefix.

#![cfg(test)]

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{CommandOps, Error, Verbosity};

#[derive(Debug, Default)]
pub struct MockState {
    pub services: Vec<String>,
    pub ip_rules: Vec<String>,
    pub routes: HashMap<String, Vec<String>>,
    pub iptables: Vec<Vec<String>>,
    pub fail_on: HashMap<String, String>,
    pub history: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockCommands {
    state: Arc<Mutex<MockState>>,
    /// When set, a service start materializes
    /// `<dir>/<iface>/rp_filter` the way the kernel would.
    rp_filter_dir: Option<PathBuf>,
}

const MOCK_KEY: &str = "-----BEGIN OpenVPN Static key V1-----\nf00dfeed\n-----END OpenVPN Static key V1-----\n";

const MOCK_PING: &str = "\
PING 192.168.50.10 (192.168.50.10) 56(84) bytes of data.

--- 192.168.50.10 ping statistics ---
10 packets transmitted, 10 received, 0% packet loss, time 3606ms
rtt min/avg/max/mdev = 0.035/0.045/0.062/0.008 ms
";

impl MockCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rp_filter_dir(dir: PathBuf) -> Self {
        MockCommands {
            state: Arc::default(),
            rp_filter_dir: Some(dir),
        }
    }

    pub fn fail_on(&self, prefix: &str, message: &str) {
        self.lock().fail_on.insert(prefix.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().fail_on.clear();
    }

    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    pub fn ip_rules(&self) -> Vec<String> {
        self.lock().ip_rules.clone()
    }

    pub fn iptables_rules(&self) -> Vec<Vec<String>> {
        self.lock().iptables.clone()
    }

    pub fn running_services(&self) -> Vec<String> {
        self.lock().services.clone()
    }

    pub fn routes(&self, table: &str) -> Vec<String> {
        self.lock().routes.get(table).cloned().unwrap_or_default()
    }

    pub fn drop_iptables_rule(&self, needle: &str) {
        self.lock()
            .iptables
            .retain(|rule| !rule.iter().any(|word| word.contains(needle)));
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn failed(joined: String, code: i32, output: &str) -> Error {
        Error::Failed {
            argv: joined,
            code,
            output: output.to_string(),
        }
    }

    fn dispatch(&self, argv: &[&str], history_entry: String) -> Result<String, Error> {
        let joined = argv.join(" ");
        let mut state = self.lock();
        state.history.push(history_entry);

        if let Some(message) = state
            .fail_on
            .iter()
            .find(|(prefix, _)| joined.starts_with(prefix.as_str()))
            .map(|(_, message)| message.clone())
        {
            return Err(Self::failed(joined, 1, &message));
        }

        match argv {
            ["service", "openvpn", "status", iface] => {
                if state.services.iter().any(|s| s == iface) {
                    Ok(format!("openvpn for {iface} is running"))
                } else {
                    Err(Self::failed(joined, 3, "not running"))
                }
            }
            ["service", "openvpn", "start" | "restart", iface] => {
                if !state.services.iter().any(|s| s == iface) {
                    state.services.push(iface.to_string());
                }
                if let Some(dir) = &self.rp_filter_dir {
                    let conf_dir = dir.join(iface);
                    let _ = fs::create_dir_all(&conf_dir);
                    let _ = fs::write(conf_dir.join("rp_filter"), "1");
                }
                Ok(String::new())
            }
            ["service", "openvpn", "stop", iface] => {
                state.services.retain(|s| s != iface);
                Ok(String::new())
            }
            ["ip", "rule", "list"] => Ok(state.ip_rules.join("\n")),
            ["ip", "rule", "add", "from", server, "table", table] => {
                state.ip_rules.push(format!("32765:\tfrom {server} lookup {table}"));
                Ok(String::new())
            }
            ["ip", "rule", "del", "from", server, "table", table] => {
                let needle = format!("from {server} lookup {table}");
                state.ip_rules.retain(|line| !line.contains(&needle));
                Ok(String::new())
            }
            ["ip", "rule", "add", "fwmark", mark, "table", table] => {
                state
                    .ip_rules
                    .push(format!("32764:\tfrom all fwmark {mark} lookup {table}"));
                Ok(String::new())
            }
            ["ip", "rule", "del", "fwmark", mark, "table", table] => {
                let needle = format!("fwmark {mark} lookup {table}");
                state.ip_rules.retain(|line| !line.contains(&needle));
                Ok(String::new())
            }
            ["ip", "route", "list", "table", table] => match state.routes.get(*table) {
                Some(routes) => Ok(routes.join("\n")),
                None => Err(Self::failed(joined, 2, "FIB table does not exist")),
            },
            ["ip", "route", "add", "default", "dev", dev, "table", table] => {
                state
                    .routes
                    .entry(table.to_string())
                    .or_default()
                    .push(format!("default dev {dev} scope link"));
                Ok(String::new())
            }
            ["ip", "route", "del", "default", "dev", dev, "table", table] => {
                let needle = format!("default dev {dev}");
                if let Some(routes) = state.routes.get_mut(*table) {
                    routes.retain(|line| !line.contains(&needle));
                }
                Ok(String::new())
            }
            ["iptables", "-t", table, job, chain, spec @ ..] => {
                let mut canonical = vec![table.to_string(), chain.to_string()];
                canonical.extend(spec.iter().map(|s| s.to_string()));
                let present = state.iptables.contains(&canonical);
                match *job {
                    "-C" => {
                        if present {
                            Ok(String::new())
                        } else {
                            Err(Self::failed(joined, 1, "iptables: No chain/target/match by that name."))
                        }
                    }
                    "-A" => {
                        state.iptables.push(canonical);
                        Ok(String::new())
                    }
                    "-D" => {
                        if present {
                            state.iptables.retain(|rule| rule != &canonical);
                            Ok(String::new())
                        } else {
                            Err(Self::failed(joined, 1, "iptables: Bad rule."))
                        }
                    }
                    other => Err(Self::failed(joined, 2, &format!("unknown iptables job {other}"))),
                }
            }
            ["openvpn", "--genkey", "--secret", path] => {
                fs::write(path, MOCK_KEY).map_err(|e| Self::failed(joined, 1, &e.to_string()))?;
                Ok(String::new())
            }
            ["ping", ..] => Ok(MOCK_PING.to_string()),
            _ => Err(Self::failed(joined, 127, "mock: unknown command")),
        }
    }
}

impl CommandOps for MockCommands {
    fn run(&self, argv: &[&str], _verbosity: Verbosity) -> Result<String, Error> {
        let entry = argv.join(" ");
        self.dispatch(argv, entry)
    }

    fn run_close_fds(&self, argv: &[&str], _verbosity: Verbosity) -> Result<String, Error> {
        self.dispatch(argv, format!("[close-fds] {}", argv.join(" ")))
    }
}
