use exitcode::ExitCode;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};

use std::process;

use vpn_proxy_lib::model::TunnelDict;
use vpn_proxy_lib::ping;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args = cli::parse();
    let base = args.server.trim_end_matches('/').to_string();
    let client = Client::new();

    let exit = match dispatch(&client, &base, &args.command, args.json) {
        Ok(()) => exitcode::OK,
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    };
    process::exit(exit);
}

enum CtlError {
    Transport(reqwest::Error),
    Status(StatusCode, String),
    Decode(String),
}

impl std::fmt::Display for CtlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CtlError::Transport(e) => write!(f, "cannot reach the daemon: {e}"),
            CtlError::Status(status, body) => write!(f, "daemon answered {status}: {body}"),
            CtlError::Decode(e) => write!(f, "unexpected response: {e}"),
        }
    }
}

impl CtlError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CtlError::Transport(_) => exitcode::UNAVAILABLE,
            CtlError::Status(status, _) if status.is_client_error() => exitcode::DATAERR,
            CtlError::Status(..) => exitcode::SOFTWARE,
            CtlError::Decode(_) => exitcode::PROTOCOL,
        }
    }
}

fn checked(response: Response) -> Result<String, CtlError> {
    let status = response.status();
    let body = response.text().map_err(CtlError::Transport)?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(CtlError::Status(status, body.trim().to_string()))
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, CtlError> {
    serde_json::from_str(body).map_err(|e| CtlError::Decode(e.to_string()))
}

fn print_tunnel(tunnel: &TunnelDict) {
    let state = if tunnel.active { "active" } else { "inactive" };
    println!(
        "{id}: {name} {server} -> {client} (port {port}, {state})",
        id = tunnel.id,
        name = tunnel.name,
        server = tunnel.server,
        client = tunnel.client,
        port = tunnel.port,
    );
}

fn print_ping(report: &ping::Report) {
    println!(
        "{host}: {received}/{transmitted} received, {loss}% loss",
        host = report.host,
        received = report.received,
        transmitted = report.transmitted,
        loss = report.packet_loss_pct,
    );
    if let Some(rtt) = &report.rtt {
        println!(
            "rtt min/avg/max/mdev = {}/{}/{}/{} ms",
            rtt.min, rtt.avg, rtt.max, rtt.mdev
        );
    }
}

fn dispatch(client: &Client, base: &str, command: &cli::Command, json: bool) -> Result<(), CtlError> {
    match command {
        cli::Command::List => {
            let body = checked(client.get(format!("{base}/")).send().map_err(CtlError::Transport)?)?;
            if json {
                println!("{body}");
                return Ok(());
            }
            let tunnels: Vec<TunnelDict> = decode(&body)?;
            if tunnels.is_empty() {
                println!("no tunnels");
            }
            for tunnel in &tunnels {
                print_tunnel(tunnel);
            }
            Ok(())
        }
        cli::Command::Create { cidrs, excluded } => {
            let mut form: Vec<(&str, &str)> = cidrs.iter().map(|c| ("cidrs", c.as_str())).collect();
            form.extend(excluded.iter().map(|e| ("excluded", e.as_str())));
            let body = checked(
                client
                    .post(format!("{base}/"))
                    .form(&form)
                    .send()
                    .map_err(CtlError::Transport)?,
            )?;
            if json {
                println!("{body}");
            } else {
                print_tunnel(&decode(&body)?);
            }
            Ok(())
        }
        cli::Command::Show { id } => {
            let body = checked(client.get(format!("{base}/{id}/")).send().map_err(CtlError::Transport)?)?;
            if json {
                println!("{body}");
            } else {
                print_tunnel(&decode(&body)?);
            }
            Ok(())
        }
        cli::Command::Enable { id } => {
            let body = checked(client.post(format!("{base}/{id}/")).send().map_err(CtlError::Transport)?)?;
            if json {
                println!("{body}");
            } else {
                print_tunnel(&decode(&body)?);
            }
            Ok(())
        }
        cli::Command::Delete { id } => {
            let body = checked(
                client
                    .delete(format!("{base}/{id}/"))
                    .send()
                    .map_err(CtlError::Transport)?,
            )?;
            println!("{body}");
            Ok(())
        }
        cli::Command::Script { id } => {
            let body = checked(
                client
                    .get(format!("{base}/{id}/client_script/"))
                    .send()
                    .map_err(CtlError::Transport)?,
            )?;
            println!("{body}");
            Ok(())
        }
        cli::Command::Forward { id, dst_addr, dst_port } => {
            let body = checked(
                client
                    .get(format!("{base}/{id}/forwardings/{dst_addr}/{dst_port}/"))
                    .send()
                    .map_err(CtlError::Transport)?,
            )?;
            println!("{}", body.trim());
            Ok(())
        }
        cli::Command::Ping { id, target, pkts } => {
            let mut url = match target {
                Some(target) => format!("{base}/{id}/ping/{target}/"),
                None => format!("{base}/{id}/ping/"),
            };
            if let Some(pkts) = pkts {
                url.push_str(&format!("?pkts={pkts}"));
            }
            let body = checked(client.get(url).send().map_err(CtlError::Transport)?)?;
            if json {
                println!("{body}");
            } else {
                print_ping(&decode(&body)?);
            }
            Ok(())
        }
    }
}
