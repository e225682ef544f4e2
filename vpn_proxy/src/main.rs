use axum::ServiceExt;
use axum::extract::Request;
use tokio::net::TcpListener;
use tower::Layer;
use tower_http::normalize_path::NormalizePathLayer;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use vpn_proxy_lib::command::SystemCommands;
use vpn_proxy_lib::engine::Engine;
use vpn_proxy_lib::store::Store;
use vpn_proxy_lib::{logging, settings};

mod api;
mod cli;
mod source_filter;

use api::AppEngine;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = run(args).await;

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }

    process::exit(exit)
}

async fn run(args: cli::Cli) -> exitcode::ExitCode {
    let mut settings = match settings::read(&args.config_path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, config_file = %args.config_path.display(), "cannot read configuration");
            return exitcode::CONFIG;
        }
    };
    if let Some(listen) = args.listen {
        settings.listen_addr = listen;
    }
    if let Some(database) = args.database {
        settings.database_path = database;
    }

    let store = match Store::open(&settings.database_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, database = %settings.database_path.display(), "cannot open database");
            return exitcode::CANTCREAT;
        }
    };

    let engine = Arc::new(Engine::new(settings.clone(), SystemCommands, store));

    if !args.no_reset {
        let reset_engine = engine.clone();
        match tokio::task::spawn_blocking(move || reset_engine.reset_all()).await {
            Ok(Ok(0)) => tracing::info!("persisted tunnels re-converged"),
            Ok(Ok(failures)) => tracing::warn!(failures, "some tunnels failed to re-converge"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "boot-time reconciliation failed");
                return exitcode::OSERR;
            }
            Err(e) => {
                tracing::error!(error = %e, "boot-time reconciliation panicked");
                return exitcode::SOFTWARE;
            }
        }
    }

    spawn_sweeper(engine.clone(), settings.sweep_interval, settings.retention_ttl);

    let app = api::router(engine, &settings);
    let app = NormalizePathLayer::trim_trailing_slash().layer(app);

    let listener = match TcpListener::bind(settings.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %settings.listen_addr, "cannot bind listen address");
            return exitcode::UNAVAILABLE;
        }
    };
    tracing::info!(addr = %settings.listen_addr, "listening");

    let service = ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(app);
    match axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        Ok(()) => exitcode::OK,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            exitcode::IOERR
        }
    }
}

/// Periodic retention: disable forwardings nobody touched within the TTL.
fn spawn_sweeper(engine: Arc<AppEngine>, interval: Duration, ttl: Duration) {
    if interval.is_zero() {
        tracing::warn!("sweep interval is zero, retention sweeper disabled");
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it, the boot reset just ran
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sweep_engine = engine.clone();
            match tokio::task::spawn_blocking(move || sweep_engine.retain(ttl, None)).await {
                Ok(Ok(0)) => tracing::debug!("retention sweep found nothing stale"),
                Ok(Ok(disabled)) => tracing::info!(disabled, "retention sweep disabled stale forwardings"),
                Ok(Err(e)) => tracing::error!(error = %e, "retention sweep failed"),
                Err(e) => tracing::error!(error = %e, "retention sweep panicked"),
            }
        }
    });
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("initiate shutdown"),
        Err(e) => tracing::error!(error = %e, "cannot listen for shutdown signal"),
    }
}
