//! The HTTP surface over the engine. Handlers stay thin: decode the
//! request, hop onto a blocking thread for the engine call, map errors to
//! status codes. 5xx bodies never carry key material or paths; the detail
//! goes to the log.

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use ipnetwork::Ipv4Network;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use vpn_proxy_lib::command::SystemCommands;
use vpn_proxy_lib::engine::{Engine, Error as EngineError};
use vpn_proxy_lib::model::TunnelDict;
use vpn_proxy_lib::ping;
use vpn_proxy_lib::settings::Settings;

use crate::source_filter::{self, SourceCidrs};

pub type AppEngine = Engine<SystemCommands>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AppEngine>,
}

pub fn router(engine: Arc<AppEngine>, settings: &Settings) -> Router {
    Router::new()
        .route("/", get(list_tunnels).post(create_tunnel))
        .route("/:id", get(get_tunnel).post(enable_tunnel).delete(delete_tunnel))
        .route("/:id/client_script", get(client_script))
        .route("/:id/forwardings/:dst/:port", get(ensure_forwarding))
        .route("/:id/ping", get(ping_client))
        .route("/:id/ping/:target", get(ping_target))
        .layer(middleware::from_fn_with_state(
            SourceCidrs::new(&settings.source_cidrs),
            source_filter::filter,
        ))
        .with_state(AppState { engine })
}

pub enum ApiError {
    BadRequest(String),
    Engine(EngineError),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Engine(EngineError::Validation(e)) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Engine(EngineError::NotFound) => (StatusCode::NOT_FOUND, "Not Found".to_string()),
            ApiError::Engine(EngineError::Alloc(e)) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Engine(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            ApiError::Internal(detail) => {
                tracing::error!(%detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, body).into_response()
    }
}

/// Engine calls block on child processes and SQLite, so they run off the
/// async worker threads.
async fn blocking<T, F>(engine: Arc<AppEngine>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppEngine) -> Result<T, EngineError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&engine)).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError::Internal(format!("engine task failed: {e}"))),
    }
}

async fn list_tunnels(State(state): State<AppState>) -> Result<Json<Vec<TunnelDict>>, ApiError> {
    let dicts = blocking(state.engine, |engine| {
        let tunnels = engine.list_tunnels()?;
        Ok(tunnels.iter().map(|t| t.to_dict(engine.settings())).collect::<Vec<_>>())
    })
    .await?;
    Ok(Json(dicts))
}

async fn create_tunnel(State(state): State<AppState>, body: String) -> Result<Json<TunnelDict>, ApiError> {
    let (cidrs, excluded) = parse_form_cidrs(&body)?;
    let dict = blocking(state.engine, move |engine| {
        let tunnel = engine.create_tunnel(&cidrs, &excluded)?;
        Ok(tunnel.to_dict(engine.settings()))
    })
    .await?;
    Ok(Json(dict))
}

async fn get_tunnel(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<TunnelDict>, ApiError> {
    let dict = blocking(state.engine, move |engine| {
        Ok(engine.get_tunnel(id)?.to_dict(engine.settings()))
    })
    .await?;
    Ok(Json(dict))
}

async fn enable_tunnel(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<TunnelDict>, ApiError> {
    let dict = blocking(state.engine, move |engine| {
        Ok(engine.enable_tunnel(id)?.to_dict(engine.settings()))
    })
    .await?;
    Ok(Json(dict))
}

async fn delete_tunnel(State(state): State<AppState>, Path(id): Path<i64>) -> Result<&'static str, ApiError> {
    blocking(state.engine, move |engine| engine.delete_tunnel(id)).await?;
    Ok("OK")
}

async fn client_script(State(state): State<AppState>, Path(id): Path<i64>) -> Result<String, ApiError> {
    blocking(state.engine, move |engine| engine.client_script(id)).await
}

async fn ensure_forwarding(
    State(state): State<AppState>,
    Path((id, dst_addr, dst_port)): Path<(i64, String, u16)>,
) -> Result<String, ApiError> {
    let dst_addr: Ipv4Addr = dst_addr
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid destination address `{dst_addr}`")))?;
    let loc_port = blocking(state.engine, move |engine| {
        engine.ensure_forwarding(id, dst_addr, dst_port)
    })
    .await?;
    Ok(loc_port.to_string())
}

async fn ping_client(
    state: State<AppState>,
    Path(id): Path<i64>,
    query: Query<HashMap<String, String>>,
) -> Result<Json<ping::Report>, ApiError> {
    run_ping(state, id, None, query).await
}

async fn ping_target(
    state: State<AppState>,
    Path((id, target)): Path<(i64, String)>,
    query: Query<HashMap<String, String>>,
) -> Result<Json<ping::Report>, ApiError> {
    run_ping(state, id, Some(target), query).await
}

async fn run_ping(
    State(state): State<AppState>,
    id: i64,
    target: Option<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<ping::Report>, ApiError> {
    let packets = match query.get("pkts").map(|raw| (raw, raw.parse::<u32>())) {
        Some((_, Ok(n))) => n,
        Some((raw, Err(e))) => {
            tracing::warn!(pkts = %raw, error = %e, "couldn't parse pkts param, using default");
            ping::DEFAULT_PACKETS
        }
        None => ping::DEFAULT_PACKETS,
    };
    let report = blocking(state.engine, move |engine| {
        engine.ping(id, target.as_deref(), packets)
    })
    .await?;
    Ok(Json(report))
}

/// Decode the form body: repeated `cidrs`/`excluded` keys, with or
/// without the `[]` suffix some clients append.
fn parse_form_cidrs(body: &str) -> Result<(Vec<Ipv4Network>, Vec<Ipv4Network>), ApiError> {
    let mut cidrs = Vec::new();
    let mut excluded = Vec::new();
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        let target = match key.as_ref() {
            "cidrs" | "cidrs[]" => &mut cidrs,
            "excluded" | "excluded[]" => &mut excluded,
            _ => continue,
        };
        let net = value
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid network `{value}`")))?;
        target.push(net);
    }
    Ok((cidrs, excluded))
}
