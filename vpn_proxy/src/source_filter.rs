//! Origin filtering in front of every route: requests from outside the
//! configured source networks get a 404, indistinguishable from a miss.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ipnetwork::Ipv4Network;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Clone)]
pub struct SourceCidrs(pub Arc<Vec<Ipv4Network>>);

impl SourceCidrs {
    pub fn new(cidrs: &[Ipv4Network]) -> Self {
        SourceCidrs(Arc::new(cidrs.to_vec()))
    }

    fn permits(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => self.0.iter().any(|net| net.contains(ip)),
            IpAddr::V6(_) => false,
        }
    }
}

pub async fn filter(
    State(cidrs): State<SourceCidrs>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if cidrs.permits(peer.ip()) {
        next.run(request).await
    } else {
        tracing::error!(source = %peer.ip(), "connection attempt from unauthorized source");
        StatusCode::NOT_FOUND.into_response()
    }
}
