//! The `/api/ip` geolocation proxy.
//!
//! Guesses the caller's address from proxy headers (or, for a bare local
//! request, the socket peer), resolves it through the public geolocation
//! service and hands the payload back untouched. Requests that come from this
//! machine are first translated to our public address; when even that fails
//! the caller gets a fixed New York answer instead.

use crate::api::GeoProvider;
use crate::models::{ErrorBody, LocalhostFallback, ProxyResponse};
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use color_eyre::eyre::{eyre, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Address used when no proxy header names the client.
pub const PLACEHOLDER_IP: &str = "8.8.8.8";

/// Headers consulted in order. Only `x-forwarded-for` may carry a list.
const CLIENT_IP_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-real-ip",
    "x-vercel-forwarded-for",
    "cf-connecting-ip",
];

fn forwarded_ip(headers: &HeaderMap) -> Option<&str> {
    CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name).and_then(|h| h.to_str().ok()))
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find(|ip| !ip.is_empty())
}

/// Best guess at the client address from proxy headers.
pub fn resolve_client_ip(headers: &HeaderMap) -> String {
    forwarded_ip(headers).unwrap_or(PLACEHOLDER_IP).to_string()
}

/// Like [`resolve_client_ip`], but a request with no proxy headers that
/// arrived over loopback is reported as coming from this machine. Remote
/// peers without headers still get the placeholder.
pub fn resolve_request_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    if let Some(ip) = forwarded_ip(headers) {
        return ip.to_string();
    }
    peer.map(|p| p.to_canonical().to_string())
        .filter(|ip| is_loopback(ip))
        .unwrap_or_else(|| PLACEHOLDER_IP.to_string())
}

pub fn is_loopback(ip: &str) -> bool {
    ip == "::1" || ip == "127.0.0.1"
}

/// Everything `/api/ip` can answer.
#[derive(Debug)]
pub enum ProxyOutcome {
    Located(ProxyResponse),
    LocalhostFallback(LocalhostFallback),
    Failed,
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        match self {
            ProxyOutcome::Located(body) => Json(body).into_response(),
            ProxyOutcome::LocalhostFallback(body) => Json(body).into_response(),
            ProxyOutcome::Failed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "Could not fetch geolocation".to_string(),
                }),
            )
                .into_response(),
        }
    }
}

/// Runs the lookup for one request. Never fails: every error becomes an
/// outcome.
pub async fn locate(
    provider: &GeoProvider,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
) -> ProxyOutcome {
    let mut ip = resolve_request_ip(headers, peer);

    if is_loopback(&ip) {
        info!("Detected localhost, trying to get public IP...");
        match provider.fetch_public_ip().await {
            Ok(public_ip) => {
                info!("Public IP found: {}", public_ip);
                ip = public_ip;
            }
            Err(e) => {
                warn!("{}. Falling back to default NYC coords.", e);
                return ProxyOutcome::LocalhostFallback(LocalhostFallback::default());
            }
        }
    }

    match provider.lookup(&ip).await {
        Ok(location) => {
            info!("Geolocation for {}: {}", ip, location);
            ProxyOutcome::Located(ProxyResponse { ip, location })
        }
        Err(e) => {
            error!("{} (ip {})", e, ip);
            ProxyOutcome::Failed
        }
    }
}

async fn ip_handler(
    State(provider): State<GeoProvider>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ProxyOutcome {
    let peer = peer.map(|ConnectInfo(addr)| addr.ip());
    locate(&provider, &headers, peer).await
}

pub fn router(provider: GeoProvider) -> Router {
    Router::new()
        .route("/api/ip", get(ip_handler))
        .with_state(provider)
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| eyre!("Failed to bind proxy to {}: {}", addr, e))
}

/// Serves the proxy until the listener fails.
pub async fn serve(listener: TcpListener, provider: GeoProvider) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Geolocation proxy listening on http://{}/api/ip", addr);
    }

    axum::serve(
        listener,
        router(provider).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
        .map_err(|e| eyre!("Proxy server error: {}", e))
}
