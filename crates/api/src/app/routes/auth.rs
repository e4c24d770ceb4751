use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query},
    http::HeaderMap,
    response::IntoResponse,
    Extension, Json,
};

use crate::app::{
    dto::{LoginRateLimitQuery, RateLimitStatusResponse},
    errors,
    services::AppServices,
};

/// The address a request is attributed to.
///
/// `X-Forwarded-For` is only read when the socket peer is a trusted proxy.
/// Hops are walked right to left past other trusted proxies; the first
/// untrusted address is the client. Anything unparseable ends the walk and
/// the peer is used.
pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted: &[IpAddr]) -> Option<IpAddr> {
    let peer = peer?.ip();
    if !trusted.contains(&peer) {
        return Some(peer);
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .collect();

    for hop in hops.into_iter().rev() {
        match hop.trim().parse::<IpAddr>() {
            Ok(ip) if trusted.contains(&ip) => continue,
            Ok(ip) => return Some(ip),
            Err(_) => break,
        }
    }
    Some(peer)
}

/// Whether a login for `email` from this client would currently be refused.
///
/// 429 when limited, otherwise the current attempt count.
pub async fn login_status(
    Extension(services): Extension<Arc<AppServices>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<LoginRateLimitQuery>,
) -> axum::response::Response {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr), &services.trusted_proxies)
        .map(|ip| ip.to_string());
    let limiter = &services.auth_rate_limit;

    let key = match limiter.check_login_rate_limit(&query.email, ip.as_deref()).await {
        Ok(key) => key,
        Err(e) => return errors::rate_limit_error_to_response(e),
    };

    Json(RateLimitStatusResponse {
        attempts: limiter.limiter().attempts(&key).await.ok(),
        max_attempts: limiter.limiter().max_attempts(),
    })
    .into_response()
}
