// proxy-server/src/routes.rs
use actix_web::cookie::time::Duration as CookieDuration;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::http::header;
use actix_web::{get, web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use actix_web_actors::ws;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::http::{HeaderName as WsHeaderName, HeaderValue as WsHeaderValue};
use uuid::Uuid;

use crate::auth;
use crate::error::ProxyError;
use crate::forward;
use crate::relay::{RelaySession, UpstreamSocket};
use crate::upstream::is_ws_handshake_header;
use crate::ProxyState;

/// Health check, answered locally
#[get("/ping")]
pub async fn ping() -> impl Responder {
    HttpResponse::Ok().body("pong")
}

#[derive(Debug, Deserialize)]
pub struct InitializeParams {
    token: Option<String>,
}

/// Exchange a one-off token from the query string for a session cookie
#[get("/initialize")]
pub async fn initialize(
    query: web::Query<InitializeParams>,
    state: web::Data<ProxyState>,
) -> HttpResponse {
    let auth = &state.config.auth;

    let claims = match query.token.as_deref() {
        Some(token) => match state.verifier.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!("Initialize with invalid token: {}", e);
                return redirect(&auth.failure_redirect);
            }
        },
        None => {
            tracing::warn!("Initialize without token");
            return redirect(&auth.failure_redirect);
        }
    };

    let session_token = match state.signer.issue(&claims.netid, claims.session_id.as_deref()) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("Failed to issue session token for {}: {}", claims.netid, e);
            return redirect(&auth.failure_redirect);
        }
    };

    let cookie = Cookie::build(auth.cookie_name.clone(), session_token)
        .path("/")
        .http_only(true)
        .secure(auth.secure_cookie)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::hours(auth.session_ttl_hours))
        .finish();

    tracing::info!("Initialized IDE session for {}", claims.netid);

    HttpResponse::Found()
        .cookie(cookie)
        .insert_header((header::LOCATION, auth.landing_path.as_str()))
        .finish()
}

fn redirect(location: &str) -> HttpResponse {
    HttpResponse::Found()
        .insert_header((header::LOCATION, location))
        .finish()
}

/// Catch-all: check the session token, then forward as HTTP or WebSocket
pub async fn proxy(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<ProxyState>,
) -> Result<HttpResponse, actix_web::Error> {
    let conn_id = Uuid::new_v4();
    let websocket = is_websocket_upgrade(&req);

    let identity = auth::identify(&req, &state.verifier, &state.config.auth.cookie_name);
    tracing::info!(
        "[{}] {} {} {} identity={}",
        conn_id,
        if websocket { "WS" } else { "HTTP" },
        req.method(),
        req.path(),
        identity
    );

    if let Err(e) = auth::authorize(&identity, state.config.auth.mode) {
        tracing::warn!("[{}] Rejected: {}", conn_id, e);
        return Err(e.into());
    }

    if websocket {
        proxy_websocket(conn_id, req, payload, &state).await
    } else {
        forward::forward_http(conn_id, &req, payload, &state)
            .await
            .map_err(Into::into)
    }
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// Complete the handshake with the upstream first and only then upgrade the
/// client, so an unreachable upstream surfaces as an HTTP gateway error.
async fn proxy_websocket(
    conn_id: Uuid,
    req: HttpRequest,
    payload: web::Payload,
    state: &ProxyState,
) -> Result<HttpResponse, actix_web::Error> {
    // Reject malformed client handshakes before touching the upstream
    ws::handshake(&req)?;

    let (upstream, protocol) = connect_upstream(conn_id, &req, state).await?;

    let ws_config = &state.config.websocket;
    let session = RelaySession::new(
        conn_id,
        upstream,
        ws_config.heartbeat_interval(),
        ws_config.idle_timeout(),
        ws_config.max_pending_messages,
    );

    let protocols: Vec<&str> = protocol.as_deref().into_iter().collect();
    ws::WsResponseBuilder::new(session, &req, payload)
        .frame_size(ws_config.max_frame_size)
        .protocols(&protocols)
        .start()
}

async fn connect_upstream(
    conn_id: Uuid,
    req: &HttpRequest,
    state: &ProxyState,
) -> Result<(UpstreamSocket, Option<String>), ProxyError> {
    let url = state.upstream.ws_url(req.uri());
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

    let headers = req.headers();
    for (name, value) in headers.iter() {
        if is_ws_handshake_header(name, headers) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            WsHeaderName::from_bytes(name.as_str().as_bytes()),
            WsHeaderValue::from_bytes(value.as_bytes()),
        ) {
            request.headers_mut().append(name, value);
        }
    }

    let timeout = state.config.upstream.connect_timeout();
    let (socket, response) = match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(WsError::Http(response))) => {
            tracing::warn!(
                "[{}] Upstream refused websocket handshake: {}",
                conn_id,
                response.status()
            );
            return Err(ProxyError::UpstreamRejected(response.status().as_u16()));
        }
        Ok(Err(e)) => {
            tracing::warn!("[{}] Failed to connect to upstream websocket: {}", conn_id, e);
            return Err(ProxyError::UpstreamUnavailable(e.to_string()));
        }
        Err(_) => {
            tracing::warn!("[{}] Upstream websocket handshake timed out", conn_id);
            return Err(ProxyError::UpstreamTimeout);
        }
    };

    let protocol = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    tracing::debug!("[{}] Upstream websocket connected to {}", conn_id, url);
    Ok((socket, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::HeaderValue;
    use actix_web::test::TestRequest;

    #[test]
    fn test_upgrade_detection_is_case_insensitive() {
        let req = TestRequest::default()
            .insert_header(("upgrade", "WebSocket"))
            .to_http_request();
        assert!(is_websocket_upgrade(&req));

        let req = TestRequest::default()
            .insert_header(("upgrade", "h2c"))
            .to_http_request();
        assert!(!is_websocket_upgrade(&req));

        assert!(!is_websocket_upgrade(&TestRequest::default().to_http_request()));
    }

    #[test]
    fn test_redirect_sets_location() {
        let resp = redirect("https://example.com/error");
        assert_eq!(resp.status(), actix_web::http::StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION),
            Some(&HeaderValue::from_static("https://example.com/error"))
        );
    }
}
