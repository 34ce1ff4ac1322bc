// proxy-server/src/forward.rs
//! HTTP forwarding to the upstream. Request and response bodies are
//! streamed chunk by chunk in both directions.

use std::io;
use std::time::Duration;

use actix_web::body::SizedStream;
use actix_web::http::header::{self, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::upstream::{is_hop_by_hop, is_hop_by_hop_name};
use crate::ProxyState;

/// Chunks of request body buffered between the client and the upstream
const REQUEST_BODY_BUFFER: usize = 16;

/// Build the pooled client used for every upstream request
pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
}

/// Forward one HTTP request and stream the upstream response back
pub async fn forward_http(
    conn_id: Uuid,
    req: &HttpRequest,
    payload: web::Payload,
    state: &ProxyState,
) -> Result<HttpResponse, ProxyError> {
    let url = state.upstream.http_url(req.uri());
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| ProxyError::BadRequest(format!("unsupported method {}", req.method())))?;

    let mut request = state
        .client
        .request(method, url)
        .headers(request_headers(req));

    let idle = state.config.upstream.body_idle_timeout();
    let mut uploaded = None;
    if has_body(req) {
        let (body, done) = stream_payload(conn_id, payload, idle);
        request = request.body(body);
        uploaded = Some(done);
    }

    // The response deadline starts once the request body has been sent,
    // however long the upload itself takes.
    let timeout = state.config.upstream.response_timeout();
    let send = request.send();
    tokio::pin!(send);
    let outcome = match uploaded {
        Some(mut done) => tokio::select! {
            result = &mut send => Ok(result),
            _ = &mut done => tokio::time::timeout(timeout, &mut send).await,
        },
        None => tokio::time::timeout(timeout, &mut send).await,
    };

    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::warn!("[{}] Upstream request failed: {}", conn_id, e);
            return Err(ProxyError::from_reqwest(e));
        }
        Err(_) => {
            tracing::warn!("[{}] Upstream did not respond within {:?}", conn_id, timeout);
            return Err(ProxyError::UpstreamTimeout);
        }
    };

    tracing::debug!("[{}] Upstream responded {}", conn_id, response.status());
    Ok(relay_response(conn_id, response, idle))
}

/// Copy end-to-end headers into the upstream request and append the
/// client address to `X-Forwarded-For`.
fn request_headers(req: &HttpRequest) -> reqwest::header::HeaderMap {
    let headers = req.headers();
    let mut forwarded = reqwest::header::HeaderMap::with_capacity(headers.len() + 1);

    for (name, value) in headers.iter() {
        if is_hop_by_hop(name, headers) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            forwarded.append(name, value);
        }
    }

    if let Some(peer) = req.peer_addr() {
        let mut chain: Vec<String> = headers
            .get_all("x-forwarded-for")
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        chain.push(peer.ip().to_string());
        let chain = chain.join(", ");
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&chain) {
            forwarded.insert("x-forwarded-for", value);
        }
    }

    forwarded
}

fn has_body(req: &HttpRequest) -> bool {
    let headers = req.headers();
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(false, |len| len > 0)
}

/// Pump the client's request body into a channel the upstream request
/// reads from. The payload is tied to the worker thread, the upstream
/// body must be `Send`.
///
/// The returned receiver resolves once the whole body has been handed
/// over. It errors instead if the pump gave up: client error, client
/// silent for `idle`, or upstream no longer reading.
fn stream_payload(
    conn_id: Uuid,
    mut payload: web::Payload,
    idle: Duration,
) -> (reqwest::Body, oneshot::Receiver<()>) {
    let (tx, rx) = mpsc::channel::<Result<web::Bytes, io::Error>>(REQUEST_BODY_BUFFER);
    let (done_tx, done_rx) = oneshot::channel();

    actix_web::rt::spawn(async move {
        loop {
            let chunk = match tokio::time::timeout(idle, payload.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    tracing::warn!("[{}] Client body error: {}", conn_id, e);
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())))
                        .await;
                    return;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("[{}] Client body stalled for {:?}", conn_id, idle);
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::TimedOut, "client body stalled")))
                        .await;
                    return;
                }
            };
            if tx.send(Ok(chunk)).await.is_err() {
                return;
            }
        }
        let _ = done_tx.send(());
    });

    (reqwest::Body::wrap_stream(ReceiverStream::new(rx)), done_rx)
}

fn relay_response(conn_id: Uuid, response: reqwest::Response, idle: Duration) -> HttpResponse {
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let upstream_headers = response.headers();
    let mut builder = HttpResponse::build(status);

    let content_length = upstream_headers
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    for (name, value) in upstream_headers.iter() {
        let (name, value) = match (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            (Ok(name), Ok(value)) => (name, value),
            _ => continue,
        };
        // actix writes content-length itself from the body size
        if name == header::CONTENT_LENGTH || is_upstream_hop_by_hop(&name, upstream_headers) {
            continue;
        }
        builder.append_header((name, value));
    }

    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return builder.finish();
    }

    let body = body_stream(conn_id, response, idle);
    match content_length {
        Some(len) => builder.body(SizedStream::new(len, body)),
        None => builder.streaming(body),
    }
}

fn is_upstream_hop_by_hop(name: &HeaderName, headers: &reqwest::header::HeaderMap) -> bool {
    is_hop_by_hop_name(
        name.as_str(),
        headers
            .get_all(reqwest::header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    )
}

/// Upstream body as a stream that fails once no chunk arrives for `idle`,
/// which aborts the client connection instead of leaving it hanging.
fn body_stream(
    conn_id: Uuid,
    response: reqwest::Response,
    idle: Duration,
) -> impl Stream<Item = Result<web::Bytes, io::Error>> + 'static {
    tokio_stream::StreamExt::timeout(response.bytes_stream(), idle).map(move |item| match item {
        Ok(Ok(chunk)) => Ok(chunk),
        Ok(Err(e)) => {
            tracing::warn!("[{}] Upstream body error: {}", conn_id, e);
            Err(io::Error::new(io::ErrorKind::Other, e))
        }
        Err(_) => {
            tracing::warn!("[{}] Upstream body stalled for {:?}", conn_id, idle);
            Err(io::Error::new(io::ErrorKind::TimedOut, "upstream body stalled"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_request_headers_skip_hop_by_hop() {
        let req = TestRequest::default()
            .insert_header(("cookie", "token=abc"))
            .insert_header(("connection", "upgrade, x-internal"))
            .insert_header(("x-internal", "1"))
            .insert_header(("transfer-encoding", "chunked"))
            .peer_addr("10.0.0.7:4321".parse().unwrap())
            .to_http_request();

        let headers = request_headers(&req);
        assert_eq!(headers.get("cookie").unwrap(), "token=abc");
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-internal").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.7");
    }

    #[test]
    fn test_forwarded_for_chain_is_extended() {
        let req = TestRequest::default()
            .insert_header(("x-forwarded-for", "203.0.113.9"))
            .peer_addr("10.0.0.7:4321".parse().unwrap())
            .to_http_request();

        let headers = request_headers(&req);
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9, 10.0.0.7");
    }

    #[test]
    fn test_repeated_forwarded_for_headers_are_joined() {
        let req = TestRequest::default()
            .append_header(("x-forwarded-for", "203.0.113.9"))
            .append_header(("x-forwarded-for", "198.51.100.4, 192.0.2.1"))
            .peer_addr("10.0.0.7:4321".parse().unwrap())
            .to_http_request();

        let headers = request_headers(&req);
        assert_eq!(headers.get_all("x-forwarded-for").iter().count(), 1);
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "203.0.113.9, 198.51.100.4, 192.0.2.1, 10.0.0.7"
        );
    }

    #[test]
    fn test_upstream_hop_by_hop_headers_are_dropped() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONNECTION,
            reqwest::header::HeaderValue::from_static("x-upstream-hint"),
        );

        assert!(is_upstream_hop_by_hop(&header::TRANSFER_ENCODING, &headers));
        assert!(is_upstream_hop_by_hop(&HeaderName::from_static("x-upstream-hint"), &headers));
        assert!(!is_upstream_hop_by_hop(&header::CONTENT_TYPE, &headers));
    }

    #[test]
    fn test_body_detection() {
        let empty = TestRequest::default().to_http_request();
        assert!(!has_body(&empty));

        let zero = TestRequest::default()
            .insert_header(("content-length", "0"))
            .to_http_request();
        assert!(!has_body(&zero));

        let sized = TestRequest::default()
            .insert_header(("content-length", "12"))
            .to_http_request();
        assert!(has_body(&sized));

        let chunked = TestRequest::default()
            .insert_header(("transfer-encoding", "chunked"))
            .to_http_request();
        assert!(has_body(&chunked));
    }
}
