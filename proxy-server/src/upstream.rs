// proxy-server/src/upstream.rs
//! Addressing of the fixed upstream and the header rules shared by the
//! HTTP and WebSocket paths.

use actix_web::http::header::{HeaderMap, HeaderName, CONNECTION};
use actix_web::http::Uri;
use proxy_common::UpstreamConfig;
use url::Url;

/// Headers that describe a single hop and are never forwarded (RFC 7230 §6.1)
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handshake headers the WebSocket client library generates itself
const WS_HANDSHAKE: &[&str] = &[
    "host",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

/// Base URLs of the upstream, fixed at startup
#[derive(Debug, Clone)]
pub struct Upstream {
    http_base: Url,
    ws_base: Url,
}

impl Upstream {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, url::ParseError> {
        let authority = config.authority();
        Ok(Self {
            http_base: Url::parse(&format!("http://{}/", authority))?,
            ws_base: Url::parse(&format!("ws://{}/", authority))?,
        })
    }

    /// Target URL for an HTTP request. Only path and query are taken from
    /// the inbound request; scheme, host and port never are.
    pub fn http_url(&self, uri: &Uri) -> Url {
        Self::join(&self.http_base, uri)
    }

    pub fn ws_url(&self, uri: &Uri) -> Url {
        Self::join(&self.ws_base, uri)
    }

    fn join(base: &Url, uri: &Uri) -> Url {
        let mut url = base.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url
    }
}

/// Whether `name` must be dropped when crossing the proxy, either because
/// it is hop-by-hop or because the `Connection` header lists it.
pub fn is_hop_by_hop(name: &HeaderName, headers: &HeaderMap) -> bool {
    is_hop_by_hop_name(
        name.as_str(),
        headers.get_all(CONNECTION).filter_map(|value| value.to_str().ok()),
    )
}

/// Same rule over raw `Connection` values, for header maps of the upstream
/// client as well as the inbound request.
pub(crate) fn is_hop_by_hop_name<'a, I>(name: &str, connection: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    HOP_BY_HOP.contains(&name)
        || connection
            .into_iter()
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case(name))
}

/// Whether a header must be left out of the forwarded WebSocket handshake
pub fn is_ws_handshake_header(name: &HeaderName, headers: &HeaderMap) -> bool {
    WS_HANDSHAKE.contains(&name.as_str()) || is_hop_by_hop(name, headers)
}
