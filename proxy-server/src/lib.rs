// proxy-server/src/lib.rs
//! Authenticating reverse proxy in front of the Cloud IDE backend.
//!
//! Requests carry a signed session token in a cookie. The proxy checks it,
//! then forwards plain HTTP and WebSocket upgrades to a single upstream.

pub mod auth;
pub mod error;
pub mod forward;
pub mod middleware;
pub mod relay;
pub mod routes;
pub mod upstream;

use std::io;
use std::net::TcpListener;

use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use proxy_common::{Config, TokenSigner, TokenVerifier};

use crate::middleware::AccessLog;
use crate::upstream::Upstream;

/// Read-only state shared by every connection handler
pub struct ProxyState {
    pub config: Config,
    pub verifier: TokenVerifier,
    pub signer: TokenSigner,
    pub upstream: Upstream,
    pub client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: Config) -> io::Result<Self> {
        let upstream = Upstream::from_config(&config.upstream)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let client = forward::build_client(config.upstream.connect_timeout())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(Self {
            verifier: TokenVerifier::from_config(&config.auth),
            signer: TokenSigner::from_config(&config.auth),
            upstream,
            client,
            config,
        })
    }
}

/// Build the proxy server on an already bound listener
pub fn build_server(config: Config, listener: TcpListener) -> io::Result<Server> {
    let workers = config.workers;
    let state = web::Data::new(ProxyState::new(config)?);

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(AccessLog)
            .service(routes::ping)
            .service(routes::initialize)
            .default_service(web::to(routes::proxy))
    })
    .listen(listener)?;

    if workers > 0 {
        server = server.workers(workers);
    }

    Ok(server.run())
}
