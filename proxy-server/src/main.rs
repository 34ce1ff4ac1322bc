// proxy-server/src/main.rs
use std::io;
use std::net::TcpListener;

use proxy_common::{setup_tracing, Config};

#[actix_web::main]
async fn main() -> io::Result<()> {
    setup_tracing();

    // No fallback: a missing or placeholder secret must stop the process.
    let config = Config::load().map_err(|e| {
        tracing::error!("Invalid configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e)
    })?;

    tracing::info!(
        "Upstream {} (connect timeout {:?}), auth mode {}, cookie `{}`",
        config.upstream.authority(),
        config.upstream.connect_timeout(),
        config.auth.mode,
        config.auth.cookie_name
    );
    tracing::info!("Database {:?}", config.database);

    let listener = TcpListener::bind(&config.listen_addr)?;
    tracing::info!("Starting IDE proxy on {}", config.listen_addr);

    proxy_server::build_server(config, listener)?.await
}
