//! AxoGate server binary.
//!
//! Exposes one directory tree over a JSON file API and a WebDAV mount, with
//! path ACLs and optional Basic authentication in front of every protected
//! route. The main entry point builds the gateway context and router, then
//! starts the HTTP listener and, when requested, the HTTPS listener.

mod acl;
mod archive;
mod atomic;
mod auth;
mod config;
mod error;
mod etag;
mod files;
mod frontend;
mod http;
mod logging;
mod multistatus;
mod router;
mod search;
mod serve;
mod storage;
mod tls;
mod upload;
mod version;
mod webdav;

use axum_server::Handle;
use clap::Parser;
use hyper_util::rt::TokioTimer;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::config::{Args, GatewayContext, IDLE_TIMEOUT_SECS, SHUTDOWN_GRACE_SECS};

shadow!(build);

/// Starts the gateway and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let ctx = GatewayContext::from_args(&args).await?;
    let app = router::build_router(&ctx);

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        root = %ctx.storage.root_path().display(),
        upload = ctx.features.upload,
        delete = ctx.features.delete,
        webdav = ctx.features.webdav,
        auth = args.auth.is_some(),
        "serving directory"
    );
    if args.auth.is_none() {
        warn!("no --auth credential configured, protected routes are open");
    }
    info!("Starting HTTP server at {}", http_addr);

    let mut http_server = axum_server::bind(http_addr).handle(handle.clone());
    http_server
        .http_builder()
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(Duration::from_secs(IDLE_TIMEOUT_SECS));
    let http_server =
        http_server.serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    if args.https {
        let https_addr = SocketAddr::new(host, args.https_port);
        let tls_config = tls::build_rustls_config(&args, host).await?;
        info!("Starting HTTPS server at {}", https_addr);

        let mut https_server = axum_server::bind_rustls(https_addr, tls_config).handle(handle.clone());
        https_server
            .http_builder()
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(Duration::from_secs(IDLE_TIMEOUT_SECS));
        let https_server =
            https_server.serve(app.into_make_service_with_connect_info::<SocketAddr>());

        tokio::select! {
            result = http_server => result?,
            result = https_server => result?,
            _ = shutdown_signal(handle) => {}
        }
    } else {
        tokio::select! {
            result = http_server => result?,
            _ = shutdown_signal(handle) => {}
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
