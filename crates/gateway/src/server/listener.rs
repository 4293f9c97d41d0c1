//! Accept loops for the TLS listener and the plaintext redirector.
//!
//! For each accepted TCP connection the loop:
//! 1. Spawns a task, so a slow client never stalls the accept loop.
//! 2. Optionally completes the TLS handshake, bounded by the read timeout.
//! 3. Serves HTTP/1.1 or HTTP/2 on it with the router, recording the peer
//!    address as [`ConnectInfo`].
//!
//! A failed handshake or connection only ends that connection's task.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{body::Body, extract::ConnectInfo, Router};
use hyper::{body::Incoming, Request};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use rustls::ServerConfig;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Bound on the TLS handshake and on each set of request headers.
    pub read_timeout: Duration,
    /// Allow more than one request per connection.
    pub keep_alive: bool,
}

/// Serve `app` over TLS on `listener` until `shutdown` fires.
///
/// # Errors
///
/// Currently infallible once bound; accept errors are logged and skipped.
pub async fn serve_tls(
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    app: Router,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    info!(addr = ?listener.local_addr().ok(), "TLS listener accepting");

    while let Some((tcp, peer)) = accept(&listener, &shutdown).await {
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls = match tokio::time::timeout(limits.read_timeout, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(%peer, "TLS handshake timed out");
                    return;
                }
            };
            serve_connection(tls, peer, app, limits).await;
        });
    }

    info!("TLS listener stopped");
    Ok(())
}

/// Serve `app` over plaintext HTTP on `listener` until `shutdown` fires.
///
/// # Errors
///
/// Currently infallible once bound; accept errors are logged and skipped.
pub async fn serve_plain(
    listener: TcpListener,
    app: Router,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "plaintext listener accepting");

    while let Some((tcp, peer)) = accept(&listener, &shutdown).await {
        let app = app.clone();
        tokio::spawn(serve_connection(tcp, peer, app, limits));
    }

    info!("plaintext listener stopped");
    Ok(())
}

/// Next connection, or `None` once `shutdown` fires.
async fn accept(
    listener: &TcpListener,
    shutdown: &CancellationToken,
) -> Option<(TcpStream, SocketAddr)> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    debug!(%peer, "accepted TCP connection");
                    return Some((tcp, peer));
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    // Typically EMFILE; back off instead of spinning.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}

async fn serve_connection<I>(io: I, peer: SocketAddr, app: Router, limits: ConnectionLimits)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        app.clone().oneshot(request.map(Body::new))
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.read_timeout)
        .keep_alive(limits.keep_alive);

    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
    {
        warn!(%peer, error = %e, "connection error");
    }
}
