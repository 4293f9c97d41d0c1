//! `gateway`: HTTPS front door entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (OTEL + tracing).
//! 3. Start the plaintext redirector, which also answers ACME challenges.
//! 4. Load or provision the TLS certificate; spawn the renewal task.
//! 5. Generate the server key pair and open the identity store.
//! 6. Build the router behind the security pipeline.
//! 7. Serve TLS until Ctrl-C.

mod config;
mod crypto;
mod login;
mod redirect;
mod server;
mod telemetry;
mod tls;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use common::{GatewayError, IdentityKeypair};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Config;
use crypto::SealedBoxCrypto;
use login::{FileIdentityStore, IdentityStore, LoginService, MemoryIdentityStore, OsRngTokens};
use server::{
    listener::{self, ConnectionLimits},
    middleware::{Pipeline, WarrantFlag},
    proxy::ReverseProxy,
    router::{self, RouterSettings},
    spa::SpaIndex,
    state::AppState,
};
use tls::{AcmeIssuer, CertCache, CertificateManager, ChallengeTokens};

/// How often the background task checks whether the certificate is due.
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %cfg.domain,
        https_port = cfg.https_port,
        http_port = cfg.http_port,
        "gateway starting"
    );

    // The ACME and backend clients build their own rustls configs; pin the
    // process default to ring. Err only means one is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let shutdown = CancellationToken::new();
    let challenges = ChallengeTokens::new();

    // -----------------------------------------------------------------------
    // 3. Plaintext redirector
    // -----------------------------------------------------------------------
    let http_addr = cfg.listen_addr(cfg.http_port)?;
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind redirector on {http_addr}"))?;
    info!(addr = %http_addr, "redirector listening");
    let redirector = tokio::spawn(listener::serve_plain(
        http_listener,
        redirect::router(
            &cfg.domain,
            cfg.https_port,
            challenges.clone(),
            cfg.redirect_timeout(),
        ),
        ConnectionLimits {
            read_timeout: cfg.redirect_timeout(),
            keep_alive: false,
        },
        shutdown.clone(),
    ));

    // -----------------------------------------------------------------------
    // 4. Certificate
    // -----------------------------------------------------------------------
    let certificates = Arc::new(certificate_manager(&cfg, &challenges).await?);
    certificates
        .bootstrap()
        .await
        .map_err(GatewayError::from)
        .context("no certificate available; refusing to start")?;
    let renewal = certificates
        .clone()
        .renewal_task(RENEWAL_CHECK_INTERVAL, shutdown.clone());
    let tls_config = tls::policy::build_server_config(certificates.clone())
        .context("failed to build TLS configuration")?;

    // -----------------------------------------------------------------------
    // 5. Login service
    // -----------------------------------------------------------------------
    let server_keys =
        Arc::new(IdentityKeypair::generate().context("failed to generate server key pair")?);
    let store: Arc<dyn IdentityStore> = match &cfg.identity_store_path {
        Some(path) => {
            let store = FileIdentityStore::open(path)
                .await
                .with_context(|| format!("failed to open identity store {path}"))?;
            info!(path = %path, records = store.len().await, "identity store opened");
            Arc::new(store)
        }
        None => {
            warn!("IDENTITY_STORE_PATH unset; login records are kept in memory only");
            Arc::new(MemoryIdentityStore::new())
        }
    };
    let login = Arc::new(LoginService::new(
        Arc::new(SealedBoxCrypto),
        store,
        Arc::new(OsRngTokens),
        server_keys,
    ));
    info!(server_identity = %login.server_identity(), "login service ready");

    // -----------------------------------------------------------------------
    // 6. Router
    // -----------------------------------------------------------------------
    let warrant = WarrantFlag::new(cfg.warrant_received);
    #[cfg(unix)]
    raise_warrant_on_sigusr1(warrant.clone())?;

    let credentials = cfg.basic_credentials();
    if credentials.is_some() {
        info!("basic auth gate enabled for backend and static routes");
    }
    let settings = RouterSettings {
        spa: SpaIndex::new(cfg.index_path(), cfg.spa_prefixes.clone()),
        proxy: ReverseProxy::new(&cfg.backend_uri()?)?,
        proxy_prefix: cfg.backend_proxy_prefix.clone(),
        asset_dir: PathBuf::from(&cfg.asset_dir),
        credentials,
        pipeline: Pipeline::security(&cfg.domain, warrant)?,
        request_timeout: cfg.write_timeout(),
    };
    let state = AppState::new(login, cfg.identity_header.as_str(), challenges);
    let app = router::build(state, settings);

    // -----------------------------------------------------------------------
    // 7. TLS server
    // -----------------------------------------------------------------------
    let https_addr = cfg.listen_addr(cfg.https_port)?;
    let https_listener = TcpListener::bind(https_addr)
        .await
        .with_context(|| format!("failed to bind TLS listener on {https_addr}"))?;
    info!(addr = %https_addr, "listening");

    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));
    listener::serve_tls(
        https_listener,
        tls_config,
        app,
        ConnectionLimits {
            read_timeout: cfg.read_timeout(),
            keep_alive: true,
        },
        shutdown,
    )
    .await?;

    redirector.await??;
    renewal.await?;
    info!("gateway stopped");
    Ok(())
}

/// Static PEM mode when both paths are configured, ACME otherwise.
async fn certificate_manager(
    cfg: &Config,
    challenges: &ChallengeTokens,
) -> Result<CertificateManager> {
    if let (Some(cert_path), Some(key_path)) = (&cfg.tls_cert_path, &cfg.tls_key_path) {
        let chain = tokio::fs::read(cert_path)
            .await
            .with_context(|| format!("failed to read TLS_CERT_PATH {cert_path}"))?;
        let key = tokio::fs::read(key_path)
            .await
            .with_context(|| format!("failed to read TLS_KEY_PATH {key_path}"))?;
        info!(cert = %cert_path, "using static certificate");
        return Ok(CertificateManager::with_static_pem(&cfg.domain, &chain, &key)?);
    }

    let cache = CertCache::new(cfg.cert_cache_dir());
    let issuer = AcmeIssuer::new(
        &cfg.acme_directory_url,
        cfg.acme_contact_email.clone(),
        cache.clone(),
        challenges.clone(),
    );
    info!(
        directory = %cfg.acme_directory_url,
        cache = %cfg.cert_cache_dir().display(),
        "using ACME certificates"
    );
    Ok(CertificateManager::with_acme(
        &cfg.domain,
        Arc::new(issuer),
        cache,
        cfg.renew_before(),
    ))
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => warn!(error = %e, "failed to listen for Ctrl-C; shutting down"),
    }
    shutdown.cancel();
}

/// `SIGUSR1` withdraws the warrant canary for the rest of the process life.
#[cfg(unix)]
fn raise_warrant_on_sigusr1(flag: WarrantFlag) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signals =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            flag.raise();
            warn!("warrant canary withdrawn");
        }
    });
    Ok(())
}
