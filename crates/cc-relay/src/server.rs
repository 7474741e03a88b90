//! Process wiring for the relay HTTP surface: owns the
//! store, rate limiter, metrics registry and code sender, builds the axum
//! router from [`crate::api`], and drives graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{AppState, CodeSender, LoggingCodeSender};
use crate::config::RelaySettings;
use crate::metrics::RelayMetrics;
use crate::rate_limit::RelayRateLimiter;
use crate::store::SqliteStore;

pub struct RelayServer {
    settings: Arc<RelaySettings>,
    store: SqliteStore,
    limiter: Arc<RelayRateLimiter>,
    metrics: Arc<RelayMetrics>,
    code_sender: Arc<dyn CodeSender>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(settings: RelaySettings) -> anyhow::Result<Self> {
        settings.validate()?;

        let store = SqliteStore::open(&settings.db_path)?;
        for bootstrap in &settings.admin_bootstrap {
            store.add_admin(&bootstrap.agent, &bootstrap.admin_public_key)?;
        }

        let limiter = Arc::new(RelayRateLimiter::new(settings.rate_limit.clone()));
        let metrics = Arc::new(RelayMetrics::new()?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            settings: Arc::new(settings),
            store,
            limiter,
            metrics,
            code_sender: Arc::new(LoggingCodeSender),
            shutdown_tx,
        })
    }

    /// Overrides the default logging-only code dispatcher, the external
    /// email-sender interface. The host application wires a real sender in
    /// before calling [`RelayServer::start`].
    pub fn with_code_sender(mut self, sender: Arc<dyn CodeSender>) -> Self {
        self.code_sender = sender;
        self
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let state = AppState {
            store: self.store.clone(),
            limiter: Arc::clone(&self.limiter),
            metrics: Arc::clone(&self.metrics),
            settings: Arc::clone(&self.settings),
            code_sender: Arc::clone(&self.code_sender),
        };

        let app = crate::api::router(state);
        let shutdown_rx = self.shutdown_tx.subscribe();

        if let (Some(cert_path), Some(key_path)) =
            (&self.settings.tls_cert_path, &self.settings.tls_key_path)
        {
            // Transport-layer TLS termination is out of this crate's scope;
            // deployments front the relay with a TLS-terminating proxy. We
            // still validate the configured pair so misconfigured
            // deployments fail fast rather than silently serving plaintext.
            warn!(
                "tls_cert_path/tls_key_path configured but relay serves plain HTTP; \
                 terminate TLS at a reverse proxy"
            );
            let tls_config = crate::tls::TlsConfig::new(cert_path, key_path)?;
            crate::tls::setup_tls_reload_handler(tls_config).await;
        }

        let listener = tokio::net::TcpListener::bind(self.settings.bind_addr).await?;
        info!("cc-relay listening on {}", self.settings.bind_addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(Self::shutdown_signal(shutdown_rx))
        .await?;

        Ok(())
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    if let Some(ref mut sigterm) = sigterm {
                        sigterm.recv().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, starting graceful shutdown");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("shutdown requested");
                }
            }
        }
    }

    /// Idempotent: repeated calls after the first are no-ops since the
    /// underlying watch channel simply stays at `true`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
