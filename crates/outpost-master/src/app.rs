//! Wiring of the master's components from a [`MasterConfig`].

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use outpost_crypto::{CaError, CaOptions, CertificateAuthority};

use crate::config::MasterConfig;
use crate::manager::SlaveManager;
use crate::pairing::{PairingError, PairingOptions, PairingService};
use crate::registry::SlaveRegistry;
use crate::router::ToolRelay;
use crate::server::{AppState, HeartbeatMonitor, build_router};
use crate::storage::{DatabaseError, MasterDatabase, SlaveStore};
use crate::tls::{TlsConfigError, serve_tls, server_tls_config};
use crate::upstream::{ContextSource, ToolRouter};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Certificate authority error: {0}")]
    Ca(#[from] CaError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Tls(#[from] TlsConfigError),
}

/// A fully wired master: storage, CA, registry, relay and pairing.
pub struct Master {
    pub config: MasterConfig,
    pub db: MasterDatabase,
    pub state: AppState,
}

impl Master {
    /// Open the database and CA under `config` and restore pending pairings.
    pub async fn open(
        config: MasterConfig,
        upstream: Arc<dyn ToolRouter>,
        contexts: Arc<dyn ContextSource>,
    ) -> Result<Self, StartupError> {
        std::fs::create_dir_all(&config.data_dir)?;
        info!(path = %config.db_path.display(), "Opening master database");
        let db = MasterDatabase::open(&config.db_path).await?;

        let ca = Arc::new(CertificateAuthority::load_or_generate(
            &config.data_dir,
            CaOptions {
                key_bits: config.ca_key_bits,
            },
        )?);

        let store: Arc<dyn SlaveStore> = Arc::new(db.clone());
        let registry = Arc::new(SlaveRegistry::new());
        let relay = ToolRelay::new(Arc::clone(&registry), config.relay_timeout);
        let pairing = Arc::new(PairingService::new(
            Arc::clone(&ca),
            Arc::clone(&store),
            PairingOptions {
                ttl: config.pairing_ttl,
                cert_validity_days: config.cert_validity_days,
            },
        ));
        pairing.restore().await?;

        let state = AppState {
            ca,
            store,
            registry,
            relay,
            pairing,
            upstream,
            contexts,
            handshake_timeout: config.handshake_timeout,
        };
        Ok(Self { config, db, state })
    }

    pub fn manager(&self) -> SlaveManager {
        SlaveManager::new(
            Arc::clone(&self.state.store),
            Arc::clone(&self.state.registry),
            self.state.relay.clone(),
        )
    }

    /// Start the pairing sweeper and the heartbeat monitor.
    pub fn spawn_background(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let sweeper = tokio::spawn(
            Arc::clone(&self.state.pairing)
                .run_sweeper(self.config.pairing_sweep_interval, shutdown.clone()),
        );
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&self.state.registry),
            self.state.relay.clone(),
            Arc::clone(&self.state.store),
            self.config.heartbeat_timeout,
        );
        let heartbeat = tokio::spawn(monitor.run(self.config.heartbeat_interval, shutdown.clone()));
        vec![sweeper, heartbeat]
    }

    /// Serve slaves on `listener` until `shutdown` flips.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), StartupError> {
        let tls = server_tls_config(&self.state.ca, &self.config.server_names)?;
        serve_tls(listener, tls, build_router(self.state.clone()), shutdown).await;
        Ok(())
    }
}
