use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum_server::Handle;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, info_span};

use crate::{
    cluster::{ClusterClient, InMemoryCluster, KubeCluster},
    config::{ClusterConfig, ManagerConfig},
    events::EventHandler,
    manager::ServiceManager,
    routes::{RouteState, create_routes},
};

pub struct Service {
    pub config: Arc<ManagerConfig>,
    pub manager: Arc<ServiceManager>,
    pub shutdown: CancellationToken,
}

impl Service {
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        let client: Arc<dyn ClusterClient> = match config.cluster {
            ClusterConfig::Kubernetes => {
                Arc::new(KubeCluster::try_default(&config.namespace).await?)
            }
            ClusterConfig::InMemory => {
                info!("using in-memory cluster, nothing is deployed");
                Arc::new(InMemoryCluster::new(&config.namespace))
            }
        };
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: ManagerConfig, client: Arc<dyn ClusterClient>) -> Self {
        let manager = Arc::new(ServiceManager::new(client, &config));
        Self {
            config: Arc::new(config),
            manager,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        let span = info_span!(
            "lambda_service_manager",
            env = %self.config.env,
            namespace = %self.config.namespace
        );

        let route_state = RouteState {
            handler: Arc::new(EventHandler::new(self.manager.clone())),
            shutdown: self.shutdown.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(
            async move {
                shutdown_signal(handle_sh, shutdown).await;
            }
            .instrument(span.clone()),
        );

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let router = create_routes(route_state).layer(TraceLayer::new_for_http());
        axum_server::bind(addr)
            .handle(handle)
            .serve(router.into_make_service())
            .instrument(span)
            .await
            .map_err(Into::into)
    }
}

async fn shutdown_signal(handle: Handle, shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {:?}", err);
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
    handle.graceful_shutdown(None);
    shutdown.cancel();
    info!("signal received, shutting down server gracefully");
}
