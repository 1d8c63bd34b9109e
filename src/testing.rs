use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Result, anyhow};
use kube::api::DynamicObject;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing::subscriber;
use tracing_subscriber::{Layer, layer::SubscriberExt};

use crate::{
    cluster::{InMemoryCluster, ResourceKind},
    config::{ClusterConfig, ManagerConfig},
    service::Service,
};

pub const TEST_NAMESPACE: &str = "knative-lambda";

pub struct TestService {
    pub service: Service,
    pub cluster: InMemoryCluster,
}

impl TestService {
    pub fn new() -> Self {
        Self::new_with_config(ManagerConfig::default())
    }

    pub fn new_with_config(config: ManagerConfig) -> Self {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let config = ManagerConfig {
            namespace: TEST_NAMESPACE.to_string(),
            cluster: ClusterConfig::InMemory,
            ..config
        };
        let cluster = InMemoryCluster::new(TEST_NAMESPACE);
        let service = Service::with_client(config, Arc::new(cluster.clone()));
        Self { service, cluster }
    }

    pub fn cancel(&self) -> CancellationToken {
        self.service.shutdown.child_token()
    }

    /// Snapshot of every stored object keyed by kind, for before/after
    /// comparisons.
    pub async fn snapshot(&self) -> BTreeMap<ResourceKind, Vec<DynamicObject>> {
        let mut snapshot = BTreeMap::new();
        for kind in ResourceKind::iter() {
            snapshot.insert(kind, self.cluster.objects(kind).await);
        }
        snapshot
    }

    /// Fails unless exactly one object of each kind exists.
    pub async fn assert_single_set(&self) -> Result<()> {
        for kind in ResourceKind::iter() {
            let count = self.cluster.objects(kind).await.len();
            if count != 1 {
                return Err(anyhow!("expected one {}, found {}", kind, count));
            }
        }
        Ok(())
    }
}
