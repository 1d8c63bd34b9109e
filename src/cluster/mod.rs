//! Access to the cluster control plane.
//!
//! Everything above this module talks to the cluster through the
//! [`ClusterClient`] trait. Two drivers implement it: [`kubernetes`], backed
//! by the `kube` crate, and [`in_memory`], which keeps objects in a map and
//! mimics the server's resourceVersion checks.

use async_trait::async_trait;
use data_model::ServiceName;
use kube::{api::DynamicObject, core::ApiResource};
use strum::{AsRefStr, Display, EnumIter};

pub mod in_memory;
pub mod kubernetes;

pub use in_memory::{Fault, InMemoryCluster, Operation};
pub use kubernetes::KubeCluster;

/// The four kinds that make up a deployed function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, AsRefStr, EnumIter)]
pub enum ResourceKind {
    ServiceAccount,
    ConfigMap,
    KnativeService,
    Trigger,
}

impl ResourceKind {
    /// Order in which a deployment is torn down: the event route first so no
    /// new events are routed to a disappearing service, the identity last.
    pub const DELETION_ORDER: [ResourceKind; 4] = [
        ResourceKind::Trigger,
        ResourceKind::KnativeService,
        ResourceKind::ConfigMap,
        ResourceKind::ServiceAccount,
    ];

    pub fn api_resource(&self) -> ApiResource {
        let (group, version, kind, plural) = match self {
            ResourceKind::ServiceAccount => ("", "v1", "ServiceAccount", "serviceaccounts"),
            ResourceKind::ConfigMap => ("", "v1", "ConfigMap", "configmaps"),
            ResourceKind::KnativeService => ("serving.knative.dev", "v1", "Service", "services"),
            ResourceKind::Trigger => ("eventing.knative.dev", "v1", "Trigger", "triggers"),
        };
        let api_version = if group.is_empty() {
            version.to_string()
        } else {
            format!("{}/{}", group, version)
        };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version,
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    /// Name of the object of this kind belonging to `service`.
    pub fn object_name(&self, service: &ServiceName) -> String {
        match self {
            ResourceKind::ConfigMap => service.config_map_name(),
            _ => service.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("{kind} {name} was modified concurrently: {message}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    #[error("access to {kind} {name} was denied: {message}")]
    Forbidden {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    #[error("{kind} {name} was rejected: {message}")]
    Rejected {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    #[error("cluster unavailable while accessing {kind} {name}: {message}")]
    Unavailable {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    #[error("failed to encode {kind} {name}. error: {source}")]
    Encoding {
        kind: ResourceKind,
        name: String,
        source: serde_json::Error,
    },
}

impl ClusterError {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::NotFound { kind, .. } |
            Self::AlreadyExists { kind, .. } |
            Self::Conflict { kind, .. } |
            Self::Forbidden { kind, .. } |
            Self::Rejected { kind, .. } |
            Self::Unavailable { kind, .. } |
            Self::Encoding { kind, .. } => *kind,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::NotFound { name, .. } |
            Self::AlreadyExists { name, .. } |
            Self::Conflict { name, .. } |
            Self::Forbidden { name, .. } |
            Self::Rejected { name, .. } |
            Self::Unavailable { name, .. } |
            Self::Encoding { name, .. } => name,
        }
    }

    /// Failures that may succeed when the same request is sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable { .. })
    }

    /// Failures that will keep failing until an operator intervenes.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// CRUD operations against one namespace of the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn namespace(&self) -> &str;

    async fn get(&self, kind: ResourceKind, name: &str)
        -> Result<Option<DynamicObject>, ClusterError>;

    async fn create(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    /// Replaces the whole object. The request carries the resourceVersion
    /// read earlier and fails with a conflict if it is stale.
    async fn replace(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError>;

    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError>;
}
