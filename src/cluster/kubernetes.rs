use anyhow::Result;
use async_trait::async_trait;
use kube::{
    Api,
    api::{DeleteParams, DynamicObject, ListParams, PostParams},
};
use tracing::debug;

use super::{ClusterClient, ClusterError, ResourceKind};

/// Cluster driver backed by the API server the ambient kubeconfig (or the
/// in-cluster service account) points at.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub async fn try_default(namespace: impl Into<String>) -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    fn api(&self, kind: ResourceKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &kind.api_resource())
    }
}

fn object_name(object: &DynamicObject) -> String {
    object.metadata.name.clone().unwrap_or_default()
}

/// Maps an API failure onto the error classes callers act upon.
fn map_error(kind: ResourceKind, name: &str, err: kube::Error) -> ClusterError {
    let name = name.to_string();
    match err {
        kube::Error::Api(response) => {
            let message = response.message;
            match response.code {
                404 => ClusterError::NotFound { kind, name },
                409 if response.reason == "AlreadyExists" => {
                    ClusterError::AlreadyExists { kind, name }
                }
                409 => ClusterError::Conflict {
                    kind,
                    name,
                    message,
                },
                401 | 403 => ClusterError::Forbidden {
                    kind,
                    name,
                    message,
                },
                429 => ClusterError::Unavailable {
                    kind,
                    name,
                    message,
                },
                code if (400..500).contains(&code) => ClusterError::Rejected {
                    kind,
                    name,
                    message,
                },
                _ => ClusterError::Unavailable {
                    kind,
                    name,
                    message,
                },
            }
        }
        kube::Error::SerdeError(source) => ClusterError::Encoding { kind, name, source },
        other => ClusterError::Unavailable {
            kind,
            name,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClusterError> {
        self.api(kind)
            .get_opt(name)
            .await
            .map_err(|e| map_error(kind, name, e))
    }

    async fn create(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let name = object_name(object);
        debug!(%kind, %name, "creating object");
        self.api(kind)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_error(kind, &name, e))
    }

    async fn replace(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let name = object_name(object);
        debug!(%kind, %name, resource_version = ?object.metadata.resource_version, "replacing object");
        self.api(kind)
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| map_error(kind, &name, e))
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        debug!(%kind, %name, "deleting object");
        self.api(kind)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_error(kind, name, e))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        self.api(kind)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map(|list| list.items)
            .map_err(|e| map_error(kind, label_selector, e))
    }
}

#[cfg(test)]
mod tests {
    use kube::error::ErrorResponse;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from api server"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_map_error() {
        let kind = ResourceKind::KnativeService;

        assert!(map_error(kind, "svc", api_error(404, "NotFound")).is_not_found());
        assert!(map_error(kind, "svc", api_error(409, "AlreadyExists")).is_already_exists());

        let conflict = map_error(kind, "svc", api_error(409, "Conflict"));
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());

        let forbidden = map_error(kind, "svc", api_error(403, "Forbidden"));
        assert!(matches!(forbidden, ClusterError::Forbidden { .. }));
        assert!(forbidden.is_permanent());

        let invalid = map_error(kind, "svc", api_error(422, "Invalid"));
        assert!(matches!(invalid, ClusterError::Rejected { .. }));

        let throttled = map_error(kind, "svc", api_error(429, "TooManyRequests"));
        assert!(throttled.is_retryable());

        let internal = map_error(kind, "svc", api_error(500, "InternalError"));
        assert!(matches!(internal, ClusterError::Unavailable { .. }));
        assert_eq!(internal.name(), "svc");
    }
}
