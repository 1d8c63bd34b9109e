use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use kube::{api::DynamicObject, core::TypeMeta};
use strum::Display;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ClusterClient, ClusterError, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Operation {
    Get,
    Create,
    Replace,
    Delete,
    List,
}

/// A failure the in-memory cluster returns instead of serving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Forbidden,
    Rejected,
    Unavailable,
    Conflict,
    /// Answered as if the namespace or type did not exist.
    NotFound,
    /// The request never completes.
    Hang,
}

impl Fault {
    fn into_error(self, kind: ResourceKind, name: &str) -> ClusterError {
        let name = name.to_string();
        let message = "injected fault".to_string();
        match self {
            Fault::Forbidden => ClusterError::Forbidden {
                kind,
                name,
                message,
            },
            Fault::Rejected => ClusterError::Rejected {
                kind,
                name,
                message,
            },
            Fault::Conflict => ClusterError::Conflict {
                kind,
                name,
                message,
            },
            Fault::NotFound => ClusterError::NotFound { kind, name },
            Fault::Unavailable | Fault::Hang => ClusterError::Unavailable {
                kind,
                name,
                message,
            },
        }
    }
}

struct FaultRule {
    kind: ResourceKind,
    operation: Operation,
    fault: Fault,
    // None fires forever
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(ResourceKind, String), DynamicObject>,
    next_version: u64,
    faults: Vec<FaultRule>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_fault(&mut self, kind: ResourceKind, operation: Operation) -> Option<Fault> {
        let index = self
            .faults
            .iter()
            .position(|rule| rule.kind == kind && rule.operation == operation)?;
        let rule = &mut self.faults[index];
        let fault = rule.fault.clone();
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(index);
            }
        }
        Some(fault)
    }
}

/// Cluster kept in process memory. Honors resourceVersion preconditions the
/// same way the API server does and can be told to fail specific requests.
#[derive(Clone)]
pub struct InMemoryCluster {
    namespace: String,
    state: Arc<Mutex<State>>,
}

impl InMemoryCluster {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Fails the next `times` matching requests, or all of them when `times`
    /// is `None`.
    pub async fn inject_fault(
        &self,
        kind: ResourceKind,
        operation: Operation,
        fault: Fault,
        times: Option<usize>,
    ) {
        if times == Some(0) {
            return;
        }
        self.state.lock().await.faults.push(FaultRule {
            kind,
            operation,
            fault,
            remaining: times,
        });
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    pub async fn objects(&self, kind: ResourceKind) -> Vec<DynamicObject> {
        self.state
            .lock()
            .await
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, object)| object.clone())
            .collect()
    }

    pub async fn object(&self, kind: ResourceKind, name: &str) -> Option<DynamicObject> {
        self.state
            .lock()
            .await
            .objects
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn check_fault(
        &self,
        kind: ResourceKind,
        operation: Operation,
        name: &str,
    ) -> Result<(), ClusterError> {
        // Lets concurrent callers interleave between requests.
        tokio::task::yield_now().await;

        let fault = self.state.lock().await.take_fault(kind, operation);
        match fault {
            None => Ok(()),
            Some(Fault::Hang) => {
                debug!(%kind, %operation, %name, "request hangs");
                futures::future::pending::<()>().await;
                Err(Fault::Hang.into_error(kind, name))
            }
            Some(fault) => Err(fault.into_error(kind, name)),
        }
    }
}

fn object_name(object: &DynamicObject) -> String {
    object.metadata.name.clone().unwrap_or_default()
}

fn same_content(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.metadata.labels == b.metadata.labels &&
        a.metadata.annotations == b.metadata.annotations &&
        a.data == b.data
}

fn matches_selector(object: &DynamicObject, selector: &str) -> bool {
    let labels = object.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClusterError> {
        self.check_fault(kind, Operation::Get, name).await?;
        Ok(self.object(kind, name).await)
    }

    async fn create(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let name = object_name(object);
        self.check_fault(kind, Operation::Create, &name).await?;
        if name.is_empty() {
            return Err(ClusterError::Rejected {
                kind,
                name,
                message: "metadata.name is required".to_string(),
            });
        }
        if object.metadata.resource_version.is_some() {
            return Err(ClusterError::Rejected {
                kind,
                name,
                message: "resourceVersion should not be set on objects to be created".to_string(),
            });
        }

        let mut state = self.state.lock().await;
        let key = (kind, name.clone());
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind, name });
        }

        let api_resource = kind.api_resource();
        let mut stored = object.clone();
        stored.types = Some(TypeMeta {
            api_version: api_resource.api_version,
            kind: api_resource.kind,
        });
        stored.metadata.namespace = Some(self.namespace.clone());
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let name = object_name(object);
        self.check_fault(kind, Operation::Replace, &name).await?;

        let mut state = self.state.lock().await;
        let key = (kind, name.clone());
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(ClusterError::NotFound { kind, name });
        };
        let Some(requested_version) = object.metadata.resource_version.as_deref() else {
            return Err(ClusterError::Rejected {
                kind,
                name,
                message: "resourceVersion must be specified for an update".to_string(),
            });
        };
        if current.metadata.resource_version.as_deref() != Some(requested_version) {
            return Err(ClusterError::Conflict {
                kind,
                name,
                message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
            });
        }
        if same_content(&current, object) {
            return Ok(current);
        }

        let mut stored = object.clone();
        stored.types = current.types.clone();
        stored.metadata.namespace = current.metadata.namespace.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        self.check_fault(kind, Operation::Delete, name).await?;
        match self
            .state
            .lock()
            .await
            .objects
            .remove(&(kind, name.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            }),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        self.check_fault(kind, Operation::List, label_selector)
            .await?;
        Ok(self
            .objects(kind)
            .await
            .into_iter()
            .filter(|object| matches_selector(object, label_selector))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn config_map(name: &str, tenant: &str) -> DynamicObject {
        let mut object = DynamicObject::new(name, &ResourceKind::ConfigMap.api_resource())
            .data(json!({ "data": { "KEY": "value" } }));
        object.metadata.labels = Some(BTreeMap::from([
            ("component".to_string(), "lambda".to_string()),
            ("tenant-id".to_string(), tenant.to_string()),
        ]));
        object
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let cluster = InMemoryCluster::new("lambdas");
        let created = cluster
            .create(ResourceKind::ConfigMap, &config_map("cm", "t1"))
            .await
            .unwrap();
        assert_eq!(created.metadata.namespace.as_deref(), Some("lambdas"));
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let err = cluster
            .create(ResourceKind::ConfigMap, &config_map("cm", "t1"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_replace_checks_resource_version() {
        let cluster = InMemoryCluster::new("lambdas");
        let created = cluster
            .create(ResourceKind::ConfigMap, &config_map("cm", "t1"))
            .await
            .unwrap();

        let mut stale = created.clone();
        stale.metadata.resource_version = Some("0".to_string());
        stale.data = json!({ "data": { "KEY": "other" } });
        let err = cluster
            .replace(ResourceKind::ConfigMap, &stale)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let mut fresh = created.clone();
        fresh.data = json!({ "data": { "KEY": "other" } });
        let replaced = cluster
            .replace(ResourceKind::ConfigMap, &fresh)
            .await
            .unwrap();
        assert_eq!(replaced.metadata.uid, created.metadata.uid);
        assert_ne!(
            replaced.metadata.resource_version,
            created.metadata.resource_version
        );

        // identical content keeps the version
        let again = cluster
            .replace(ResourceKind::ConfigMap, &replaced)
            .await
            .unwrap();
        assert_eq!(
            again.metadata.resource_version,
            replaced.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_list_by_labels_and_delete() {
        let cluster = InMemoryCluster::new("lambdas");
        for (name, tenant) in [("a", "t1"), ("b", "t1"), ("c", "t2")] {
            cluster
                .create(ResourceKind::ConfigMap, &config_map(name, tenant))
                .await
                .unwrap();
        }
        let listed = cluster
            .list(ResourceKind::ConfigMap, "component=lambda,tenant-id=t1")
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(cluster
            .list(ResourceKind::Trigger, "")
            .await
            .unwrap()
            .is_empty());

        cluster.delete(ResourceKind::ConfigMap, "a").await.unwrap();
        let err = cluster
            .delete(ResourceKind::ConfigMap, "a")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cluster.len().await, 2);
    }

    #[tokio::test]
    async fn test_faults_fire_the_requested_number_of_times() {
        let cluster = InMemoryCluster::new("lambdas");
        cluster
            .inject_fault(
                ResourceKind::ConfigMap,
                Operation::Create,
                Fault::Unavailable,
                Some(1),
            )
            .await;
        let err = cluster
            .create(ResourceKind::ConfigMap, &config_map("cm", "t1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(cluster
            .create(ResourceKind::ConfigMap, &config_map("cm", "t1"))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_completes() {
        let cluster = InMemoryCluster::new("lambdas");
        cluster
            .inject_fault(ResourceKind::Trigger, Operation::Get, Fault::Hang, None)
            .await;
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            cluster.get(ResourceKind::Trigger, "t"),
        )
        .await;
        assert!(result.is_err());
    }
}
