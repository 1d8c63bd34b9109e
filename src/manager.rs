use std::{collections::BTreeSet, fmt, future::Future, sync::Arc, time::Duration};

use data_model::{
    BuildCompletionEvent,
    ServiceName,
    ValidationError,
    is_label_value,
    is_managed,
    tenant_selector,
};
use futures::future::join_all;
use lambda_utils::{RetryPolicy, retry_with_backoff};
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    apply::{ApplyOutcome, apply_resource},
    cluster::{ClusterClient, ClusterError, ResourceKind},
    config::{LambdaSettings, ManagerConfig},
    resources::{Deployment, ManagedResource, managed_resources},
};

enum DeleteOutcome {
    Deleted,
    Absent,
    Unmanaged,
}

/// How a caller should react to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorClass {
    /// The request itself is wrong. Sending it again will not help.
    Validation,
    /// May succeed if the same request is sent again.
    Transient,
    /// Needs an operator, e.g. missing permissions or an admission rejection.
    Permanent,
}

#[derive(Debug)]
pub struct ResourceFailure {
    pub kind: ResourceKind,
    pub name: String,
    pub error: ClusterError,
}

impl From<ClusterError> for ResourceFailure {
    fn from(error: ClusterError) -> Self {
        Self {
            kind: error.kind(),
            name: error.name().to_string(),
            error,
        }
    }
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.name, self.error)
    }
}

struct Failures<'a>(&'a [ResourceFailure]);

impl fmt::Display for Failures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to apply {} resources for {service}: {}", failures.len(), Failures(failures))]
    Apply {
        service: ServiceName,
        failures: Vec<ResourceFailure>,
    },

    #[error("failed to delete resources of {target}: {}", Failures(failures))]
    Delete {
        target: String,
        failures: Vec<ResourceFailure>,
    },

    #[error("failed to look up {target}: {source}")]
    Lookup {
        target: String,
        source: ClusterError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation did not complete within {0:?}")]
    DeadlineExceeded(Duration),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::Validation(_) => ErrorClass::Validation,
            ServiceError::Apply { failures, .. } | ServiceError::Delete { failures, .. } => {
                if failures.iter().any(|f| f.error.is_permanent()) {
                    ErrorClass::Permanent
                } else {
                    ErrorClass::Transient
                }
            }
            ServiceError::Lookup { source, .. } if source.is_permanent() => ErrorClass::Permanent,
            ServiceError::Lookup { .. } |
            ServiceError::Cancelled |
            ServiceError::DeadlineExceeded(_) => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Kinds named by an aggregated apply or delete failure.
    pub fn failed_kinds(&self) -> Vec<ResourceKind> {
        match self {
            ServiceError::Apply { failures, .. } | ServiceError::Delete { failures, .. } => {
                failures.iter().map(|f| f.kind).collect()
            }
            ServiceError::Lookup { source, .. } => vec![source.kind()],
            _ => Vec::new(),
        }
    }
}

/// Provisions, upgrades and removes the resources of deployed functions.
///
/// Holds no per-service state; every call reads the cluster afresh, so any
/// number of calls may run concurrently.
pub struct ServiceManager {
    client: Arc<dyn ClusterClient>,
    settings: LambdaSettings,
    retry: RetryPolicy,
    max_conflict_retries: u32,
    operation_timeout: Option<Duration>,
}

impl ServiceManager {
    pub fn new(client: Arc<dyn ClusterClient>, config: &ManagerConfig) -> Self {
        Self {
            client,
            settings: config.lambda.clone(),
            retry: config.retry.clone(),
            max_conflict_retries: config.max_conflict_retries,
            operation_timeout: config.operation_timeout(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.client.namespace()
    }

    pub fn service_name(tenant_id: &str, function_id: &str) -> ServiceName {
        ServiceName::for_function(tenant_id, function_id)
    }

    /// Creates or updates all four resources of `name`. Safe to call again
    /// after a partial failure; resources already in place are left alone.
    #[tracing::instrument(skip(self, cancel, name, event), fields(service = %name, tenant_id = %event.tenant_id, function_id = %event.function_id, correlation_id = ?event.correlation_id))]
    pub async fn create_service(
        &self,
        cancel: &CancellationToken,
        name: &ServiceName,
        event: &BuildCompletionEvent,
    ) -> Result<(), ServiceError> {
        event.validate()?;
        if !event.is_success() {
            return Err(ValidationError::BuildNotSuccessful(event.status.clone()).into());
        }

        self.run(cancel, async {
            let deployment = Deployment::new(name.clone(), self.namespace(), event.clone());
            let resources = managed_resources(&deployment, &self.settings);
            let results = join_all(
                resources
                    .iter()
                    .map(|resource| self.apply_with_retry(resource.as_ref())),
            )
            .await;

            let mut failures = Vec::new();
            for (resource, result) in resources.iter().zip(results) {
                match result {
                    Ok(outcome) => {
                        debug!(kind = %resource.kind(), name = resource.key(), %outcome, "applied resource")
                    }
                    Err(err) => {
                        warn!(kind = %resource.kind(), name = resource.key(), error = %err, "failed to apply resource");
                        failures.push(ResourceFailure::from(err));
                    }
                }
            }

            if !failures.is_empty() {
                return Err(ServiceError::Apply {
                    service: name.clone(),
                    failures,
                });
            }
            info!(image = %event.image_reference, "service is up to date");
            Ok(())
        })
        .await
    }

    /// Deletes all four resources of `name`. Resources that are already gone
    /// count as deleted.
    #[tracing::instrument(skip(self, cancel, name), fields(service = %name))]
    pub async fn delete_service(
        &self,
        cancel: &CancellationToken,
        name: &ServiceName,
    ) -> Result<(), ServiceError> {
        self.run(cancel, async {
            let failures = self.delete_resources(name).await;
            if !failures.is_empty() {
                return Err(ServiceError::Delete {
                    target: name.to_string(),
                    failures,
                });
            }
            info!("service deleted");
            Ok(())
        })
        .await
    }

    /// Reports whether the serving object of `name` exists.
    #[tracing::instrument(skip(self, cancel, name), fields(service = %name))]
    pub async fn check_service_exists(
        &self,
        cancel: &CancellationToken,
        name: &ServiceName,
    ) -> Result<bool, ServiceError> {
        self.run(cancel, async {
            let kind = ResourceKind::KnativeService;
            let object = self
                .client
                .get(kind, &kind.object_name(name))
                .await
                .map_err(|source| ServiceError::Lookup {
                    target: name.to_string(),
                    source,
                })?;
            Ok(object.is_some())
        })
        .await
    }

    /// Names of the serving objects owned by `tenant_id`.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn list_services(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
    ) -> Result<Vec<ServiceName>, ServiceError> {
        validate_tenant(tenant_id)?;
        self.run(cancel, async {
            let names = self
                .tenant_services(tenant_id, &[ResourceKind::KnativeService])
                .await?;
            Ok(names.into_iter().collect())
        })
        .await
    }

    /// Removes every deployment owned by `tenant_id`, including partial ones
    /// whose serving object is already gone.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn delete_tenant_services(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
    ) -> Result<Vec<ServiceName>, ServiceError> {
        validate_tenant(tenant_id)?;
        self.run(cancel, async {
            let names = self
                .tenant_services(tenant_id, &ResourceKind::DELETION_ORDER)
                .await?;

            let mut failures = Vec::new();
            for name in &names {
                failures.extend(self.delete_resources(name).await);
            }
            if !failures.is_empty() {
                return Err(ServiceError::Delete {
                    target: format!("tenant {}", tenant_id),
                    failures,
                });
            }
            info!(services = names.len(), "tenant services deleted");
            Ok(names.into_iter().collect())
        })
        .await
    }

    async fn apply_with_retry(
        &self,
        resource: &dyn ManagedResource,
    ) -> Result<ApplyOutcome, ClusterError> {
        let description = format!("apply {} {}", resource.kind(), resource.key());
        retry_with_backoff(
            &self.retry,
            &description,
            || apply_resource(self.client.as_ref(), resource, self.max_conflict_retries),
            ClusterError::is_retryable,
        )
        .await
    }

    // Deletes in a fixed order and keeps going past failures so one denied
    // kind does not leave the rest behind.
    async fn delete_resources(&self, name: &ServiceName) -> Vec<ResourceFailure> {
        let mut failures = Vec::new();
        for kind in ResourceKind::DELETION_ORDER {
            let object = kind.object_name(name);
            let description = format!("delete {} {}", kind, object);
            let result = retry_with_backoff(
                &self.retry,
                &description,
                || self.delete_managed(kind, &object),
                ClusterError::is_retryable,
            )
            .await;
            match result {
                Ok(DeleteOutcome::Deleted) => debug!(%kind, name = %object, "deleted resource"),
                Ok(DeleteOutcome::Absent) => {
                    debug!(%kind, name = %object, "resource already absent")
                }
                Ok(DeleteOutcome::Unmanaged) => {
                    warn!(%kind, name = %object, "leaving object without the lambda component label in place")
                }
                Err(err) if err.is_not_found() => {
                    debug!(%kind, name = %object, "resource already absent")
                }
                Err(err) => {
                    warn!(%kind, name = %object, error = %err, "failed to delete resource");
                    failures.push(ResourceFailure::from(err));
                }
            }
        }
        failures
    }

    // Objects that share a name but lack the managed labels belong to
    // someone else and are never deleted.
    async fn delete_managed(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        let Some(object) = self.client.get(kind, name).await? else {
            return Ok(DeleteOutcome::Absent);
        };
        if !is_managed(object.metadata.labels.as_ref()) {
            return Ok(DeleteOutcome::Unmanaged);
        }
        self.client.delete(kind, name).await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn tenant_services(
        &self,
        tenant_id: &str,
        kinds: &[ResourceKind],
    ) -> Result<BTreeSet<ServiceName>, ServiceError> {
        let selector = tenant_selector(tenant_id);
        let mut names = BTreeSet::new();
        for kind in kinds {
            let objects = self
                .client
                .list(*kind, &selector)
                .await
                .map_err(|source| ServiceError::Lookup {
                    target: format!("tenant {}", tenant_id),
                    source,
                })?;
            for object in objects {
                let object_name = object.metadata.name.unwrap_or_default();
                let service = match kind {
                    ResourceKind::ConfigMap => object_name
                        .strip_suffix("-config")
                        .unwrap_or(&object_name)
                        .to_string(),
                    _ => object_name,
                };
                match ServiceName::parse(&service) {
                    Ok(name) => {
                        names.insert(name);
                    }
                    Err(err) => warn!(%kind, name = %service, error = %err, "skipping unmanaged object"),
                }
            }
        }
        Ok(names)
    }

    async fn run<T, F>(&self, cancel: &CancellationToken, operation: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        let bounded = async {
            match self.operation_timeout {
                Some(timeout) => tokio::time::timeout(timeout, operation)
                    .await
                    .map_err(|_| ServiceError::DeadlineExceeded(timeout))?,
                None => operation.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("operation cancelled");
                Err(ServiceError::Cancelled)
            }
            result = bounded => result,
        }
    }
}

fn validate_tenant(tenant_id: &str) -> Result<(), ValidationError> {
    if tenant_id.trim().is_empty() {
        return Err(ValidationError::MissingField("tenant_id"));
    }
    if !is_label_value(tenant_id) {
        return Err(ValidationError::InvalidLabelValue {
            field: "tenant_id",
            value: tenant_id.to_string(),
        });
    }
    Ok(())
}
