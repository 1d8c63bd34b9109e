use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::DynamicObject;

use super::{Deployment, ManagedResource, OwnedField, to_dynamic};
use crate::cluster::ResourceKind;

/// The ServiceAccount the function's pods run as.
pub struct Identity {
    name: String,
    service_account: ServiceAccount,
}

impl Identity {
    pub fn new(deployment: &Deployment) -> Self {
        let metadata = deployment.object_meta(ResourceKind::ServiceAccount);
        Self {
            name: metadata.name.clone().unwrap_or_default(),
            service_account: ServiceAccount {
                metadata,
                ..Default::default()
            },
        }
    }
}

impl ManagedResource for Identity {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ServiceAccount
    }

    fn key(&self) -> &str {
        &self.name
    }

    fn build_desired_state(&self) -> serde_json::Result<DynamicObject> {
        to_dynamic(&self.service_account)
    }

    fn owned_fields(&self) -> &'static [OwnedField] {
        // secrets and imagePullSecrets belong to the token controller
        &[]
    }
}
