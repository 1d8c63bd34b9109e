//! Desired state for the four objects backing a deployed function.
//!
//! Builders are pure: the same deployment and settings always produce the
//! same objects, and nothing here talks to the cluster.

use std::collections::BTreeMap;

use data_model::{BuildCompletionEvent, ServiceName};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde::Serialize;

use crate::{cluster::ResourceKind, config::LambdaSettings};

mod configuration;
mod event_route;
mod identity;
mod serving;

pub use configuration::Configuration;
pub use event_route::{EventRoute, TENANT_FILTER_ATTRIBUTE, TRIGGER_PARALLELISM_ANNOTATION};
pub use identity::Identity;
pub use serving::{
    ANNOTATION_MAX_SCALE,
    ANNOTATION_MIN_SCALE,
    ANNOTATION_TARGET,
    MAX_SCALE,
    MIN_SCALE,
    Serving,
    TARGET,
};

/// One function deployment: where it goes and what triggered it.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub service_name: ServiceName,
    pub namespace: String,
    pub event: BuildCompletionEvent,
}

impl Deployment {
    pub fn new(
        service_name: ServiceName,
        namespace: impl Into<String>,
        event: BuildCompletionEvent,
    ) -> Self {
        Self {
            service_name,
            namespace: namespace.into(),
            event,
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.event.labels()
    }

    fn object_meta(&self, kind: ResourceKind) -> ObjectMeta {
        ObjectMeta {
            name: Some(kind.object_name(&self.service_name)),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }
}

/// A top-level field of an object's body that the manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnedField {
    /// The live value is overwritten with the desired one.
    Replace(&'static str),
    /// The desired value is merged into the live one, keeping fields the
    /// server or other controllers filled in.
    Merge(&'static str),
}

impl OwnedField {
    pub fn name(&self) -> &'static str {
        match self {
            OwnedField::Replace(name) | OwnedField::Merge(name) => name,
        }
    }
}

/// An object the manager keeps in its desired state.
pub trait ManagedResource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Object name within the namespace.
    fn key(&self) -> &str;

    fn build_desired_state(&self) -> serde_json::Result<DynamicObject>;

    /// Top-level fields this manager owns besides labels and annotations.
    /// Anything else found on the live object is left alone on update.
    fn owned_fields(&self) -> &'static [OwnedField];
}

/// The full set for a deployment, in creation order.
pub fn managed_resources(
    deployment: &Deployment,
    settings: &LambdaSettings,
) -> Vec<Box<dyn ManagedResource>> {
    vec![
        Box::new(Identity::new(deployment)),
        Box::new(Configuration::new(deployment, settings)),
        Box::new(Serving::new(deployment, settings)),
        Box::new(EventRoute::new(deployment, settings)),
    ]
}

pub(crate) fn to_dynamic<T: Serialize>(resource: &T) -> serde_json::Result<DynamicObject> {
    serde_json::from_value(serde_json::to_value(resource)?)
}

#[cfg(test)]
mod tests {
    use data_model::{
        LABEL_COMPONENT,
        LABEL_FUNCTION_ID,
        LABEL_TENANT_ID,
        test_objects::tests::{TEST_IMAGE_V1, mock_build_event},
    };

    use super::*;

    pub(crate) fn test_deployment() -> Deployment {
        let event = mock_build_event(TEST_IMAGE_V1);
        Deployment::new(event.service_name(), "lambdas", event)
    }

    #[test]
    fn test_managed_resources_cover_every_kind_once() {
        let deployment = test_deployment();
        let resources = managed_resources(&deployment, &LambdaSettings::default());
        let kinds: Vec<_> = resources.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::ServiceAccount,
                ResourceKind::ConfigMap,
                ResourceKind::KnativeService,
                ResourceKind::Trigger,
            ]
        );
    }

    #[test]
    fn test_every_resource_carries_common_labels_and_name() {
        let deployment = test_deployment();
        for resource in managed_resources(&deployment, &LambdaSettings::default()) {
            let object = resource.build_desired_state().unwrap();
            let labels = object.metadata.labels.clone().unwrap();
            assert_eq!(labels[LABEL_TENANT_ID], "customer-123");
            assert_eq!(labels[LABEL_FUNCTION_ID], "parser-abc");
            assert_eq!(labels[LABEL_COMPONENT], "lambda");
            assert_eq!(object.metadata.name.as_deref(), Some(resource.key()));
            assert_eq!(object.metadata.namespace.as_deref(), Some("lambdas"));
            assert_eq!(
                resource.key(),
                resource.kind().object_name(&deployment.service_name)
            );
            let types = object.types.unwrap();
            assert_eq!(types.api_version, resource.kind().api_resource().api_version);
            assert_eq!(types.kind, resource.kind().api_resource().kind);
        }
    }

    #[test]
    fn test_builders_are_deterministic() {
        let deployment = test_deployment();
        let settings = LambdaSettings::default();
        let first = managed_resources(&deployment, &settings);
        let second = managed_resources(&deployment, &settings);
        for (a, b) in first.iter().zip(second.iter()) {
            let a = serde_json::to_value(a.build_desired_state().unwrap()).unwrap();
            let b = serde_json::to_value(b.build_desired_state().unwrap()).unwrap();
            assert_eq!(a, b);
        }
    }
}
