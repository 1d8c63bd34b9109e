use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};

use super::{Deployment, ManagedResource, OwnedField, to_dynamic};
use crate::{cluster::ResourceKind, config::LambdaSettings};

/// CloudEvent attribute the broker matches against the tenant id.
pub const TENANT_FILTER_ATTRIBUTE: &str = "tenantid";
pub const TRIGGER_PARALLELISM_ANNOTATION: &str = "rabbitmq.eventing.knative.dev/parallelism";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: TriggerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub broker: String,
    pub filter: TriggerFilter,
    pub subscriber: Destination,
    pub delivery: DeliverySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFilter {
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "ref")]
    pub reference: KReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySpec {
    pub retry: u32,
    pub backoff_policy: String,
    pub backoff_delay: String,
}

/// Trigger routing the tenant's events from the broker to the serving object.
pub struct EventRoute {
    name: String,
    trigger: Trigger,
}

impl EventRoute {
    pub fn new(deployment: &Deployment, settings: &LambdaSettings) -> Self {
        let mut metadata = deployment.object_meta(ResourceKind::Trigger);
        if let Some(parallelism) = settings.trigger_parallelism {
            metadata.annotations = Some(BTreeMap::from([(
                TRIGGER_PARALLELISM_ANNOTATION.to_string(),
                parallelism.to_string(),
            )]));
        }
        let name = metadata.name.clone().unwrap_or_default();
        let api_resource = ResourceKind::Trigger.api_resource();
        let subscriber = ResourceKind::KnativeService.api_resource();

        let trigger = Trigger {
            api_version: api_resource.api_version,
            kind: api_resource.kind,
            metadata,
            spec: TriggerSpec {
                broker: settings.broker.clone(),
                filter: TriggerFilter {
                    attributes: BTreeMap::from([(
                        TENANT_FILTER_ATTRIBUTE.to_string(),
                        deployment.event.tenant_id.clone(),
                    )]),
                },
                subscriber: Destination {
                    reference: KReference {
                        api_version: subscriber.api_version,
                        kind: subscriber.kind,
                        name: ResourceKind::KnativeService.object_name(&deployment.service_name),
                        namespace: deployment.namespace.clone(),
                    },
                },
                delivery: DeliverySpec {
                    retry: settings.delivery.retry,
                    backoff_policy: settings.delivery.backoff_policy.clone(),
                    backoff_delay: settings.delivery.backoff_delay.clone(),
                },
            },
        };

        Self { name, trigger }
    }
}

impl ManagedResource for EventRoute {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Trigger
    }

    fn key(&self) -> &str {
        &self.name
    }

    fn build_desired_state(&self) -> serde_json::Result<DynamicObject> {
        to_dynamic(&self.trigger)
    }

    fn owned_fields(&self) -> &'static [OwnedField] {
        &[OwnedField::Merge("spec")]
    }
}
