use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        ConfigMapEnvSource,
        Container,
        ContainerPort,
        EnvFromSource,
        Probe,
        ResourceRequirements,
        TCPSocketAction,
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::ObjectMeta,
        util::intstr::IntOrString,
    },
};
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};

use super::{Deployment, ManagedResource, OwnedField, to_dynamic};
use crate::{cluster::ResourceKind, config::LambdaSettings};

pub const ANNOTATION_MIN_SCALE: &str = "autoscaling.knative.dev/min-scale";
pub const ANNOTATION_MAX_SCALE: &str = "autoscaling.knative.dev/max-scale";
pub const ANNOTATION_TARGET: &str = "autoscaling.knative.dev/target";

pub const MIN_SCALE: &str = "0";
pub const MAX_SCALE: &str = "10";
pub const TARGET: &str = "100";

const CONTAINER_NAME: &str = "user-container";
const PORT_NAME: &str = "http1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnativeService {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: KnativeServiceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnativeServiceSpec {
    pub template: RevisionTemplate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionTemplate {
    pub metadata: ObjectMeta,
    pub spec: RevisionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSpec {
    pub service_account_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_concurrency: Option<u32>,
    pub enable_service_links: bool,
    pub containers: Vec<Container>,
}

/// The Knative Service running the function image with scale-to-zero.
pub struct Serving {
    name: String,
    service: KnativeService,
}

impl Serving {
    pub fn new(deployment: &Deployment, settings: &LambdaSettings) -> Self {
        let metadata = deployment.object_meta(ResourceKind::KnativeService);
        let name = metadata.name.clone().unwrap_or_default();
        let api_resource = ResourceKind::KnativeService.api_resource();

        let template_metadata = ObjectMeta {
            labels: Some(deployment.labels()),
            annotations: Some(autoscaling_annotations()),
            ..Default::default()
        };

        let service = KnativeService {
            api_version: api_resource.api_version,
            kind: api_resource.kind,
            metadata,
            spec: KnativeServiceSpec {
                template: RevisionTemplate {
                    metadata: template_metadata,
                    spec: RevisionSpec {
                        // runs under the identity object
                        service_account_name: name.clone(),
                        container_concurrency: settings.container_concurrency,
                        enable_service_links: settings.enable_service_links,
                        containers: vec![function_container(deployment, settings)],
                    },
                },
            },
        };

        Self { name, service }
    }
}

fn autoscaling_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([
        (ANNOTATION_MIN_SCALE.to_string(), MIN_SCALE.to_string()),
        (ANNOTATION_MAX_SCALE.to_string(), MAX_SCALE.to_string()),
        (ANNOTATION_TARGET.to_string(), TARGET.to_string()),
    ])
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

fn function_container(deployment: &Deployment, settings: &LambdaSettings) -> Container {
    let port = i32::from(settings.container_port);
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(deployment.event.image_reference.clone()),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: deployment.service_name.config_map_name(),
                optional: None,
            }),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some(PORT_NAME.to_string()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: quantities(&settings.resources.requests),
            limits: quantities(&settings.resources.limits),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                host: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl ManagedResource for Serving {
    fn kind(&self) -> ResourceKind {
        ResourceKind::KnativeService
    }

    fn key(&self) -> &str {
        &self.name
    }

    fn build_desired_state(&self) -> serde_json::Result<DynamicObject> {
        to_dynamic(&self.service)
    }

    fn owned_fields(&self) -> &'static [OwnedField] {
        // status and the server-populated traffic block are left alone
        &[OwnedField::Merge("spec")]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resources::tests::test_deployment;

    #[test]
    fn test_serving_object() {
        let deployment = test_deployment();
        let serving = Serving::new(&deployment, &LambdaSettings::default());
        assert_eq!(serving.key(), deployment.service_name.as_str());

        let object = serving.build_desired_state().unwrap();
        let types = object.types.clone().unwrap();
        assert_eq!(types.api_version, "serving.knative.dev/v1");
        assert_eq!(types.kind, "Service");

        let template = &object.data["spec"]["template"];
        assert_eq!(
            template["metadata"]["annotations"],
            json!({
                "autoscaling.knative.dev/max-scale": "10",
                "autoscaling.knative.dev/min-scale": "0",
                "autoscaling.knative.dev/target": "100",
            })
        );
        assert_eq!(template["metadata"]["labels"]["component"], "lambda");

        let spec = &template["spec"];
        assert_eq!(spec["serviceAccountName"], deployment.service_name.as_str());
        assert!(spec.get("containerConcurrency").is_none());

        let container = &spec["containers"][0];
        assert_eq!(container["image"], "registry/x:customer-123-parser-abc");
        assert_eq!(
            container["envFrom"][0]["configMapRef"]["name"],
            deployment.service_name.config_map_name()
        );
        assert_eq!(container["ports"][0]["containerPort"], 8080);
        assert_eq!(container["resources"]["limits"]["memory"], "512Mi");
        assert_eq!(container["readinessProbe"]["tcpSocket"]["port"], 8080);
    }

    #[test]
    fn test_serving_settings_flow_into_revision() {
        let deployment = test_deployment();
        let settings = LambdaSettings {
            container_port: 9000,
            container_concurrency: Some(4),
            ..Default::default()
        };
        let object = Serving::new(&deployment, &settings)
            .build_desired_state()
            .unwrap();
        let spec = &object.data["spec"]["template"]["spec"];
        assert_eq!(spec["containerConcurrency"], 4);
        assert_eq!(spec["containers"][0]["ports"][0]["containerPort"], 9000);
    }
}
