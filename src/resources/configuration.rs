use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;

use super::{Deployment, ManagedResource, OwnedField, to_dynamic};
use crate::{cluster::ResourceKind, config::LambdaSettings};

pub const KEY_TENANT_ID: &str = "TENANT_ID";
pub const KEY_FUNCTION_ID: &str = "FUNCTION_ID";
pub const KEY_SERVICE_NAME: &str = "SERVICE_NAME";

/// ConfigMap surfaced to the function container as environment.
///
/// The image reference is not part of it, so a new build only changes the
/// serving object.
pub struct Configuration {
    name: String,
    config_map: ConfigMap,
}

impl Configuration {
    pub fn new(deployment: &Deployment, settings: &LambdaSettings) -> Self {
        let metadata = deployment.object_meta(ResourceKind::ConfigMap);

        let mut data: BTreeMap<String, String> = settings.function_env.clone();
        data.insert(
            KEY_TENANT_ID.to_string(),
            deployment.event.tenant_id.clone(),
        );
        data.insert(
            KEY_FUNCTION_ID.to_string(),
            deployment.event.function_id.clone(),
        );
        data.insert(
            KEY_SERVICE_NAME.to_string(),
            deployment.service_name.to_string(),
        );

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            config_map: ConfigMap {
                metadata,
                data: Some(data),
                ..Default::default()
            },
        }
    }
}

impl ManagedResource for Configuration {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ConfigMap
    }

    fn key(&self) -> &str {
        &self.name
    }

    fn build_desired_state(&self) -> serde_json::Result<DynamicObject> {
        to_dynamic(&self.config_map)
    }

    fn owned_fields(&self) -> &'static [OwnedField] {
        &[OwnedField::Replace("data")]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resources::tests::test_deployment;

    #[test]
    fn test_config_map_contents() {
        let deployment = test_deployment();
        let settings = LambdaSettings {
            function_env: BTreeMap::from([
                ("LOG_LEVEL".to_string(), "debug".to_string()),
                // identity keys cannot be overridden
                (KEY_TENANT_ID.to_string(), "someone-else".to_string()),
            ]),
            ..Default::default()
        };
        let configuration = Configuration::new(&deployment, &settings);
        assert_eq!(
            configuration.key(),
            format!("{}-config", deployment.service_name)
        );

        let object = configuration.build_desired_state().unwrap();
        assert_eq!(
            object.data["data"],
            json!({
                "FUNCTION_ID": "parser-abc",
                "LOG_LEVEL": "debug",
                "SERVICE_NAME": deployment.service_name.as_str(),
                "TENANT_ID": "customer-123",
            })
        );
    }

    #[test]
    fn test_config_map_does_not_depend_on_image() {
        let deployment = test_deployment();
        let mut upgraded = deployment.clone();
        upgraded.event.image_reference = "registry/x:other".to_string();

        let settings = LambdaSettings::default();
        let before = Configuration::new(&deployment, &settings)
            .build_desired_state()
            .unwrap();
        let after = Configuration::new(&upgraded, &settings)
            .build_desired_state()
            .unwrap();
        assert_eq!(before.data, after.data);
    }
}
