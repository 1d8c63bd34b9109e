use std::{collections::BTreeMap, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Result, anyhow};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use lambda_utils::RetryPolicy;
use serde::{Deserialize, Serialize};

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "LAMBDA_MANAGER_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterConfig {
    /// Talks to the API server from the ambient kubeconfig or the in-cluster
    /// service account.
    Kubernetes,
    /// Keeps objects in process memory. For local runs.
    InMemory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerResources {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

impl Default for ContainerResources {
    fn default() -> Self {
        Self {
            requests: BTreeMap::from([
                ("cpu".to_string(), "100m".to_string()),
                ("memory".to_string(), "128Mi".to_string()),
            ]),
            limits: BTreeMap::from([
                ("cpu".to_string(), "1000m".to_string()),
                ("memory".to_string(), "512Mi".to_string()),
            ]),
        }
    }
}

/// How the broker redelivers events the function failed to handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryPolicy {
    pub retry: u32,
    pub backoff_policy: String,
    /// ISO-8601 duration.
    pub backoff_delay: String,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retry: 5,
            backoff_policy: "exponential".to_string(),
            backoff_delay: "PT1S".to_string(),
        }
    }
}

/// Settings applied to every deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaSettings {
    pub broker: String,
    pub container_port: u16,
    /// Extra entries written to every function's ConfigMap.
    pub function_env: BTreeMap<String, String>,
    pub resources: ContainerResources,
    pub container_concurrency: Option<u32>,
    pub enable_service_links: bool,
    pub delivery: DeliveryPolicy,
    pub trigger_parallelism: Option<u32>,
}

impl Default for LambdaSettings {
    fn default() -> Self {
        Self {
            broker: "default".to_string(),
            container_port: 8080,
            function_env: BTreeMap::new(),
            resources: ContainerResources::default(),
            container_concurrency: None,
            enable_service_links: false,
            delivery: DeliveryPolicy::default(),
            trigger_parallelism: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub env: String,
    pub listen_addr: String,
    pub namespace: String,
    pub cluster: ClusterConfig,
    pub lambda: LambdaSettings,
    /// Backoff around each resource apply. Off unless `max_retries > 0`.
    pub retry: RetryPolicy,
    /// Re-reads after a resourceVersion conflict before giving up.
    pub max_conflict_retries: u32,
    /// Deadline for a single manager operation. 0 disables it.
    pub operation_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            namespace: "knative-lambda".to_string(),
            cluster: ClusterConfig::Kubernetes,
            lambda: LambdaSettings::default(),
            retry: RetryPolicy::default(),
            max_conflict_retries: 5,
            operation_timeout_secs: 30,
        }
    }
}

impl ManagerConfig {
    /// Defaults, then the YAML file if given, then `LAMBDA_MANAGER_*`
    /// variables with nested keys separated by `__`.
    pub fn load(path: Option<&Path>) -> Result<ManagerConfig> {
        let mut figment = Figment::from(Serialized::defaults(ManagerConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(anyhow!("config file {} does not exist", path.display()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: ManagerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &str) -> Result<ManagerConfig> {
        Self::load(Some(Path::new(path)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.namespace.trim().is_empty() {
            return Err(anyhow!("namespace must not be empty"));
        }
        if self.lambda.broker.trim().is_empty() {
            return Err(anyhow!("lambda.broker must not be empty"));
        }
        if self.lambda.container_port == 0 {
            return Err(anyhow!("lambda.container_port must not be 0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!(
                "retry.initial_delay_ms ({}) is larger than retry.max_delay_ms ({})",
                self.retry.initial_delay_ms,
                self.retry.max_delay_ms
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_secs > 0).then(|| Duration::from_secs(self.operation_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn test_parse_sample_config() {
        // Jail serializes access to the process environment.
        Jail::expect_with(|_| {
            let config = ManagerConfig::from_path(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/sample_config.yaml"
            ))
            .map_err(|e| e.to_string())?;
            assert_eq!(config.env, "production");
            assert_eq!(config.namespace, "knative-lambda");
            assert_eq!(config.cluster, ClusterConfig::Kubernetes);
            assert_eq!(config.lambda.broker, "knative-lambda-service-broker");
            assert_eq!(config.lambda.container_concurrency, Some(10));
            assert_eq!(config.lambda.trigger_parallelism, Some(50));
            assert_eq!(config.lambda.function_env["LOG_LEVEL"], "info");
            assert_eq!(config.lambda.delivery.retry, 5);
            assert_eq!(config.retry.max_retries, 3);
            assert!(config.structured_logging());
            Ok(())
        });
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.structured_logging());
        assert!(!config.retry.is_enabled());
        assert_eq!(config.operation_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
namespace: from-file
cluster: in_memory
lambda:
  broker: file-broker
"#,
            )?;
            jail.set_env("LAMBDA_MANAGER_NAMESPACE", "from-env");
            jail.set_env("LAMBDA_MANAGER_LAMBDA__CONTAINER_PORT", "9090");

            let config = ManagerConfig::load(Some(Path::new("config.yaml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.namespace, "from-env");
            assert_eq!(config.cluster, ClusterConfig::InMemory);
            assert_eq!(config.lambda.broker, "file-broker");
            assert_eq!(config.lambda.container_port, 9090);
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ManagerConfig {
            listen_addr: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.listen_addr = "0.0.0.0:8080".to_string();
        config.namespace = " ".to_string();
        assert!(config.validate().is_err());

        config.namespace = "lambdas".to_string();
        config.retry.initial_delay_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ManagerConfig::load(Some(Path::new("does-not-exist.yaml"))).is_err());
    }
}
