pub mod naming;
pub mod test_objects;

use std::collections::BTreeMap;

use derive_builder::Builder;
pub use naming::ServiceName;
use serde::{Deserialize, Serialize};

pub const BUILD_STATUS_SUCCESS: &str = "success";

pub const LABEL_TENANT_ID: &str = "tenant-id";
pub const LABEL_FUNCTION_ID: &str = "function-id";
pub const LABEL_COMPONENT: &str = "component";
pub const COMPONENT_LAMBDA: &str = "lambda";

const LABEL_VALUE_MAX_LEN: usize = 63;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid image reference `{0}`")]
    InvalidImageReference(String),

    #[error("field `{field}` is not a valid label value: `{value}`")]
    InvalidLabelValue { field: &'static str, value: String },

    #[error("invalid service name `{name}`: {reason}")]
    InvalidServiceName { name: String, reason: &'static str },

    #[error("build did not succeed, status `{0}`")]
    BuildNotSuccessful(String),

    #[error("unsupported event type `{0}`")]
    UnsupportedEventType(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Emitted by the build pipeline once a function image has been built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(setter(into))]
pub struct BuildCompletionEvent {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub function_id: String,
    #[serde(default)]
    pub image_reference: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
}

impl BuildCompletionEvent {
    pub fn is_success(&self) -> bool {
        self.status == BUILD_STATUS_SUCCESS
    }

    /// Checks everything the resource builders rely on. Runs before any
    /// cluster call is made.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_label_value("tenant_id", &self.tenant_id)?;
        require_label_value("function_id", &self.function_id)?;

        let image = self.image_reference.trim();
        if image.is_empty() {
            return Err(ValidationError::MissingField("image_reference"));
        }
        if image.len() != self.image_reference.len() ||
            image.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ValidationError::InvalidImageReference(
                self.image_reference.clone(),
            ));
        }
        Ok(())
    }

    pub fn service_name(&self) -> ServiceName {
        ServiceName::for_function(&self.tenant_id, &self.function_id)
    }

    /// Labels shared by every resource of the deployment.
    pub fn labels(&self) -> BTreeMap<String, String> {
        common_labels(&self.tenant_id, &self.function_id)
    }
}

/// Asks for the removal of a deployed function. Either names the service
/// directly or identifies it by its tenant and function.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDeleteEvent {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub function_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ServiceDeleteEvent {
    pub fn resolve_service_name(&self) -> Result<ServiceName, ValidationError> {
        if let Some(name) = &self.service_name {
            return ServiceName::parse(name);
        }
        if self.tenant_id.trim().is_empty() {
            return Err(ValidationError::MissingField("tenant_id"));
        }
        if self.function_id.trim().is_empty() {
            return Err(ValidationError::MissingField("function_id"));
        }
        Ok(ServiceName::for_function(&self.tenant_id, &self.function_id))
    }
}

pub fn common_labels(tenant_id: &str, function_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TENANT_ID.to_string(), tenant_id.to_string()),
        (LABEL_FUNCTION_ID.to_string(), function_id.to_string()),
        (LABEL_COMPONENT.to_string(), COMPONENT_LAMBDA.to_string()),
    ])
}

/// Whether an object carries the component label put on every managed
/// resource.
pub fn is_managed(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|labels| labels.get(LABEL_COMPONENT))
        .is_some_and(|component| component == COMPONENT_LAMBDA)
}

/// Label selector matching every managed resource of a tenant.
pub fn tenant_selector(tenant_id: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_COMPONENT, COMPONENT_LAMBDA, LABEL_TENANT_ID, tenant_id
    )
}

fn require_label_value(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if !is_label_value(value) {
        return Err(ValidationError::InvalidLabelValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

// (([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?
pub fn is_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    if value.len() > LABEL_VALUE_MAX_LEN {
        return false;
    }
    let bytes = value.as_bytes();
    let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
    first.is_ascii_alphanumeric() &&
        last.is_ascii_alphanumeric() &&
        bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
