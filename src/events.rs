//! CloudEvents decoding and dispatch to the [`ServiceManager`].

use std::sync::Arc;

use axum::http::{HeaderMap, header::CONTENT_TYPE};
use bytes::Bytes;
use data_model::{BuildCompletionEvent, ServiceDeleteEvent, ValidationError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use strum::{AsRefStr, Display};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::manager::{ServiceError, ServiceManager};

pub const EVENT_BUILD_COMPLETE: &str = "lambda.build.complete";
pub const EVENT_BUILD_FAILED: &str = "lambda.build.failed";
pub const EVENT_SERVICE_DELETE: &str = "lambda.service.delete";

const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CloudEvent {
    /// Decodes an HTTP delivery in either structured or binary content mode.
    pub fn from_http(headers: &HeaderMap, body: &Bytes) -> Result<Self, ValidationError> {
        let content_type = header(headers, CONTENT_TYPE.as_str()).unwrap_or_default();
        if content_type.starts_with(STRUCTURED_CONTENT_TYPE) {
            return serde_json::from_slice(body)
                .map_err(|e| ValidationError::MalformedPayload(e.to_string()));
        }

        let data = if body.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice(body)
                    .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?,
            )
        };
        Ok(Self {
            specversion: required_header(headers, "ce-specversion", "specversion")?,
            id: required_header(headers, "ce-id", "id")?,
            source: required_header(headers, "ce-source", "source")?,
            event_type: required_header(headers, "ce-type", "type")?,
            subject: header(headers, "ce-subject").map(str::to_string),
            data,
        })
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        let data = self
            .data
            .clone()
            .ok_or(ValidationError::MissingField("data"))?;
        serde_json::from_value(data).map_err(|e| ValidationError::MalformedPayload(e.to_string()))
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required_header(
    headers: &HeaderMap,
    name: &str,
    field: &'static str,
) -> Result<String, ValidationError> {
    match header(headers, name) {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        _ => Err(ValidationError::MissingField(field)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HandlerStatus {
    Created,
    Ignored,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResponse {
    pub status: HandlerStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

pub struct EventHandler {
    manager: Arc<ServiceManager>,
}

impl EventHandler {
    pub fn new(manager: Arc<ServiceManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ServiceManager {
        &self.manager
    }

    #[tracing::instrument(skip(self, cancel, event), fields(event_id = %event.id, event_type = %event.event_type, source = %event.source))]
    pub async fn handle(
        &self,
        cancel: &CancellationToken,
        event: CloudEvent,
    ) -> Result<HandlerResponse, ServiceError> {
        match event.event_type.as_str() {
            EVENT_BUILD_COMPLETE | EVENT_BUILD_FAILED => {
                let build: BuildCompletionEvent = event.payload()?;
                self.handle_build(cancel, &event, build).await
            }
            EVENT_SERVICE_DELETE => {
                let delete: ServiceDeleteEvent = event.payload()?;
                self.handle_delete(cancel, &event, delete).await
            }
            other => Err(ValidationError::UnsupportedEventType(other.to_string()).into()),
        }
    }

    async fn handle_build(
        &self,
        cancel: &CancellationToken,
        event: &CloudEvent,
        mut build: BuildCompletionEvent,
    ) -> Result<HandlerResponse, ServiceError> {
        if build.correlation_id.is_none() {
            build.correlation_id = Some(event.id.clone());
        }

        if !build.is_success() {
            info!(
                tenant_id = %build.tenant_id,
                function_id = %build.function_id,
                status = %build.status,
                error_message = ?build.error_message,
                "ignoring unsuccessful build"
            );
            return Ok(HandlerResponse {
                status: HandlerStatus::Ignored,
                message: format!("build status `{}`, nothing to deploy", build.status),
                service_name: None,
                correlation_id: build.correlation_id,
            });
        }

        build.validate()?;
        let name = build.service_name();
        self.manager.create_service(cancel, &name, &build).await?;
        Ok(HandlerResponse {
            status: HandlerStatus::Created,
            message: format!("service deployed with image {}", build.image_reference),
            service_name: Some(name.to_string()),
            correlation_id: build.correlation_id,
        })
    }

    async fn handle_delete(
        &self,
        cancel: &CancellationToken,
        event: &CloudEvent,
        delete: ServiceDeleteEvent,
    ) -> Result<HandlerResponse, ServiceError> {
        let name = delete.resolve_service_name()?;
        if let Some(reason) = &delete.reason {
            info!(service = %name, %reason, "deleting service");
        }
        self.manager.delete_service(cancel, &name).await?;
        Ok(HandlerResponse {
            status: HandlerStatus::Deleted,
            message: "service deleted".to_string(),
            service_name: Some(name.to_string()),
            correlation_id: delete.correlation_id.or_else(|| Some(event.id.clone())),
        })
    }
}
