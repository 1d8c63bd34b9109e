use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::{ServiceName, ValidationError};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::manager::{ErrorClass, ServiceError};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unavailable(message: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn unprocessable(message: &str) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        } else {
            warn!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, self.message).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::bad_request(&e.to_string())
    }
}

// Brokers redeliver on 5xx, so only transient failures answer with one.
impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let message = e.to_string();
        match e.class() {
            ErrorClass::Validation => Self::bad_request(&message),
            ErrorClass::Transient => Self::unavailable(&message),
            ErrorClass::Permanent => Self::unprocessable(&message),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TenantServices {
    pub tenant_id: String,
    pub services: Vec<String>,
}

impl TenantServices {
    pub fn new(tenant_id: &str, services: Vec<ServiceName>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            services: services.into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub namespace: String,
}
