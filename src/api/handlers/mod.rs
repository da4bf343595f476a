//! Route handlers and the shared response envelope.
//!
//! Clients only ever see one of the fixed messages below; the specific cause
//! of a failure is logged server-side.

pub mod first_factor;
pub mod health;
pub mod logout;
pub mod user_info;
pub mod verify;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const AUTHENTICATION_FAILED: &str = "Authentication failed. Check your credentials.";
pub const OPERATION_FAILED: &str = "Operation failed.";
pub const UNAUTHORIZED: &str = "Unauthorized.";

/// `{"status":"OK"}` or `{"status":"KO","message":...}`.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "OK".to_string(),
            message: None,
        }
    }

    #[must_use]
    pub fn ko(message: impl Into<String>) -> Self {
        Self {
            status: "KO".to_string(),
            message: Some(message.into()),
        }
    }
}

pub(crate) fn ok_response() -> Response {
    (StatusCode::OK, Json(StatusResponse::ok())).into_response()
}

pub(crate) fn ko_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(StatusResponse::ko(message))).into_response()
}
