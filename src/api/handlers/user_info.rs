//! Second-factor preferences of the logged-in user.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};
use utoipa::ToSchema;

use super::{ko_response, ok_response, StatusResponse, OPERATION_FAILED, UNAUTHORIZED};
use crate::{
    api::{session::Session, AppState},
    preferences::{Method, UserPreferences},
};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MethodRequest {
    pub method: String,
}

async fn authenticated(headers: &HeaderMap, state: &AppState) -> Option<Session> {
    state
        .sessions()
        .lookup(headers)
        .await
        .filter(|session| session.subject().is_some())
}

#[utoipa::path(
    get,
    path = "/api/user/info",
    responses(
        (status = 200, description = "Second-factor preferences", body = UserPreferences),
        (status = 401, description = "No valid session", body = StatusResponse),
        (status = 500, description = "Preferences could not be loaded", body = StatusResponse)
    ),
    tag = "user"
)]
pub async fn user_info(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    let Some(session) = authenticated(&headers, &state).await else {
        return ko_response(StatusCode::UNAUTHORIZED, UNAUTHORIZED);
    };
    let username = &session.user.username;

    let (preferences, errors) = state.preferences().load(username).await;
    if !errors.is_empty() {
        for err in &errors {
            error!("Unable to load preferences of {username}: {err}");
        }
        debug!(?preferences, failed = errors.len(), "partial preferences of {username}");
        return ko_response(StatusCode::INTERNAL_SERVER_ERROR, OPERATION_FAILED);
    }

    (StatusCode::OK, Json(preferences)).into_response()
}

#[utoipa::path(
    post,
    path = "/api/user/info/2fa_method",
    request_body = MethodRequest,
    responses(
        (status = 200, description = "Preferred method saved", body = StatusResponse),
        (status = 400, description = "Unknown method or missing payload", body = StatusResponse),
        (status = 401, description = "No valid session", body = StatusResponse),
        (status = 500, description = "Preference could not be saved", body = StatusResponse)
    ),
    tag = "user"
)]
pub async fn set_method(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<MethodRequest>>,
) -> Response {
    let Some(session) = authenticated(&headers, &state).await else {
        return ko_response(StatusCode::UNAUTHORIZED, UNAUTHORIZED);
    };
    let username = &session.user.username;

    let request: MethodRequest = match payload {
        Some(Json(payload)) => payload,
        None => return ko_response(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let method = match request.method.parse::<Method>() {
        Ok(method) => method,
        Err(err) => return ko_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    match state.preferences().save_method(username, method).await {
        Ok(()) => {
            info!("User {username} now prefers {method}");
            ok_response()
        }
        Err(err) => {
            error!("Failed to save preferred method of {username}: {err}");
            ko_response(StatusCode::INTERNAL_SERVER_ERROR, OPERATION_FAILED)
        }
    }
}
