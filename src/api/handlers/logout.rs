use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{debug, error};

use super::StatusResponse;
use crate::api::{session::extract_session_token, AppState};

/// Drop the current session (if any) and expire the cookie.
#[utoipa::path(
    post,
    path = "/api/logout",
    responses(
        (status = 200, description = "Logged out", body = StatusResponse)
    ),
    tag = "authentication"
)]
pub async fn logout(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    if let Some(token) = extract_session_token(&headers) {
        state.sessions().remove(&token).await;
        debug!("Session removed");
    }

    let mut response_headers = HeaderMap::new();
    match state.sessions().clear_cookie() {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build logout cookie: {err}"),
    }

    (StatusCode::OK, response_headers, Json(StatusResponse::ok())).into_response()
}
