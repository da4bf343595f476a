//! Username/password login guarded by regulation.
//!
//! Flow Overview:
//! 1) Enter the username's regulation critical section.
//! 2) Refuse banned users (or users whose history cannot be read).
//! 3) Verify the password and record the attempt.
//! 4) Open a one-factor session and hand out the cookie.
//!
//! Every refusal answers with the same 401 envelope and costs one password
//! verification, so a caller cannot tell a ban from a wrong password or an
//! unknown user by message or by timing.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use super::{ko_response, StatusResponse, AUTHENTICATION_FAILED, OPERATION_FAILED};
use crate::api::{
    session::{extract_session_token, AuthenticationLevel},
    AppState,
};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct FirstFactorRequest {
    pub username: String,
    pub password: String,
}

fn authentication_failed() -> Response {
    ko_response(StatusCode::UNAUTHORIZED, AUTHENTICATION_FAILED)
}

/// Refuse without consulting the outcome of a password check that still runs.
/// Nothing is recorded.
async fn refuse_after_check(
    state: &AppState,
    username: &str,
    password: &SecretString,
) -> Response {
    let _ = state.users().check_password(username, password).await;
    authentication_failed()
}

#[utoipa::path(
    post,
    path = "/api/firstfactor",
    request_body = FirstFactorRequest,
    responses(
        (status = 200, description = "Authenticated, session cookie set", body = StatusResponse),
        (status = 400, description = "Missing payload", body = StatusResponse),
        (status = 401, description = "Authentication failed", body = StatusResponse),
        (status = 500, description = "Session could not be created", body = StatusResponse)
    ),
    tag = "authentication"
)]
pub async fn first_factor(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<FirstFactorRequest>>,
) -> Response {
    let request: FirstFactorRequest = match payload {
        Some(Json(payload)) => payload,
        None => return ko_response(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let username = request.username.trim().to_string();
    let password = SecretString::from(request.password);
    if username.is_empty() {
        return refuse_after_check(&state, &username, &password).await;
    }

    let guard = state.regulator().lock(&username).await;

    match guard.is_banned(Utc::now()).await {
        Ok(ban) if ban.banned => {
            warn!("Rejecting login of banned user {username}");
            return refuse_after_check(&state, &username, &password).await;
        }
        Ok(_) => {}
        Err(err) => {
            error!("Unable to regulate login of {username}: {err}");
            return refuse_after_check(&state, &username, &password).await;
        }
    }

    let verified = match state.users().check_password(&username, &password).await {
        Ok(verified) => verified,
        Err(err) => {
            error!("Password check failed for {username}: {err}");
            return authentication_failed();
        }
    };

    guard.record_attempt(verified, Utc::now()).await;
    if !verified {
        info!("Invalid credentials for {username}");
        return authentication_failed();
    }

    let details = match state.users().get_details(&username).await {
        Ok(Some(details)) => details,
        Ok(None) => {
            error!("User {username} verified but has no details");
            return authentication_failed();
        }
        Err(err) => {
            error!("Failed to load details of {username}: {err}");
            return authentication_failed();
        }
    };
    drop(guard);

    // A successful login always starts from a fresh session.
    if let Some(previous) = extract_session_token(&headers) {
        state.sessions().remove(&previous).await;
    }

    let token = match state
        .sessions()
        .create(details, AuthenticationLevel::OneFactor)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session for {username}: {err}");
            return ko_response(StatusCode::INTERNAL_SERVER_ERROR, OPERATION_FAILED);
        }
    };

    let cookie = match state.sessions().cookie(&token) {
        Ok(cookie) => cookie,
        Err(err) => {
            error!("Failed to encode session cookie for {username}: {err}");
            return ko_response(StatusCode::INTERNAL_SERVER_ERROR, OPERATION_FAILED);
        }
    };

    info!("User {username} authenticated with first factor");
    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);
    (
        StatusCode::OK,
        response_headers,
        Json(StatusResponse::ok()),
    )
        .into_response()
}
