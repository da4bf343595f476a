//! Forward-auth decision endpoint.
//!
//! Flow Overview:
//! 1) Rebuild the original request from the `X-Forwarded-*` headers set by the proxy.
//! 2) Resolve the caller's session (if any) into an access control subject.
//! 3) Evaluate the rules and answer 200 (allow), 401 (authenticate) or 403 (deny).
//!
//! Allowed authenticated requests carry `Remote-*` headers describing the user
//! so the proxy can forward them to the protected application.

use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use std::{net::IpAddr, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
    access_control::{PolicyLevel, Target},
    api::{
        session::{AuthenticationLevel, Session},
        AppState,
    },
};

const REMOTE_USER: HeaderName = HeaderName::from_static("remote-user");
const REMOTE_GROUPS: HeaderName = HeaderName::from_static("remote-groups");
const REMOTE_NAME: HeaderName = HeaderName::from_static("remote-name");
const REMOTE_EMAIL: HeaderName = HeaderName::from_static("remote-email");

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ForwardedError {
    #[error("missing {0} header")]
    Missing(&'static str),
    #[error("invalid {0} header")]
    Invalid(&'static str),
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, ForwardedError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| ForwardedError::Invalid(name))
        })
        .transpose()
        .map(|value| value.filter(|value| !value.is_empty()))
}

/// First hop of `X-Forwarded-For`, falling back to `X-Real-IP`.
fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Rebuild the protected request from the proxy headers.
pub(crate) fn forwarded_target(headers: &HeaderMap) -> Result<Target, ForwardedError> {
    let proto = header(headers, "x-forwarded-proto")?
        .ok_or(ForwardedError::Missing("X-Forwarded-Proto"))?;
    let host = header(headers, "x-forwarded-host")?
        .ok_or(ForwardedError::Missing("X-Forwarded-Host"))?;
    let uri = header(headers, "x-forwarded-uri")?.unwrap_or("/");
    let separator = if uri.starts_with('/') { "" } else { "/" };

    let url = Url::parse(&format!("{proto}://{host}{separator}{uri}"))
        .map_err(|_| ForwardedError::Invalid("X-Forwarded-Host"))?;
    let domain = url
        .host_str()
        .ok_or(ForwardedError::Invalid("X-Forwarded-Host"))?;

    let method = match header(headers, "x-forwarded-method")? {
        Some(method) => Method::from_str(&method.to_ascii_uppercase())
            .map_err(|_| ForwardedError::Invalid("X-Forwarded-Method"))?,
        None => Method::GET,
    };

    let ip = extract_client_ip(headers)
        .ok_or(ForwardedError::Missing("X-Forwarded-For"))?
        .parse::<IpAddr>()
        .map_err(|_| ForwardedError::Invalid("X-Forwarded-For"))?;

    Ok(Target::new(domain, url.path(), method, ip))
}

fn remote_headers(session: &Session) -> HeaderMap {
    let user = &session.user;
    let values = [
        (REMOTE_USER, Some(user.username.clone())),
        (REMOTE_GROUPS, Some(user.groups.join(","))),
        (REMOTE_NAME, Some(user.display_name.clone())),
        (REMOTE_EMAIL, user.email.clone()),
    ];

    let mut headers = HeaderMap::new();
    for (name, value) in values {
        let Some(value) = value else {
            continue;
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(err) => error!("Failed to encode {name} header for {}: {err}", user.username),
        }
    }
    headers
}

#[utoipa::path(
    get,
    path = "/api/verify",
    params(
        ("X-Forwarded-Proto" = String, Header, description = "Scheme of the original request"),
        ("X-Forwarded-Host" = String, Header, description = "Host of the original request"),
        ("X-Forwarded-Uri" = Option<String>, Header, description = "Path and query of the original request"),
        ("X-Forwarded-Method" = Option<String>, Header, description = "Method of the original request, GET when absent"),
        ("X-Forwarded-For" = String, Header, description = "Client address chain; the first hop is used")
    ),
    responses(
        (status = 200, description = "Request may proceed"),
        (status = 400, description = "Forwarded headers are missing or invalid"),
        (status = 401, description = "Authentication required"),
        (status = 403, description = "Request is denied")
    ),
    tag = "verify"
)]
pub async fn verify(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    let target = match forwarded_target(&headers) {
        Ok(target) => target,
        Err(err) => {
            warn!("Rejecting verify request: {err}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let session = state.sessions().lookup(&headers).await;
    let subject = session.as_ref().and_then(Session::subject);
    let policy = state.access_control().evaluate(subject.as_ref(), &target);
    let level = session
        .as_ref()
        .map_or(AuthenticationLevel::NotAuthenticated, |session| session.level);

    debug!(
        domain = target.domain(),
        path = target.path(),
        method = %target.method(),
        policy = %policy,
        "verify decision"
    );

    match policy {
        PolicyLevel::Bypass => StatusCode::OK.into_response(),
        PolicyLevel::Deny => StatusCode::FORBIDDEN.into_response(),
        PolicyLevel::OneFactor | PolicyLevel::TwoFactor => match session {
            Some(session) if level.satisfies(policy) => {
                (StatusCode::OK, remote_headers(&session)).into_response()
            }
            _ => StatusCode::UNAUTHORIZED.into_response(),
        },
    }
}
