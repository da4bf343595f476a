//! In-memory sessions keyed by the SHA-256 of an opaque cookie token.
//!
//! Raw tokens only ever live in the client's cookie; the store keeps hashes.

use anyhow::{Context, Result};
use axum::http::{
    header::{InvalidHeaderValue, AUTHORIZATION, COOKIE},
    HeaderMap, HeaderValue,
};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    access_control::{PolicyLevel, Subject},
    config::SessionConfig,
    users::UserDetails,
};

pub const SESSION_COOKIE_NAME: &str = "vigil_session";

/// How strongly the session holder proved their identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthenticationLevel {
    NotAuthenticated,
    OneFactor,
    TwoFactor,
}

impl AuthenticationLevel {
    /// Whether this level is enough for `policy`. `deny` is never satisfied.
    #[must_use]
    pub fn satisfies(self, policy: PolicyLevel) -> bool {
        match policy {
            PolicyLevel::Bypass => true,
            PolicyLevel::OneFactor => self >= Self::OneFactor,
            PolicyLevel::TwoFactor => self >= Self::TwoFactor,
            PolicyLevel::Deny => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    pub user: UserDetails,
    pub level: AuthenticationLevel,
    expires_at: Instant,
}

impl Session {
    /// Identity used for access control; `None` until a factor was verified.
    #[must_use]
    pub fn subject(&self) -> Option<Subject> {
        (self.level >= AuthenticationLevel::OneFactor)
            .then(|| Subject::new(self.user.username.clone(), self.user.groups.clone()))
    }
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Vec<u8>, Session>>,
    ttl: Duration,
    secure: bool,
}

impl SessionStore {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: config.ttl,
            secure: config.secure,
        }
    }

    /// Open a session for `user` and return the raw token for the cookie.
    ///
    /// # Errors
    /// Returns an error if the operating system RNG fails.
    pub async fn create(&self, user: UserDetails, level: AuthenticationLevel) -> Result<String> {
        let token = generate_session_token()?;
        let now = Instant::now();
        let session = Session {
            user,
            level,
            expires_at: now + self.ttl,
        };

        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, session| session.expires_at > now);
        sessions.insert(hash_session_token(&token), session);
        Ok(token)
    }

    /// Look up a live session. Expired sessions are dropped on access.
    pub async fn get(&self, token: &str) -> Option<Session> {
        let key = hash_session_token(token);
        let now = Instant::now();

        {
            let sessions = self.sessions.read().await;
            match sessions.get(&key) {
                Some(session) if session.expires_at > now => return Some(session.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        debug!("Dropping expired session");
        self.sessions.write().await.remove(&key);
        None
    }

    pub async fn remove(&self, token: &str) {
        self.sessions
            .write()
            .await
            .remove(&hash_session_token(token));
    }

    /// Resolve the session referenced by the request's cookie or bearer token.
    pub async fn lookup(&self, headers: &HeaderMap) -> Option<Session> {
        let token = extract_session_token(headers)?;
        self.get(&token).await
    }

    /// Build a `HttpOnly` cookie for the session token.
    ///
    /// # Errors
    /// Returns `InvalidHeaderValue` if the token contains invalid characters.
    pub fn cookie(&self, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        let ttl_seconds = self.ttl.as_secs();
        let mut cookie = format!(
            "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }

    /// # Errors
    /// Returns `InvalidHeaderValue` if the cookie cannot be encoded.
    pub fn clear_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie =
            format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }
}

/// Generate a random 256-bit session token, base64url encoded.
///
/// # Errors
/// Returns an error if the operating system RNG fails.
pub fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[must_use]
pub fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Session token from a `Bearer` authorization header or the session cookie.
#[must_use]
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == SESSION_COOKIE_NAME)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
