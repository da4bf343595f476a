use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};
use tower::ServiceExt;
use vigil::{
    access_control::AccessControl,
    api::{self, AppState},
    config::Config,
    preferences::Method,
    storage::{
        AttemptRecord, AttemptStore, DeviceHandle, MemoryStore, PreferenceStore, StorageError,
    },
    users::{hash_password, FileUserBackend},
};

const CONFIG: &str = r#"
[access_control]
default_policy = "deny"

[[access_control.rules]]
domain = "public.example.com"
policy = "bypass"

[[access_control.rules]]
domain = "*.example.com"
resources = ["^/admin"]
subject = "group:admins"
policy = "two_factor"

[[access_control.rules]]
domain = ["secure.example.com", "app.example.com"]
policy = "one_factor"

[[access_control.rules]]
domain = "blocked.example.com"
policy = "deny"

[regulation]
max_retries = 3
find_time = "2m"
ban_time = "5m"

[session]
ttl = "1h"

[storage]
timeout = "2s"

[authentication_backend.file]
path = "/etc/vigil/users.toml"
"#;

fn password_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| {
        hash_password(&SecretString::from("password".to_string())).expect("hash password")
    })
}

fn users() -> Result<FileUserBackend> {
    let hash = password_hash();
    let content = format!(
        r#"
[users.john]
displayname = "John Doe"
email = "john.doe@example.com"
password = "{hash}"
groups = ["admins", "dev"]

[users.harry]
displayname = "Harry Potter"
password = "{hash}"
groups = []
"#
    );
    Ok(FileUserBackend::parse(&content)?)
}

fn state_with<S>(store: Arc<S>) -> Result<Arc<AppState>>
where
    S: AttemptStore + PreferenceStore + 'static,
{
    let config = Config::parse(CONFIG)?;
    let access_control = AccessControl::new(&config.access_control)?;
    Ok(Arc::new(AppState::with_store(
        &config,
        access_control,
        store,
        Arc::new(users()?),
    )))
}

// find_time + ban_time of CONFIG
const HISTORY_WINDOW: Duration = Duration::from_secs(7 * 60);

fn app_with_memory() -> Result<(Router, Arc<MemoryStore>)> {
    let store = Arc::new(MemoryStore::new(HISTORY_WINDOW));
    Ok((api::app(state_with(store.clone())?), store))
}

fn verify_request(host: &str, uri: &str, cookie: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method("GET")
        .uri("/api/verify")
        .header("x-forwarded-proto", "https")
        .header("x-forwarded-host", host)
        .header("x-forwarded-uri", uri)
        .header("x-forwarded-for", "10.0.0.1");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    Ok(builder.body(Body::empty())?)
}

fn json_request(uri: &str, body: &serde_json::Value, cookie: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    Ok(builder.body(Body::from(serde_json::to_vec(body)?))?)
}

fn get_request(uri: &str, cookie: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    Ok(builder.body(Body::empty())?)
}

async fn json_body(response: Response) -> Result<serde_json::Value> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn session_cookie(response: &Response) -> Result<String> {
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .context("missing set-cookie")?
        .to_str()?;
    let pair = set_cookie.split(';').next().context("empty cookie")?;
    Ok(pair.to_string())
}

async fn login(app: &Router, username: &str, password: &str) -> Result<Response> {
    let request = json_request(
        "/api/firstfactor",
        &serde_json::json!({"username": username, "password": password}),
        None,
    )?;
    Ok(app.clone().oneshot(request).await?)
}

async fn login_cookie(app: &Router, username: &str) -> Result<String> {
    let response = login(app, username, "password").await?;
    assert_eq!(response.status(), StatusCode::OK);
    session_cookie(&response)
}

#[tokio::test]
async fn verify_without_session() -> Result<()> {
    let (app, _) = app_with_memory()?;

    let cases = [
        ("public.example.com", "/", StatusCode::OK),
        ("secure.example.com", "/", StatusCode::UNAUTHORIZED),
        ("blocked.example.com", "/", StatusCode::FORBIDDEN),
        ("unknown.org", "/", StatusCode::FORBIDDEN),
    ];
    for (host, uri, expected) in cases {
        let response = app.clone().oneshot(verify_request(host, uri, None)?).await?;
        assert_eq!(response.status(), expected, "{host}{uri}");
    }
    Ok(())
}

#[tokio::test]
async fn verify_rejects_incomplete_forwarded_headers() -> Result<()> {
    let (app, _) = app_with_memory()?;
    let request = Request::builder()
        .uri("/api/verify")
        .header("x-forwarded-host", "secure.example.com")
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn verify_with_one_factor_session() -> Result<()> {
    let (app, _) = app_with_memory()?;
    let cookie = login_cookie(&app, "john").await?;

    let response = app
        .clone()
        .oneshot(verify_request("secure.example.com", "/", Some(&cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("remote-user").map(|v| v.as_bytes()), Some(&b"john"[..]));
    assert_eq!(
        headers.get("remote-groups").map(|v| v.as_bytes()),
        Some(&b"admins,dev"[..])
    );
    assert_eq!(
        headers.get("remote-name").map(|v| v.as_bytes()),
        Some(&b"John Doe"[..])
    );
    assert_eq!(
        headers.get("remote-email").map(|v| v.as_bytes()),
        Some(&b"john.doe@example.com"[..])
    );

    // Admin pages of members of `admins` need a second factor.
    let response = app
        .clone()
        .oneshot(verify_request("secure.example.com", "/admin/users", Some(&cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Harry is not in `admins`, so the two-factor rule does not apply.
    let cookie = login_cookie(&app, "harry").await?;
    let response = app
        .oneshot(verify_request("app.example.com", "/admin/users", Some(&cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn first_factor_failures_share_one_message() -> Result<()> {
    let (app, _) = app_with_memory()?;

    for (username, password) in [("john", "wrong"), ("nobody", "password"), ("", "password")] {
        let response = login(&app, username, password).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(
            json_body(response).await?,
            serde_json::json!({
                "status": "KO",
                "message": "Authentication failed. Check your credentials."
            })
        );
    }
    Ok(())
}

#[tokio::test]
async fn repeated_failures_ban_the_user() -> Result<()> {
    let (app, store) = app_with_memory()?;

    for _ in 0..3 {
        let response = login(&app, "john", "wrong").await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // Banned: the correct password is refused with the same message.
    let response = login(&app, "john", "password").await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(response).await?["message"],
        "Authentication failed. Check your credentials."
    );

    let since = Utc::now() - chrono::TimeDelta::hours(1);
    let history = store.load_recent_attempts("john", since).await?;
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|attempt| !attempt.success));

    // Other users are unaffected.
    let response = login(&app, "harry", "password").await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

async fn timed_login(app: &Router, username: &str, password: &str) -> Result<Duration> {
    let started = Instant::now();
    let response = login(app, username, password).await?;
    let elapsed = started.elapsed();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(elapsed)
}

#[tokio::test]
async fn refused_logins_cost_a_password_check() -> Result<()> {
    let (app, store) = app_with_memory()?;

    for _ in 0..3 {
        login(&app, "john", "wrong").await?;
    }
    let wrong = timed_login(&app, "harry", "wrong").await?;
    let banned = timed_login(&app, "john", "wrong").await?;
    let empty = timed_login(&app, "", "wrong").await?;

    assert!(banned * 5 > wrong, "banned {banned:?} vs wrong {wrong:?}");
    assert!(empty * 5 > wrong, "empty {empty:?} vs wrong {wrong:?}");

    // The refused attempt of the banned user is not recorded.
    let since = Utc::now() - chrono::TimeDelta::hours(1);
    assert_eq!(store.load_recent_attempts("john", since).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn logout_drops_the_session() -> Result<()> {
    let (app, _) = app_with_memory()?;
    let cookie = login_cookie(&app, "john").await?;

    let response = app
        .clone()
        .oneshot(json_request("/api/logout", &serde_json::json!({}), Some(&cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_cookie(&response)?.ends_with('='));

    let response = app
        .oneshot(verify_request("secure.example.com", "/", Some(&cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn user_info_requires_session() -> Result<()> {
    let (app, _) = app_with_memory()?;
    let response = app.oneshot(get_request("/api/user/info", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn user_info_reports_preferences() -> Result<()> {
    let (app, store) = app_with_memory()?;
    let cookie = login_cookie(&app, "john").await?;

    let response = app
        .clone()
        .oneshot(get_request("/api/user/info", Some(&cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await?,
        serde_json::json!({"method": "totp", "has_totp": false, "has_u2f": false})
    );

    store
        .set_u2f_device(
            "john",
            DeviceHandle {
                key_handle: vec![1, 2, 3],
                public_key: vec![4, 5, 6],
            },
        )
        .await;
    store
        .set_totp_secret("john", SecretString::from("JBSWY3DPEHPK3PXP".to_string()))
        .await;

    let response = app
        .clone()
        .oneshot(json_request(
            "/api/user/info/2fa_method",
            &serde_json::json!({"method": "u2f"}),
            Some(&cookie),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await?, serde_json::json!({"status": "OK"}));

    let response = app
        .oneshot(get_request("/api/user/info", Some(&cookie))?)
        .await?;
    assert_eq!(
        json_body(response).await?,
        serde_json::json!({"method": "u2f", "has_totp": true, "has_u2f": true})
    );
    Ok(())
}

#[tokio::test]
async fn unknown_method_is_rejected() -> Result<()> {
    let (app, store) = app_with_memory()?;
    let cookie = login_cookie(&app, "john").await?;

    let response = app
        .oneshot(json_request(
            "/api/user/info/2fa_method",
            &serde_json::json!({"method": "sms"}),
            Some(&cookie),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await?,
        serde_json::json!({
            "status": "KO",
            "message": "Unknown method 'sms', it should be one of totp, u2f, mobile_push"
        })
    );
    assert_eq!(store.load_preferred_method("john").await?, None);
    Ok(())
}

/// Healthy attempt history, broken preference storage.
struct BrokenPreferences {
    attempts: MemoryStore,
}

impl BrokenPreferences {
    fn new() -> Self {
        Self {
            attempts: MemoryStore::new(HISTORY_WINDOW),
        }
    }
}

#[async_trait]
impl AttemptStore for BrokenPreferences {
    async fn append_attempt(&self, record: &AttemptRecord) -> Result<(), StorageError> {
        self.attempts.append_attempt(record).await
    }

    async fn load_recent_attempts(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, StorageError> {
        self.attempts.load_recent_attempts(username, since).await
    }
}

#[async_trait]
impl PreferenceStore for BrokenPreferences {
    async fn load_preferred_method(&self, _username: &str) -> Result<Option<Method>, StorageError> {
        Ok(Some(Method::MobilePush))
    }

    async fn save_preferred_method(
        &self,
        _username: &str,
        _method: Method,
    ) -> Result<(), StorageError> {
        Err(StorageError::Backend("connection reset".to_string()))
    }

    async fn load_u2f_device_handle(
        &self,
        _username: &str,
    ) -> Result<Option<DeviceHandle>, StorageError> {
        Err(StorageError::Backend("connection reset".to_string()))
    }

    async fn load_totp_secret(&self, _username: &str) -> Result<Option<SecretString>, StorageError> {
        Ok(None)
    }
}

#[tokio::test]
async fn storage_failures_stay_generic() -> Result<()> {
    let app = api::app(state_with(Arc::new(BrokenPreferences::new()))?);
    let cookie = login_cookie(&app, "john").await?;

    let response = app
        .clone()
        .oneshot(get_request("/api/user/info", Some(&cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json_body(response).await?,
        serde_json::json!({"status": "KO", "message": "Operation failed."})
    );

    let response = app
        .oneshot(json_request(
            "/api/user/info/2fa_method",
            &serde_json::json!({"method": "totp"}),
            Some(&cookie),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json_body(response).await?,
        serde_json::json!({"status": "KO", "message": "Operation failed."})
    );
    Ok(())
}

#[tokio::test]
async fn responses_carry_a_request_id() -> Result<()> {
    let (app, _) = app_with_memory()?;
    let response = app.oneshot(get_request("/api/health", None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    Ok(())
}
