//! Login, sessions and the role guards.
//!
//! Credentials are checked against the `users` table of the backend (the
//! hosted service's own auth is not used). A successful login stores the
//! trimmed [`SessionUser`] in an in-memory session map keyed by a random
//! id that travels in the `session` cookie.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Form, Json,
    extract::{Query, Request, State},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use lazy_static::lazy_static;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::AppError;
use crate::models::{AccountStatus, Role, SessionUser, USERS, User};
use crate::store::{Backend, Query as RowQuery, StoreError, decode_rows};
use crate::views::redirect_with_error;

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "session";

/// User session data
///
/// Represents an authenticated user session.
#[derive(Debug, Clone)]
pub struct Session {
    /// The trimmed user record resolved at login
    pub user: SessionUser,

    /// Time when the session expires
    pub expires_at: SystemTime,
}

/// Global sessions storage
///
/// Stores all active user sessions in a thread-safe map.
lazy_static! {
    static ref SESSIONS: RwLock<HashMap<String, Session>> = RwLock::new(HashMap::new());
}

fn sessions_read() -> RwLockReadGuard<'static, HashMap<String, Session>> {
    SESSIONS.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sessions_write() -> RwLockWriteGuard<'static, HashMap<String, Session>> {
    SESSIONS.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Credential data for login
///
/// Used to receive the login form data from the client.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginPageQuery {
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Fill in all fields.")]
    MissingFields,

    #[error("Invalid username or password.")]
    InvalidCredentials,

    #[error("Connection error. Try again.")]
    Backend(#[from] StoreError),
}

/// Hash a password for storage
///
/// Uses Argon2 with a random salt.
///
/// # Arguments
/// * `password` - The plaintext password to hash
///
/// # Returns
/// * `Result<String, AppError>` - The PHC-formatted hash or an error
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    match argon2.hash_password(password.as_bytes(), &salt) {
        Ok(hash) => Ok(hash.to_string()),
        Err(e) => Err(AppError::InternalError(
            format!("Password hashing failed: {e}").into(),
        )),
    }
}

/// Verify a password against the stored value
///
/// Stored values starting with `$argon2` are checked as Argon2 hashes.
/// Anything else is a legacy plaintext password and is compared directly.
///
/// # Arguments
/// * `password` - The plaintext password to verify
/// * `stored` - The value from the `password` column
///
/// # Returns
/// * `bool` - True if the password matches
pub fn verify_password(password: &str, stored: &str) -> bool {
    if stored.starts_with("$argon2") {
        return match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                warn!("Unreadable password hash: {e}");
                false
            }
        };
    }

    !stored.is_empty() && stored == password
}

/// Check a username/password pair against the `users` table
///
/// The username is trimmed and only `ACTIVO` accounts match.
///
/// # Arguments
/// * `backend` - Row store holding the `users` table
/// * `username` - Username as typed
/// * `password` - Password as typed
///
/// # Returns
/// * `Result<SessionUser, LoginError>` - The trimmed user record or the reason for refusal
pub async fn authenticate(
    backend: &dyn Backend,
    username: &str,
    password: &str,
) -> Result<SessionUser, LoginError> {
    let username = username.trim();
    if username.is_empty() || password.trim().is_empty() {
        return Err(LoginError::MissingFields);
    }

    let rows = backend
        .select(
            &RowQuery::table(USERS)
                .eq("username", username)
                .eq("status", AccountStatus::Active.as_str())
                .limit(1),
        )
        .await?;

    let user = decode_rows::<User>(USERS, rows)
        .into_iter()
        .next()
        .ok_or(LoginError::InvalidCredentials)?;

    match user.password.as_deref() {
        Some(stored) if verify_password(password, stored) => Ok(SessionUser::from(user)),
        _ => Err(LoginError::InvalidCredentials),
    }
}

/// Create a new user session
///
/// # Arguments
/// * `user` - The authenticated user record
/// * `duration` - How long the session stays valid
///
/// # Returns
/// * `String` - A unique session ID
pub fn create_session(user: SessionUser, duration: Duration) -> String {
    let session_id = Uuid::new_v4().to_string();
    let session = Session {
        user,
        expires_at: SystemTime::now() + duration,
    };

    let mut sessions = sessions_write();
    sessions.retain(|_, existing| existing.expires_at > SystemTime::now());
    sessions.insert(session_id.clone(), session);

    session_id
}

/// Validate a session
///
/// # Arguments
/// * `session_id` - The session ID to validate
///
/// # Returns
/// * `Option<SessionUser>` - The user record for the session if valid, None otherwise
pub fn validate_session(session_id: &str) -> Option<SessionUser> {
    let sessions = sessions_read();

    sessions
        .get(session_id)
        .filter(|session| session.expires_at > SystemTime::now())
        .map(|session| session.user.clone())
}

pub fn destroy_session(session_id: &str) {
    sessions_write().remove(session_id);
}

/// Insert an instructor row with a hashed password.
///
/// Used by the `add-instructor` command to seed a fresh installation.
pub async fn create_instructor(
    backend: &dyn Backend,
    username: &str,
    password: &str,
    name: &str,
) -> Result<SessionUser, AppError> {
    let username = username.trim();
    if username.is_empty() || password.trim().is_empty() {
        return Err(AppError::Validation("Username and password are required.".into()));
    }

    let row = backend
        .insert(
            USERS,
            json!({
                "name": if name.trim().is_empty() { username } else { name.trim() },
                "username": username,
                "password": hash_password(password)?,
                "role": Role::INSTRUCTOR,
                "status": AccountStatus::Active.as_str(),
                "gym_id": null,
            }),
        )
        .await?;

    let user: User = serde_json::from_value(row).map_err(StoreError::from)?;
    Ok(SessionUser::from(user))
}

#[derive(Serialize)]
struct LoginPage {
    error: Option<String>,
}

/// Serve the login page
///
/// # Arguments
/// * `state` - Shared application state holding the templates
/// * `query` - Optional `error` message from a failed attempt
///
/// # Returns
/// * `Result<Html<String>, AppError>` - The rendered login page
pub async fn serve_login_page(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<LoginPageQuery>,
) -> Result<Response, AppError> {
    if jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| validate_session(cookie.value()))
        .is_some()
    {
        return Ok(Redirect::to("/").into_response());
    }

    let page = state.views.render("login", &LoginPage { error: query.error })?;
    Ok(page.into_response())
}

/// Handle user login requests
///
/// Processes login form submissions, validates credentials, and creates a session if valid.
///
/// # Arguments
/// * `state` - Shared application state
/// * `jar` - Cookie jar for storing the session cookie
/// * `credentials` - Form data containing the username and password
///
/// # Returns
/// * `Response` - Redirect to the dashboard if successful, back to the login page otherwise
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(credentials): Form<Credentials>,
) -> Response {
    match authenticate(state.backend.as_ref(), &credentials.username, &credentials.password).await {
        Ok(user) => {
            info!("{} signed in as {}", user.username, user.role);
            let duration = Duration::from_secs(state.config.session_hours * 60 * 60);
            let session_id = create_session(user, duration);
            let cookie = Cookie::build((SESSION_COOKIE, session_id))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax);

            (jar.add(cookie), Redirect::to("/")).into_response()
        }
        Err(e) => {
            if let LoginError::Backend(cause) = &e {
                error!("Login lookup failed: {cause}");
            }
            redirect_with_error("/login", &e.to_string()).into_response()
        }
    }
}

/// Handle user logout
///
/// Drops the session and clears the session cookie.
///
/// # Arguments
/// * `jar` - Cookie jar containing the session cookie
///
/// # Returns
/// * `(CookieJar, Redirect)` - Modified cookie jar and redirect to the login page
pub async fn handle_logout(jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        destroy_session(cookie.value());
    }

    let removal = Cookie::build((SESSION_COOKIE, "")).path("/");
    (jar.remove(removal), Redirect::to("/login"))
}

fn is_api(request: &Request) -> bool {
    request.uri().path().starts_with("/api/")
}

/// Authentication middleware
///
/// Resolves the session cookie to the user record and stores it in the
/// request extensions. Pages without a valid session are redirected to
/// the login page; `/api/*` calls get a 401.
///
/// # Arguments
/// * `jar` - Cookie jar containing session information
/// * `request` - The incoming request
/// * `next` - Next middleware in the chain
///
/// # Returns
/// * `Response` - Either passes the request through or refuses it
pub async fn require_auth(jar: CookieJar, mut request: Request, next: Next) -> Response {
    if let Some(user) = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| validate_session(cookie.value()))
    {
        request.extensions_mut().insert(user);
        return next.run(request).await;
    }

    if is_api(&request) {
        return AppError::Unauthorized.into_response();
    }
    Redirect::to("/login").into_response()
}

async fn require_role(role: Role, request: Request, next: Next) -> Response {
    let allowed = request
        .extensions()
        .get::<SessionUser>()
        .is_some_and(|user| user.role() == role);

    if allowed {
        next.run(request).await
    } else if is_api(&request) {
        AppError::Forbidden.into_response()
    } else {
        Redirect::to("/").into_response()
    }
}

/// Lets only instructors through; runs after [`require_auth`].
pub async fn require_instructor(request: Request, next: Next) -> Response {
    require_role(Role::Instructor, request, next).await
}

/// Lets only students through; runs after [`require_auth`].
pub async fn require_student(request: Request, next: Next) -> Response {
    require_role(Role::Student, request, next).await
}

#[derive(Serialize)]
struct UnknownRolePage<'a> {
    user: &'a SessionUser,
}

/// Sends each role to its dashboard.
pub async fn serve_home(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, AppError> {
    match user.role() {
        Role::Instructor => Ok(Redirect::to("/instructor").into_response()),
        Role::Student => Ok(Redirect::to("/student").into_response()),
        Role::Other(role) => {
            warn!("{} has unrecognised role {role:?}", user.username);
            let page: Html<String> = state
                .views
                .render("unknown_role", &UnknownRolePage { user: &user })?;
            Ok(page.into_response())
        }
    }
}

pub async fn current_user(Extension(user): Extension<SessionUser>) -> Json<SessionUser> {
    Json(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalBackend;
    use tempfile::TempDir;

    fn student(id: &str) -> SessionUser {
        SessionUser {
            id: id.into(),
            name: "Ana Perez".into(),
            username: "ana".into(),
            role: Role::STUDENT.into(),
            status: AccountStatus::Active,
            cuota_status: None,
            gym_id: None,
        }
    }

    #[test]
    fn hashed_and_legacy_passwords_verify() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("other", &hash));

        assert!(verify_password("plain", "plain"));
        assert!(!verify_password("plain", "Plain"));
        assert!(!verify_password("", ""));
    }

    #[test]
    fn sessions_expire_and_can_be_destroyed() {
        let id = create_session(student("s1"), Duration::from_secs(60));
        assert_eq!(validate_session(&id).map(|u| u.id), Some("s1".into()));

        destroy_session(&id);
        assert!(validate_session(&id).is_none());

        let expired = create_session(student("s2"), Duration::from_secs(0));
        assert!(validate_session(&expired).is_none());
    }

    #[tokio::test]
    async fn authenticate_checks_status_and_password() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();
        backend
            .insert(USERS, json!({
                "name": "Ana Perez", "username": "ana", "password": "pw",
                "role": "ALUMNO", "status": "ACTIVO",
            }))
            .await
            .unwrap();
        backend
            .insert(USERS, json!({
                "name": "Luis", "username": "luis", "password": "pw",
                "role": "ALUMNO", "status": "INACTIVO",
            }))
            .await
            .unwrap();

        let user = authenticate(&backend, "  ana ", "pw").await.unwrap();
        assert_eq!(user.username, "ana");

        assert!(matches!(
            authenticate(&backend, "ana", "wrong").await,
            Err(LoginError::InvalidCredentials)
        ));
        assert!(matches!(
            authenticate(&backend, "luis", "pw").await,
            Err(LoginError::InvalidCredentials)
        ));
        assert!(matches!(
            authenticate(&backend, "   ", "pw").await,
            Err(LoginError::MissingFields)
        ));
        assert!(matches!(
            authenticate(&backend, "ana", "   ").await,
            Err(LoginError::MissingFields)
        ));
    }

    #[tokio::test]
    async fn seeded_instructor_can_log_in() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();

        let created = create_instructor(&backend, "coach", "pw", "Coach Carter").await.unwrap();
        assert_eq!(created.role(), Role::Instructor);

        let user = authenticate(&backend, "coach", "pw").await.unwrap();
        assert_eq!(user.name, "Coach Carter");
    }
}
