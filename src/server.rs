use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::accounts::password::verify_password;
use crate::accounts::session::{Flash, Session, SessionStore};
use crate::accounts::set_password::{set_password, PasswordPolicy, SetPasswordForm};
use crate::accounts::{User, UserStore};
use crate::config::Config;
use crate::db;
use crate::email::sink::{build_sink, deliver_pending, EmailSink};
use crate::email::Outbox;
use crate::migrations::MigrationRunner;

pub const ACCOUNT_PAGE: &str = "/user#user_password";
const UPDATE_FAILED: &str = "Your password could not be updated. Please try again.";

#[derive(Clone)]
pub struct ApiState {
    config: Config,
    db_path: PathBuf,
    policy: PasswordPolicy,
    sink: Option<Arc<dyn EmailSink>>,
}

impl ApiState {
    pub fn new(config: Config) -> Result<Self> {
        let sink = build_sink(&config.email)?.map(Arc::from);
        Ok(Self {
            db_path: config.resolved_db_path(),
            policy: PasswordPolicy::from(&config.accounts),
            config,
            sink,
        })
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    ok: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    ok: bool,
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiErrorBody {
            ok: false,
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[derive(Debug, Serialize)]
struct AccountResponse {
    user: User,
    has_password: bool,
    flash: Flash,
}

/// The session behind the request's bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AuthSession(pub Session);

#[async_trait]
impl FromRequestParts<ApiState> for AuthSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let conn = open_db(state)?;
        let session = SessionStore::new(&conn)
            .resolve(token)
            .map_err(ApiError::internal)?
            .ok_or_else(|| ApiError::unauthorized("unknown session"))?;
        Ok(AuthSession(session))
    }
}

fn bearer_token(headers: &HeaderMap) -> std::result::Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("login required"))?;

    let value = value.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or_else(|| ApiError::unauthorized("invalid authorization"))?;

    if token.trim().is_empty() {
        return Err(ApiError::unauthorized("missing bearer token"));
    }
    Ok(token)
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/user", get(account))
        .route("/user/password", post(change_password))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(config: Config, bind: SocketAddr) -> Result<()> {
    let state = ApiState::new(config)?;
    {
        let conn = db::open(&state.db_path)?;
        MigrationRunner::with_currencies(&state.config.currencies.codes).run(&conn)?;
    }

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("account server listening on http://{bind}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> Json<ApiResponse<HealthResponse>> {
    ok(HealthResponse { status: "ok" })
}

async fn login(
    State(state): State<ApiState>,
    Form(form): Form<LoginForm>,
) -> ApiResult<LoginResponse> {
    let conn = open_db(&state)?;
    let user = UserStore::new(&conn)
        .find_password_login(&form.email)
        .map_err(ApiError::internal)?
        .filter(|user| verify_password(&form.password, &user.password_hash))
        .ok_or_else(|| ApiError::unauthorized("invalid e-mail or password"))?;
    let token = SessionStore::new(&conn)
        .create(user.id)
        .map_err(ApiError::internal)?;
    info!("user {} logged in with a password", user.id);
    Ok(ok(LoginResponse {
        user_id: user.id,
        token,
    }))
}

async fn account(
    State(state): State<ApiState>,
    AuthSession(session): AuthSession,
) -> ApiResult<AccountResponse> {
    let conn = open_db(&state)?;
    let user = UserStore::new(&conn)
        .get(session.user_id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::unauthorized("account no longer exists"))?;
    let flash = SessionStore::new(&conn)
        .take_flash(&session)
        .map_err(ApiError::internal)?;

    Ok(ok(AccountResponse {
        has_password: user.has_password(),
        user,
        flash,
    }))
}

/// Always redirects back to the account page; the outcome travels as flash.
async fn change_password(
    State(state): State<ApiState>,
    AuthSession(session): AuthSession,
    Form(form): Form<SetPasswordForm>,
) -> std::result::Result<Redirect, ApiError> {
    let changed = {
        let conn = open_db(&state)?;
        let outbox = Outbox::new(
            &conn,
            state.config.email.site_name.as_str(),
            state.config.email.from_address.as_str(),
        );
        let flash = match set_password(&conn, &session, &form, &state.policy, &outbox) {
            Ok(outcome) if outcome.is_success() => {
                info!("user {} updated their password", session.user_id);
                outcome.into_flash()
            }
            Ok(outcome) => {
                info!(
                    "rejected password change for user {}: {} errors",
                    session.user_id,
                    outcome.errors.len()
                );
                outcome.into_flash()
            }
            Err(err) => {
                warn!("password change failed for user {}: {err:#}", session.user_id);
                Flash {
                    messages: Vec::new(),
                    errors: vec![UPDATE_FAILED.to_string()],
                }
            }
        };
        let changed = !flash.messages.is_empty();
        SessionStore::new(&conn)
            .set_flash(&session, &flash)
            .map_err(ApiError::internal)?;
        changed
    };

    if changed {
        spawn_delivery(&state);
    }
    Ok(Redirect::to(ACCOUNT_PAGE))
}

/// Delivers queued e-mails in the background so the redirect never waits on the sink.
fn spawn_delivery(state: &ApiState) {
    let Some(sink) = state.sink.clone() else {
        return;
    };
    let db_path = state.db_path.clone();
    let email = state.config.email.clone();
    tokio::spawn(async move {
        if let Err(err) = deliver_pending(&db_path, &email, sink.as_ref()).await {
            warn!("failed delivering queued emails: {err}");
        }
    });
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse { ok: true, data })
}

fn open_db(state: &ApiState) -> std::result::Result<Connection, ApiError> {
    db::open(&state.db_path).map_err(ApiError::internal)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    use axum::body::Body;
    use axum::extract::{FromRequestParts, State};
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
    use axum::http::{Request, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::Form;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{
        account, change_password, router, ApiState, AuthSession, ACCOUNT_PAGE, UPDATE_FAILED,
    };
    use crate::accounts::password::verify_password;
    use crate::accounts::session::{Session, SessionStore};
    use crate::accounts::set_password::SetPasswordForm;
    use crate::accounts::UserStore;
    use crate::config::Config;
    use crate::db;
    use crate::email::Outbox;
    use crate::migrations::MigrationRunner;

    fn test_state() -> ApiState {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "clerk-server-{}-{nanos}.db",
            std::process::id()
        ));
        let mut config = Config::default();
        config.storage.db_path = path.display().to_string();
        ApiState::new(config).expect("state")
    }

    fn seed_user(path: &Path, email: &str) -> (String, Session) {
        let conn = db::open(path).expect("open");
        MigrationRunner::new().run(&conn).expect("migrate");
        let user = UserStore::new(&conn).create(email, "Dana").expect("create");
        let sessions = SessionStore::new(&conn);
        let token = sessions.create(user.id).expect("session");
        let session = sessions.resolve(&token).expect("resolve").expect("session");
        (token, session)
    }

    fn form_post(uri: &str, token: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body)).expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn stored_hash(path: &Path, session: &Session) -> String {
        let conn = db::open(path).expect("open");
        UserStore::new(&conn)
            .get(session.user_id)
            .expect("get")
            .expect("user")
            .password_hash
    }

    fn form(password: &str, password2: &str) -> Form<SetPasswordForm> {
        Form(SetPasswordForm {
            password: password.to_string(),
            password2: password2.to_string(),
        })
    }

    #[tokio::test]
    async fn resolves_bearer_sessions() {
        let state = test_state();
        let (token, session) = seed_user(&state.db_path, "d@example.com");

        let request = Request::builder()
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(())
            .expect("request");
        let (mut parts, _) = request.into_parts();
        let AuthSession(resolved) = AuthSession::from_request_parts(&mut parts, &state)
            .await
            .expect("session");
        assert_eq!(resolved, session);

        let (mut anonymous, _) = Request::builder().body(()).expect("request").into_parts();
        let rejection = AuthSession::from_request_parts(&mut anonymous, &state)
            .await
            .expect_err("no token");
        assert_eq!(rejection.into_response().status(), StatusCode::UNAUTHORIZED);

        let (mut forged, _) = Request::builder()
            .header(AUTHORIZATION, "Bearer clk_forged")
            .body(())
            .expect("request")
            .into_parts();
        assert!(AuthSession::from_request_parts(&mut forged, &state)
            .await
            .is_err());
        let _ = std::fs::remove_file(&state.db_path);
    }

    #[tokio::test]
    async fn successful_change_redirects_with_message() {
        let state = test_state();
        let (_, session) = seed_user(&state.db_path, "d@example.com");

        let response = change_password(
            State(state.clone()),
            AuthSession(session),
            form("validpass1", "validpass1"),
        )
        .await
        .expect("handler")
        .into_response();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(LOCATION).expect("location"),
            ACCOUNT_PAGE
        );

        let body = account(State(state.clone()), AuthSession(session))
            .await
            .expect("account")
            .0;
        assert!(body.data.has_password);
        assert_eq!(body.data.flash.messages, vec!["Updated password.".to_string()]);
        assert!(body.data.flash.errors.is_empty());

        let conn = db::open(&state.db_path).expect("open");
        let queued = Outbox::new(&conn, "Clerk", "support@localhost")
            .pending(10)
            .expect("pending");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].template_id, "password_added");
        let _ = std::fs::remove_file(&state.db_path);
    }

    #[tokio::test]
    async fn rejected_change_still_redirects_with_errors() {
        let state = test_state();
        let (_, session) = seed_user(&state.db_path, "d@example.com");

        let response = change_password(
            State(state.clone()),
            AuthSession(session),
            form("validpass1", "different"),
        )
        .await
        .expect("handler")
        .into_response();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let body = account(State(state.clone()), AuthSession(session))
            .await
            .expect("account")
            .0;
        assert!(!body.data.has_password);
        assert!(body.data.flash.messages.is_empty());
        assert_eq!(
            body.data.flash.errors,
            vec!["Those passwords do not match.".to_string()]
        );

        let conn = db::open(&state.db_path).expect("open");
        let queued = Outbox::new(&conn, "Clerk", "support@localhost")
            .pending(10)
            .expect("pending");
        assert!(queued.is_empty());
        let _ = std::fs::remove_file(&state.db_path);
    }

    #[tokio::test]
    async fn failed_change_redirects_with_an_error_and_keeps_no_hash() {
        let state = test_state();
        let (_, session) = seed_user(&state.db_path, "d@example.com");
        {
            let conn = db::open(&state.db_path).expect("open");
            conn.execute_batch("DROP TABLE emails").expect("drop emails");
        }

        let response = change_password(
            State(state.clone()),
            AuthSession(session),
            form("validpass1", "validpass1"),
        )
        .await
        .expect("handler")
        .into_response();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(stored_hash(&state.db_path, &session).is_empty());

        let body = account(State(state.clone()), AuthSession(session))
            .await
            .expect("account")
            .0;
        assert!(body.data.flash.messages.is_empty());
        assert_eq!(body.data.flash.errors, vec![UPDATE_FAILED.to_string()]);
        let _ = std::fs::remove_file(&state.db_path);
    }

    #[tokio::test]
    async fn form_post_through_router_sets_the_password() {
        let state = test_state();
        let (token, session) = seed_user(&state.db_path, "d@example.com");
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(form_post(
                "/user/password",
                Some(&token),
                "password=validpass1&password2=validpass1",
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(LOCATION).expect("location"),
            ACCOUNT_PAGE
        );
        assert!(verify_password(
            "validpass1",
            &stored_hash(&state.db_path, &session)
        ));

        let page = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/user")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(page.status(), StatusCode::OK);
        let body = json_body(page).await;
        assert_eq!(body["data"]["has_password"], true);
        assert_eq!(body["data"]["flash"]["messages"][0], "Updated password.");

        let anonymous = app
            .oneshot(form_post(
                "/user/password",
                None,
                "password=validpass1&password2=validpass1",
            ))
            .await
            .expect("response");
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        let _ = std::fs::remove_file(&state.db_path);
    }

    #[tokio::test]
    async fn login_issues_a_session_for_the_right_password() {
        let state = test_state();
        let (token, _) = seed_user(&state.db_path, "d@example.com");
        let app = router(state.clone());

        let set = app
            .clone()
            .oneshot(form_post(
                "/user/password",
                Some(&token),
                "password=validpass1&password2=validpass1",
            ))
            .await
            .expect("response");
        assert_eq!(set.status(), StatusCode::SEE_OTHER);

        let wrong = app
            .clone()
            .oneshot(form_post(
                "/login",
                None,
                "email=d%40example.com&password=wrongpass",
            ))
            .await
            .expect("response");
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let right = app
            .oneshot(form_post(
                "/login",
                None,
                "email=d%40example.com&password=validpass1",
            ))
            .await
            .expect("response");
        assert_eq!(right.status(), StatusCode::OK);
        let body = json_body(right).await;
        let issued = body["data"]["token"].as_str().expect("token");

        let conn = db::open(&state.db_path).expect("open");
        assert!(SessionStore::new(&conn)
            .resolve(issued)
            .expect("resolve")
            .is_some());
        let _ = std::fs::remove_file(&state.db_path);
    }
}
