use axum::{
    extract::{rejection::JsonRejection, FromRef, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::{
    auth::{
        cookies::{append_cookie, read_cookie, CSRF_COOKIE},
        csrf::clear_state_cookie,
        dto::{
            ChangePasswordRequest, LoginRequest, OAuthCallbackRequest, RegisterRequest,
            StartResponse, UpdateProfileRequest, UserResponse,
        },
        extractors::AuthUser,
        linker::IdentityLinker,
        services,
        session::{IssuedSession, SessionKeys},
    },
    error::AuthError,
    state::AppState,
    store::User,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/oauth/start", get(oauth_start))
        .route("/auth/oauth/callback", post(oauth_callback))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(get_me))
        .route("/user/password", patch(change_password))
        .route("/user/profile", patch(update_profile))
}

fn with_cookies(cookies: &[&str]) -> Result<HeaderMap, AuthError> {
    let mut headers = HeaderMap::new();
    for cookie in cookies {
        append_cookie(&mut headers, cookie)?;
    }
    Ok(headers)
}

fn start_session(state: &AppState, user: &User) -> Result<IssuedSession, AuthError> {
    SessionKeys::from_ref(state)
        .issue(user)
        .map_err(|e| AuthError::Internal(e.to_string()))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserResponse>), AuthError> {
    let Json(payload) = payload?;
    let user = services::register(state.store.as_ref(), payload).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<UserResponse>), AuthError> {
    let Json(payload) = payload?;
    let user = services::authenticate(state.store.as_ref(), payload).await?;
    let session = start_session(&state, &user)?;
    Ok((with_cookies(&[&session.cookie()])?, Json(user.into())))
}

#[instrument(skip(state))]
pub async fn logout(State(state): State<AppState>) -> Result<(HeaderMap, Json<Value>), AuthError> {
    let cookie = SessionKeys::from_ref(&state).revoke();
    Ok((with_cookies(&[&cookie])?, Json(json!({}))))
}

#[instrument(skip(state))]
pub async fn oauth_start(
    State(state): State<AppState>,
) -> Result<(HeaderMap, Json<StartResponse>), AuthError> {
    let oauth = state.oauth.as_ref().ok_or(AuthError::NotConfigured("GitHub OAuth"))?;
    let request = oauth.begin_authorization().await?;
    info!(proxied = oauth.uses_proxy(), "oauth flow started");
    Ok((
        with_cookies(&[&request.state_cookie])?,
        Json(StartResponse {
            authorization_url: request.url,
            use_proxy: oauth.uses_proxy(),
        }),
    ))
}

/// The state cookie is cleared on every outcome, malformed bodies included.
#[instrument(skip(state, headers, payload))]
pub async fn oauth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<OAuthCallbackRequest>, JsonRejection>,
) -> Response {
    let clear = clear_state_cookie(state.config.session.secure_cookie);
    let stored = read_cookie(&headers, CSRF_COOKIE);

    let outcome = async {
        let Json(payload) = payload?;
        let oauth = state.oauth.as_ref().ok_or(AuthError::NotConfigured("GitHub OAuth"))?;
        let identity = oauth
            .handle_callback(&payload.code, &payload.state, stored)
            .await?;
        let user = IdentityLinker::new(state.store.as_ref())
            .resolve(&identity)
            .await?;
        let session = start_session(&state, &user)?;
        let headers = with_cookies(&[&clear, &session.cookie()])?;
        info!(user_id = %user.id, "oauth login complete");
        Ok::<_, AuthError>((headers, user))
    }
    .await;

    match outcome {
        Ok((headers, user)) => (headers, Json(UserResponse::from(user))).into_response(),
        Err(err) => match with_cookies(&[&clear]) {
            Ok(headers) => (headers, err).into_response(),
            Err(cookie_err) => cookie_err.into_response(),
        },
    }
}

#[instrument(skip(state, claims))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<UserResponse>, AuthError> {
    let user = services::current_user(state.store.as_ref(), claims.sub).await?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, claims, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Json<Value>, AuthError> {
    let Json(payload) = payload?;
    services::change_password(state.store.as_ref(), claims.sub, payload).await?;
    Ok(Json(json!({})))
}

#[instrument(skip(state, claims, payload))]
pub async fn update_profile(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Json<UserResponse>, AuthError> {
    let Json(payload) = payload?;
    let user = services::update_profile(state.store.as_ref(), claims.sub, payload).await?;
    Ok(Json(user.into()))
}
