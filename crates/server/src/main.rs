use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    middleware::map_response,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use router::{ActionRouter, DispatchOutcome, HmacNonceAuth, PermissionChecker, RouterSettings};
use serde::Serialize;
use shared::{
    error::{ErrorBody, ErrorCode},
    protocol::{actions_route, ajax_route, auth_token_route, ResponseEnvelope, TokenResponse},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod actions;
mod app_state;
mod config;
mod legacy;
mod request;

use app_state::{AppState, MANAGE_OPTIONS};
use config::{load_settings, normalize_database_url, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = build_state(&settings, storage)?;
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid server_bind {:?}", settings.server_bind))?;
    info!(%addr, debug = settings.debug, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(settings: &Settings, storage: Storage) -> anyhow::Result<AppState> {
    let secret = if settings.nonce_secret.is_empty() {
        warn!("nonce_secret is not configured; auth tokens will not survive a restart");
        format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
    } else {
        settings.nonce_secret.clone()
    };
    let auth = HmacNonceAuth::new(
        secret.as_bytes(),
        Duration::from_secs(settings.nonce_lifetime_seconds),
    )?;
    let registry = actions::register_actions(&storage).context("failed to register actions")?;
    let router = ActionRouter::new(
        registry,
        Arc::new(auth),
        RouterSettings {
            nonce_purpose: settings.nonce_purpose.clone(),
            debug: settings.debug,
        },
    );

    Ok(AppState {
        router: Arc::new(router),
        storage,
        admin_key: settings.admin_key.clone().filter(|key| !key.is_empty()),
        nonce_lifetime_seconds: settings.nonce_lifetime_seconds,
    })
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(ajax_route(), get(ajax).post(ajax))
        .route(auth_token_route(), get(issue_token))
        .route(actions_route(), get(list_actions))
        .route("/legacy/:name", get(legacy_ajax).post(legacy_ajax))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(map_response(oversized_body_envelope))
        .with_state(state)
}

/// Both the limit layer and the `Bytes` extractor answer oversized bodies with
/// a plain-text 413; callers still get an envelope.
async fn oversized_body_envelope(response: Response) -> Response {
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return response;
    }
    let outcome = DispatchOutcome::failure_with(
        StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
        ErrorBody::new(ErrorCode::InvalidParameters, "Request body is too large"),
    );
    envelope_response(outcome).into_response()
}

fn envelope_response(outcome: DispatchOutcome) -> (StatusCode, Json<ResponseEnvelope>) {
    let status =
        StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome.envelope))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn ajax(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let fields = match request::collect_fields(query.as_deref(), &headers, &body) {
        Ok(fields) => fields,
        Err(body) => return envelope_response(DispatchOutcome::failure_with(400, body)),
    };
    dispatch_fields(&state, fields, &headers).await
}

async fn legacy_ajax(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let fields = match request::collect_fields(query.as_deref(), &headers, &body) {
        Ok(fields) => fields,
        Err(body) => return envelope_response(DispatchOutcome::failure_with(400, body)),
    };
    let fields = legacy::translate(&name, fields);
    dispatch_fields(&state, fields, &headers).await
}

async fn dispatch_fields(
    state: &AppState,
    fields: serde_json::Map<String, serde_json::Value>,
    headers: &HeaderMap,
) -> (StatusCode, Json<ResponseEnvelope>) {
    let caller = state.caller(headers);
    let action_request = request::into_action_request(fields, headers);
    envelope_response(state.router.dispatch(action_request, &caller).await)
}

async fn issue_token(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    success_response(&TokenResponse {
        token: state.router.issue_token(),
        purpose: state.router.settings().nonce_purpose.clone(),
        lifetime_seconds: state.nonce_lifetime_seconds,
    })
}

async fn list_actions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !state.caller(&headers).has(MANAGE_OPTIONS) {
        return envelope_response(DispatchOutcome::failure(
            ErrorCode::InsufficientPermissions,
            "You do not have permission to perform this action",
        ));
    }
    success_response(&state.router.list_registered_actions())
}

fn success_response<T: Serialize>(data: &T) -> (StatusCode, Json<ResponseEnvelope>) {
    match serde_json::to_value(data) {
        Ok(data) => envelope_response(DispatchOutcome::success(data)),
        Err(error) => {
            error!(%error, "failed to encode response data");
            envelope_response(DispatchOutcome::failure(
                ErrorCode::ServerError,
                "An unexpected error occurred",
            ))
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
