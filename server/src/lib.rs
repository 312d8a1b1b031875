use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{Next, from_fn},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use drive_log_lib::{
    comms::{
        ALL_SESSIONS_PATH, ApiResponse, DELETE_SESSION_PATH, GET_SESSION_PATH, SAVE_SESSION_PATH,
        TOTAL_DISTANCE_PATH,
    },
    trip_session::TripSession,
};
use serde::Serialize;

pub mod server_state;

use server_state::{Saved, ServerState};

pub const BIND_ENV: &str = "DRIVE_LOG_BIND";
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

pub fn app(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(SAVE_SESSION_PATH, post(save_session))
        .route(&format!("{GET_SESSION_PATH}/{{id}}"), get(get_session))
        .route(&format!("{DELETE_SESSION_PATH}/{{id}}"), get(delete_session))
        .route(ALL_SESSIONS_PATH, get(all_sessions))
        .route(TOTAL_DISTANCE_PATH, get(total_distance))
        .with_state(state)
        .layer(from_fn(log_request))
}

/// Serves the routes until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<ServerState>) -> std::io::Result<()> {
    axum::serve(listener, app(state)).await
}

async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;
    tracing::debug!("{method} {path} -> {}", response.status());
    response
}

fn reply<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Response {
    (status, Json(body)).into_response()
}

fn not_found(id: i64) -> Response {
    tracing::warn!("Session {id} not found");
    reply(StatusCode::NOT_FOUND, ApiResponse::<()>::error("Session not found."))
}

/// Takes the raw body so malformed JSON gets the same envelope as any other
/// failure.
async fn save_session(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let session: TripSession = match serde_json::from_slice(&body) {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!("Rejected malformed session: {err}");
            return reply(
                StatusCode::BAD_REQUEST,
                ApiResponse::<()>::error(format!("Invalid session JSON: {err}")),
            );
        }
    };

    match state.save(session).await {
        Ok((stored, Saved::Created)) => {
            tracing::info!("Created session {:?}", stored.id);
            reply(StatusCode::CREATED, ApiResponse::success("Session saved.", Some(stored)))
        }
        Ok((stored, Saved::Updated)) => {
            tracing::info!("Updated session {:?}", stored.id);
            reply(StatusCode::OK, ApiResponse::success("Session updated.", Some(stored)))
        }
        Err(errors) => {
            tracing::warn!("Rejected session: {errors:?}");
            reply(
                StatusCode::BAD_REQUEST,
                ApiResponse::<()>::error("Validation errors occurred.").with_errors(errors),
            )
        }
    }
}

async fn get_session(State(state): State<Arc<ServerState>>, Path(id): Path<i64>) -> Response {
    match state.get(id).await {
        Some(session) => reply(StatusCode::OK, ApiResponse::success("Session found.", Some(session))),
        None => not_found(id),
    }
}

async fn delete_session(State(state): State<Arc<ServerState>>, Path(id): Path<i64>) -> Response {
    if state.delete(id).await {
        tracing::info!("Deleted session {id}");
        reply(StatusCode::OK, ApiResponse::<()>::success("Session deleted.", None))
    } else {
        not_found(id)
    }
}

async fn all_sessions(State(state): State<Arc<ServerState>>) -> Response {
    let sessions = state.all().await;
    reply(StatusCode::OK, ApiResponse::success(format!("{} sessions.", sessions.len()), Some(sessions)))
}

async fn total_distance(State(state): State<Arc<ServerState>>) -> Response {
    reply(StatusCode::OK, ApiResponse::success("Total distance.", Some(state.total_distance().await)))
}
