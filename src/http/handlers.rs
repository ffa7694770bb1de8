//! Gateway handlers: HTTP in, RPC call, HTTP out.
//!
//! Bodies are read as raw bytes and parsed here, so malformed JSON is a 422
//! with the same error body as any other validation failure.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Instant;

use crate::http::request::RequestId;
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::todo::model::{NewTodo, Todo, TodoPatch};

pub const HEALTH_MESSAGE: &str = "We're good to go.";

/// Operations that expose a health route, as in `/todo/get/health`.
const HEALTH_OPERATIONS: &[&str] = &["get", "post", "patch", "delete"];

/// PATCH body. `id` is optional but must match the path when present.
#[derive(Debug, Deserialize)]
struct PatchBody {
    id: Option<String>,
    text: Option<String>,
    done: Option<bool>,
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::validation(format!("invalid JSON body: {err}")))
}

fn finish<T: IntoResponse>(
    method: &str,
    route: &'static str,
    started: Instant,
    result: Result<T, ApiError>,
) -> Response {
    let response = match result {
        Ok(ok) => ok.into_response(),
        Err(err) => err.into_response(),
    };
    metrics::record_http_request(method, route, response.status().as_u16(), started);
    response
}

pub async fn list_todos(State(state): State<AppState>, request_id: RequestId) -> Response {
    let started = Instant::now();
    tracing::debug!(request_id = %request_id, "Listing todos");
    let result = state.todos.list().await.map(Json).map_err(ApiError::from);
    finish("GET", "/todo", started, result)
}

pub async fn get_todo(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request_id: RequestId,
) -> Response {
    let started = Instant::now();
    tracing::debug!(request_id = %request_id, id = %id, "Fetching todo");
    let result = state.todos.get(&id).await.map(Json).map_err(ApiError::from);
    finish("GET", "/todo/{id}", started, result)
}

pub async fn create_todo(
    State(state): State<AppState>,
    request_id: RequestId,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let result = create(&state, &request_id, &body).await;
    finish("POST", "/todo", started, result)
}

async fn create(
    state: &AppState,
    request_id: &RequestId,
    body: &Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let new: NewTodo = parse_body(body)?;
    let todo: Todo = state.todos.create(new).await?;
    tracing::info!(request_id = %request_id, id = %todo.id, "Todo created");
    let location = format!("/todo/{}", todo.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(todo)))
}

pub async fn update_todo(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request_id: RequestId,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let result = update(&state, id, &request_id, &body).await;
    finish("PATCH", "/todo/{id}", started, result)
}

async fn update(
    state: &AppState,
    id: String,
    request_id: &RequestId,
    body: &Bytes,
) -> Result<Json<Todo>, ApiError> {
    let body: PatchBody = parse_body(body)?;
    if matches!(&body.id, Some(body_id) if *body_id != id) {
        return Err(ApiError::validation("body id does not match path id"));
    }
    let patch = TodoPatch {
        id,
        text: body.text,
        done: body.done,
    };
    let todo = state.todos.update(patch).await?;
    tracing::info!(request_id = %request_id, id = %todo.id, "Todo updated");
    Ok(Json(todo))
}

pub async fn delete_todo(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request_id: RequestId,
) -> Response {
    let started = Instant::now();
    let result = state
        .todos
        .delete(&id)
        .await
        .map(|()| {
            tracing::info!(request_id = %request_id, id = %id, "Todo deleted");
            StatusCode::NO_CONTENT
        })
        .map_err(ApiError::from);
    finish("DELETE", "/todo/{id}", started, result)
}

pub async fn health(Path(operation): Path<String>) -> Response {
    if HEALTH_OPERATIONS.contains(&operation.as_str()) {
        (StatusCode::OK, HEALTH_MESSAGE).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
