use std::convert::Infallible;

use async_stream::stream as async_stream;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::application::usecases::WatchService;
use crate::application::AppError;
use crate::domain::{UserId, Watch};
use crate::infrastructure::event_bus::EventBus;

#[derive(Clone)]
pub struct ApiState {
    pub service: WatchService,
    pub api_token: Option<String>,
    pub event_bus: Option<EventBus>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/users/:user/watches", get(list_watches).post(create_watch))
        .route(
            "/users/:user/watches/:index",
            axum::routing::delete(stop_watch),
        )
        .route("/admin/watches", get(list_all_watches))
        .route("/events/stream", get(stream_events))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Watch as shown to its owner: `position` is what `DELETE .../watches/:index` takes.
#[derive(Debug, Serialize)]
struct WatchView {
    position: usize,
    #[serde(flatten)]
    watch: Watch,
}

fn numbered(watches: Vec<Watch>) -> Vec<WatchView> {
    watches
        .into_iter()
        .enumerate()
        .map(|(i, watch)| WatchView {
            position: i + 1,
            watch,
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CreateWatchBody {
    platform: String,
    query: String,
    #[serde(default)]
    max_price: Option<f64>,
    /// Present for ending-soon watches.
    #[serde(default)]
    max_minutes: Option<u32>,
    /// Ending-soon watches only: stop watching after this instant.
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

async fn create_watch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user): Path<i64>,
    Json(body): Json<CreateWatchBody>,
) -> Response {
    if let Err(rejection) = check_auth(&headers, &state.api_token) {
        return rejection.into_response();
    }
    let user = UserId(user);
    let created = match body.max_minutes {
        Some(minutes) => {
            state
                .service
                .monitor_ending(
                    user,
                    &body.platform,
                    &body.query,
                    body.max_price,
                    minutes,
                    body.expires_at,
                )
                .await
        }
        None if body.expires_at.is_some() => Err(AppError::Validation(
            "expires_at needs max_minutes".into(),
        )),
        None => {
            state
                .service
                .monitor(user, &body.platform, &body.query, body.max_price)
                .await
        }
    };
    match created {
        Ok(w) => (StatusCode::CREATED, Json(w)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_watches(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user): Path<i64>,
) -> Response {
    if let Err(rejection) = check_auth(&headers, &state.api_token) {
        return rejection.into_response();
    }
    match state.service.list(UserId(user)).await {
        Ok(v) => Json(numbered(v)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop_watch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((user, index)): Path<(i64, usize)>,
) -> Response {
    if let Err(rejection) = check_auth(&headers, &state.api_token) {
        return rejection.into_response();
    }
    match state.service.stop(UserId(user), index).await {
        Ok(w) => Json(w).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_all_watches(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = check_auth(&headers, &state.api_token) {
        return rejection.into_response();
    }
    match state.service.list_all().await {
        Ok(v) => Json(v).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct StreamQuery {
    /// Only notifications for this destination.
    user: Option<i64>,
}

async fn stream_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(q): Query<StreamQuery>,
) -> Response {
    if let Err(rejection) = check_auth(&headers, &state.api_token) {
        return rejection.into_response();
    }
    let Some(bus) = state.event_bus.clone() else {
        return (
            StatusCode::NOT_IMPLEMENTED,
            "event stream not enabled".to_string(),
        )
            .into_response();
    };

    let user_filter = q.user.map(UserId);
    let live = BroadcastStream::new(bus.subscribe()).filter_map(move |msg| {
        // lagged receivers skip what they missed
        let event = msg.ok()?;
        if user_filter.is_some_and(|u| u != event.destination) {
            return None;
        }
        let data = serde_json::to_string(&event).ok()?;
        let id = format!("{}:{}", event.watch.id, event.listing.id);
        Some(Ok::<SseEvent, Infallible>(
            SseEvent::default().event("notification").id(id).data(data),
        ))
    });

    let out = async_stream! {
        tokio::pin!(live);
        while let Some(item) = live.next().await {
            yield item;
        }
    };

    Sse::new(out).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn status_for(e: &AppError) -> StatusCode {
    match e {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::QuotaExceeded { .. } => StatusCode::CONFLICT,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: AppError) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        warn!("request failed: {e}");
    }
    (status, Json(ErrorBody { error: e.to_string() })).into_response()
}

fn check_auth(headers: &HeaderMap, token: &Option<String>) -> Result<(), (StatusCode, String)> {
    // no token configured: open API
    let Some(expected) = token else {
        return Ok(());
    };
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if auth == format!("Bearer {}", expected) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "unauthorized".to_string()))
    }
}
