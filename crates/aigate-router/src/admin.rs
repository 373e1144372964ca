use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use serde::Deserialize;
use uuid::Uuid;

use aigate_model::Mode;
use aigate_relay::RelayEngine;

use crate::relay::{RouterState, bearer_token, json_error};

pub fn admin_router(engine: Arc<RelayEngine>) -> Router {
    let state = RouterState { engine };

    Router::new()
        .route("/channels/{id}/test", post(test_channel))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(State(state): State<RouterState>, request: Request, next: Next) -> Response {
    let admin_key = state.engine.state().global.load().admin_key.clone();
    if bearer_token(request.headers()) != Some(admin_key.as_str()) {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid_admin_key",
            "invalid admin key",
        );
    }
    next.run(request).await
}

#[derive(Debug, Deserialize)]
struct TestChannelQuery {
    model: String,
}

/// Probe one channel with a tiny chat request and report what came back.
async fn test_channel(
    State(state): State<RouterState>,
    Path(id): Path<i64>,
    Query(query): Query<TestChannelQuery>,
) -> Response {
    let Some(channel) = state.engine.state().channel(id) else {
        return json_error(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "channel_not_found",
            format!("channel {id} not found"),
        );
    };
    let Some(model_config) = state.engine.state().model_config(&query.model) else {
        return json_error(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "model_not_found",
            format!("model {} not found", query.model),
        );
    };

    let probe = serde_json::json!({
        "model": model_config.actual_model(),
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 1,
    });
    let result = state
        .engine
        .test_channel(
            &Uuid::new_v4().to_string(),
            channel,
            &model_config,
            Mode::ChatCompletions,
            Bytes::from(probe.to_string()),
        )
        .await;

    axum::Json(result).into_response()
}
