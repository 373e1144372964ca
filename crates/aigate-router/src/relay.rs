use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use aigate_model::{Channel, Group, Mode};
use aigate_relay::{RelayEngine, RelayRequest, UpstreamResponse};

const REQUEST_ID_HEADER: &str = "x-aigate-request-id";
const DESIGNATED_CHANNEL_HEADER: &str = "x-aigate-channel";
const ADMIN_KEY_HEADER: &str = "x-aigate-admin-key";

#[derive(Clone)]
pub(crate) struct RouterState {
    pub engine: Arc<RelayEngine>,
}

pub fn relay_router(engine: Arc<RelayEngine>) -> Router {
    let state = RouterState { engine };

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/edits", post(edits))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/audio/transcriptions", post(audio_transcription))
        .route("/v1/audio/translations", post(audio_translation))
        .route("/v1/rerank", post(rerank))
        .route("/v1/pdf/parse", post(parse_pdf))
        // Surfaces aigate knows about but does not serve.
        .route("/v1/moderations", post(not_implemented))
        .route("/v1/responses", post(not_implemented))
        .layer(middleware::from_fn_with_state(state.clone(), group_auth))
        .with_state(state)
}

async fn group_auth(
    State(state): State<RouterState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "missing_api_key",
            "missing api key",
        );
    };
    let Some(group) = state.engine.state().authenticate(token) else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid_api_key",
            "invalid api key",
        );
    };
    request.extensions_mut().insert(group);
    next.run(request).await
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

macro_rules! mode_handler {
    ($name:ident, $mode:expr) => {
        async fn $name(
            State(state): State<RouterState>,
            Extension(group): Extension<Arc<Group>>,
            headers: HeaderMap,
            body: Bytes,
        ) -> Response {
            relay_mode(state, group, headers, body, $mode).await
        }
    };
}

mode_handler!(chat_completions, Mode::ChatCompletions);
mode_handler!(completions, Mode::Completions);
mode_handler!(embeddings, Mode::Embeddings);
mode_handler!(images_generations, Mode::ImagesGenerations);
mode_handler!(edits, Mode::Edits);
mode_handler!(audio_speech, Mode::AudioSpeech);
mode_handler!(audio_transcription, Mode::AudioTranscription);
mode_handler!(audio_translation, Mode::AudioTranslation);
mode_handler!(rerank, Mode::Rerank);
mode_handler!(parse_pdf, Mode::ParsePdf);

async fn relay_mode(
    state: RouterState,
    group: Arc<Group>,
    headers: HeaderMap,
    body: Bytes,
    mode: Mode,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let started_at = Instant::now();

    let Some(model) = parse_model(&body) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "missing_model",
            "model is required",
        );
    };
    let Some(model_config) = state.engine.state().model_config(&model) else {
        return json_error(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "model_not_found",
            format!("model {model} not found"),
        );
    };

    let designated_channel = match designated_channel(&state, &headers) {
        Ok(channel) => channel,
        Err(response) => return response,
    };

    info!(
        event = "relay_received",
        request_id = %request_id,
        group = %group.name,
        mode = %mode,
        model = %model,
    );

    let cancel = CancellationToken::new();
    // Dropping the handler future (client gone) trips the token; the
    // spawned relay task still finishes its bookkeeping.
    let _guard = cancel.clone().drop_guard();

    let req = RelayRequest {
        request_id: request_id.clone(),
        mode,
        origin_model: model.clone(),
        model_config,
        group: group.clone(),
        designated_channel,
        body,
        client_ip: client_ip(&headers),
        cancel,
    };

    let engine = state.engine.clone();
    let outcome = tokio::spawn(async move { engine.relay(req).await }).await;

    match outcome {
        Ok(upstream) => {
            info!(
                event = "relay_responded",
                request_id = %request_id,
                group = %group.name,
                mode = %mode,
                model = %model,
                status = upstream.status.as_u16(),
                elapsed_ms = started_at.elapsed().as_millis(),
            );
            upstream_response(upstream, &request_id)
        }
        Err(err) => {
            tracing::error!(event = "relay_task_failed", request_id = %request_id, error = %err);
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "aigate_error",
                "internal_error",
                "internal error",
            )
        }
    }
}

fn parse_model(body: &Bytes) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(str::to_string)
}

/// A caller may pin the channel with `x-aigate-channel`, gated on the admin
/// key so tenants cannot bypass selection.
fn designated_channel(
    state: &RouterState,
    headers: &HeaderMap,
) -> Result<Option<Arc<Channel>>, Response> {
    let Some(raw) = headers
        .get(DESIGNATED_CHANNEL_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };

    let admin_key = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if admin_key != state.engine.state().global.load().admin_key {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "invalid_request_error",
            "admin_key_required",
            "designating a channel requires the admin key",
        ));
    }

    let Ok(id) = raw.parse::<i64>() else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_channel",
            "invalid channel id",
        ));
    };
    match state.engine.state().channel(id) {
        Some(channel) => Ok(Some(channel)),
        None => Err(json_error(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "channel_not_found",
            format!("channel {id} not found"),
        )),
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

async fn not_implemented() -> Response {
    json_error(
        StatusCode::NOT_IMPLEMENTED,
        "aigate_error",
        "api_not_implemented",
        "API not implemented",
    )
}

fn upstream_response(upstream: UpstreamResponse, request_id: &str) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    response.headers_mut().extend(upstream.headers);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub(crate) fn json_error(
    status: StatusCode,
    error_type: &str,
    code: &str,
    message: impl Into<String>,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message.into(),
            "type": error_type,
            "code": code,
        }
    });
    (status, axum::Json(body)).into_response()
}
