mod models;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use llmux_common::{Dialect, ProxyError, Service};
use llmux_core::engine::{InboundRequest, ProxyEngine, ProxyOutcome};
use llmux_core::stats::info_document;
use llmux_protocol::error::ErrorPayload;

const SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const SSE_KEEPALIVE_FRAME: &[u8] = b": keep-alive\n\n";

#[derive(Clone)]
struct RouterState {
    engine: Arc<ProxyEngine>,
}

/// One router per service mounted at `/{service}`, plus the info endpoint.
pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = RouterState { engine };
    Router::new()
        .route("/", get(info))
        .route("/{service}/v1/models", get(list_models))
        .route("/{service}/v1/chat/completions", post(chat_completions))
        .route("/{service}/v1/messages", post(anthropic_messages))
        .route("/{service}/v1beta/models/{*model_action}", post(google_generate))
        .route("/{service}/v1alpha/models/{*model_action}", post(google_generate))
        .with_state(state)
}

async fn info(State(state): State<RouterState>) -> Response {
    let doc = info_document(state.engine.state()).await;
    axum::Json(doc).into_response()
}

async fn list_models(
    State(state): State<RouterState>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(service) = Service::parse(&service) else {
        return not_found();
    };
    if let Some(denied) = geoblock(&state, &headers) {
        return denied;
    }
    let config = &state.engine.state().config;
    let list = models::visible_models(service, config);
    axum::Json(serde_json::to_value(list).unwrap_or_default()).into_response()
}

async fn chat_completions(
    State(state): State<RouterState>,
    Path(service): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, &service, headers, Dialect::OpenAiChat, None, false, body).await
}

async fn anthropic_messages(
    State(state): State<RouterState>,
    Path(service): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = Dialect::AnthropicMessages;
    dispatch(state, &service, headers, dialect, None, false, body).await
}

async fn google_generate(
    State(state): State<RouterState>,
    Path((service, model_action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (model, action) = match model_action.split_once(':') {
        Some((model, action)) => (model.to_string(), action),
        None => return not_found(),
    };
    let stream_hint = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return not_found(),
    };
    dispatch(
        state,
        &service,
        headers,
        Dialect::GoogleAi,
        Some(model),
        stream_hint,
        body,
    )
    .await
}

async fn dispatch(
    state: RouterState,
    service: &str,
    headers: HeaderMap,
    mut dialect: Dialect,
    model_from_path: Option<String>,
    stream_hint: bool,
    body: Bytes,
) -> Response {
    let Some(service) = Service::parse(service) else {
        return not_found();
    };
    if let Some(denied) = geoblock(&state, &headers) {
        return denied;
    }
    if dialect == Dialect::AnthropicMessages && service.native_dialect() != dialect {
        return not_found();
    }
    // The Mistral native endpoint shares the chat-completions path.
    if dialect == Dialect::OpenAiChat && service == Service::MistralAi {
        dialect = Dialect::MistralChat;
    }

    let user_token = extract_user_token(&headers);
    let inbound = InboundRequest {
        service,
        dialect,
        body,
        model_from_path,
        stream_hint,
    };

    match state.engine.handle_completion(inbound, user_token).await {
        Ok(ProxyOutcome::Blocking { status, body }) => json_response(status, body),
        Ok(ProxyOutcome::Streaming { content_type, rx }) => {
            let rx = with_keepalive(rx);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(
                    ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>),
                ))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => error_response(&err),
    }
}

/// Inject SSE comment frames during long silences so idle connections stay
/// open through intermediaries.
fn with_keepalive(mut rx: tokio::sync::mpsc::Receiver<Bytes>) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, out) = tokio::sync::mpsc::channel(32);
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(SSE_KEEPALIVE_INTERVAL, rx.recv()).await {
                Ok(Some(chunk)) => {
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    if tx.send(Bytes::from_static(SSE_KEEPALIVE_FRAME)).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    out
}

/// The inbound bearer/API key identifies the proxy user, not the upstream.
fn extract_user_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(text) = value.to_str()
        && let Some(token) = text.strip_prefix("Bearer ")
    {
        return Some(token.to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Ingress country filter; the header is populated by the fronting CDN.
fn geoblock(state: &RouterState, headers: &HeaderMap) -> Option<Response> {
    let config = &state.engine.state().config;
    if !config.geoblock_enabled {
        return None;
    }
    let country = headers
        .get("cf-ipcountry")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if config
        .geoblock_allowed_countries
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(country))
    {
        return None;
    }
    tracing::debug!(country, "geoblocked request");
    let payload = ErrorPayload::new("forbidden", "not available in your region");
    Some(json_response(403, payload.to_bytes()))
}

fn json_response(status: u16, body: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(err: &ProxyError) -> Response {
    if let ProxyError::UpstreamPassthrough { status, body } = err {
        return json_response(
            *status,
            ErrorPayload::annotate_upstream(body, "forwarded by llmux"),
        );
    }
    let payload = ErrorPayload::new(err.kind(), err.to_string())
        .with_note("the proxy, not the upstream, produced this error");
    json_response(err.status(), payload.to_bytes())
}

fn not_found() -> Response {
    json_response(
        404,
        ErrorPayload::new("not_found", "unknown service or path").to_bytes(),
    )
}
