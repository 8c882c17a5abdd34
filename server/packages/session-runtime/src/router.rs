use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use session_runtime_error::{ErrorType, ProblemDetails, RateLimitScope, RuntimeError};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::agent::{AgentCatalog, AgentDefinition};
use crate::conversation::{ConversationRecord, RoundRecord};
use crate::coordinator::{ChatOutcome, ChatRequest, Coordinator};
use crate::pool::PoolStats;
use crate::tokens::TokenUsage;

const USER_ID_HEADER: &str = "x-user-id";
const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct AppState {
    coordinator: Arc<Coordinator>,
    catalog: Arc<AgentCatalog>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, catalog: Arc<AgentCatalog>) -> Self {
        Self {
            coordinator,
            catalog,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/pool/stats", get(get_pool_stats))
        .route("/agents", get(list_agents).post(create_agent))
        .route("/agents/:agent_id", get(get_agent).delete(delete_agent))
        .route("/sessions/:session_id", delete(clear_session))
        .route("/sessions/:session_id/chat", post(post_chat))
        .route("/sessions/:session_id/broadcast", post(post_broadcast))
        .route("/sessions/:session_id/events", get(get_events))
        .route("/sessions/:session_id/memory", get(get_memory))
        .route("/sessions/:session_id/summarize", post(post_summarize))
        .route("/sessions/:session_id/usage", get(get_usage))
        .with_state(shared);

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    let http_logging = match std::env::var("SESSION_RUNTIME_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_pool_stats,
        list_agents,
        create_agent,
        get_agent,
        delete_agent,
        clear_session,
        post_chat,
        post_broadcast,
        get_events,
        get_memory,
        post_summarize,
        get_usage
    ),
    components(
        schemas(
            HealthResponse,
            ChatMessageRequest,
            ChatOutcome,
            BroadcastRequest,
            BroadcastResponse,
            BroadcastResult,
            TokenUsage,
            AgentListResponse,
            AgentDefinition,
            ConversationRecord,
            RoundRecord,
            PoolStats,
            ProblemDetails,
            ErrorType,
            RateLimitScope
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agents", description = "Agent catalog"),
        (name = "sessions", description = "Chat sessions")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Runtime(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(problem),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatMessageRequest {
    pub message: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct BroadcastRequest {
    pub message: String,
    pub agent_ids: Vec<String>,
}

/// Results in the order of the request's `agent_ids`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct BroadcastResponse {
    pub results: Vec<BroadcastResult>,
}

/// Exactly one of `outcome` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct BroadcastResult {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ChatOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentListResponse {
    pub agents: Vec<AgentDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventsQuery {
    /// Reconnecting with the same id replaces the previous connection.
    pub client_id: Option<String>,
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/pool/stats",
    responses((status = 200, body = PoolStats)),
    tag = "meta"
)]
async fn get_pool_stats(State(state): State<Arc<AppState>>) -> Json<PoolStats> {
    Json(state.coordinator.pool_stats())
}

#[utoipa::path(
    get,
    path = "/v1/agents",
    responses((status = 200, body = AgentListResponse)),
    tag = "agents"
)]
async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentListResponse> {
    Json(AgentListResponse {
        agents: state.catalog.list(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/agents",
    request_body = AgentDefinition,
    responses(
        (status = 201, body = AgentDefinition),
        (status = 400, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<AgentDefinition>,
) -> Result<(StatusCode, Json<AgentDefinition>), ApiError> {
    let created = state.catalog.create(definition)?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}",
    responses(
        (status = 200, body = AgentDefinition),
        (status = 404, body = ProblemDetails)
    ),
    params(("agent_id" = String, Path, description = "Agent id")),
    tag = "agents"
)]
async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentDefinition>, ApiError> {
    Ok(Json(state.catalog.get(&agent_id)?))
}

#[utoipa::path(
    delete,
    path = "/v1/agents/{agent_id}",
    responses(
        (status = 204, description = "Agent removed"),
        (status = 404, body = ProblemDetails)
    ),
    params(("agent_id" = String, Path, description = "Agent id")),
    tag = "agents"
)]
async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.catalog.remove(&agent_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 204, description = "Session instances and memory cleared"),
        (status = 503, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn clear_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.clear_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/chat",
    request_body = ChatMessageRequest,
    responses(
        (status = 200, body = ChatOutcome),
        (status = 404, body = ProblemDetails),
        (status = 429, body = ProblemDetails),
        (status = 502, body = ProblemDetails),
        (status = 504, body = ProblemDetails)
    ),
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("x-user-id" = Option<String>, Header, description = "Caller identity for rate limiting")
    ),
    tag = "sessions"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Json<ChatOutcome>, ApiError> {
    let user_id = caller_id(&headers);

    // Cancelled when the client goes away and axum drops this future.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let outcome = state
        .coordinator
        .chat(
            ChatRequest {
                user_id,
                session_id,
                agent_id: request.agent_id.filter(|id| !id.is_empty()),
                message: request.message,
            },
            &cancel,
        )
        .await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/broadcast",
    request_body = BroadcastRequest,
    responses(
        (status = 200, body = BroadcastResponse),
        (status = 400, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("x-user-id" = Option<String>, Header, description = "Caller identity for rate limiting")
    ),
    tag = "sessions"
)]
async fn post_broadcast(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    let user_id = caller_id(&headers);
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let results = state
        .coordinator
        .broadcast(
            &user_id,
            &session_id,
            &request.agent_ids,
            &request.message,
            &cancel,
        )
        .await?;
    let results = request
        .agent_ids
        .into_iter()
        .zip(results)
        .map(|(agent_id, result)| match result {
            Ok(outcome) => BroadcastResult {
                agent_id,
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => BroadcastResult {
                agent_id,
                outcome: None,
                error: Some(err.to_problem_details()),
            },
        })
        .collect();
    Ok(Json(BroadcastResponse { results }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events",
    params(
        ("session_id" = String, Path, description = "Session id"),
        EventsQuery
    ),
    responses(
        (status = 200, description = "Server-sent event stream"),
        (status = 410, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let (_handle, stream) = state
        .coordinator
        .hub()
        .connect(query.client_id, Some(session_id))?;
    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/memory",
    responses(
        (status = 200, body = ConversationRecord),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn get_memory(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ConversationRecord>, ApiError> {
    let layer = state
        .coordinator
        .memory(&session_id)
        .await?
        .ok_or(RuntimeError::SessionNotFound { session_id })?;
    Ok(Json(ConversationRecord::from_layer(&layer)))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/summarize",
    responses(
        (status = 200, body = ConversationRecord),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn post_summarize(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ConversationRecord>, ApiError> {
    let layer = state.coordinator.force_summarize(&session_id).await?;
    Ok(Json(ConversationRecord::from_layer(&layer)))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/usage",
    responses(
        (status = 200, body = TokenUsage),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn get_usage(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<TokenUsage>, ApiError> {
    let usage = state
        .coordinator
        .token_usage(&session_id)
        .ok_or(RuntimeError::SessionNotFound { session_id })?;
    Ok(Json(usage))
}

fn caller_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}
