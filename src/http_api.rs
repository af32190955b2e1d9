//! HTTP control surface
//!
//! A thin JSON-over-HTTP shell over the typed [`ControlApi`]. DTOs live at
//! this boundary; domain types stay inside. Nothing here adds semantics:
//! every endpoint delegates to one control operation.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{AgentBehavior, AgentRegistration, ApiError, ControlApi};
use crate::audit::{ActionRecord, AuditFilter};
use crate::capability::RoutingPolicy;
use crate::config::AgentConfig;
use crate::domain_types::{
    AgentId, AgentName, CapabilityName, CorrelationId, HandlerTimeoutMs, InboxCapacity,
};
use crate::lifecycle::AgentState;
use crate::messaging::dead_letter::DeadLetterStats;
use crate::messaging::message::{
    AckPolicy, Address, MessageDraft, MessageKind, MessagePriority, Payload, Sender,
};
use crate::metrics::MetricsSnapshot;
use crate::registry::{AgentDescriptor, ListFilter};

/// Error payload returned by every endpoint on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error kind.
    pub error: String,
    /// Human-readable detail.
    pub details: Option<String>,
}

fn error_response(status: StatusCode, kind: &str, details: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: kind.to_string(),
            details: Some(details),
        }),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let details = self.to_string();
        let (status, kind) = match &self {
            Self::NoSuchAgent { .. } => (StatusCode::NOT_FOUND, "no_such_agent"),
            Self::NoSuchRecipient { .. } => (StatusCode::NOT_FOUND, "no_such_recipient"),
            Self::DuplicateName { .. } => (StatusCode::CONFLICT, "duplicate_name"),
            Self::IllegalState { .. } => (StatusCode::CONFLICT, "illegal_state"),
            Self::IllegalTransition { .. } => (StatusCode::CONFLICT, "illegal_transition"),
            Self::BackpressureTimeout { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "backpressure_timeout")
            }
            Self::DeadlineExceeded { .. } => (StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded"),
            Self::DeniedByPolicy { .. } => (StatusCode::FORBIDDEN, "denied_by_policy"),
            Self::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        error_response(status, kind, details)
    }
}

/// Agent representation for API serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    /// Prefixed textual id.
    pub id: String,
    /// Name.
    pub name: String,
    /// Lifecycle state label.
    pub state: AgentState,
    /// Declared capabilities.
    pub capabilities: Vec<String>,
    /// Declared relationships, as textual ids.
    pub relationships: Vec<String>,
    /// Consecutive failed health samples.
    pub consecutive_failures: u32,
    /// Current inbox depth.
    pub queue_depth: usize,
}

impl AgentView {
    fn from_descriptor(descriptor: &AgentDescriptor, queue_depth: usize) -> Self {
        Self {
            id: descriptor.id.to_string(),
            name: descriptor.name.to_string(),
            state: descriptor.state,
            capabilities: descriptor
                .capabilities
                .iter()
                .map(ToString::to_string)
                .collect(),
            relationships: descriptor
                .relationships
                .iter()
                .map(ToString::to_string)
                .collect(),
            consecutive_failures: descriptor.consecutive_failures,
            queue_depth,
        }
    }
}

/// Registration request body.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    /// Agent name.
    pub name: String,
    /// Capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Related agent ids, textual form.
    #[serde(default)]
    pub relationships: Vec<String>,
    /// Installed blueprint to instantiate.
    pub blueprint: String,
    /// Allow overlapping handlers.
    #[serde(default)]
    pub reentrant: bool,
    /// Inbox capacity override.
    pub inbox_capacity: Option<usize>,
    /// Handler budget override, in milliseconds.
    pub handler_timeout_ms: Option<u64>,
    /// Opaque agent parameters.
    pub params: Option<Value>,
}

/// Registration response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The new agent's textual id.
    pub id: String,
}

/// Lifecycle command response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Audit action id; poll `/audit` with it for progress.
    pub action_id: String,
}

/// Send request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    /// Destination: an agent id, `cap:<tag>`, or `broadcast`.
    pub to: String,
    /// Message kind.
    pub kind: MessageKind,
    /// JSON payload.
    #[serde(default)]
    pub payload: Value,
    /// Priority; defaults to normal.
    pub priority: Option<MessagePriority>,
    /// Routing policy for capability destinations: `any`, `least_loaded`,
    /// `round_robin`, or `preferred:<agent id>`.
    pub routing: Option<String>,
    /// Time-to-live in milliseconds.
    pub ttl_ms: Option<u64>,
    /// Skip delivery tracking.
    #[serde(default)]
    pub fire_and_forget: bool,
    /// Correlation id to propagate, textual uuid.
    pub correlation_id: Option<String>,
}

/// Send response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    /// Correlation id attached to the accepted message(s).
    pub correlation_id: String,
    /// Per-recipient message ids.
    pub message_ids: Vec<String>,
    /// Recipients that got a copy.
    pub recipients: Vec<String>,
}

/// Query string accepted by the agent listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    /// Filter by state label.
    pub state: Option<AgentState>,
    /// Filter by capability.
    pub capability: Option<String>,
    /// Filter by name prefix.
    pub prefix: Option<String>,
}

/// Query string accepted by the audit endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    /// Filter by correlation id.
    pub correlation_id: Option<String>,
    /// Maximum records returned.
    pub limit: Option<usize>,
}

/// Health check response for the `/api/v1/health` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Always `healthy` while the process serves requests.
    pub status: String,
}

/// Dead letter listing response.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterResponse {
    /// Aggregate statistics.
    pub stats: DeadLetterStats,
    /// Most recent entries, newest last.
    pub recent: Vec<Value>,
}

/// Creates the Axum application router over a control API.
pub fn create_app(control: ControlApi) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/agents", get(list_agents).post(register_agent))
        .route(
            "/api/v1/agents/{id}",
            get(get_agent).delete(deregister_agent),
        )
        .route("/api/v1/agents/{id}/start", post(start_agent))
        .route("/api/v1/agents/{id}/stop", post(stop_agent))
        .route("/api/v1/agents/{id}/restart", post(restart_agent))
        .route("/api/v1/messages", post(send_message))
        .route("/api/v1/metrics", get(metrics_snapshot))
        .route("/api/v1/audit", get(audit_query))
        .route("/api/v1/dead-letters", get(dead_letters))
        .route("/api/v1/capabilities", get(capabilities))
        .with_state(control)
}

/// Binds a listener on `addr`.
///
/// # Errors
/// Returns the bind error.
pub async fn bind(addr: SocketAddr) -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;
    Ok((listener, actual))
}

/// Serves the application until the token is cancelled.
///
/// # Errors
/// Returns the server error.
pub async fn serve_with_graceful_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown_token: CancellationToken,
) -> Result<(), std::io::Error> {
    let shutdown_signal = async move {
        shutdown_token.cancelled().await;
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(std::io::Error::other)?;
    Ok(())
}

async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "healthy".to_string(),
    })
}

fn parse_agent_id(text: &str) -> Result<AgentId, Response> {
    text.parse::<AgentId>().map_err(|error| {
        error_response(StatusCode::BAD_REQUEST, "invalid_id", error.to_string())
    })
}

fn parse_capability(text: &str) -> Result<CapabilityName, Response> {
    CapabilityName::try_new(text.to_string()).map_err(|error| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_capability",
            error.to_string(),
        )
    })
}

fn parse_address(text: &str) -> Result<Address, Response> {
    if text == "broadcast" {
        return Ok(Address::Broadcast);
    }
    if let Some(capability) = text.strip_prefix("cap:") {
        return Ok(Address::Capability(parse_capability(capability)?));
    }
    Ok(Address::Agent(parse_agent_id(text)?))
}

fn parse_routing(text: &str) -> Result<RoutingPolicy, Response> {
    match text {
        "any" => Ok(RoutingPolicy::Any),
        "least_loaded" => Ok(RoutingPolicy::LeastLoaded),
        "round_robin" => Ok(RoutingPolicy::RoundRobin),
        other => match other.strip_prefix("preferred:") {
            Some(id) => Ok(RoutingPolicy::Preferred(parse_agent_id(id)?)),
            None => Err(error_response(
                StatusCode::BAD_REQUEST,
                "invalid_routing",
                format!("unknown routing policy: {other}"),
            )),
        },
    }
}

async fn list_agents(
    State(control): State<ControlApi>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<AgentView>>, Response> {
    let capability = match &query.capability {
        Some(tag) => Some(parse_capability(tag)?),
        None => None,
    };
    let filter = ListFilter {
        state: query.state,
        capability,
        name_prefix: query.prefix,
    };
    let views = control
        .list(&filter)
        .iter()
        .map(|descriptor| {
            AgentView::from_descriptor(descriptor, control.queue_depth(descriptor.id))
        })
        .collect();
    Ok(Json(views))
}

async fn register_agent(
    State(control): State<ControlApi>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, Response> {
    let name = AgentName::try_new(request.name.trim().to_string()).map_err(|error| {
        error_response(StatusCode::BAD_REQUEST, "invalid_name", error.to_string())
    })?;

    let mut capabilities = std::collections::BTreeSet::new();
    for tag in &request.capabilities {
        capabilities.insert(parse_capability(tag)?);
    }
    let mut relationships = std::collections::BTreeSet::new();
    for id in &request.relationships {
        relationships.insert(parse_agent_id(id)?);
    }

    let inbox_capacity = match request.inbox_capacity {
        Some(capacity) => Some(InboxCapacity::try_new(capacity).map_err(|error| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_inbox_capacity",
                error.to_string(),
            )
        })?),
        None => None,
    };
    let handler_timeout_ms = match request.handler_timeout_ms {
        Some(ms) => Some(HandlerTimeoutMs::try_new(ms).map_err(|error| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_handler_timeout",
                error.to_string(),
            )
        })?),
        None => None,
    };

    let registration = AgentRegistration {
        name,
        capabilities,
        relationships,
        config: AgentConfig {
            inbox_capacity,
            handler_timeout_ms,
            reentrant: request.reentrant,
            blueprint: None,
            params: request.params.unwrap_or(Value::Null),
        },
        behavior: AgentBehavior::Blueprint(request.blueprint),
    };

    let agent_id = control
        .register(registration)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: agent_id.to_string(),
        }),
    ))
}

async fn get_agent(
    State(control): State<ControlApi>,
    Path(id): Path<String>,
) -> Result<Json<AgentView>, Response> {
    let agent_id = parse_agent_id(&id)?;
    let descriptor = control
        .get(agent_id)
        .map_err(IntoResponse::into_response)?;
    Ok(Json(AgentView::from_descriptor(
        &descriptor,
        control.queue_depth(agent_id),
    )))
}

async fn deregister_agent(
    State(control): State<ControlApi>,
    Path(id): Path<String>,
) -> Result<StatusCode, Response> {
    let agent_id = parse_agent_id(&id)?;
    control
        .deregister(agent_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_agent(
    State(control): State<ControlApi>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Response> {
    let agent_id = parse_agent_id(&id)?;
    let action_id = control
        .start(agent_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandResponse {
            action_id: action_id.to_string(),
        }),
    ))
}

async fn stop_agent(
    State(control): State<ControlApi>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Response> {
    let agent_id = parse_agent_id(&id)?;
    let action_id = control
        .stop(agent_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandResponse {
            action_id: action_id.to_string(),
        }),
    ))
}

async fn restart_agent(
    State(control): State<ControlApi>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Response> {
    let agent_id = parse_agent_id(&id)?;
    let action_id = control
        .restart(agent_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandResponse {
            action_id: action_id.to_string(),
        }),
    ))
}

async fn send_message(
    State(control): State<ControlApi>,
    Json(request): Json<SendRequest>,
) -> Result<impl IntoResponse, Response> {
    let to = parse_address(&request.to)?;
    let payload = Payload::json(&request.payload).map_err(|error| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_payload",
            error.to_string(),
        )
    })?;

    let mut draft = MessageDraft::new(Sender::External, to, request.kind, payload);
    if let Some(priority) = request.priority {
        draft = draft.with_priority(priority);
    }
    if let Some(routing) = &request.routing {
        draft = draft.with_routing(parse_routing(routing)?);
    }
    if let Some(ttl_ms) = request.ttl_ms {
        draft = draft.with_ttl(Duration::from_millis(ttl_ms));
    }
    if request.fire_and_forget {
        draft = draft.with_ack_policy(AckPolicy::FireAndForget);
    }
    if let Some(correlation) = &request.correlation_id {
        let parsed = correlation.parse::<uuid::Uuid>().map_err(|error| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_correlation_id",
                error.to_string(),
            )
        })?;
        draft = draft.with_correlation_id(CorrelationId::new(parsed));
    }

    let receipt = control
        .send(draft)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SendResponse {
            correlation_id: receipt.correlation_id.to_string(),
            message_ids: receipt
                .deliveries
                .iter()
                .map(|delivery| delivery.message_id.to_string())
                .collect(),
            recipients: receipt
                .recipients()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }),
    ))
}

async fn metrics_snapshot(State(control): State<ControlApi>) -> Json<MetricsSnapshot> {
    Json(control.metrics_snapshot())
}

async fn audit_query(
    State(control): State<ControlApi>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<ActionRecord>>, Response> {
    let correlation_id = match &query.correlation_id {
        Some(text) => {
            let parsed = text.parse::<uuid::Uuid>().map_err(|error| {
                error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_correlation_id",
                    error.to_string(),
                )
            })?;
            Some(CorrelationId::new(parsed))
        }
        None => None,
    };
    let filter = AuditFilter {
        correlation_id,
        limit: query.limit,
        ..AuditFilter::default()
    };
    Ok(Json(control.audit_query(&filter)))
}

async fn dead_letters(State(control): State<ControlApi>) -> Json<DeadLetterResponse> {
    let recent = control
        .recent_dead_letters(50)
        .iter()
        .map(|entry| {
            serde_json::json!({
                "message_id": entry.message.message_id.to_string(),
                "to": entry.message.to.to_string(),
                "kind": entry.message.kind.label(),
                "reason": entry.reason.label(),
            })
        })
        .collect();
    Json(DeadLetterResponse {
        stats: control.dead_letter_stats(),
        recent,
    })
}

async fn capabilities(State(control): State<ControlApi>) -> Json<Value> {
    let listed: Vec<Value> = control
        .capabilities()
        .iter()
        .map(|(capability, candidates)| {
            serde_json::json!({
                "capability": capability.to_string(),
                "candidates": candidates,
            })
        })
        .collect();
    Json(Value::Array(listed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing_covers_all_forms() {
        assert_eq!(parse_address("broadcast").unwrap(), Address::Broadcast);
        assert!(matches!(
            parse_address("cap:pay").unwrap(),
            Address::Capability(_)
        ));
        assert!(matches!(
            parse_address("agent-0000000000000001").unwrap(),
            Address::Agent(_)
        ));
        assert!(parse_address("nonsense").is_err());
    }

    #[test]
    fn routing_parsing_covers_all_policies() {
        assert_eq!(parse_routing("any").unwrap(), RoutingPolicy::Any);
        assert_eq!(
            parse_routing("least_loaded").unwrap(),
            RoutingPolicy::LeastLoaded
        );
        assert_eq!(
            parse_routing("round_robin").unwrap(),
            RoutingPolicy::RoundRobin
        );
        assert!(matches!(
            parse_routing("preferred:agent-0000000000000002").unwrap(),
            RoutingPolicy::Preferred(_)
        ));
        assert!(parse_routing("random").is_err());
    }
}
