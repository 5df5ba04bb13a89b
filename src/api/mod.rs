//! HTTP API server
//!
//! Tenant-scoped operations take the tenant from the `x-tenant-id`
//! header; authentication sits in front of this service and is not
//! handled here.

pub mod health;
pub mod websocket;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::{ForgottenRepo, InstanceRepo, RecoveryStatus};
use crate::events::{
    build_recovery_customer_converted_event, build_recovery_customer_replied_event, EventHub,
    EventSink,
};
use crate::jobs::{Job, MessageJob, QueueKind, RecoveryScanJob};
use crate::pipeline::JobPipeline;
use crate::session::{BridgeWebhook, SessionRegistry, TransportEvent};
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SessionRegistry>,
    pub pipeline: JobPipeline,
    pub hub: Arc<EventHub>,
    pub instances: InstanceRepo,
    pub forgotten: ForgottenRepo,
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = std::result::Result<T, ApiError>;

fn error_response(e: &Error) -> ApiError {
    let status = match e {
        Error::InvalidPhoneFormat(_) | Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::AlreadyConnecting(_) | Error::AlreadyPaired(_) | Error::NotConnected(_) => {
            StatusCode::CONFLICT
        }
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
        }),
    )
}

/// Refuse instance operations across tenant boundaries. A live session
/// answers from memory; offline instances fall back to the repository.
/// An instance nobody has claimed yet belongs to the first caller.
fn check_instance_owner(state: &ApiState, tenant: &str, instance_id: &str) -> ApiResult<()> {
    let owner = match state.registry.tenant_of(instance_id) {
        Some(owner) => Some(owner),
        None => state
            .instances
            .owner_of(instance_id)
            .map_err(|e| error_response(&e))?,
    };
    match owner {
        Some(owner) if owner != tenant => Err(error_response(&Error::NotFound(format!(
            "instance {instance_id}"
        )))),
        _ => Ok(()),
    }
}

fn tenant_id(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "missing x-tenant-id header".to_owned(),
                }),
            )
        })
}

/// The API server
pub struct ApiServer {
    state: ApiState,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: ApiState, port: u16) -> Self {
        Self { state, port }
    }

    /// Build the router with all routes
    fn router(&self) -> Router {
        let router = Router::new()
            .route("/api/instances", get(list_instances))
            .route("/api/instances/{id}/connect", post(connect_instance))
            .route("/api/instances/{id}/pairing-code", post(pairing_code))
            .route("/api/instances/{id}/send", post(send_message))
            .route("/api/instances/{id}/recovery-scan", post(trigger_scan))
            .route("/api/forgotten", get(list_forgotten))
            .route("/api/forgotten/{id}/status", post(update_forgotten))
            .route("/api/dlq", get(list_dead_letters))
            .route("/api/dlq/{queue}/retry", post(retry_dead_letters))
            .route("/webhooks/bridge", post(bridge_webhook))
            .with_state(self.state.clone())
            .merge(health::router(self.state.clone()))
            .merge(websocket::router(self.state.hub.clone()));

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

#[derive(Debug, Serialize)]
struct InstanceView {
    id: String,
    status: String,
    phone_number: Option<String>,
    last_error: Option<String>,
}

async fn list_instances(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<InstanceView>>> {
    let tenant = tenant_id(&headers)?;
    let records = state
        .instances
        .list_for_tenant(&tenant)
        .map_err(|e| error_response(&e))?;

    Ok(Json(
        records
            .into_iter()
            .map(|r| InstanceView {
                id: r.id,
                status: r.status.as_str().to_owned(),
                phone_number: r.phone_number,
                last_error: r.last_error,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
struct ConnectResponse {
    status: &'static str,
}

async fn connect_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<ConnectResponse>> {
    let tenant = tenant_id(&headers)?;
    check_instance_owner(&state, &tenant, &id)?;
    state
        .registry
        .connect(&tenant, &id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(ConnectResponse {
        status: "connecting",
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingRequest {
    phone_number: String,
}

#[derive(Debug, Serialize)]
struct PairingResponse {
    code: String,
}

async fn pairing_code(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PairingRequest>,
) -> ApiResult<Json<PairingResponse>> {
    let tenant = tenant_id(&headers)?;
    check_instance_owner(&state, &tenant, &id)?;
    let code = state
        .registry
        .pairing_code(&tenant, &id, &body.phone_number)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(PairingResponse { code }))
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    to: String,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: String,
}

async fn send_message(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendRequest>,
) -> ApiResult<Json<SendResponse>> {
    let tenant = tenant_id(&headers)?;
    check_instance_owner(&state, &tenant, &id)?;
    let message_id = state
        .registry
        .send_text(&id, &body.to, &body.content, false)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(SendResponse { message_id }))
}

#[derive(Debug, Serialize)]
struct ScanResponse {
    job_id: String,
}

async fn trigger_scan(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<ScanResponse>> {
    let tenant = tenant_id(&headers)?;
    check_instance_owner(&state, &tenant, &id)?;
    let job = Job::new(
        QueueKind::Recovery,
        &tenant,
        &RecoveryScanJob {
            instance_id: id,
            force: true,
        },
    )
    .map_err(|e| error_response(&e))?;
    let job_id = state
        .pipeline
        .enqueue(job, None)
        .map_err(|e| error_response(&e))?;
    Ok(Json(ScanResponse { job_id }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ForgottenView {
    id: String,
    contact_phone: String,
    contact_name: Option<String>,
    silent_side: String,
    last_message: String,
    hours_of_silence: i64,
    temperature: u8,
    temperature_label: String,
    temperature_emoji: String,
    temperature_explanation: String,
    estimated_value_cents: i64,
    suggested_reply: String,
    reply_rationale: String,
    status: String,
}

async fn list_forgotten(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ForgottenView>>> {
    let tenant = tenant_id(&headers)?;
    let rows = state
        .forgotten
        .list_for_tenant(&tenant)
        .map_err(|e| error_response(&e))?;

    Ok(Json(
        rows.into_iter()
            .map(|c| ForgottenView {
                id: c.id,
                contact_phone: c.contact_phone,
                contact_name: c.contact_name,
                silent_side: c.silent_side,
                last_message: c.last_message,
                hours_of_silence: c.hours_of_silence,
                temperature: c.temperature,
                temperature_label: c.temperature_label,
                temperature_emoji: c.temperature_emoji,
                temperature_explanation: c.temperature_explanation,
                estimated_value_cents: c.estimated_value_cents,
                suggested_reply: c.suggested_reply,
                reply_rationale: c.reply_rationale,
                status: c.status.as_str().to_owned(),
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdateRequest {
    status: String,
    converted_value_cents: Option<i64>,
}

async fn update_forgotten(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StatusUpdateRequest>,
) -> ApiResult<StatusCode> {
    let tenant = tenant_id(&headers)?;
    let status = match body.status.as_str() {
        "replied" => RecoveryStatus::Replied,
        "converted" => RecoveryStatus::Converted,
        "ignored" => RecoveryStatus::Ignored,
        other => {
            return Err(error_response(&Error::Validation(format!(
                "unknown status {other}"
            ))));
        }
    };
    let Some(customer) = state
        .forgotten
        .find(&tenant, &id)
        .map_err(|e| error_response(&e))?
    else {
        return Err(error_response(&Error::NotFound(format!(
            "forgotten customer {id}"
        ))));
    };

    // replying means actually sending the suggested message
    if status == RecoveryStatus::Replied {
        state
            .registry
            .send_text(
                &customer.instance_id,
                &customer.contact_phone,
                &customer.suggested_reply,
                false,
            )
            .await
            .map_err(|e| error_response(&e))?;
    }

    state
        .forgotten
        .update_status(&tenant, &id, status, body.converted_value_cents)
        .map_err(|e| error_response(&e))?;

    match status {
        RecoveryStatus::Replied => state.hub.emit(build_recovery_customer_replied_event(
            &tenant,
            &id,
            &customer.contact_phone,
        )),
        RecoveryStatus::Converted => state.hub.emit(build_recovery_customer_converted_event(
            &tenant,
            &id,
            &customer.contact_phone,
            body.converted_value_cents,
        )),
        RecoveryStatus::Found | RecoveryStatus::Ignored => {}
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    queue: Option<String>,
}

async fn list_dead_letters(
    State(state): State<ApiState>,
    Query(query): Query<DlqQuery>,
) -> ApiResult<Json<Vec<crate::broker::DeadLetter>>> {
    let queue = match query.queue.as_deref() {
        Some(name) => Some(parse_queue(name)?),
        None => None,
    };
    let rows = state
        .pipeline
        .store()
        .dead_letters(queue)
        .map_err(|e| error_response(&e))?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    requeued: u32,
}

async fn retry_dead_letters(
    State(state): State<ApiState>,
    Path(queue): Path<String>,
) -> ApiResult<Json<RetryResponse>> {
    let queue = parse_queue(&queue)?;
    let requeued = state
        .pipeline
        .store()
        .retry_dead(queue)
        .map_err(|e| error_response(&e))?;
    Ok(Json(RetryResponse { requeued }))
}

/// Callback surface for the protocol bridge sidecar
///
/// Lifecycle events go to the session registry; inbound messages are
/// enqueued so delivery to the AI responder survives a restart.
async fn bridge_webhook(
    State(state): State<ApiState>,
    Json(payload): Json<BridgeWebhook>,
) -> ApiResult<StatusCode> {
    let event = payload.into_event().map_err(|e| error_response(&e))?;

    match event {
        TransportEvent::MessageReceived {
            instance_id,
            message_id,
            from_phone,
            from_name,
            content,
            received_at,
        } => {
            let Some(tenant) = state.registry.tenant_of(&instance_id) else {
                tracing::warn!(instance_id, "inbound message for unknown instance");
                return Ok(StatusCode::NO_CONTENT);
            };
            let job = Job::new(
                QueueKind::Message,
                &tenant,
                &MessageJob {
                    instance_id,
                    message_id,
                    contact_phone: from_phone,
                    contact_name: from_name,
                    content,
                    received_at,
                },
            )
            .map_err(|e| error_response(&e))?;
            state
                .pipeline
                .enqueue(job, None)
                .map_err(|e| error_response(&e))?;
        }
        other => state.registry.handle_event(other).await,
    }

    Ok(StatusCode::NO_CONTENT)
}

fn parse_queue(name: &str) -> ApiResult<QueueKind> {
    QueueKind::from_str(name)
        .ok_or_else(|| error_response(&Error::Validation(format!("unknown queue {name}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerGuard, JobStore};
    use crate::db::init_memory;
    use crate::session::{ConnectionStatus, CredsStore, MockTransport};

    fn state() -> ApiState {
        let pool = init_memory().unwrap();
        let hub = Arc::new(EventHub::new());
        let dir = std::env::temp_dir().join(format!("courier-test-{}", uuid::Uuid::new_v4()));
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(MockTransport::default()),
            CredsStore::new(dir.join("p"), dir.join("b")),
            InstanceRepo::new(pool.clone()),
            hub.clone(),
        ));
        ApiState {
            registry,
            pipeline: JobPipeline::new(JobStore::new(pool.clone()), Arc::new(BrokerGuard::new())),
            hub,
            instances: InstanceRepo::new(pool.clone()),
            forgotten: ForgottenRepo::new(pool),
        }
    }

    #[tokio::test]
    async fn instance_operations_are_tenant_scoped() {
        let state = state();

        // a live session answers from the registry
        state.registry.connect("org-1", "inst-1").await.unwrap();
        assert!(check_instance_owner(&state, "org-1", "inst-1").is_ok());
        let (status, _) = check_instance_owner(&state, "org-2", "inst-1").unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        // offline instances are resolved through the repository
        state
            .instances
            .upsert_status("org-1", "inst-2", ConnectionStatus::Disconnected, None, None)
            .unwrap();
        assert!(check_instance_owner(&state, "org-1", "inst-2").is_ok());
        assert!(check_instance_owner(&state, "org-2", "inst-2").is_err());

        // an unclaimed instance goes to whoever asks first
        assert!(check_instance_owner(&state, "org-3", "inst-new").is_ok());
    }

    #[test]
    fn tenant_header_is_required() {
        let headers = HeaderMap::new();
        assert!(tenant_id(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-tenant-id", "org-1".parse().unwrap());
        assert_eq!(tenant_id(&headers).unwrap(), "org-1");
    }

    #[test]
    fn error_mapping_covers_the_taxonomy() {
        let (status, _) = error_response(&Error::InvalidPhoneFormat("x".to_owned()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = error_response(&Error::AlreadyConnecting("i".to_owned()));
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = error_response(&Error::BrokerUnavailable("b".to_owned()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = error_response(&Error::NotFound("f".to_owned()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = error_response(&Error::Database("d".to_owned()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
