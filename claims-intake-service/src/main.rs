mod providers;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{from_fn, Next},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use claim_flow::{
    DocumentValidator, FileSnapshotStore, FlowError, FlowMachine, FlowState,
    InMemorySnapshotStore, InsuredPerson, NewUpload, SnapshotStore, SubmissionBlocker,
    UploadCategory,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::providers::{
    HttpDocumentValidator, OfflineDocumentValidator, StubAuthenticator, StubClaimSubmitter,
    StubInsuredDirectory,
};

#[derive(Clone)]
struct AppState {
    machine: FlowMachine,
}

#[derive(Debug, Deserialize)]
struct AuthenticateRequest {
    policy_number: String,
    date_of_birth: String,
    captcha_affirmed: bool,
}

#[derive(Debug, Deserialize)]
struct SelectInsuredRequest {
    insured_id: String,
}

#[derive(Debug, Deserialize)]
struct ClaimTypeRequest {
    claim_type: String,
}

#[derive(Debug, Deserialize)]
struct UploadFileRequest {
    name: String,
    mime_type: String,
    data_base64: String,
}

#[derive(Debug, Deserialize)]
struct AddUploadsRequest {
    files: Vec<UploadFileRequest>,
}

#[derive(Debug, Serialize)]
struct AddUploadsResponse {
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct NavigateResponse {
    step: u8,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    claim_number: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    blockers: Option<Vec<SubmissionBlocker>>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn flow_error(err: FlowError) -> ApiError {
    let status = match &err {
        FlowError::Locked { .. } => StatusCode::TOO_MANY_REQUESTS,
        FlowError::AuthenticationFailed | FlowError::SessionExpired => StatusCode::UNAUTHORIZED,
        FlowError::CaptchaRequired | FlowError::UnknownCategory(_) => StatusCode::BAD_REQUEST,
        FlowError::SubmissionNotReady(_) => StatusCode::CONFLICT,
        FlowError::Storage(_) | FlowError::Collaborator(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "request failed");
    }
    let blockers = match &err {
        FlowError::SubmissionNotReady(blockers) => Some(blockers.clone()),
        _ => None,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            blockers,
        }),
    )
}

/// Initialize structured JSON tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "claims_intake_service=debug,claim_flow=debug".into());

    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

/// Middleware to add a correlation ID to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let store: Arc<dyn SnapshotStore> = match std::env::var("SNAPSHOT_DIR") {
        Ok(dir) => {
            info!(%dir, "using file-backed snapshot store");
            Arc::new(FileSnapshotStore::new(dir))
        }
        Err(_) => {
            info!("using in-memory snapshot store (set SNAPSHOT_DIR to persist)");
            Arc::new(InMemorySnapshotStore::new())
        }
    };

    let validator: Arc<dyn DocumentValidator> = match std::env::var("VALIDATION_URL") {
        Ok(url) => {
            info!(%url, "using HTTP document validation");
            Arc::new(HttpDocumentValidator::new(url)?)
        }
        Err(_) => {
            info!("VALIDATION_URL not set, accepting structurally valid files");
            Arc::new(OfflineDocumentValidator)
        }
    };

    let machine = FlowMachine::restore(
        store,
        Arc::new(StubAuthenticator),
        Arc::new(StubInsuredDirectory),
        validator,
        Arc::new(StubClaimSubmitter),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to restore flow state: {e}"))?;

    let app_state = AppState { machine };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/state", get(get_state))
        .route("/authenticate", post(authenticate))
        .route("/insured", get(insured_list))
        .route("/insured/select", post(select_insured))
        .route("/claim-type", post(set_claim_type))
        .route("/uploads/{category}", post(add_uploads))
        .route("/uploads/{category}/{id}", delete(remove_upload))
        .route("/navigate/{step}", post(navigate))
        .route("/submit", post(submit))
        .route("/reset", post(reset))
        .layer(from_fn(correlation_id_middleware))
        .with_state(app_state);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("claims intake service running on http://{bind_addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn get_state(State(state): State<AppState>) -> Json<FlowState> {
    Json(state.machine.state())
}

async fn authenticate(
    State(state): State<AppState>,
    Json(request): Json<AuthenticateRequest>,
) -> Result<Json<FlowState>, ApiError> {
    let next = state
        .machine
        .authenticate(
            request.policy_number.trim(),
            &request.date_of_birth,
            request.captcha_affirmed,
        )
        .await
        .map_err(flow_error)?;
    Ok(Json(next))
}

async fn insured_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<InsuredPerson>>, ApiError> {
    let list = state.machine.insured_list().await.map_err(flow_error)?;
    Ok(Json(list))
}

async fn select_insured(
    State(state): State<AppState>,
    Json(request): Json<SelectInsuredRequest>,
) -> Result<Json<FlowState>, ApiError> {
    let next = state
        .machine
        .select_insured(&request.insured_id)
        .await
        .map_err(flow_error)?;
    Ok(Json(next))
}

async fn set_claim_type(
    State(state): State<AppState>,
    Json(request): Json<ClaimTypeRequest>,
) -> Result<Json<FlowState>, ApiError> {
    let next = state
        .machine
        .set_claim_type(&request.claim_type)
        .await
        .map_err(flow_error)?;
    Ok(Json(next))
}

fn parse_category(raw: &str) -> Result<UploadCategory, ApiError> {
    UploadCategory::parse(raw)
        .ok_or_else(|| flow_error(FlowError::UnknownCategory(raw.to_string())))
}

async fn add_uploads(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Json(request): Json<AddUploadsRequest>,
) -> Result<Json<AddUploadsResponse>, ApiError> {
    let category = parse_category(&category)?;

    let mut files = Vec::with_capacity(request.files.len());
    for file in request.files {
        let bytes = BASE64.decode(file.data_base64.as_bytes()).map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: format!("file {} is not valid base64", file.name),
                    blockers: None,
                }),
            )
        })?;
        files.push(NewUpload {
            name: file.name,
            mime_type: file.mime_type,
            bytes,
        });
    }

    let ids = state
        .machine
        .add_files(category, files)
        .await
        .map_err(flow_error)?;
    Ok(Json(AddUploadsResponse { ids }))
}

async fn remove_upload(
    State(state): State<AppState>,
    Path((category, id)): Path<(String, String)>,
) -> Result<Json<FlowState>, ApiError> {
    let category = parse_category(&category)?;
    let next = state
        .machine
        .remove_upload(category, &id)
        .await
        .map_err(flow_error)?;
    Ok(Json(next))
}

async fn navigate(
    State(state): State<AppState>,
    Path(step): Path<u8>,
) -> Result<Json<NavigateResponse>, ApiError> {
    let step = state.machine.navigate_to(step).await.map_err(flow_error)?;
    Ok(Json(NavigateResponse { step }))
}

async fn submit(State(state): State<AppState>) -> Result<Json<SubmitResponse>, ApiError> {
    let claim_number = state.machine.submit().await.map_err(flow_error)?;
    Ok(Json(SubmitResponse { claim_number }))
}

async fn reset(State(state): State<AppState>) -> Result<Json<FlowState>, ApiError> {
    let next = state.machine.reset().await.map_err(flow_error)?;
    Ok(Json(next))
}
