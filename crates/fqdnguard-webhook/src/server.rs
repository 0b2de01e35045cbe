//! HTTPS server and admission handlers
//!
//! - `POST /v1/validate`: FQDN uniqueness (validating webhook)
//! - `POST /v1/mutate`: idle timeout defaulting (mutating webhook)
//! - `GET /readyz`: readiness probe

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info};

use fqdnguard_common::{metrics, Error};

use crate::error::WebhookError;
use crate::mutate::idle_timeout_patch;
use crate::review::{check_content_type, parse_review, AdmissionOperation};
use crate::validate::{Decision, Verdict};
use crate::WebhookState;

type ReviewResult = Result<Json<AdmissionReview<DynamicObject>>, WebhookError>;

/// Listener settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
}

/// Router with every webhook endpoint
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/v1/validate", post(validate_handler))
        .route("/v1/mutate", post(mutate_handler))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook over TLS until `handle` is told to shut down
pub async fn serve(
    config: ServerConfig,
    state: Arc<WebhookState>,
    handle: Handle,
) -> Result<(), Error> {
    let tls = RustlsConfig::from_pem_file(&config.cert_file, &config.key_file)
        .await
        .map_err(|e| {
            Error::config_field(
                "webhook.tlsCertFile",
                format!(
                    "failed to load TLS material from {} and {}: {e}",
                    config.cert_file.display(),
                    config.key_file.display()
                ),
            )
        })?;

    info!(addr = %config.addr, "Starting admission webhook server");

    axum_server::bind_rustls(config.addr, tls)
        .handle(handle)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::internal("server", e.to_string()))?;

    info!("Admission webhook server stopped");
    Ok(())
}

async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ReviewResult {
    check_content_type(&headers)?;
    let admission = parse_review(&body)?;
    let operation = admission.operation;

    let verdict = state
        .pipeline
        .run(
            &state.cache,
            operation,
            admission.new.as_ref(),
            admission.old.as_ref(),
            admission.dry_run,
        )
        .map_err(|e| {
            error!(uid = %admission.request.uid, operation = %operation, error = %e, "Admission failed");
            metrics::record_admission(operation.as_str(), "error");
            WebhookError::from(e)
        })?;

    let outcome = if verdict.decision.is_allowed() {
        "allowed"
    } else {
        "denied"
    };
    metrics::record_admission(operation.as_str(), outcome);
    debug!(
        uid = %admission.request.uid,
        operation = %operation,
        outcome,
        warnings = verdict.warnings.len(),
        "Admission decided"
    );

    Ok(Json(verdict_response(&admission.request, verdict).into_review()))
}

async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ReviewResult {
    check_content_type(&headers)?;
    let admission = parse_review(&body)?;
    let response = AdmissionResponse::from(&admission.request);

    let new = match (admission.operation, admission.new.as_ref()) {
        (AdmissionOperation::Delete, _) | (_, None) => {
            return Ok(Json(response.into_review()));
        }
        (_, Some(new)) => new,
    };

    let ops = idle_timeout_patch(new, &state.idle_connection_timeout);
    if ops.is_empty() {
        return Ok(Json(response.into_review()));
    }

    debug!(
        uid = %admission.request.uid,
        operations = ops.len(),
        "Defaulting route idle connection timeouts"
    );

    let response = response
        .with_patch(json_patch::Patch(ops))
        .map_err(|e| WebhookError::internal(format!("failed to encode patch: {e}")))?;
    Ok(Json(response.into_review()))
}

/// Turn a verdict into an admission response for `request`
fn verdict_response(request: &AdmissionRequest<DynamicObject>, verdict: Verdict) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    match verdict.decision {
        Decision::Allow => {
            let mut response = response;
            if !verdict.warnings.is_empty() {
                response.warnings = Some(verdict.warnings);
            }
            response
        }
        Decision::Deny { code, message } => {
            let mut response = response.deny(message);
            response.result.code = code;
            response
        }
    }
}
