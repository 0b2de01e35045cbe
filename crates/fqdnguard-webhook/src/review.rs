//! AdmissionReview decoding
//!
//! Bodies are decoded by hand rather than through axum's `Json` extractor so
//! that every malformed input maps to a 400 with a useful message.

use std::fmt;

use axum::http::{header, HeaderMap};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionReview, Operation};
use tracing::debug;

use fqdnguard_common::crd::{HTTPProxy, HTTPPROXY_GROUP, HTTPPROXY_KIND, HTTPPROXY_VERSION};

use crate::error::WebhookError;

/// Operations the webhook decides on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdmissionOperation {
    /// Object is being created
    Create,
    /// Object is being updated
    Update,
    /// Object is being deleted
    Delete,
}

impl AdmissionOperation {
    /// Upper-case verb, as the API server spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AdmissionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&Operation> for AdmissionOperation {
    type Error = WebhookError;

    fn try_from(op: &Operation) -> Result<Self, Self::Error> {
        match op {
            Operation::Create => Ok(Self::Create),
            Operation::Update => Ok(Self::Update),
            Operation::Delete => Ok(Self::Delete),
            other => Err(WebhookError::bad_request(format!(
                "operation {other:?} is not supported, must be one of CREATE, UPDATE or DELETE"
            ))),
        }
    }
}

/// A decoded HTTPProxy admission request
#[derive(Debug)]
pub struct ProxyAdmission {
    /// Raw request, kept to build the response (UID, GVK)
    pub request: AdmissionRequest<DynamicObject>,
    /// Operation being admitted
    pub operation: AdmissionOperation,
    /// Side effects must not be committed
    pub dry_run: bool,
    /// Object after the change; absent on delete
    pub new: Option<HTTPProxy>,
    /// Object before the change; absent on create
    pub old: Option<HTTPProxy>,
}

/// Reject anything that isn't `application/json`
pub fn check_content_type(headers: &HeaderMap) -> Result<(), WebhookError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if essence.eq_ignore_ascii_case("application/json") {
        Ok(())
    } else {
        Err(WebhookError::bad_request(format!(
            "content-type header is {content_type:?}, must be application/json"
        )))
    }
}

/// Decode and check an AdmissionReview body
pub fn parse_review(body: &[u8]) -> Result<ProxyAdmission, WebhookError> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_slice(body).map_err(|e| {
        WebhookError::bad_request(format!("request body could not be decoded: {e}"))
    })?;

    let request: AdmissionRequest<DynamicObject> = review
        .try_into()
        .map_err(|e| WebhookError::bad_request(format!("invalid admission review: {e}")))?;

    let kind = &request.kind;
    if kind.group != HTTPPROXY_GROUP || kind.version != HTTPPROXY_VERSION || kind.kind != HTTPPROXY_KIND
    {
        return Err(WebhookError::bad_request(format!(
            "requested kind must be {HTTPPROXY_GROUP}/{HTTPPROXY_VERSION}, Kind={HTTPPROXY_KIND}, got {}/{}, Kind={}",
            kind.group, kind.version, kind.kind
        )));
    }

    let operation = AdmissionOperation::try_from(&request.operation)?;
    let new = request.object.as_ref().map(decode_proxy).transpose()?;
    let old = request.old_object.as_ref().map(decode_proxy).transpose()?;

    match operation {
        AdmissionOperation::Create | AdmissionOperation::Update if new.is_none() => {
            return Err(WebhookError::bad_request(format!(
                "{operation} request carries no object"
            )));
        }
        AdmissionOperation::Update | AdmissionOperation::Delete if old.is_none() => {
            return Err(WebhookError::bad_request(format!(
                "{operation} request carries no oldObject"
            )));
        }
        _ => {}
    }

    debug!(
        uid = %request.uid,
        operation = %operation,
        namespace = ?request.namespace,
        name = %request.name,
        dry_run = request.dry_run,
        "Decoded admission request"
    );

    Ok(ProxyAdmission {
        dry_run: request.dry_run,
        operation,
        new,
        old,
        request,
    })
}

fn decode_proxy(obj: &DynamicObject) -> Result<HTTPProxy, WebhookError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| WebhookError::bad_request(format!("HTTPProxy could not be decoded: {e}")))
}
