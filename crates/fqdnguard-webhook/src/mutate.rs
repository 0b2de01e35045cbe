//! Idle connection timeout defaulting
//!
//! Routes of plain HTTP proxies (no `tcpproxy`) without an explicit
//! `timeoutPolicy.idleConnection` get the configured default, and the object
//! is marked with [`IDLE_TIMEOUT_ANNOTATION`] so the change is visible.

use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use serde_json::{json, Value};

use fqdnguard_common::crd::HTTPProxy;

/// Marks objects whose routes received a default idle timeout
pub const IDLE_TIMEOUT_ANNOTATION: &str =
    "policies.network.snappcloud.io/added-timeoutPolicy-idleConnection";

/// JSON patch adding default idle timeouts; empty when nothing is missing
pub fn idle_timeout_patch(proxy: &HTTPProxy, default_timeout: &str) -> Vec<PatchOperation> {
    if proxy.spec.tcp_proxy.is_some() {
        return Vec::new();
    }

    let mut ops: Vec<PatchOperation> = proxy
        .spec
        .routes
        .iter()
        .enumerate()
        .filter_map(|(i, route)| {
            let index = i.to_string();
            match &route.timeout_policy {
                None => Some(add(
                    ["spec", "routes", index.as_str(), "timeoutPolicy"],
                    json!({ "idleConnection": default_timeout }),
                )),
                Some(policy) if policy.idle_connection.as_deref().unwrap_or_default().is_empty() => {
                    Some(add(
                        ["spec", "routes", index.as_str(), "timeoutPolicy", "idleConnection"],
                        Value::String(default_timeout.to_string()),
                    ))
                }
                Some(_) => None,
            }
        })
        .collect();

    if ops.is_empty() {
        return ops;
    }

    ops.push(if proxy.metadata.annotations.is_some() {
        add(
            ["metadata", "annotations", IDLE_TIMEOUT_ANNOTATION],
            Value::String(String::new()),
        )
    } else {
        add(
            ["metadata", "annotations"],
            json!({ IDLE_TIMEOUT_ANNOTATION: "" }),
        )
    });

    ops
}

fn add<'a>(tokens: impl IntoIterator<Item = &'a str>, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(tokens),
        value,
    })
}
