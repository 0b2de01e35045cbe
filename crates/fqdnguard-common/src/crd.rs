//! Contour HTTPProxy CRD (projectcontour.io/v1)
//!
//! Only the fields fqdnguard reads are modelled: the virtual host, the ingress
//! class, routes (for timeout and rate-limit policies) and the TCP proxy
//! marker. Unknown fields are ignored on deserialization. Nothing writes a
//! whole object back: the webhook never re-serializes an admitted object and
//! the controller only patches `metadata.finalizers`.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::ResourceIdentity;

/// API group of the guarded resource
pub const HTTPPROXY_GROUP: &str = "projectcontour.io";
/// API version of the guarded resource
pub const HTTPPROXY_VERSION: &str = "v1";
/// Kind of the guarded resource
pub const HTTPPROXY_KIND: &str = "HTTPProxy";

/// HTTPProxy routes traffic for a virtual host to backend services.
///
/// Example:
/// ```yaml
/// apiVersion: projectcontour.io/v1
/// kind: HTTPProxy
/// metadata:
///   name: web
///   namespace: team-a
/// spec:
///   ingressClassName: public
///   virtualhost:
///     fqdn: web.example.com
///   routes:
///     - services:
///         - name: web
///           port: 80
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "projectcontour.io",
    version = "v1",
    kind = "HTTPProxy",
    plural = "httpproxies",
    shortname = "proxy",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::upper_case_acronyms)]
pub struct HTTPProxySpec {
    /// Ingress class this proxy is served by
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    /// Root proxies declare a virtual host; included proxies do not
    #[serde(default, rename = "virtualhost", skip_serializing_if = "Option::is_none")]
    pub virtual_host: Option<VirtualHost>,

    /// HTTP routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    /// TCP proxying configuration (opaque; only its presence matters)
    #[serde(default, rename = "tcpproxy", skip_serializing_if = "Option::is_none")]
    pub tcp_proxy: Option<serde_json::Value>,

    /// Included HTTPProxies (opaque)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<serde_json::Value>,
}

/// Virtual host of a root HTTPProxy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    /// Fully qualified domain name; the API server validates its syntax
    pub fqdn: String,

    /// TLS configuration (opaque)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<serde_json::Value>,

    /// Rate limit policy for the whole virtual host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_policy: Option<RateLimitPolicy>,
}

/// A single HTTP route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Match conditions (opaque)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<serde_json::Value>,

    /// Upstream services (opaque)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<serde_json::Value>,

    /// Timeouts applied to this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_policy: Option<TimeoutPolicy>,

    /// Rate limit policy for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_policy: Option<RateLimitPolicy>,
}

/// Route timeout policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPolicy {
    /// Timeout for receiving a response from the upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    /// Stream idle timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle: Option<String>,

    /// Upstream connection idle timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_connection: Option<String>,
}

/// Local and global rate limiting
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    /// Envoy-local token bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalRateLimitPolicy>,

    /// External rate limit service descriptors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalRateLimitPolicy>,
}

/// Local rate limit policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalRateLimitPolicy {
    /// Requests allowed per unit
    #[serde(default)]
    pub requests: u32,

    /// second, minute or hour
    #[serde(default)]
    pub unit: String,

    /// Extra requests allowed above the steady rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
}

/// Global rate limit policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRateLimitPolicy {
    /// Disables a global policy inherited from the virtual host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,

    /// Descriptors sent to the rate limit service
    #[serde(default)]
    pub descriptors: Vec<RateLimitDescriptor>,
}

/// One rate limit descriptor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptor {
    /// Ordered descriptor entries
    #[serde(default)]
    pub entries: Vec<RateLimitDescriptorEntry>,
}

/// A descriptor entry; exactly one field must be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptorEntry {
    /// Static key/value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic_key: Option<GenericKeyDescriptor>,

    /// Value taken from a request header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header: Option<RequestHeaderDescriptor>,

    /// Static value emitted when headers match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header_value_match: Option<RequestHeaderValueMatchDescriptor>,

    /// Client address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<serde_json::Value>,
}

/// genericKey descriptor entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenericKeyDescriptor {
    /// Descriptor key, defaults to "generic_key" in Envoy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Descriptor value
    #[serde(default)]
    pub value: String,
}

/// requestHeader descriptor entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderDescriptor {
    /// Header to read
    #[serde(default)]
    pub header_name: String,

    /// Key to emit the header value under
    #[serde(default)]
    pub descriptor_key: String,
}

/// requestHeaderValueMatch descriptor entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderValueMatchDescriptor {
    /// Header match conditions (opaque)
    #[serde(default)]
    pub headers: Vec<serde_json::Value>,

    /// Emit when the headers match (true) or don't (false)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_match: Option<bool>,

    /// Value to emit
    #[serde(default)]
    pub value: String,
}

impl HTTPProxy {
    /// The virtual host FQDN, if this is a root proxy
    pub fn fqdn(&self) -> Option<&str> {
        self.spec.virtual_host.as_ref().map(|vh| vh.fqdn.as_str())
    }

    /// namespace/name identity of this object
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// True once the API server has set a deletion timestamp
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Every rate limit policy on the object: the virtual host's first, then routes'
    pub fn rate_limit_policies(&self) -> impl Iterator<Item = (String, &RateLimitPolicy)> + '_ {
        let vhost = self
            .spec
            .virtual_host
            .as_ref()
            .and_then(|vh| vh.rate_limit_policy.as_ref())
            .map(|p| ("virtualhost".to_string(), p));

        let routes = self
            .spec
            .routes
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.rate_limit_policy.as_ref().map(|p| (format!("routes[{i}]"), p)));

        vhost.into_iter().chain(routes)
    }
}
