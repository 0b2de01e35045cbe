//! Common types for fqdnguard: the HTTPProxy CRD, the FQDN reservation cache,
//! configuration, errors and utilities shared by the webhook and controller.

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod crd;
pub mod error;
pub mod ingress_class;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer placed on every HTTPProxy so deletions always reach the cache
pub const CACHE_FINALIZER: &str = "fqdnguard.projectcontour.io/cache-cleanup";

/// Field manager name used for writes to the API server
pub const FIELD_MANAGER: &str = "fqdnguard-controller";

/// Default HTTPS port for the admission webhook
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Install the aws-lc-rs rustls crypto provider for the whole process.
///
/// Both the kube client and the webhook TLS listener need a provider before
/// the first handshake. Returns false if a provider was already installed.
pub fn install_crypto_provider() -> bool {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok()
}
