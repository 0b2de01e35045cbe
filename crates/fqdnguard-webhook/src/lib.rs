//! Admission webhook for HTTPProxy objects
//!
//! Validates that no two HTTPProxies claim the same virtual host under the
//! same ingress class, and defaults route idle connection timeouts.

#![deny(missing_docs)]

pub mod error;
pub mod mutate;
pub mod ratelimit;
pub mod review;
pub mod server;
pub mod validate;

use std::sync::Arc;

use fqdnguard_common::cache::ReservationCache;
use fqdnguard_common::config::Config;

pub use error::WebhookError;
pub use server::{serve, webhook_router, ServerConfig};
pub use validate::Pipeline;

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Reservation cache shared with the controller
    pub cache: Arc<ReservationCache>,
    /// Validation stages
    pub pipeline: Pipeline,
    /// Default written into routes lacking `timeoutPolicy.idleConnection`
    pub idle_connection_timeout: String,
}

impl WebhookState {
    /// Build handler state from the loaded configuration
    pub fn from_config(config: &Config, cache: Arc<ReservationCache>) -> Self {
        Self {
            cache,
            pipeline: Pipeline::new(
                config.allow_list(),
                config.entry_ttl(),
                Arc::new(ratelimit::GlobalRateLimitParser),
            ),
            idle_connection_timeout: config.mutation.idle_connection_timeout.clone(),
        }
    }
}
