//! Static configuration loaded once at startup
//!
//! ```yaml
//! ingressClasses: [private, public]
//! cache:
//!   entryTtlSecond: 15
//!   cleanUpIntervalSecond: 60
//! webhook:
//!   port: 8443
//!   tlsCertFile: /etc/webhook/tls.crt
//!   tlsKeyFile: /etc/webhook/tls.key
//! mutation:
//!   idleConnectionTimeout: 15s
//! controller:
//!   finalizerMaxAttempts: 5
//! ```
//!
//! Only `ingressClasses` is required.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingress_class::IngressClassAllowList;
use crate::retry::RetryConfig;
use crate::{Error, Result, DEFAULT_WEBHOOK_PORT};

/// Top-level configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Ingress classes whose FQDNs must be unique
    pub ingress_classes: Vec<String>,
    /// Reservation cache tuning
    #[serde(default)]
    pub cache: CacheConfig,
    /// HTTPS listener
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Defaulting applied by the mutating endpoint
    #[serde(default)]
    pub mutation: MutationConfig,
    /// Finalizer controller tuning
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// Reservation cache settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Lifetime of a provisional reservation, in seconds
    pub entry_ttl_second: u64,
    /// Sweeper period, in seconds
    pub clean_up_interval_second: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl_second: 15,
            clean_up_interval_second: 60,
        }
    }
}

/// Webhook listener settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    /// TCP port for HTTPS
    pub port: u16,
    /// PEM certificate chain
    pub tls_cert_file: PathBuf,
    /// PEM private key
    pub tls_key_file: PathBuf,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_WEBHOOK_PORT,
            tls_cert_file: PathBuf::from("/etc/webhook/tls.crt"),
            tls_key_file: PathBuf::from("/etc/webhook/tls.key"),
        }
    }
}

/// Mutation settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MutationConfig {
    /// Value written to `timeoutPolicy.idleConnection` when a route lacks one
    pub idle_connection_timeout: String,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            idle_connection_timeout: "15s".to_string(),
        }
    }
}

/// Controller settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Attempts for one finalizer write before giving up on conflicts
    pub finalizer_max_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            finalizer_max_attempts: 5,
        }
    }
}

impl Config {
    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate config from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde can't express
    pub fn validate(&self) -> Result<()> {
        if self.ingress_classes.is_empty() {
            return Err(Error::config_field(
                "ingressClasses",
                "at least one ingress class is required",
            ));
        }
        if let Some(blank) = self.ingress_classes.iter().find(|c| c.trim().is_empty()) {
            return Err(Error::config_field(
                "ingressClasses",
                format!("ingress class names must not be blank, got {blank:?}"),
            ));
        }
        if self.cache.entry_ttl_second == 0 {
            return Err(Error::config_field("cache.entryTtlSecond", "must be positive"));
        }
        if self.cache.clean_up_interval_second == 0 {
            return Err(Error::config_field(
                "cache.cleanUpIntervalSecond",
                "must be positive",
            ));
        }
        if self.webhook.port == 0 {
            return Err(Error::config_field("webhook.port", "must be non-zero"));
        }
        validate_duration_string(&self.mutation.idle_connection_timeout)
            .map_err(|e| Error::config_field("mutation.idleConnectionTimeout", e))?;
        if self.controller.finalizer_max_attempts == 0 {
            return Err(Error::config_field(
                "controller.finalizerMaxAttempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Configured classes as an allow-list
    pub fn allow_list(&self) -> IngressClassAllowList {
        IngressClassAllowList::new(self.ingress_classes.iter().cloned())
    }

    /// Provisional reservation lifetime
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.entry_ttl_second)
    }

    /// Sweeper period
    pub fn clean_up_interval(&self) -> Duration {
        Duration::from_secs(self.cache.clean_up_interval_second)
    }

    /// Backoff for finalizer writes
    pub fn finalizer_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.controller.finalizer_max_attempts)
    }
}

/// Accepts Contour timeout values: `infinity`, or Go-style durations made of
/// `<int><unit>` pairs with units `h`, `m`, `s`, `ms`.
fn validate_duration_string(s: &str) -> std::result::Result<(), String> {
    if s == "infinity" || s == "infinite" {
        return Ok(());
    }
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let mut remaining = s;
    while !remaining.is_empty() {
        let num_end = remaining
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(remaining.len());
        if num_end == 0 {
            return Err(format!("expected a number in duration '{s}'"));
        }
        remaining = &remaining[num_end..];

        let unit_len = if remaining.starts_with("ms") {
            2
        } else if remaining.starts_with(['h', 'm', 's']) {
            1
        } else {
            return Err(format!(
                "missing or invalid unit in duration '{s}' (expected h, m, s or ms)"
            ));
        };
        remaining = &remaining[unit_len..];
    }

    Ok(())
}
