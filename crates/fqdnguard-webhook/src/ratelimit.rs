//! Syntax checks for rate limit policies
//!
//! Contour accepts some policies that the rate limit service later can't
//! turn into a configuration. Those are caught here and reported as
//! admission warnings; they never cause a denial.

#[cfg(test)]
use mockall::automock;

use fqdnguard_common::crd::{
    GlobalRateLimitPolicy, HTTPProxy, LocalRateLimitPolicy, RateLimitDescriptorEntry,
};

/// First problem found in a proxy's rate limit policies
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Global policy with nothing to match on
    #[error("{path}: global rate limit policy must have at least one descriptor")]
    NoDescriptors {
        /// Location of the policy
        path: String,
    },

    /// Descriptor without entries
    #[error("{path}: descriptor must have at least one entry")]
    EmptyDescriptor {
        /// Location of the descriptor
        path: String,
    },

    /// Entry setting zero or several entry kinds
    #[error(
        "{path}: entry must set exactly one of genericKey, requestHeader, requestHeaderValueMatch, remoteAddress (found {found})"
    )]
    EntryKind {
        /// Location of the entry
        path: String,
        /// How many kinds were set
        found: usize,
    },

    /// A required string field is blank
    #[error("{path}.{field} must not be empty")]
    EmptyField {
        /// Location of the entry
        path: String,
        /// Blank field
        field: &'static str,
    },

    /// requestHeaderValueMatch without header conditions
    #[error("{path}.requestHeaderValueMatch must have at least one header condition")]
    NoHeaderConditions {
        /// Location of the entry
        path: String,
    },

    /// Local policy that can never admit a request or has an unknown unit
    #[error("{path}: local rate limit {reason}")]
    InvalidLocal {
        /// Location of the policy
        path: String,
        /// What's wrong
        reason: String,
    },
}

/// Checks the rate limit policies of an HTTPProxy
#[cfg_attr(test, automock)]
pub trait RateLimitValidator: Send + Sync {
    /// `Ok` if every policy is usable, else the first problem found
    fn validate(&self, proxy: &HTTPProxy) -> Result<(), RateLimitError>;
}

/// Validator matching what the global rate limit service can parse
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalRateLimitParser;

impl RateLimitValidator for GlobalRateLimitParser {
    fn validate(&self, proxy: &HTTPProxy) -> Result<(), RateLimitError> {
        for (path, policy) in proxy.rate_limit_policies() {
            let path = format!("{path}.rateLimitPolicy");
            if let Some(local) = &policy.local {
                check_local(&format!("{path}.local"), local)?;
            }
            if let Some(global) = &policy.global {
                check_global(&format!("{path}.global"), global)?;
            }
        }
        Ok(())
    }
}

const LOCAL_UNITS: [&str; 3] = ["second", "minute", "hour"];

fn check_local(path: &str, local: &LocalRateLimitPolicy) -> Result<(), RateLimitError> {
    if local.requests == 0 {
        return Err(RateLimitError::InvalidLocal {
            path: path.to_string(),
            reason: "requests must be greater than zero".to_string(),
        });
    }
    if !LOCAL_UNITS.contains(&local.unit.as_str()) {
        return Err(RateLimitError::InvalidLocal {
            path: path.to_string(),
            reason: format!(
                "unit {:?} is not one of second, minute, hour",
                local.unit
            ),
        });
    }
    Ok(())
}

fn check_global(path: &str, global: &GlobalRateLimitPolicy) -> Result<(), RateLimitError> {
    // A disabled route-level policy only switches off the virtual host's one
    if global.disabled == Some(true) {
        return Ok(());
    }
    if global.descriptors.is_empty() {
        return Err(RateLimitError::NoDescriptors {
            path: path.to_string(),
        });
    }

    for (d, descriptor) in global.descriptors.iter().enumerate() {
        let descriptor_path = format!("{path}.descriptors[{d}]");
        if descriptor.entries.is_empty() {
            return Err(RateLimitError::EmptyDescriptor {
                path: descriptor_path,
            });
        }
        for (e, entry) in descriptor.entries.iter().enumerate() {
            check_entry(&format!("{descriptor_path}.entries[{e}]"), entry)?;
        }
    }
    Ok(())
}

fn check_entry(path: &str, entry: &RateLimitDescriptorEntry) -> Result<(), RateLimitError> {
    let found = [
        entry.generic_key.is_some(),
        entry.request_header.is_some(),
        entry.request_header_value_match.is_some(),
        entry.remote_address.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();

    if found != 1 {
        return Err(RateLimitError::EntryKind {
            path: path.to_string(),
            found,
        });
    }

    let empty = |field| RateLimitError::EmptyField {
        path: path.to_string(),
        field,
    };

    if let Some(generic) = &entry.generic_key {
        if generic.value.is_empty() {
            return Err(empty("genericKey.value"));
        }
    }
    if let Some(header) = &entry.request_header {
        if header.header_name.is_empty() {
            return Err(empty("requestHeader.headerName"));
        }
        if header.descriptor_key.is_empty() {
            return Err(empty("requestHeader.descriptorKey"));
        }
    }
    if let Some(matcher) = &entry.request_header_value_match {
        if matcher.value.is_empty() {
            return Err(empty("requestHeaderValueMatch.value"));
        }
        if matcher.headers.is_empty() {
            return Err(RateLimitError::NoHeaderConditions {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}
