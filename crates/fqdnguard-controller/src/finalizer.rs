//! Finalizer reconciliation
//!
//! Live HTTPProxies carry [`CACHE_FINALIZER`] so their deletion is observed
//! by the cache watcher before the object disappears. Objects being deleted
//! have it removed again.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{debug, info, instrument, warn};

use fqdnguard_common::cache::ResourceIdentity;
use fqdnguard_common::crd::HTTPProxy;
use fqdnguard_common::retry::{retry_on_conflict, RetryConfig};
use fqdnguard_common::{metrics, Error, CACHE_FINALIZER};

use crate::store::ProxyStore;

/// Delay before retrying a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Finalizer write attempts when no retry policy is configured
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Shared state for finalizer reconciles
pub struct Context {
    /// Object access
    pub store: Arc<dyn ProxyStore>,
    /// Backoff for conflicting writes
    pub retry: RetryConfig,
}

impl Context {
    /// Create a context giving up after [`DEFAULT_MAX_ATTEMPTS`] conflicting writes
    pub fn new(store: Arc<dyn ProxyStore>) -> Self {
        Self {
            store,
            retry: RetryConfig::with_max_attempts(DEFAULT_MAX_ATTEMPTS),
        }
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Make the finalizer match the object's lifecycle
#[instrument(skip(proxy, ctx), fields(proxy = %proxy.identity()))]
pub async fn reconcile(proxy: Arc<HTTPProxy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let wanted = !proxy.is_being_deleted();
    if proxy.has_finalizer(CACHE_FINALIZER) == wanted {
        return Ok(Action::await_change());
    }

    let identity = proxy.identity();
    let operation = if wanted {
        "add_finalizer"
    } else {
        "remove_finalizer"
    };

    retry_on_conflict(&ctx.retry, operation, || {
        set_finalizer(ctx.store.as_ref(), &identity, wanted)
    })
    .await
    .map_err(|e| {
        if e.is_api_conflict() {
            Error::conflict(identity.to_string(), format!("{operation} kept conflicting: {e}"))
        } else {
            e
        }
    })?;

    Ok(Action::await_change())
}

/// Requeue failed reconciles after [`ERROR_REQUEUE`]
pub fn error_policy(proxy: Arc<HTTPProxy>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(proxy = %proxy.identity(), %error, "Finalizer reconcile failed, requeueing");
    Action::requeue(ERROR_REQUEUE)
}

// One read-modify-write of the finalizer list against the latest version
async fn set_finalizer(
    store: &dyn ProxyStore,
    identity: &ResourceIdentity,
    present: bool,
) -> Result<(), Error> {
    let Some(current) = store.get(&identity.namespace, &identity.name).await? else {
        debug!("Object is gone, nothing to do");
        return Ok(());
    };

    if current.has_finalizer(CACHE_FINALIZER) == present {
        return Ok(());
    }
    if present && current.is_being_deleted() {
        debug!("Object started deleting, not adding finalizer");
        return Ok(());
    }

    let mut finalizers = current.metadata.finalizers.unwrap_or_default();
    if present {
        finalizers.push(CACHE_FINALIZER.to_string());
    } else {
        finalizers.retain(|f| f != CACHE_FINALIZER);
    }

    match store
        .patch_finalizers(
            &identity.namespace,
            &identity.name,
            current.metadata.resource_version,
            finalizers,
        )
        .await
    {
        Ok(_) => {
            info!(present, "Updated cache finalizer");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => {
            if e.is_api_conflict() {
                metrics::FINALIZER_CONFLICTS.add(1, &[]);
            }
            Err(e)
        }
    }
}
