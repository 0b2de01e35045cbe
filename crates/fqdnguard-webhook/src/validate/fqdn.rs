use fqdnguard_common::cache::{CacheEntry, CacheKey, CacheTxn, ResourceIdentity};
use fqdnguard_common::crd::HTTPProxy;
use fqdnguard_common::ingress_class::IngressClassDescriptor;
use tracing::{debug, info};

use super::{AdmissionError, Decision, Flow, RequestContext, Stage};
use crate::review::AdmissionOperation;

/// Enforces one owner per `class/fqdn`
///
/// Reservations made here are provisional. Entries are only released when
/// they belong to the object under review, so a confirmed entry can't be
/// taken over or dropped by anyone else's request.
pub struct FqdnStage;

impl Stage for FqdnStage {
    fn name(&self) -> &'static str {
        "fqdn-uniqueness"
    }

    fn check(
        &self,
        ctx: &mut RequestContext<'_>,
        txn: &mut CacheTxn<'_>,
    ) -> Result<Flow, AdmissionError> {
        match ctx.operation {
            AdmissionOperation::Create => on_create(ctx, txn),
            AdmissionOperation::Update => on_update(ctx, txn),
            AdmissionOperation::Delete => on_delete(ctx, txn),
        }
    }
}

fn on_create(ctx: &RequestContext<'_>, txn: &mut CacheTxn<'_>) -> Result<Flow, AdmissionError> {
    let new = ctx.new_object()?;
    if new.fqdn().is_none() {
        return Ok(Flow::Continue);
    }

    match key_of(new, ctx.new_class()?) {
        Some(key) => Ok(acquire(ctx, txn, &key, &new.identity())),
        None => Ok(Flow::Continue),
    }
}

fn on_update(ctx: &RequestContext<'_>, txn: &mut CacheTxn<'_>) -> Result<Flow, AdmissionError> {
    let new = ctx.new_object()?;
    let old = ctx.old_object()?;
    if new.fqdn().is_none() && old.fqdn().is_none() {
        return Ok(Flow::Continue);
    }

    let new_key = key_of(new, ctx.new_class()?);
    let old_key = key_of(old, ctx.old_class()?);
    let identity = new.identity();

    match (old_key, new_key) {
        (None, None) => Ok(Flow::Continue),
        (Some(old_key), None) => {
            release(ctx, txn, &old_key, &identity);
            Ok(Flow::Continue)
        }
        (None, Some(new_key)) => Ok(acquire(ctx, txn, &new_key, &identity)),
        (Some(old_key), Some(new_key)) if old_key == new_key => Ok(Flow::Continue),
        (Some(old_key), Some(new_key)) => {
            let flow = acquire(ctx, txn, &new_key, &identity);
            // Old reservation goes only once the new one is secured
            if flow == Flow::Continue {
                release(ctx, txn, &old_key, &identity);
            }
            Ok(flow)
        }
    }
}

fn on_delete(ctx: &RequestContext<'_>, txn: &mut CacheTxn<'_>) -> Result<Flow, AdmissionError> {
    let old = ctx.old_object()?;
    if old.fqdn().is_none() {
        return Ok(Flow::Continue);
    }

    if let Some(key) = key_of(old, ctx.old_class()?) {
        release(ctx, txn, &key, &old.identity());
    }
    Ok(Flow::Continue)
}

/// Key for an object, if it takes part in uniqueness
fn key_of(proxy: &HTTPProxy, class: &IngressClassDescriptor) -> Option<CacheKey> {
    proxy.fqdn().and_then(|fqdn| class.cache_key(fqdn))
}

fn acquire(
    ctx: &RequestContext<'_>,
    txn: &mut CacheTxn<'_>,
    key: &CacheKey,
    identity: &ResourceIdentity,
) -> Flow {
    match txn.get(key) {
        Some(entry) if entry.owner != *identity => {
            info!(
                key = %key,
                owner = %entry.owner,
                requester = %identity,
                confirmed = entry.is_confirmed(),
                "Denying fqdn already held by another object"
            );
            return Flow::Decide(Decision::deny(
                403,
                format!(
                    "fqdn is already acquired by another httpproxy object named {} in namespace {}",
                    entry.owner.name, entry.owner.namespace
                ),
            ));
        }
        Some(entry) if entry.is_confirmed() => {
            debug!(key = %key, owner = %identity, "Key already confirmed for this object");
            return Flow::Continue;
        }
        _ => {}
    }

    if !ctx.dry_run {
        let expires_at = txn.now() + ctx.ttl_secs;
        debug!(key = %key, owner = %identity, expires_at, "Reserving fqdn provisionally");
        txn.set(
            key.clone(),
            CacheEntry::provisional(identity.clone(), expires_at),
        );
    }
    Flow::Continue
}

fn release(
    ctx: &RequestContext<'_>,
    txn: &mut CacheTxn<'_>,
    key: &CacheKey,
    identity: &ResourceIdentity,
) {
    if ctx.dry_run {
        return;
    }
    match txn.get(key) {
        Some(entry) if entry.owner == *identity => {
            debug!(key = %key, owner = %identity, "Releasing fqdn");
            txn.delete(key);
        }
        Some(entry) => {
            debug!(
                key = %key,
                owner = %entry.owner,
                requester = %identity,
                "Not releasing fqdn held by another object"
            );
        }
        None => {}
    }
}
