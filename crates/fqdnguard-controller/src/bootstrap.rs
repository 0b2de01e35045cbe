//! Startup seeding of the reservation cache
//!
//! Runs before the webhook binds its port. Every existing HTTPProxy with a
//! virtual host under a managed class becomes a confirmed entry. Two objects
//! already sharing a key mean the cluster is in a state this guard exists to
//! prevent, so startup fails.

use std::collections::HashMap;

use tracing::info;

use fqdnguard_common::cache::{CacheEntry, CacheKey, ReservationCache, ResourceIdentity};
use fqdnguard_common::crd::HTTPProxy;
use fqdnguard_common::ingress_class::IngressClassAllowList;
use fqdnguard_common::Error;

use crate::store::{ProxyStore, LIST_PAGE_SIZE};

/// List every HTTPProxy in pages
pub async fn list_all(store: &dyn ProxyStore) -> Result<Vec<HTTPProxy>, Error> {
    let mut proxies = Vec::new();
    let mut token = None;
    loop {
        let page = store.list_page(token, LIST_PAGE_SIZE).await?;
        proxies.extend(page.items);
        match page.continue_token {
            Some(next) => token = Some(next),
            None => return Ok(proxies),
        }
    }
}

/// Fill `cache` with confirmed entries for existing objects.
///
/// Returns the listed objects so the watcher can start from them. Nothing is
/// written to the cache if two objects claim the same key.
pub async fn seed_cache(
    store: &dyn ProxyStore,
    cache: &ReservationCache,
    allow_list: &IngressClassAllowList,
) -> Result<Vec<HTTPProxy>, Error> {
    let proxies = list_all(store).await?;

    let mut owners: HashMap<CacheKey, ResourceIdentity> = HashMap::new();
    for proxy in &proxies {
        let Some(key) = allow_list.cache_key_for(proxy) else {
            continue;
        };
        let identity = proxy.identity();
        if let Some(first) = owners.get(&key) {
            return Err(Error::bootstrap(
                key.to_string(),
                first.to_string(),
                identity.to_string(),
            ));
        }
        owners.insert(key, identity);
    }

    let reserved = owners.len();
    let mut txn = cache.write();
    for (key, owner) in owners {
        txn.set(key, CacheEntry::confirmed(owner));
    }
    drop(txn);

    info!(
        objects = proxies.len(),
        reserved, "Seeded reservation cache from existing HTTPProxies"
    );
    Ok(proxies)
}
