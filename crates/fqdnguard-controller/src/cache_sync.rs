//! Confirms reservations from watch events
//!
//! The controller is the only writer of confirmed entries. Whatever the API
//! server has persisted wins over provisional admission-time reservations.

use std::sync::Arc;

use tracing::{debug, error};

use fqdnguard_common::cache::{CacheEntry, CacheKey, ReservationCache, ResourceIdentity};
use fqdnguard_common::ingress_class::IngressClassAllowList;
use fqdnguard_common::metrics;

use crate::events::ProxyEvent;

/// Applies [`ProxyEvent`]s to the reservation cache
pub struct CacheSync {
    cache: Arc<ReservationCache>,
    allow_list: IngressClassAllowList,
}

impl CacheSync {
    /// Create a sync writing into `cache`
    pub fn new(cache: Arc<ReservationCache>, allow_list: IngressClassAllowList) -> Self {
        Self { cache, allow_list }
    }

    /// Apply one event
    pub fn apply_event(&self, event: &ProxyEvent) {
        match event {
            ProxyEvent::Created(proxy) => {
                if let Some(key) = self.allow_list.cache_key_for(proxy) {
                    self.confirm(key, proxy.identity());
                }
            }
            ProxyEvent::Updated { old, new } => {
                let old_key = self.allow_list.cache_key_for(old);
                let new_key = self.allow_list.cache_key_for(new);
                if old_key == new_key {
                    return;
                }

                let owner = new.identity();
                if let Some(key) = new_key {
                    self.confirm(key, owner.clone());
                }
                if let Some(key) = old_key {
                    self.release(&key, &owner);
                }
            }
            ProxyEvent::Deleted(proxy) => {
                if let Some(key) = self.allow_list.cache_key_for(proxy) {
                    debug!(key = %key, owner = %proxy.identity(), "Dropping reservation of deleted proxy");
                    self.cache.delete(&key);
                }
            }
        }
    }

    fn confirm(&self, key: CacheKey, owner: ResourceIdentity) {
        let mut txn = self.cache.write();
        match txn.get(&key) {
            Some(entry) if entry.is_confirmed() && entry.owner != owner => {
                error!(
                    key = %key,
                    owner = %entry.owner,
                    contender = %owner,
                    "fqdn uniqueness is compromised"
                );
            }
            Some(entry) if entry.is_confirmed() => {}
            _ => {
                debug!(key = %key, owner = %owner, "Confirming reservation");
                txn.set(key, CacheEntry::confirmed(owner));
                metrics::CACHE_CONFIRMATIONS.add(1, &[]);
            }
        }
    }

    // Another object may have reserved the old key since admission released it
    fn release(&self, key: &CacheKey, owner: &ResourceIdentity) {
        let mut txn = self.cache.write();
        if txn.get(key).is_some_and(|e| &e.owner == owner) {
            debug!(key = %key, owner = %owner, "Releasing previous reservation");
            txn.delete(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fqdnguard_common::cache::ManualClock;
    use fqdnguard_common::crd::{HTTPProxy, HTTPProxySpec, VirtualHost};
    use kube::api::ObjectMeta;

    const NOW: i64 = 1_000;

    fn proxy(ns: &str, name: &str, class: &str, fqdn: Option<&str>) -> HTTPProxy {
        HTTPProxy {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: HTTPProxySpec {
                ingress_class_name: Some(class.to_string()),
                virtual_host: fqdn.map(|f| VirtualHost {
                    fqdn: f.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    fn sync() -> (Arc<ReservationCache>, CacheSync) {
        let cache = Arc::new(ReservationCache::with_clock(Arc::new(ManualClock::new(NOW))));
        let sync = CacheSync::new(cache.clone(), IngressClassAllowList::new(["c1", "c2"]));
        (cache, sync)
    }

    fn key(class: &str, fqdn: &str) -> CacheKey {
        CacheKey::new(class, fqdn)
    }

    fn id(ns: &str, name: &str) -> ResourceIdentity {
        ResourceIdentity::new(ns, name)
    }

    #[test]
    fn created_confirms_and_overrides_provisional() {
        let (cache, sync) = sync();
        cache.set(
            key("c1", "a.example.com"),
            CacheEntry::provisional(id("team-b", "other"), NOW + 15),
        );

        sync.apply_event(&ProxyEvent::Created(proxy(
            "team-a",
            "web",
            "c1",
            Some("a.example.com"),
        )));

        assert_eq!(
            cache.get(&key("c1", "a.example.com")),
            Some(CacheEntry::confirmed(id("team-a", "web")))
        );
    }

    #[test]
    fn created_never_steals_a_confirmed_key() {
        let (cache, sync) = sync();
        cache.set(
            key("c1", "a.example.com"),
            CacheEntry::confirmed(id("team-b", "first")),
        );

        sync.apply_event(&ProxyEvent::Created(proxy(
            "team-a",
            "second",
            "c1",
            Some("a.example.com"),
        )));

        assert_eq!(
            cache.get(&key("c1", "a.example.com")).map(|e| e.owner),
            Some(id("team-b", "first"))
        );
    }

    #[test]
    fn created_ignores_unmanaged_objects() {
        let (cache, sync) = sync();
        sync.apply_event(&ProxyEvent::Created(proxy("team-a", "inc", "c1", None)));
        sync.apply_event(&ProxyEvent::Created(proxy(
            "team-a",
            "web",
            "other-class",
            Some("a.example.com"),
        )));
        assert!(cache.is_empty());
    }

    #[test]
    fn created_twice_is_idempotent() {
        let (cache, sync) = sync();
        let event = ProxyEvent::Created(proxy("team-a", "web", "c1", Some("a.example.com")));
        sync.apply_event(&event);
        sync.apply_event(&event);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.is_confirmed(&key("c1", "a.example.com")), Some(true));
    }

    #[test]
    fn updated_with_same_key_is_a_no_op() {
        let (cache, sync) = sync();
        let mut new = proxy("team-a", "web", "c1", Some("a.example.com"));
        new.spec.routes.push(Default::default());

        sync.apply_event(&ProxyEvent::Updated {
            old: proxy("team-a", "web", "c1", Some("a.example.com")),
            new,
        });

        assert!(cache.is_empty());
    }

    #[test]
    fn updated_moves_confirmation_to_new_key() {
        let (cache, sync) = sync();
        cache.set(
            key("c1", "a.example.com"),
            CacheEntry::confirmed(id("team-a", "web")),
        );

        sync.apply_event(&ProxyEvent::Updated {
            old: proxy("team-a", "web", "c1", Some("a.example.com")),
            new: proxy("team-a", "web", "c2", Some("a.example.com")),
        });

        assert!(!cache.exists(&key("c1", "a.example.com")));
        assert_eq!(cache.is_confirmed(&key("c2", "a.example.com")), Some(true));
    }

    #[test]
    fn updated_keeps_old_key_reserved_by_someone_else() {
        let (cache, sync) = sync();
        cache.set(
            key("c1", "a.example.com"),
            CacheEntry::provisional(id("team-b", "next"), NOW + 15),
        );

        sync.apply_event(&ProxyEvent::Updated {
            old: proxy("team-a", "web", "c1", Some("a.example.com")),
            new: proxy("team-a", "web", "c1", Some("b.example.com")),
        });

        assert_eq!(
            cache.get(&key("c1", "a.example.com")).map(|e| e.owner),
            Some(id("team-b", "next"))
        );
        assert_eq!(cache.is_confirmed(&key("c1", "b.example.com")), Some(true));
    }

    #[test]
    fn updated_dropping_vhost_releases_key() {
        let (cache, sync) = sync();
        cache.set(
            key("c1", "a.example.com"),
            CacheEntry::confirmed(id("team-a", "web")),
        );

        sync.apply_event(&ProxyEvent::Updated {
            old: proxy("team-a", "web", "c1", Some("a.example.com")),
            new: proxy("team-a", "web", "c1", None),
        });

        assert!(cache.is_empty());
    }

    #[test]
    fn deleted_removes_key_unconditionally() {
        let (cache, sync) = sync();
        cache.set(
            key("c1", "a.example.com"),
            CacheEntry::confirmed(id("team-b", "other")),
        );

        sync.apply_event(&ProxyEvent::Deleted(proxy(
            "team-a",
            "web",
            "c1",
            Some("a.example.com"),
        )));
        assert!(cache.is_empty());

        // Deleting an absent key is harmless
        sync.apply_event(&ProxyEvent::Deleted(proxy(
            "team-a",
            "web",
            "c1",
            Some("a.example.com"),
        )));
        assert!(cache.is_empty());
    }

    /// Story: admission reserves, the controller confirms, the sweeper leaves
    /// it alone, and deletion frees the name for someone else
    #[test]
    fn story_reservation_lifecycle() {
        let clock = Arc::new(ManualClock::new(NOW));
        let cache = Arc::new(ReservationCache::with_clock(clock.clone()));
        let sync = CacheSync::new(cache.clone(), IngressClassAllowList::new(["c1"]));
        let web = proxy("team-a", "web", "c1", Some("a.example.com"));
        let k = key("c1", "a.example.com");

        cache.set(k.clone(), CacheEntry::provisional(web.identity(), NOW + 15));
        sync.apply_event(&ProxyEvent::Created(web.clone()));

        clock.advance(3_600);
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.is_confirmed(&k), Some(true));

        sync.apply_event(&ProxyEvent::Deleted(web));
        assert!(!cache.exists(&k));
    }
}
