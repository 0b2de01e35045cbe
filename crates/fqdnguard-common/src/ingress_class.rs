//! Ingress class resolution
//!
//! The effective class of an HTTPProxy is `spec.ingressClassName`, unless the
//! legacy `kubernetes.io/ingress.class` annotation is set, in which case the
//! annotation wins. Only classes in the configured allow-list participate in
//! FQDN uniqueness.

use std::collections::BTreeSet;

use kube::ResourceExt;

use crate::cache::CacheKey;
use crate::crd::HTTPProxy;

/// Legacy annotation that overrides `spec.ingressClassName`
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Effective ingress class of a proxy; empty string when unset
pub fn effective_class_name(proxy: &HTTPProxy) -> String {
    if let Some(class) = proxy.annotations().get(INGRESS_CLASS_ANNOTATION) {
        return class.clone();
    }
    proxy.spec.ingress_class_name.clone().unwrap_or_default()
}

/// Set of ingress classes this deployment guards
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressClassAllowList {
    classes: BTreeSet<String>,
}

impl IngressClassAllowList {
    /// Build an allow-list from configured class names
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
        }
    }

    /// Exact, case-sensitive membership
    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains(class)
    }

    /// Number of configured classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// True if no classes are configured
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Resolve a proxy's class against this list
    pub fn describe(&self, proxy: &HTTPProxy) -> IngressClassDescriptor {
        let name = effective_class_name(proxy);
        let valid = self.contains(&name);
        IngressClassDescriptor { name, valid }
    }

    /// Cache key for a proxy, if it takes part in FQDN uniqueness
    ///
    /// That requires a virtual host and an allow-listed class. Objects with
    /// an unknown class are treated as having no virtual host.
    pub fn cache_key_for(&self, proxy: &HTTPProxy) -> Option<CacheKey> {
        let fqdn = proxy.fqdn()?;
        self.describe(proxy).cache_key(fqdn)
    }
}

/// Resolved class of one object, computed per request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressClassDescriptor {
    /// Effective class name; may be empty
    pub name: String,
    /// Whether the class is in the allow-list
    pub valid: bool,
}

impl IngressClassDescriptor {
    /// True when no class was set at all
    pub fn is_unset(&self) -> bool {
        self.name.is_empty()
    }

    /// Key for `fqdn` under this class; `None` when the class is not valid
    pub fn cache_key(&self, fqdn: &str) -> Option<CacheKey> {
        self.valid.then(|| CacheKey::new(&self.name, fqdn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{HTTPProxySpec, VirtualHost};

    fn proxy(class: Option<&str>, annotation: Option<&str>, fqdn: Option<&str>) -> HTTPProxy {
        let mut p = HTTPProxy::new(
            "web",
            HTTPProxySpec {
                ingress_class_name: class.map(String::from),
                virtual_host: fqdn.map(|f| VirtualHost {
                    fqdn: f.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        p.metadata.namespace = Some("team-a".to_string());
        if let Some(a) = annotation {
            p.annotations_mut()
                .insert(INGRESS_CLASS_ANNOTATION.to_string(), a.to_string());
        }
        p
    }

    #[test]
    fn annotation_overrides_spec_field() {
        let p = proxy(Some("private"), Some("public"), None);
        assert_eq!(effective_class_name(&p), "public");
    }

    #[test]
    fn missing_class_resolves_to_empty() {
        let allow = IngressClassAllowList::new(["public"]);
        let desc = allow.describe(&proxy(None, None, None));
        assert!(desc.is_unset());
        assert!(!desc.valid);
    }

    #[test]
    fn membership_is_exact() {
        let allow = IngressClassAllowList::new(["public", "private"]);
        assert!(allow.contains("public"));
        assert!(!allow.contains("Public"));
        assert_eq!(allow.len(), 2);
    }

    /// Story: only allow-listed proxies with a virtual host get a cache key
    #[test]
    fn story_cache_key_requires_vhost_and_valid_class() {
        let allow = IngressClassAllowList::new(["public"]);

        let key = allow.cache_key_for(&proxy(Some("public"), None, Some("a.example.com")));
        assert_eq!(key.map(|k| k.to_string()).as_deref(), Some("public/a.example.com"));

        assert!(allow
            .cache_key_for(&proxy(Some("internal"), None, Some("a.example.com")))
            .is_none());
        assert!(allow.cache_key_for(&proxy(Some("public"), None, None)).is_none());
    }
}
