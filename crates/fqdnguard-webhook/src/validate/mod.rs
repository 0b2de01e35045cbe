//! Admission validation pipeline
//!
//! Each operation has a fixed, ordered list of stages:
//!
//! | operation | stages                                   |
//! |-----------|------------------------------------------|
//! | CREATE    | ingress class, fqdn uniqueness, advisory |
//! | UPDATE    | ingress class, fqdn uniqueness, advisory |
//! | DELETE    | ingress class, fqdn uniqueness           |
//!
//! [`Pipeline::run`] walks the list under a single cache write guard. A stage
//! either lets the request continue or ends it with a [`Decision`]. If every
//! stage continues, the request is allowed with whatever warnings were
//! collected on the way.

mod advisory;
mod class;
mod fqdn;

use std::sync::Arc;
use std::time::Duration;

use fqdnguard_common::cache::{CacheTxn, ReservationCache};
use fqdnguard_common::crd::HTTPProxy;
use fqdnguard_common::ingress_class::{IngressClassAllowList, IngressClassDescriptor};

use crate::ratelimit::RateLimitValidator;
use crate::review::AdmissionOperation;

pub use advisory::{AdvisoryStage, WARNING_MAX_CHARS, WARNING_PREFIX};
pub use class::IngressClassStage;
pub use fqdn::FqdnStage;

/// Internal failure while evaluating a request
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// A stage found state that an earlier stage should have produced
    #[error("admission pipeline invariant violated: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Class descriptor for the named side was never resolved
    pub fn missing_class(side: &str) -> Self {
        Self::Internal(format!("ingress class of the {side} object was not resolved"))
    }

    /// The named object is absent although the operation requires it
    pub fn missing_object(side: &str) -> Self {
        Self::Internal(format!("{side} object is missing"))
    }
}

/// Final outcome of a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Admit the object
    Allow,
    /// Reject with an HTTP-style code and a human readable reason
    Deny {
        /// HTTP-style status code (400, 403)
        code: u16,
        /// Reason shown to the user
        message: String,
    },
}

impl Decision {
    /// Shorthand for a denial
    pub fn deny(code: u16, message: impl Into<String>) -> Self {
        Self::Deny {
            code,
            message: message.into(),
        }
    }

    /// True unless this is a denial
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// What a stage wants the driver to do next
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Run the next stage
    Continue,
    /// Stop and answer with this decision
    Decide(Decision),
}

/// Decision plus accumulated warnings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// Allow or deny
    pub decision: Decision,
    /// Non-blocking warnings; only attached to allowed requests
    pub warnings: Vec<String>,
}

/// Per-request state shared by the stages
#[derive(Debug)]
pub struct RequestContext<'a> {
    /// Operation under review
    pub operation: AdmissionOperation,
    /// Object after the change; `None` on delete
    pub new: Option<&'a HTTPProxy>,
    /// Object before the change; `None` on create
    pub old: Option<&'a HTTPProxy>,
    /// Suppress every cache mutation
    pub dry_run: bool,
    /// Set by the ingress class stage on create and update
    pub new_class: Option<IngressClassDescriptor>,
    /// Set by the ingress class stage on update and delete
    pub old_class: Option<IngressClassDescriptor>,
    /// Warnings for the final response
    pub warnings: Vec<String>,
    /// Lifetime of a provisional reservation, in seconds
    pub ttl_secs: i64,
}

impl<'a> RequestContext<'a> {
    /// Context for one request, before any stage ran
    pub fn new(
        operation: AdmissionOperation,
        new: Option<&'a HTTPProxy>,
        old: Option<&'a HTTPProxy>,
        dry_run: bool,
        ttl_secs: i64,
    ) -> Self {
        Self {
            operation,
            new,
            old,
            dry_run,
            new_class: None,
            old_class: None,
            warnings: Vec::new(),
            ttl_secs,
        }
    }

    pub(crate) fn new_object(&self) -> Result<&'a HTTPProxy, AdmissionError> {
        self.new.ok_or_else(|| AdmissionError::missing_object("new"))
    }

    pub(crate) fn old_object(&self) -> Result<&'a HTTPProxy, AdmissionError> {
        self.old.ok_or_else(|| AdmissionError::missing_object("old"))
    }

    pub(crate) fn new_class(&self) -> Result<&IngressClassDescriptor, AdmissionError> {
        self.new_class
            .as_ref()
            .ok_or_else(|| AdmissionError::missing_class("new"))
    }

    pub(crate) fn old_class(&self) -> Result<&IngressClassDescriptor, AdmissionError> {
        self.old_class
            .as_ref()
            .ok_or_else(|| AdmissionError::missing_class("old"))
    }
}

/// One rule in the pipeline
pub trait Stage: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Evaluate the request; cache access goes through `txn` only
    fn check(
        &self,
        ctx: &mut RequestContext<'_>,
        txn: &mut CacheTxn<'_>,
    ) -> Result<Flow, AdmissionError>;
}

/// Ordered stage lists per operation
pub struct Pipeline {
    create: Vec<Box<dyn Stage>>,
    update: Vec<Box<dyn Stage>>,
    delete: Vec<Box<dyn Stage>>,
    ttl_secs: i64,
}

impl Pipeline {
    /// Standard pipeline: class, uniqueness, then advisory checks
    pub fn new(
        allow_list: IngressClassAllowList,
        entry_ttl: Duration,
        validator: Arc<dyn RateLimitValidator>,
    ) -> Self {
        let class = || Box::new(IngressClassStage::new(allow_list.clone())) as Box<dyn Stage>;
        let advisory = || Box::new(AdvisoryStage::new(validator.clone())) as Box<dyn Stage>;

        Self {
            create: vec![class(), Box::new(FqdnStage), advisory()],
            update: vec![class(), Box::new(FqdnStage), advisory()],
            delete: vec![class(), Box::new(FqdnStage)],
            ttl_secs: i64::try_from(entry_ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Stages run for `operation`, in order
    pub fn stages(&self, operation: AdmissionOperation) -> &[Box<dyn Stage>] {
        match operation {
            AdmissionOperation::Create => &self.create,
            AdmissionOperation::Update => &self.update,
            AdmissionOperation::Delete => &self.delete,
        }
    }

    /// Evaluate one request against the cache
    pub fn run(
        &self,
        cache: &ReservationCache,
        operation: AdmissionOperation,
        new: Option<&HTTPProxy>,
        old: Option<&HTTPProxy>,
        dry_run: bool,
    ) -> Result<Verdict, AdmissionError> {
        let mut ctx = RequestContext::new(operation, new, old, dry_run, self.ttl_secs);
        let mut txn = cache.write();

        for stage in self.stages(operation) {
            match stage.check(&mut ctx, &mut txn)? {
                Flow::Continue => {}
                Flow::Decide(decision) => {
                    tracing::debug!(stage = stage.name(), ?decision, "Stage ended the pipeline");
                    let warnings = if decision.is_allowed() {
                        ctx.warnings
                    } else {
                        Vec::new()
                    };
                    return Ok(Verdict { decision, warnings });
                }
            }
        }

        Ok(Verdict {
            decision: Decision::Allow,
            warnings: ctx.warnings,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fqdnguard_common::cache::{CacheEntry, CacheKey, ManualClock, ResourceIdentity};
    use fqdnguard_common::crd::{HTTPProxySpec, VirtualHost};
    use kube::ResourceExt;

    use crate::ratelimit::GlobalRateLimitParser;

    pub(crate) const NOW: i64 = 1_700_000_000;
    pub(crate) const TTL: u64 = 15;

    pub(crate) fn proxy(ns: &str, name: &str, class: &str, fqdn: Option<&str>) -> HTTPProxy {
        let mut p = HTTPProxy::new(
            name,
            HTTPProxySpec {
                ingress_class_name: (!class.is_empty()).then(|| class.to_string()),
                virtual_host: fqdn.map(|f| VirtualHost {
                    fqdn: f.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        p.metadata.namespace = Some(ns.to_string());
        p
    }

    pub(crate) fn cache() -> ReservationCache {
        ReservationCache::with_clock(Arc::new(ManualClock::new(NOW)))
    }

    pub(crate) fn pipeline() -> Pipeline {
        Pipeline::new(
            IngressClassAllowList::new(["c1", "c2"]),
            Duration::from_secs(TTL),
            Arc::new(GlobalRateLimitParser),
        )
    }

    pub(crate) fn key(class: &str, fqdn: &str) -> CacheKey {
        CacheKey::new(class, fqdn)
    }

    fn owner(ns: &str, name: &str) -> ResourceIdentity {
        ResourceIdentity::new(ns, name)
    }

    fn create(p: &Pipeline, c: &ReservationCache, obj: &HTTPProxy, dry_run: bool) -> Verdict {
        p.run(c, AdmissionOperation::Create, Some(obj), None, dry_run)
            .unwrap()
    }

    fn update(
        p: &Pipeline,
        c: &ReservationCache,
        old: &HTTPProxy,
        new: &HTTPProxy,
        dry_run: bool,
    ) -> Verdict {
        p.run(c, AdmissionOperation::Update, Some(new), Some(old), dry_run)
            .unwrap()
    }

    fn delete(p: &Pipeline, c: &ReservationCache, old: &HTTPProxy, dry_run: bool) -> Verdict {
        p.run(c, AdmissionOperation::Delete, None, Some(old), dry_run)
            .unwrap()
    }

    fn denied_with(verdict: &Verdict, code: u16) -> &str {
        match &verdict.decision {
            Decision::Deny { code: c, message } if *c == code => message,
            other => panic!("expected deny {code}, got {other:?}"),
        }
    }

    /// Runs `f` with and without dry-run on identical caches; the decisions
    /// must match and the dry-run cache must be untouched.
    fn assert_dry_run_pure<F>(seed: &[(CacheKey, CacheEntry)], f: F)
    where
        F: Fn(&Pipeline, &ReservationCache, bool) -> Verdict,
    {
        let p = pipeline();
        let wet = cache();
        let dry = cache();
        for (k, v) in seed {
            wet.set(k.clone(), v.clone());
            dry.set(k.clone(), v.clone());
        }
        let before = dry.snapshot();

        let wet_verdict = f(&p, &wet, false);
        let dry_verdict = f(&p, &dry, true);

        assert_eq!(wet_verdict, dry_verdict);
        assert_eq!(dry.snapshot(), before);
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    /// Story: first create of a free fqdn reserves it provisionally
    #[test]
    fn story_create_reserves_free_fqdn() {
        let (p, c) = (pipeline(), cache());
        let web = proxy("team-a", "web", "c1", Some("a.example.com"));

        let verdict = create(&p, &c, &web, false);

        assert_eq!(verdict.decision, Decision::Allow);
        let entry = c.get(&key("c1", "a.example.com")).unwrap();
        assert_eq!(entry.owner, owner("team-a", "web"));
        assert_eq!(entry.expires_at, NOW + TTL as i64);
    }

    /// Story: a second object asking for the same fqdn is told who holds it
    #[test]
    fn story_second_create_is_denied_naming_owner() {
        let (p, c) = (pipeline(), cache());
        create(&p, &c, &proxy("team-a", "web", "c1", Some("a.example.com")), false);
        let before = c.snapshot();

        let verdict = create(&p, &c, &proxy("team-b", "shop", "c1", Some("a.example.com")), false);

        let msg = denied_with(&verdict, 403);
        assert_eq!(
            msg,
            "fqdn is already acquired by another httpproxy object named web in namespace team-a"
        );
        assert_eq!(c.snapshot(), before);
    }

    /// Story: moving to a free fqdn releases the old one
    #[test]
    fn story_update_moves_reservation() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "c1", Some("old.example.com"));
        c.set(key("c1", "old.example.com"), CacheEntry::confirmed(old.identity()));
        let new = proxy("team-a", "web", "c1", Some("new.example.com"));

        let verdict = update(&p, &c, &old, &new, false);

        assert!(verdict.decision.is_allowed());
        assert!(!c.exists(&key("c1", "old.example.com")));
        assert_eq!(c.is_confirmed(&key("c1", "new.example.com")), Some(false));
    }

    /// Story: deleting an object always succeeds and frees its fqdn
    #[test]
    fn story_delete_releases_key() {
        let (p, c) = (pipeline(), cache());
        let web = proxy("team-a", "web", "c1", Some("a.example.com"));
        c.set(key("c1", "a.example.com"), CacheEntry::confirmed(web.identity()));

        let verdict = delete(&p, &c, &web, false);

        assert!(verdict.decision.is_allowed());
        assert!(c.is_empty());
    }

    /// Story: a dry-run create is allowed but reserves nothing
    #[test]
    fn story_dry_run_create_leaves_cache_empty() {
        let (p, c) = (pipeline(), cache());
        let verdict = create(&p, &c, &proxy("team-a", "web", "c1", Some("a.example.com")), true);
        assert!(verdict.decision.is_allowed());
        assert!(!c.exists(&key("c1", "a.example.com")));
    }

    // =========================================================================
    // Ingress class stage
    // =========================================================================

    #[test]
    fn create_without_class_is_bad_request() {
        let (p, c) = (pipeline(), cache());
        let verdict = create(&p, &c, &proxy("team-a", "web", "", Some("a.example.com")), false);
        assert_eq!(denied_with(&verdict, 400), "ingressClassName is not set");
        assert!(c.is_empty());
    }

    #[test]
    fn update_to_unknown_class_is_bad_request() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "c1", Some("a.example.com"));
        let new = proxy("team-a", "web", "internal", Some("a.example.com"));
        let verdict = update(&p, &c, &old, &new, false);
        assert_eq!(denied_with(&verdict, 400), "ingressClassName is not valid");
    }

    #[test]
    fn annotation_class_wins_over_spec() {
        let (p, c) = (pipeline(), cache());
        let mut web = proxy("team-a", "web", "c1", Some("a.example.com"));
        web.annotations_mut().insert(
            fqdnguard_common::ingress_class::INGRESS_CLASS_ANNOTATION.to_string(),
            "c2".to_string(),
        );
        create(&p, &c, &web, false);
        assert!(c.exists(&key("c2", "a.example.com")));
        assert!(!c.exists(&key("c1", "a.example.com")));
    }

    /// Story: the class was retired from config while the object still
    /// carries the cleanup finalizer; dropping the finalizer must go through
    #[test]
    fn story_retired_class_object_can_finish_deleting() {
        let c = cache();
        let p = Pipeline::new(
            IngressClassAllowList::new(["c2"]),
            Duration::from_secs(TTL),
            Arc::new(GlobalRateLimitParser),
        );
        let mut old = proxy("team-a", "web", "c1", Some("a.example.com"));
        old.metadata.finalizers = Some(vec![fqdnguard_common::CACHE_FINALIZER.to_string()]);
        old.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Default::default()),
        );
        let mut new = old.clone();
        new.metadata.finalizers = Some(Vec::new());

        let verdict = update(&p, &c, &old, &new, false);

        assert_eq!(verdict.decision, Decision::Allow);
        assert!(c.is_empty());
    }

    #[test]
    fn metadata_only_update_skips_class_check() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "retired", Some("a.example.com"));
        let mut new = old.clone();
        new.metadata.finalizers = Some(vec![fqdnguard_common::CACHE_FINALIZER.to_string()]);
        assert!(update(&p, &c, &old, &new, false).decision.is_allowed());

        let unset = proxy("team-a", "legacy", "", Some("b.example.com"));
        let mut labelled = unset.clone();
        labelled.labels_mut().insert("team".to_string(), "a".to_string());
        assert!(update(&p, &c, &unset, &labelled, false).decision.is_allowed());
        assert!(c.is_empty());
    }

    #[test]
    fn spec_change_under_retired_class_is_still_denied() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "retired", Some("a.example.com"));
        let new = proxy("team-a", "web", "retired", Some("b.example.com"));
        let verdict = update(&p, &c, &old, &new, false);
        assert_eq!(denied_with(&verdict, 400), "ingressClassName is not valid");
    }

    /// Story: objects admitted under a class later removed from config can still be deleted
    #[test]
    fn story_delete_with_unknown_class_is_never_denied() {
        let (p, c) = (pipeline(), cache());
        let legacy = proxy("team-a", "web", "retired", Some("a.example.com"));
        let verdict = delete(&p, &c, &legacy, false);
        assert!(verdict.decision.is_allowed());
    }

    // =========================================================================
    // FQDN stage
    // =========================================================================

    #[test]
    fn create_without_vhost_touches_nothing() {
        let (p, c) = (pipeline(), cache());
        let verdict = create(&p, &c, &proxy("team-a", "include", "c1", None), false);
        assert!(verdict.decision.is_allowed());
        assert!(c.is_empty());
    }

    #[test]
    fn provisional_reservation_blocks_other_owners() {
        let (p, c) = (pipeline(), cache());
        c.set(
            key("c1", "a.example.com"),
            CacheEntry::provisional(owner("team-a", "web"), NOW + 5),
        );
        let verdict = create(&p, &c, &proxy("team-b", "shop", "c1", Some("a.example.com")), false);
        denied_with(&verdict, 403);
        assert_eq!(
            c.get(&key("c1", "a.example.com")).unwrap().owner,
            owner("team-a", "web")
        );
    }

    #[test]
    fn same_fqdn_under_another_class_is_independent() {
        let (p, c) = (pipeline(), cache());
        create(&p, &c, &proxy("team-a", "web", "c1", Some("a.example.com")), false);
        let verdict = create(&p, &c, &proxy("team-b", "shop", "c2", Some("a.example.com")), false);
        assert!(verdict.decision.is_allowed());
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn retried_create_renews_own_provisional_entry() {
        let (p, c) = (pipeline(), cache());
        c.set(
            key("c1", "a.example.com"),
            CacheEntry::provisional(owner("team-a", "web"), NOW + 1),
        );
        let verdict = create(&p, &c, &proxy("team-a", "web", "c1", Some("a.example.com")), false);
        assert!(verdict.decision.is_allowed());
        assert_eq!(
            c.get(&key("c1", "a.example.com")).unwrap().expires_at,
            NOW + TTL as i64
        );
    }

    /// Story: admission never downgrades a confirmed entry
    #[test]
    fn story_confirmed_entry_survives_admission_writes() {
        let (p, c) = (pipeline(), cache());
        let k = key("c1", "a.example.com");
        c.set(k.clone(), CacheEntry::confirmed(owner("team-a", "web")));

        create(&p, &c, &proxy("team-a", "web", "c1", Some("a.example.com")), false);
        assert_eq!(c.is_confirmed(&k), Some(true));

        let thief = proxy("team-b", "shop", "c1", Some("a.example.com"));
        denied_with(&create(&p, &c, &thief, false), 403);

        // Another object's delete can't release it either
        delete(&p, &c, &thief, false);
        assert_eq!(c.is_confirmed(&k), Some(true));
    }

    #[test]
    fn update_without_vhost_on_either_side_passes() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "c1", None);
        let new = proxy("team-a", "web", "c1", None);
        assert!(update(&p, &c, &old, &new, false).decision.is_allowed());
        assert!(c.is_empty());
    }

    #[test]
    fn update_dropping_vhost_releases_old_key() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "c1", Some("a.example.com"));
        c.set(key("c1", "a.example.com"), CacheEntry::confirmed(old.identity()));
        let new = proxy("team-a", "web", "c1", None);

        assert!(update(&p, &c, &old, &new, false).decision.is_allowed());
        assert!(c.is_empty());
    }

    #[test]
    fn update_gaining_vhost_acquires_like_create() {
        let (p, c) = (pipeline(), cache());
        c.set(
            key("c1", "a.example.com"),
            CacheEntry::confirmed(owner("team-b", "shop")),
        );
        let old = proxy("team-a", "web", "c1", None);
        let taken = proxy("team-a", "web", "c1", Some("a.example.com"));
        denied_with(&update(&p, &c, &old, &taken, false), 403);

        let free = proxy("team-a", "web", "c1", Some("b.example.com"));
        assert!(update(&p, &c, &old, &free, false).decision.is_allowed());
        assert!(c.exists(&key("c1", "b.example.com")));
    }

    #[test]
    fn update_with_unchanged_key_is_a_no_op() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "c1", Some("a.example.com"));
        c.set(key("c1", "a.example.com"), CacheEntry::confirmed(old.identity()));
        let before = c.snapshot();

        assert!(update(&p, &c, &old, &old.clone(), false).decision.is_allowed());
        assert_eq!(c.snapshot(), before);
    }

    /// Story: a denied move keeps the old reservation in place
    #[test]
    fn story_denied_update_keeps_old_key() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "c1", Some("old.example.com"));
        c.set(key("c1", "old.example.com"), CacheEntry::confirmed(old.identity()));
        c.set(
            key("c1", "new.example.com"),
            CacheEntry::confirmed(owner("team-b", "shop")),
        );
        let before = c.snapshot();
        let new = proxy("team-a", "web", "c1", Some("new.example.com"));

        let verdict = update(&p, &c, &old, &new, false);

        assert!(denied_with(&verdict, 403).contains("named shop in namespace team-b"));
        assert_eq!(c.snapshot(), before);
    }

    #[test]
    fn class_change_moves_key_across_classes() {
        let (p, c) = (pipeline(), cache());
        let old = proxy("team-a", "web", "c1", Some("a.example.com"));
        c.set(key("c1", "a.example.com"), CacheEntry::confirmed(old.identity()));
        let new = proxy("team-a", "web", "c2", Some("a.example.com"));

        assert!(update(&p, &c, &old, &new, false).decision.is_allowed());
        assert!(!c.exists(&key("c1", "a.example.com")));
        assert!(c.exists(&key("c2", "a.example.com")));
    }

    #[test]
    fn delete_without_vhost_is_allowed() {
        let (p, c) = (pipeline(), cache());
        assert!(delete(&p, &c, &proxy("team-a", "inc", "c1", None), false)
            .decision
            .is_allowed());
    }

    // =========================================================================
    // Dry-run purity, every branch
    // =========================================================================

    #[test]
    fn dry_run_is_pure_for_every_branch() {
        let web_old = proxy("team-a", "web", "c1", Some("old.example.com"));
        let held_by_web = (
            key("c1", "old.example.com"),
            CacheEntry::confirmed(web_old.identity()),
        );
        let held_by_shop = (
            key("c1", "new.example.com"),
            CacheEntry::confirmed(owner("team-b", "shop")),
        );
        let own_provisional = (
            key("c1", "new.example.com"),
            CacheEntry::provisional(owner("team-a", "web"), NOW + 1),
        );
        let web_new = proxy("team-a", "web", "c1", Some("new.example.com"));
        let web_none = proxy("team-a", "web", "c1", None);
        let web_bad = proxy("team-a", "web", "nope", Some("new.example.com"));

        // create: free, taken, own provisional, no vhost, bad class
        assert_dry_run_pure(&[], |p, c, d| create(p, c, &web_new, d));
        assert_dry_run_pure(&[held_by_shop.clone()], |p, c, d| create(p, c, &web_new, d));
        assert_dry_run_pure(&[own_provisional.clone()], |p, c, d| create(p, c, &web_new, d));
        assert_dry_run_pure(&[], |p, c, d| create(p, c, &web_none, d));
        assert_dry_run_pure(&[], |p, c, d| create(p, c, &web_bad, d));

        // update a-d
        assert_dry_run_pure(&[], |p, c, d| update(p, c, &web_none, &web_none, d));
        assert_dry_run_pure(&[held_by_web.clone()], |p, c, d| update(p, c, &web_old, &web_none, d));
        assert_dry_run_pure(&[], |p, c, d| update(p, c, &web_none, &web_new, d));
        assert_dry_run_pure(&[held_by_web.clone()], |p, c, d| update(p, c, &web_old, &web_old, d));
        assert_dry_run_pure(&[held_by_web.clone()], |p, c, d| update(p, c, &web_old, &web_new, d));
        assert_dry_run_pure(&[held_by_web.clone(), held_by_shop], |p, c, d| {
            update(p, c, &web_old, &web_new, d)
        });

        // delete
        assert_dry_run_pure(&[held_by_web], |p, c, d| delete(p, c, &web_old, d));
        assert_dry_run_pure(&[], |p, c, d| delete(p, c, &web_none, d));
    }

    // =========================================================================
    // Driver
    // =========================================================================

    #[test]
    fn stage_order_is_fixed_per_operation() {
        let p = pipeline();
        let names = |op| -> Vec<&str> { p.stages(op).iter().map(|s| s.name()).collect() };
        assert_eq!(
            names(AdmissionOperation::Create),
            vec!["ingress-class", "fqdn-uniqueness", "advisory"]
        );
        assert_eq!(
            names(AdmissionOperation::Update),
            vec!["ingress-class", "fqdn-uniqueness", "advisory"]
        );
        assert_eq!(
            names(AdmissionOperation::Delete),
            vec!["ingress-class", "fqdn-uniqueness"]
        );
    }

    #[test]
    fn fqdn_stage_without_class_descriptor_is_internal_error() {
        let c = cache();
        let web = proxy("team-a", "web", "c1", Some("a.example.com"));
        let mut ctx = RequestContext::new(AdmissionOperation::Create, Some(&web), None, false, 15);
        let mut txn = c.write();

        let err = FqdnStage.check(&mut ctx, &mut txn).unwrap_err();
        assert!(err.to_string().contains("ingress class"));
    }

    #[test]
    fn denial_drops_collected_warnings() {
        let (p, c) = (pipeline(), cache());
        c.set(
            key("c1", "a.example.com"),
            CacheEntry::confirmed(owner("team-b", "shop")),
        );
        let verdict = create(&p, &c, &proxy("team-a", "web", "c1", Some("a.example.com")), false);
        assert!(verdict.warnings.is_empty());
    }

    /// Story: many teams race for the same hostname at once; exactly one wins
    #[test]
    fn story_concurrent_creates_admit_exactly_one() {
        const CONTENDERS: usize = 16;
        let (p, c) = (pipeline(), cache());
        let start = std::sync::Barrier::new(CONTENDERS);

        let verdicts: Vec<Verdict> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..CONTENDERS)
                .map(|i| {
                    let (p, c, start) = (&p, &c, &start);
                    scope.spawn(move || {
                        let obj = proxy(&format!("team-{i}"), "web", "c1", Some("a.example.com"));
                        start.wait();
                        create(p, c, &obj, false)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let allowed = verdicts.iter().filter(|v| v.decision.is_allowed()).count();
        assert_eq!(allowed, 1);
        for verdict in verdicts.iter().filter(|v| !v.decision.is_allowed()) {
            denied_with(verdict, 403);
        }
        assert_eq!(c.len(), 1);
        let winner = c.get(&key("c1", "a.example.com")).unwrap().owner;
        assert!(winner.namespace.starts_with("team-"));
    }
}
