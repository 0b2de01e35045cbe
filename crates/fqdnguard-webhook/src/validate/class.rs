use fqdnguard_common::cache::CacheTxn;
use fqdnguard_common::crd::HTTPProxy;
use fqdnguard_common::ingress_class::{effective_class_name, IngressClassAllowList};

use super::{AdmissionError, Decision, Flow, RequestContext, Stage};
use crate::review::AdmissionOperation;

/// Resolves ingress classes and rejects unknown ones on create/update
///
/// Deletes are never rejected here: an object admitted under a class that
/// has since been removed from the allow-list must stay removable. The same
/// holds for updates that only touch metadata (finalizers, labels) and for
/// updates of an object that is already being deleted.
pub struct IngressClassStage {
    allow_list: IngressClassAllowList,
}

impl IngressClassStage {
    /// Stage checking against `allow_list`
    pub fn new(allow_list: IngressClassAllowList) -> Self {
        Self { allow_list }
    }
}

impl Stage for IngressClassStage {
    fn name(&self) -> &'static str {
        "ingress-class"
    }

    fn check(
        &self,
        ctx: &mut RequestContext<'_>,
        _txn: &mut CacheTxn<'_>,
    ) -> Result<Flow, AdmissionError> {
        if matches!(
            ctx.operation,
            AdmissionOperation::Update | AdmissionOperation::Delete
        ) {
            ctx.old_class = Some(self.allow_list.describe(ctx.old_object()?));
        }

        if ctx.operation == AdmissionOperation::Delete {
            return Ok(Flow::Continue);
        }

        let new = ctx.new_object()?;
        let new_class = self.allow_list.describe(new);
        if !new_class.valid && ctx.operation == AdmissionOperation::Update {
            let old = ctx.old_object()?;
            if new.is_being_deleted() || is_metadata_only(old, new) {
                return Ok(Flow::Decide(Decision::Allow));
            }
        }

        if new_class.is_unset() {
            return Ok(Flow::Decide(Decision::deny(400, "ingressClassName is not set")));
        }
        if !new_class.valid {
            return Ok(Flow::Decide(Decision::deny(400, "ingressClassName is not valid")));
        }

        ctx.new_class = Some(new_class);
        Ok(Flow::Continue)
    }
}

// Class and spec unchanged, so no reservation can move
fn is_metadata_only(old: &HTTPProxy, new: &HTTPProxy) -> bool {
    old.spec == new.spec && effective_class_name(old) == effective_class_name(new)
}
