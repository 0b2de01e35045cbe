use std::sync::Arc;

use fqdnguard_common::cache::CacheTxn;
use tracing::debug;

use super::{AdmissionError, Flow, RequestContext, Stage};
use crate::ratelimit::RateLimitValidator;

/// Prefix of every rate limit warning
pub const WARNING_PREFIX: &str = "Rate Limit Config Error: ";

/// Warnings longer than this are cut, counted in chars
pub const WARNING_MAX_CHARS: usize = 120;

/// Surfaces rate limit policy mistakes as warnings; never denies
pub struct AdvisoryStage {
    validator: Arc<dyn RateLimitValidator>,
}

impl AdvisoryStage {
    /// Stage delegating to `validator`
    pub fn new(validator: Arc<dyn RateLimitValidator>) -> Self {
        Self { validator }
    }
}

impl Stage for AdvisoryStage {
    fn name(&self) -> &'static str {
        "advisory"
    }

    fn check(
        &self,
        ctx: &mut RequestContext<'_>,
        _txn: &mut CacheTxn<'_>,
    ) -> Result<Flow, AdmissionError> {
        let new = ctx.new_object()?;
        if let Err(e) = self.validator.validate(new) {
            debug!(error = %e, "Rate limit policy is invalid");
            ctx.warnings.push(warning(&e.to_string()));
        }
        Ok(Flow::Continue)
    }
}

fn warning(reason: &str) -> String {
    format!("{WARNING_PREFIX}{reason}")
        .chars()
        .take(WARNING_MAX_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MockRateLimitValidator, RateLimitError};
    use crate::review::AdmissionOperation;
    use crate::validate::tests::{cache, proxy};

    fn run(validator: MockRateLimitValidator) -> Vec<String> {
        let c = cache();
        let web = proxy("team-a", "web", "c1", Some("a.example.com"));
        let stage = AdvisoryStage::new(Arc::new(validator));
        let mut ctx = RequestContext::new(AdmissionOperation::Create, Some(&web), None, false, 15);
        let mut txn = c.write();
        assert_eq!(stage.check(&mut ctx, &mut txn).unwrap(), Flow::Continue);
        ctx.warnings
    }

    #[test]
    fn valid_policy_adds_no_warning() {
        let mut v = MockRateLimitValidator::new();
        v.expect_validate().returning(|_| Ok(()));
        assert!(run(v).is_empty());
    }

    #[test]
    fn invalid_policy_becomes_prefixed_warning() {
        let mut v = MockRateLimitValidator::new();
        v.expect_validate()
            .returning(|_| Err(RateLimitError::NoDescriptors { path: "virtualhost".into() }));
        let warnings = run(v);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with(WARNING_PREFIX));
        assert!(warnings[0].contains("virtualhost"));
    }

    /// Story: a long multi-byte reason is cut on a char boundary
    #[test]
    fn story_long_warning_is_truncated_safely() {
        let reason = "é".repeat(300);
        let w = warning(&reason);
        assert_eq!(w.chars().count(), WARNING_MAX_CHARS);
        assert!(w.starts_with(WARNING_PREFIX));
    }

    #[test]
    fn short_warning_is_kept_whole() {
        assert_eq!(warning("bad"), "Rate Limit Config Error: bad");
    }
}
