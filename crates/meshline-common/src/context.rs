use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Headers;

/// Metadata the router extracted from the downstream request, used by the
/// subset load balancer to select a partition. Keys are kept sorted so a
/// criteria set maps to exactly one selector tuple.
pub type MetadataMatchCriteria = BTreeMap<String, String>;

/// Cancellation handle shared between a request and the upstream core.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-request context produced by the downstream connection handler and
/// threaded through host selection and pool initialization.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancelToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Everything the load balancer may inspect when choosing a host.
pub trait LoadBalancerContext: Send + Sync {
    /// Headers of the downstream request, if any.
    fn downstream_headers(&self) -> Option<&Headers>;

    /// Metadata criteria for subset selection, if any.
    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria>;

    /// The request context, used for pool initialization and cancellation.
    fn downstream_context(&self) -> &RequestContext;
}

/// Plain-data [`LoadBalancerContext`] carrying optional headers and criteria.
/// Protocol filters build one of these per request.
#[derive(Debug, Clone, Default)]
pub struct LbContext {
    pub headers: Option<Headers>,
    pub criteria: Option<MetadataMatchCriteria>,
    pub request: RequestContext,
}

impl LbContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_criteria(mut self, criteria: MetadataMatchCriteria) -> Self {
        self.criteria = Some(criteria);
        self
    }
}

impl LoadBalancerContext for LbContext {
    fn downstream_headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria> {
        self.criteria.as_ref()
    }

    fn downstream_context(&self) -> &RequestContext {
        &self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_lb_context_accessors() {
        let mut headers = Headers::new();
        headers.insert("hostname".into(), "e1".into());
        let mut criteria = MetadataMatchCriteria::new();
        criteria.insert("version".into(), "1.0".into());

        let ctx = LbContext::new().with_headers(headers).with_criteria(criteria);
        assert_eq!(
            ctx.downstream_headers().unwrap().get("hostname").unwrap(),
            "e1"
        );
        assert_eq!(
            ctx.metadata_match_criteria().unwrap().get("version").unwrap(),
            "1.0"
        );
        assert!(!ctx.downstream_context().is_cancelled());
    }
}
