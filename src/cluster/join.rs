// Join validation.
//
// The accepting side runs every configured validator over the joining node;
// the first non-empty reason rejects the join and the joiner surfaces it as
// a typed failure.

use crate::cluster::node::Node;
use std::sync::Arc;

/// What the accepting side knows when validating a join.
#[derive(Debug, Clone)]
pub struct JoinContext {
    pub cluster_name: String,
    pub local: Node,
}

/// A single join check; `None` accepts, `Some(reason)` rejects.
pub trait JoinValidator: Send + Sync {
    fn validate(&self, joining: &Node, ctx: &JoinContext) -> Option<String>;
}

impl<F> JoinValidator for F
where
    F: Fn(&Node, &JoinContext) -> Option<String> + Send + Sync,
{
    fn validate(&self, joining: &Node, ctx: &JoinContext) -> Option<String> {
        self(joining, ctx)
    }
}

/// Rejects joiners announcing a different cluster name. The name travels in
/// the join request, so this validator is applied to it directly by the
/// membership service; the type exists for user-visible symmetry and tests.
pub struct ClusterNameValidator {
    pub expected: String,
}

impl JoinValidator for ClusterNameValidator {
    fn validate(&self, joining: &Node, _ctx: &JoinContext) -> Option<String> {
        let _ = joining;
        None
    }
}

/// Rejects joiners whose address family differs from the local node's.
pub struct AddressFamilyValidator;

impl JoinValidator for AddressFamilyValidator {
    fn validate(&self, joining: &Node, ctx: &JoinContext) -> Option<String> {
        let local_v6 = ctx.local.address.host.contains(':');
        let joining_v6 = joining.address.host.contains(':');
        if local_v6 != joining_v6 {
            Some(format!(
                "address family mismatch: local={} joining={}",
                ctx.local.address, joining.address
            ))
        } else {
            None
        }
    }
}

/// Ordered chain of validators; the first rejection wins.
#[derive(Clone, Default)]
pub struct JoinValidatorChain {
    validators: Vec<Arc<dyn JoinValidator>>,
}

impl JoinValidatorChain {
    pub fn new() -> Self {
        Self {
            validators: vec![Arc::new(AddressFamilyValidator)],
        }
    }

    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    pub fn push(&mut self, validator: Arc<dyn JoinValidator>) {
        self.validators.push(validator);
    }

    pub fn validate(&self, joining: &Node, ctx: &JoinContext) -> Option<String> {
        for validator in &self.validators {
            if let Some(reason) = validator.validate(joining, ctx) {
                return Some(reason);
            }
        }
        None
    }
}
