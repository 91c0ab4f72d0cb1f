//! Handler, interceptor, and policy registration.
//!
//! The registry is an explicit table built once at startup: work type name
//! to handler, work type name to ordered interceptor list, work type name to
//! retry policy. Supervisors only ever resolve through it; there is no
//! runtime type introspection.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use relay_core::RetryPolicy;

use crate::saga::SagaContext;
use crate::work::Work;

/// Handles an event delivery or a request.
pub trait Handler: Send + Sync {
    /// Structural payload validation, run before a record is created.
    /// Failures surface synchronously to the caller and never persist.
    fn validate(&self, _payload: &Value) -> Result<(), String> {
        Ok(())
    }

    fn exec(&self, payload: Value) -> anyhow::Result<Value>;
}

/// Closures are handlers.
impl<F> Handler for F
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn exec(&self, payload: Value) -> anyhow::Result<Value> {
        self(payload)
    }
}

/// Handles a saga's top-level dispatch. The context is how the handler
/// invokes named sub-steps with idempotent re-entry.
pub trait SagaHandler: Send + Sync {
    fn validate(&self, _payload: &Value) -> Result<(), String> {
        Ok(())
    }

    fn exec(&self, ctx: &SagaContext, payload: Value) -> anyhow::Result<Value>;
}

impl<F> SagaHandler for F
where
    F: Fn(&SagaContext, Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn exec(&self, ctx: &SagaContext, payload: Value) -> anyhow::Result<Value> {
        self(ctx, payload)
    }
}

/// Wraps dispatch of a work type. `pre_dispatch` runs before the handler in
/// registration order, `post_dispatch` after it; a failure in either is
/// treated like a handler failure.
pub trait Interceptor: Send + Sync {
    fn pre_dispatch(&self, _work: &Work) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_dispatch(&self, _work: &Work, _result: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Startup-built resolution tables.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    saga_handlers: HashMap<String, Arc<dyn SagaHandler>>,
    interceptors: HashMap<String, Vec<Arc<dyn Interceptor>>>,
    policies: HashMap<String, RetryPolicy>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an event/request handler to a work type. Last registration wins.
    pub fn register_handler(
        &mut self,
        work_type: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        self.handlers.insert(work_type.into(), Arc::new(handler));
        self
    }

    /// Bind a saga handler to a work type.
    pub fn register_saga_handler(
        &mut self,
        work_type: impl Into<String>,
        handler: impl SagaHandler + 'static,
    ) -> &mut Self {
        self.saga_handlers.insert(work_type.into(), Arc::new(handler));
        self
    }

    /// Append an interceptor for a work type; dispatch preserves
    /// registration order.
    pub fn register_interceptor(
        &mut self,
        work_type: impl Into<String>,
        interceptor: impl Interceptor + 'static,
    ) -> &mut Self {
        self.interceptors
            .entry(work_type.into())
            .or_default()
            .push(Arc::new(interceptor));
        self
    }

    /// Declare the retry policy for a work type; types without one get
    /// `RetryPolicy::default()`.
    pub fn register_policy(
        &mut self,
        work_type: impl Into<String>,
        policy: RetryPolicy,
    ) -> &mut Self {
        self.policies.insert(work_type.into(), policy);
        self
    }

    pub fn handler_for(&self, work_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(work_type).cloned()
    }

    pub fn saga_handler_for(&self, work_type: &str) -> Option<Arc<dyn SagaHandler>> {
        self.saga_handlers.get(work_type).cloned()
    }

    pub fn interceptors_for(&self, work_type: &str) -> &[Arc<dyn Interceptor>] {
        self.interceptors
            .get(work_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn policy_for(&self, work_type: &str) -> RetryPolicy {
        self.policies.get(work_type).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn resolves_registered_handler() {
        let mut registry = Registry::new();
        registry.register_handler("inventory.adjust", |payload: Value| {
            Ok(payload)
        });

        assert!(registry.handler_for("inventory.adjust").is_some());
        assert!(registry.handler_for("inventory.unknown").is_none());
    }

    #[test]
    fn interceptors_keep_registration_order() {
        struct Tag;
        impl Interceptor for Tag {}

        let mut registry = Registry::new();
        registry.register_interceptor("t", Tag);
        registry.register_interceptor("t", Tag);

        assert_eq!(registry.interceptors_for("t").len(), 2);
        assert!(registry.interceptors_for("other").is_empty());
    }

    #[test]
    fn policy_falls_back_to_default() {
        let mut registry = Registry::new();
        registry.register_policy("t", RetryPolicy::new(3, Duration::from_secs(60)));

        assert_eq!(registry.policy_for("t").try_limit, 3);
        assert_eq!(registry.policy_for("other"), RetryPolicy::default());
    }
}
