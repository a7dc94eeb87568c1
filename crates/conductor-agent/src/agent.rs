use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use conductor_core::types::{ExecutionContext, Payload};

/// A unit of work with optional setup, validation and teardown.
///
/// `process` is the work function: it may be called several times for one
/// `execute` when retries are configured, so it must be safe to repeat.
pub trait Agent: Send + Sync + 'static {
    type Input: Payload;
    type Output: Payload;

    /// Agent name (used as the event source and in logs).
    fn name(&self) -> &str;

    /// One-time setup, run lazily before the first `execute`.
    fn initialize(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Synchronous input check, run before any attempt.
    ///
    /// A plain error becomes `INVALID_INPUT`; a typed `AgentError` is kept.
    fn validate(&self, input: &Self::Input) -> anyhow::Result<()> {
        let _ = input;
        Ok(())
    }

    /// The work function.
    fn process(
        &self,
        ctx: ExecutionContext<Self::Input>,
    ) -> BoxFuture<'_, anyhow::Result<Self::Output>>;

    /// Release resources acquired in `initialize`.
    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

type WorkFn<I, O> =
    Arc<dyn Fn(ExecutionContext<I>) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;
type ValidateFn<I> = Arc<dyn Fn(&I) -> anyhow::Result<()> + Send + Sync>;

/// An [`Agent`] built from a closure.
pub struct FnAgent<I, O> {
    name: String,
    work: WorkFn<I, O>,
    validator: Option<ValidateFn<I>>,
}

impl<I: Payload, O: Payload> FnAgent<I, O> {
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(ExecutionContext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Arc::new(move |ctx: ExecutionContext<I>| work(ctx).boxed()),
            validator: None,
        }
    }

    /// Attach an input validator.
    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }
}

impl<I: Payload, O: Payload> Agent for FnAgent<I, O> {
    type Input = I;
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, input: &I) -> anyhow::Result<()> {
        match &self.validator {
            Some(validator) => validator(input),
            None => Ok(()),
        }
    }

    fn process(&self, ctx: ExecutionContext<I>) -> BoxFuture<'_, anyhow::Result<O>> {
        (self.work)(ctx)
    }
}
