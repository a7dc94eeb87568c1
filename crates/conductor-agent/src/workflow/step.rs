use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::warn;

use conductor_core::error::{panic_message, AgentError};
use conductor_core::types::{ExecutionContext, Payload, StepResult};

/// Boxed step handler. `Ok(Some(v))` replaces the context data, `Ok(None)`
/// leaves it alone.
pub type StepHandler<T> =
    Arc<dyn Fn(ExecutionContext<T>) -> BoxFuture<'static, anyhow::Result<Option<T>>> + Send + Sync>;

/// Best-effort failure hook. Its own errors and panics are logged and dropped.
pub type ErrorHook<T> =
    Arc<dyn Fn(&AgentError, &ExecutionContext<T>) -> anyhow::Result<()> + Send + Sync>;

/// Guard deciding whether a step runs.
pub enum StepCondition<T> {
    Sync(Arc<dyn Fn(&ExecutionContext<T>) -> bool + Send + Sync>),
    Async(Arc<dyn Fn(ExecutionContext<T>) -> BoxFuture<'static, bool> + Send + Sync>),
}

impl<T> Clone for StepCondition<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<T: Payload> StepCondition<T> {
    pub fn new<C>(condition: C) -> Self
    where
        C: Fn(&ExecutionContext<T>) -> bool + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(condition))
    }

    pub fn new_async<C, Fut>(condition: C) -> Self
    where
        C: Fn(ExecutionContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::Async(Arc::new(move |ctx: ExecutionContext<T>| condition(ctx).boxed()))
    }

    /// Evaluate against the current context. A panic counts as a failure.
    async fn evaluate(&self, ctx: &ExecutionContext<T>) -> Result<bool, AgentError> {
        match self {
            Self::Sync(f) => catch_unwind(AssertUnwindSafe(|| f(ctx))).map_err(AgentError::from_panic),
            Self::Async(f) => AssertUnwindSafe(async { f(ctx.clone()).await })
                .catch_unwind()
                .await
                .map_err(AgentError::from_panic),
        }
    }
}

/// Per-step options for [`Step::with_options`].
pub struct StepOptions<T> {
    condition: Option<StepCondition<T>>,
    on_error: Option<ErrorHook<T>>,
}

impl<T> Default for StepOptions<T> {
    fn default() -> Self {
        Self {
            condition: None,
            on_error: None,
        }
    }
}

impl<T: Payload> StepOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only run the step when `condition` holds.
    pub fn when<C>(mut self, condition: C) -> Self
    where
        C: Fn(&ExecutionContext<T>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(StepCondition::new(condition));
        self
    }

    /// Only run the step when the async `condition` resolves to true.
    pub fn when_async<C, Fut>(mut self, condition: C) -> Self
    where
        C: Fn(ExecutionContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.condition = Some(StepCondition::new_async(condition));
        self
    }

    /// Call `hook` when the handler fails.
    pub fn on_error<H>(mut self, hook: H) -> Self
    where
        H: Fn(&AgentError, &ExecutionContext<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

/// A named step registered on a workflow.
pub struct Step<T> {
    name: String,
    handler: StepHandler<T>,
    condition: Option<StepCondition<T>>,
    on_error: Option<ErrorHook<T>>,
}

impl<T> Clone for Step<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: Arc::clone(&self.handler),
            condition: self.condition.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T: Payload> Step<T> {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ExecutionContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |ctx: ExecutionContext<T>| handler(ctx).boxed()),
            condition: None,
            on_error: None,
        }
    }

    pub fn with_options(mut self, options: StepOptions<T>) -> Self {
        self.condition = options.condition;
        self.on_error = options.on_error;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// Run the step against `ctx`: condition check, handler, data update.
    ///
    /// The returned result is not appended to `ctx.history`; the caller does
    /// that so ordering stays in one place.
    pub(crate) async fn evaluate(&self, ctx: &mut ExecutionContext<T>) -> StepResult<T> {
        let started_at = Utc::now();
        let clock = Instant::now();

        if let Some(condition) = &self.condition {
            match condition.evaluate(ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    return StepResult {
                        step: self.name.clone(),
                        success: true,
                        skipped: true,
                        data: None,
                        error: None,
                        started_at,
                        completed_at: Utc::now(),
                        duration_ms: clock.elapsed().as_millis() as u64,
                    };
                }
                Err(err) => return self.failure(err, ctx, started_at, clock),
            }
        }

        // The handler call itself may panic before returning a future.
        let outcome = AssertUnwindSafe(async { (self.handler)(ctx.clone()).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => {
                if let Some(data) = &output {
                    ctx.data = data.clone();
                }
                StepResult {
                    step: self.name.clone(),
                    success: true,
                    skipped: false,
                    data: output,
                    error: None,
                    started_at,
                    completed_at: Utc::now(),
                    duration_ms: clock.elapsed().as_millis() as u64,
                }
            }
            Ok(Err(e)) => self.failure(AgentError::normalize(e), ctx, started_at, clock),
            Err(panic) => self.failure(AgentError::from_panic(panic), ctx, started_at, clock),
        }
    }

    fn failure(
        &self,
        error: AgentError,
        ctx: &ExecutionContext<T>,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> StepResult<T> {
        if let Some(hook) = &self.on_error {
            match catch_unwind(AssertUnwindSafe(|| hook(&error, ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(step = %self.name, error = %e, "Step error hook failed");
                }
                Err(panic) => {
                    warn!(
                        step = %self.name,
                        error = %panic_message(panic.as_ref()),
                        "Step error hook panicked"
                    );
                }
            }
        }

        StepResult {
            step: self.name.clone(),
            success: false,
            skipped: false,
            data: None,
            error: Some(error),
            started_at,
            completed_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
        }
    }
}

impl<T> std::fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("conditional", &self.condition.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use conductor_core::error::ErrorCode;

    #[tokio::test]
    async fn returned_value_replaces_data() {
        let step = Step::new("inc", |ctx: ExecutionContext<i32>| async move { Ok(Some(ctx.data + 1)) });
        let mut ctx = ExecutionContext::new(1);

        let result = step.evaluate(&mut ctx).await;
        assert!(result.success);
        assert!(!result.skipped);
        assert_eq!(result.data, Some(2));
        assert_eq!(ctx.data, 2);
        assert!(ctx.history.is_empty());
    }

    #[tokio::test]
    async fn none_leaves_data_untouched() {
        let step = Step::new("observe", |_: ExecutionContext<i32>| async { Ok(None) });
        let mut ctx = ExecutionContext::new(7);

        let result = step.evaluate(&mut ctx).await;
        assert!(result.success);
        assert_eq!(result.data, None);
        assert_eq!(ctx.data, 7);
    }

    #[tokio::test]
    async fn false_condition_skips_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let step = Step::new("guarded", move |_: ExecutionContext<i32>| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(100)) }
        })
        .with_options(StepOptions::new().when(|ctx: &ExecutionContext<i32>| ctx.data > 10));
        assert!(step.is_conditional());

        let mut ctx = ExecutionContext::new(3);
        let result = step.evaluate(&mut ctx).await;
        assert!(result.success);
        assert!(result.skipped);
        assert_eq!(result.data, None);
        assert_eq!(ctx.data, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_condition_is_awaited() {
        let step = Step::new("guarded", |_: ExecutionContext<i32>| async { Ok(Some(0)) })
            .with_options(StepOptions::new().when_async(|ctx: ExecutionContext<i32>| async move {
                tokio::task::yield_now().await;
                ctx.data == 5
            }));

        let mut ctx = ExecutionContext::new(5);
        let result = step.evaluate(&mut ctx).await;
        assert!(!result.skipped);
        assert_eq!(ctx.data, 0);
    }

    #[tokio::test]
    async fn failure_runs_hook_and_keeps_data() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let h = hook_calls.clone();
        let step = Step::new("explode", |_: ExecutionContext<i32>| async {
            Err::<Option<i32>, _>(anyhow::anyhow!("bad lead"))
        })
        .with_options(StepOptions::new().on_error(move |err: &AgentError, ctx: &ExecutionContext<i32>| {
            assert_eq!(err.message, "bad lead");
            assert_eq!(ctx.data, 9);
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut ctx = ExecutionContext::new(9);
        let result = step.evaluate(&mut ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::UnknownError);
        assert_eq!(ctx.data, 9);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_hook_is_swallowed() {
        let step = Step::new("explode", |_: ExecutionContext<i32>| async {
            Err::<Option<i32>, _>(anyhow::Error::new(AgentError::invalid_input("no email")))
        })
        .with_options(
            StepOptions::new()
                .on_error(|_: &AgentError, _: &ExecutionContext<i32>| -> anyhow::Result<()> {
                    panic!("hook crashed")
                }),
        );

        let mut ctx = ExecutionContext::new(0);
        let result = step.evaluate(&mut ctx).await;
        assert_eq!(result.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn handler_panic_becomes_step_failure() {
        let step = Step::new("panics", |_: ExecutionContext<i32>| async {
            if true {
                panic!("handler bug");
            }
            Ok(None)
        });

        let mut ctx = ExecutionContext::new(0);
        let result = step.evaluate(&mut ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap().message.contains("handler bug"));
    }

    #[tokio::test]
    async fn handler_panic_before_future_becomes_step_failure() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let h = hook_calls.clone();
        let step = Step::new("prelude", |ctx: ExecutionContext<i32>| {
            if ctx.data > 0 {
                panic!("bad prelude");
            }
            async { Ok(None) }
        })
        .with_options(StepOptions::new().on_error(move |_: &AgentError, _: &ExecutionContext<i32>| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut ctx = ExecutionContext::new(4);
        let result = step.evaluate(&mut ctx).await;
        assert!(!result.success);
        let err = result.error.unwrap();
        assert_eq!(err.code, ErrorCode::UnknownError);
        assert!(err.message.contains("bad prelude"));
        assert_eq!(ctx.data, 4);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_condition_panic_before_future_becomes_step_failure() {
        let step = Step::new("guarded", |_: ExecutionContext<i32>| async { Ok(Some(1)) })
            .with_options(StepOptions::new().when_async(|ctx: ExecutionContext<i32>| {
                if ctx.data == 0 {
                    panic!("condition prelude");
                }
                async { true }
            }));

        let mut ctx = ExecutionContext::new(0);
        let result = step.evaluate(&mut ctx).await;
        assert!(!result.success);
        assert!(!result.skipped);
        assert!(result.error.unwrap().message.contains("condition prelude"));
        assert_eq!(ctx.data, 0);
    }

    #[tokio::test]
    async fn condition_panic_becomes_step_failure() {
        let step = Step::new("guarded", |_: ExecutionContext<i32>| async { Ok(None) })
            .with_options(StepOptions::new().when(|_: &ExecutionContext<i32>| -> bool {
                panic!("condition bug")
            }));

        let mut ctx = ExecutionContext::new(0);
        let result = step.evaluate(&mut ctx).await;
        assert!(!result.success);
        assert!(!result.skipped);
    }
}
